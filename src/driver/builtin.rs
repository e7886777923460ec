//! In-process driver for the built-in directives.
//!
//! `sleep`, `println`, `exit`, and `if_none_exit` compile to task nodes on
//! this driver and run without leaving the process.

use std::io::Write;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ArgMap, Driver, DriverError, Location, Manifest, Resources, Result};

/// Registry name of the built-in driver kind.
pub const DRIVER_NAME: &str = "builtin";

/// Argument key names per directive, in positional order.
pub fn arg_keys(directive: &str) -> &'static [&'static str] {
    match directive {
        "sleep" => &["duration"],
        "println" => &["content"],
        "exit" => &["message"],
        _ => &["0", "1"],
    }
}

/// Driver instance bound to one directive.
pub struct BuiltinDriver {
    directive: String,
    resources: Mutex<Option<Resources>>,
}

impl BuiltinDriver {
    /// Build an instance; `location.fname` selects the directive.
    pub fn create(location: &Location) -> Result<std::sync::Arc<dyn Driver>> {
        Ok(std::sync::Arc::new(Self {
            directive: location.fname.clone(),
            resources: Mutex::new(None),
        }))
    }

    fn write_line(&self, text: &str) {
        if let Some(resources) = self.resources.lock().as_mut() {
            let _ = writeln!(resources.log, "{text}");
        } else {
            println!("{text}");
        }
    }
}

#[async_trait::async_trait]
impl Driver for BuiltinDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn function_name(&self) -> &str {
        &self.directive
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            name: self.directive.clone(),
            driver: DRIVER_NAME.to_string(),
            ..Default::default()
        }
    }

    async fn load(&self, resources: Resources) -> Result<()> {
        *self.resources.lock() = Some(resources);
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken, args: ArgMap) -> Result<ArgMap> {
        match self.directive.as_str() {
            "sleep" => {
                let spec = args.get("duration").map(String::as_str).unwrap_or("1s");
                let duration = parse_duration(spec)?;
                tokio::select! {
                    _ = tokio::time::sleep(duration) => Ok(ArgMap::new()),
                    _ = cancel.cancelled() => Err(DriverError::Cancelled("sleep".into())),
                }
            }
            "println" => {
                let content = args.get("content").cloned().unwrap_or_default();
                self.write_line(&content);
                Ok(ArgMap::new())
            }
            "exit" => {
                let message = args
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| "exit directive".to_string());
                Err(DriverError::Exit(message))
            }
            "if_none_exit" => {
                // Exits the flow when any given value is empty.
                for key in arg_keys("if_none_exit") {
                    if let Some(value) = args.get(*key) {
                        if value.is_empty() {
                            return Err(DriverError::Exit(format!(
                                "if_none_exit: argument {key} is empty"
                            )));
                        }
                    }
                }
                Ok(ArgMap::new())
            }
            other => Err(DriverError::FunctionUnavailable(other.to_string())),
        }
    }
}

/// Parse `1s`, `200ms`, `2m`, `1h`, or a bare number of seconds.
fn parse_duration(spec: &str) -> Result<Duration> {
    let spec = spec.trim();
    let (value, unit) = match spec.find(|c: char| c.is_ascii_alphabetic()) {
        Some(pos) => spec.split_at(pos),
        None => (spec, "s"),
    };
    let value: f64 = value
        .parse()
        .map_err(|_| DriverError::Execution(format!("invalid duration {spec:?}")))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => {
            return Err(DriverError::Execution(format!(
                "invalid duration unit {unit:?}"
            )));
        }
    };
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("0.5").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("oops").is_err());
    }

    #[tokio::test]
    async fn exit_directive_errors() {
        let loc = Location::parse("builtin:exit").unwrap();
        let driver = BuiltinDriver::create(&loc).unwrap();
        let err = driver
            .run(CancellationToken::new(), ArgMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Exit(_)));
    }

    #[tokio::test]
    async fn if_none_exit_passes_when_values_present() {
        let loc = Location::parse("builtin:if_none_exit").unwrap();
        let driver = BuiltinDriver::create(&loc).unwrap();
        let ok = driver
            .run(
                CancellationToken::new(),
                ArgMap::from([("0".into(), "present".into())]),
            )
            .await;
        assert!(ok.is_ok());
        let err = driver
            .run(
                CancellationToken::new(),
                ArgMap::from([("0".into(), String::new())]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Exit(_)));
    }

    #[tokio::test]
    async fn sleep_honors_cancellation() {
        let loc = Location::parse("builtin:sleep").unwrap();
        let driver = BuiltinDriver::create(&loc).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = driver
            .run(cancel, ArgMap::from([("duration".into(), "10s".into())]))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled(_)));
    }
}
