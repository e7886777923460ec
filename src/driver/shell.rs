//! The `shell` driver kind: external shell scripts.
//!
//! Arguments are exported as environment variables, stdout and stderr are
//! appended to the node's log writer, and cancellation kills the child.

use std::io::Write;
use std::process::Stdio;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ArgMap, Driver, DriverError, Location, Manifest, Resources, Result};

/// Driver instance bound to one script path.
pub struct ShellDriver {
    location: Location,
    resources: Mutex<Option<Resources>>,
}

impl ShellDriver {
    /// Build an instance for `location`.
    pub fn create(location: &Location) -> Result<std::sync::Arc<dyn Driver>> {
        Ok(std::sync::Arc::new(Self {
            location: location.clone(),
            resources: Mutex::new(None),
        }))
    }

    fn log(&self, text: &str) {
        if let Some(resources) = self.resources.lock().as_mut() {
            let _ = resources.log.write_all(text.as_bytes());
        }
    }
}

#[async_trait::async_trait]
impl Driver for ShellDriver {
    fn name(&self) -> &str {
        "shell"
    }

    fn function_name(&self) -> &str {
        &self.location.fname
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            name: self.location.fname.clone(),
            driver: "shell".to_string(),
            usage: format!("runs {}", self.location.path),
            ..Default::default()
        }
    }

    async fn load(&self, resources: Resources) -> Result<()> {
        if !std::path::Path::new(&self.location.path).exists() {
            return Err(DriverError::FunctionUnavailable(self.location.path.clone()));
        }
        *self.resources.lock() = Some(resources);
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken, args: ArgMap) -> Result<ArgMap> {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg(&self.location.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &args {
            command.env(key, value);
        }

        let child = command.spawn()?;
        let output = tokio::select! {
            out = child.wait_with_output() => out?,
            _ = cancel.cancelled() => {
                return Err(DriverError::Cancelled(self.location.fname.clone()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !stdout.is_empty() {
            self.log(&stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            self.log(&stderr);
        }

        let code = output.status.code().unwrap_or(-1);
        if !output.status.success() {
            return Err(DriverError::Execution(format!(
                "{} exited with code {code}",
                self.location.path
            )));
        }
        Ok(ArgMap::from([
            ("code".to_string(), code.to_string()),
            ("stdout".to_string(), stdout),
        ]))
    }
}
