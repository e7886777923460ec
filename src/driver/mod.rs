//! Function drivers.
//!
//! A driver knows how to load and run functions of one kind. The engine
//! depends only on the capability set below; concrete kinds register in a
//! process-wide registry keyed by driver name and are published immutable
//! after startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::runtime::logbucket::LogWriter;

/// Built-in directive driver.
pub mod builtin;
/// The `go` kind: linked-in native functions.
pub mod native;
/// The `shell` kind: external shell scripts.
pub mod shell;

/// String-keyed argument and result maps exchanged with functions.
pub type ArgMap = HashMap<String, String>;

/// Convenience result alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by drivers and the registry.
#[derive(Debug, Error)]
pub enum DriverError {
    /// No driver kind with the given name is registered.
    #[error("driver {0:?} not found")]
    NotFound(String),

    /// The location names a function the driver cannot provide.
    #[error("function {0:?} is not available")]
    FunctionUnavailable(String),

    /// A `load "…"` location string did not parse.
    #[error("invalid function location {0:?}")]
    InvalidLocation(String),

    /// The run was cancelled.
    #[error("cancelled while running {0:?}")]
    Cancelled(String),

    /// The `exit` directive requested flow termination.
    #[error("exit: {0}")]
    Exit(String),

    /// Function execution failed.
    #[error("{0}")]
    Execution(String),

    /// IO error from the driver's resources.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static description of a function: defaults and failure policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Function name.
    pub name: String,
    /// Driver kind providing the function.
    pub driver: String,
    /// Default arguments, overlaid by caller args in [`Driver::merge_args`].
    #[serde(default)]
    pub args: ArgMap,
    /// How many times a failed run is retried.
    #[serde(default)]
    pub retry_on_failure: u32,
    /// Whether a failure counts against the step.
    #[serde(default)]
    pub ignore_failure: bool,
    /// Human-readable usage line.
    #[serde(default)]
    pub usage: String,
}

/// Identity labels attached to a task's resources.
#[derive(Debug, Clone, Default)]
pub struct Labels {
    /// Owning flow id.
    pub flow_id: String,
    /// Node sequence number.
    pub seq: usize,
    /// Node name.
    pub node_name: String,
}

/// Append-only table functions may write output rows into.
#[derive(Debug, Default)]
pub struct OutcomeSink {
    rows: Mutex<Vec<Vec<String>>>,
}

impl OutcomeSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one output row.
    pub fn append(&self, row: Vec<String>) {
        self.rows.lock().push(row);
    }

    /// Snapshot of all rows.
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.rows.lock().clone()
    }
}

/// Resources handed to a driver's `load`.
#[derive(Clone)]
pub struct Resources {
    /// Flow/node identity labels.
    pub labels: Labels,
    /// Append-only log writer for this node.
    pub log: LogWriter,
    /// Shared outcome table.
    pub outcomes: Arc<OutcomeSink>,
}

/// Parsed `driver:path[@version]` function location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Driver kind name.
    pub driver: String,
    /// Driver-interpreted path.
    pub path: String,
    /// Function name, the last path segment without extension.
    pub fname: String,
    /// Optional version tag.
    pub version: String,
}

impl Location {
    /// Parse a location string.
    pub fn parse(text: &str) -> Result<Self> {
        let (driver, rest) = text
            .split_once(':')
            .ok_or_else(|| DriverError::InvalidLocation(text.to_string()))?;
        let (path, version) = match rest.split_once('@') {
            Some((p, v)) => (p, v),
            None => (rest, ""),
        };
        let base = path.rsplit('/').next().unwrap_or(path);
        let fname = base.split('.').next().unwrap_or(base);
        if driver.is_empty() || path.is_empty() || fname.is_empty() {
            return Err(DriverError::InvalidLocation(text.to_string()));
        }
        Ok(Self {
            driver: driver.to_string(),
            path: path.to_string(),
            fname: fname.to_string(),
            version: version.to_string(),
        })
    }
}

/// Capability set the engine requires from every function driver.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Driver kind name (`go`, `shell`, `builtin`, …).
    fn name(&self) -> &str;

    /// Name of the function this instance runs.
    fn function_name(&self) -> &str;

    /// Static manifest: argument defaults and failure policy.
    fn manifest(&self) -> Manifest;

    /// Prepare the function; called once per task before execution.
    async fn load(&self, resources: Resources) -> Result<()>;

    /// Run the function once.
    async fn run(&self, cancel: CancellationToken, args: ArgMap) -> Result<ArgMap>;

    /// Overlay caller args on the manifest defaults.
    fn merge_args(&self, args: ArgMap) -> ArgMap {
        let mut merged = self.manifest().args;
        merged.extend(args);
        merged
    }

    /// Release any held resources.
    async fn stop_and_release(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory building one driver instance for a function location.
pub type DriverFactory = Arc<dyn Fn(&Location) -> Result<Arc<dyn Driver>> + Send + Sync>;

/// Registry of driver kinds.
pub struct DriverRegistry {
    factories: RwLock<HashMap<String, DriverFactory>>,
}

impl DriverRegistry {
    fn with_defaults() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register("go", Arc::new(|loc| native::NativeDriver::create(loc)));
        registry.register("shell", Arc::new(|loc| shell::ShellDriver::create(loc)));
        registry.register(
            builtin::DRIVER_NAME,
            Arc::new(|loc| builtin::BuiltinDriver::create(loc)),
        );
        registry
    }

    /// Register a driver kind under `name`, replacing any previous factory.
    pub fn register(&self, name: &str, factory: DriverFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    /// Build a driver instance for `location`.
    pub fn create(&self, location: &Location) -> Result<Arc<dyn Driver>> {
        let factory = self
            .factories
            .read()
            .get(&location.driver)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(location.driver.clone()))?;
        factory(location)
    }
}

/// The process-wide driver registry.
pub fn registry() -> &'static DriverRegistry {
    static REGISTRY: Lazy<DriverRegistry> = Lazy::new(DriverRegistry::with_defaults);
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_location() {
        let loc = Location::parse("go:function1").unwrap();
        assert_eq!(loc.driver, "go");
        assert_eq!(loc.path, "function1");
        assert_eq!(loc.fname, "function1");
        assert_eq!(loc.version, "");
    }

    #[test]
    fn parses_path_and_version() {
        let loc = Location::parse("shell:/tmp/function3.sh@v2").unwrap();
        assert_eq!(loc.driver, "shell");
        assert_eq!(loc.path, "/tmp/function3.sh");
        assert_eq!(loc.fname, "function3");
        assert_eq!(loc.version, "v2");
    }

    #[test]
    fn rejects_missing_driver() {
        assert!(Location::parse("no-colon-here").is_err());
    }

    #[test]
    fn merge_overlays_defaults() {
        struct Probe;
        #[async_trait]
        impl Driver for Probe {
            fn name(&self) -> &str {
                "probe"
            }
            fn function_name(&self) -> &str {
                "probe"
            }
            fn manifest(&self) -> Manifest {
                Manifest {
                    name: "probe".into(),
                    driver: "probe".into(),
                    args: ArgMap::from([("a".into(), "1".into()), ("b".into(), "2".into())]),
                    ..Default::default()
                }
            }
            async fn load(&self, _resources: Resources) -> Result<()> {
                Ok(())
            }
            async fn run(&self, _cancel: CancellationToken, args: ArgMap) -> Result<ArgMap> {
                Ok(args)
            }
        }

        let merged = Probe.merge_args(ArgMap::from([("b".into(), "9".into())]));
        assert_eq!(merged["a"], "1");
        assert_eq!(merged["b"], "9");
    }
}
