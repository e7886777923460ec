//! The `go` driver kind: functions linked into the process.
//!
//! Native functions live in a process-global table. Embedders register them
//! at startup; after that the table is effectively immutable and every
//! `load "go:NAME"` resolves through it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{ArgMap, Driver, DriverError, Location, Manifest, Resources, Result};

/// Signature of a native function.
pub type NativeFn =
    Arc<dyn Fn(CancellationToken, ArgMap) -> BoxFuture<'static, Result<ArgMap>> + Send + Sync>;

struct NativeEntry {
    manifest: Manifest,
    call: NativeFn,
}

static TABLE: Lazy<RwLock<HashMap<String, Arc<NativeEntry>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a native function under `name` with a default manifest.
pub fn register<F, Fut>(name: &str, call: F)
where
    F: Fn(CancellationToken, ArgMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ArgMap>> + Send + 'static,
{
    register_with_manifest(
        Manifest {
            name: name.to_string(),
            driver: "go".to_string(),
            ..Default::default()
        },
        call,
    );
}

/// Register a native function with an explicit manifest (argument defaults,
/// retry and ignore-failure policy).
pub fn register_with_manifest<F, Fut>(manifest: Manifest, call: F)
where
    F: Fn(CancellationToken, ArgMap) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ArgMap>> + Send + 'static,
{
    let name = manifest.name.clone();
    let call: NativeFn =
        Arc::new(move |cancel, args| -> BoxFuture<'static, Result<ArgMap>> {
            Box::pin(call(cancel, args))
        });
    TABLE.write().insert(name, Arc::new(NativeEntry { manifest, call }));
}

/// Driver instance bound to one registered native function.
pub struct NativeDriver {
    fname: String,
    entry: Arc<NativeEntry>,
    resources: Mutex<Option<Resources>>,
}

impl NativeDriver {
    /// Build an instance for `location`, failing when the function was never
    /// registered.
    pub fn create(location: &Location) -> Result<Arc<dyn Driver>> {
        let entry = TABLE
            .read()
            .get(&location.fname)
            .cloned()
            .ok_or_else(|| DriverError::FunctionUnavailable(location.fname.clone()))?;
        Ok(Arc::new(Self {
            fname: location.fname.clone(),
            entry,
            resources: Mutex::new(None),
        }))
    }

    /// Resources handed over at load time, if any.
    pub fn resources(&self) -> Option<Resources> {
        self.resources.lock().clone()
    }
}

#[async_trait::async_trait]
impl Driver for NativeDriver {
    fn name(&self) -> &str {
        "go"
    }

    fn function_name(&self) -> &str {
        &self.fname
    }

    fn manifest(&self) -> Manifest {
        self.entry.manifest.clone()
    }

    async fn load(&self, resources: Resources) -> Result<()> {
        *self.resources.lock() = Some(resources);
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken, args: ArgMap) -> Result<ArgMap> {
        (self.entry.call)(cancel, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_function_runs() {
        register("echo_native", |_cancel, args| async move { Ok(args) });
        let loc = Location::parse("go:echo_native").unwrap();
        let driver = NativeDriver::create(&loc).unwrap();
        let out = driver
            .run(
                CancellationToken::new(),
                ArgMap::from([("k".into(), "v".into())]),
            )
            .await
            .unwrap();
        assert_eq!(out["k"], "v");
    }

    #[test]
    fn unknown_function_fails_creation() {
        let loc = Location::parse("go:never_registered").unwrap();
        assert!(matches!(
            NativeDriver::create(&loc),
            Err(DriverError::FunctionUnavailable(_))
        ));
    }
}
