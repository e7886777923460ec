//! In-process flow store.
//!
//! Flows live in memory for their lifetime; there is no persistence.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::{Result, RuntimeError};
use super::flow::{Flow, FlowId};

/// Map of flow id to flow state.
#[derive(Default)]
pub struct FlowStore {
    flows: RwLock<HashMap<String, Arc<Flow>>>,
}

impl FlowStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a flow, replacing any previous flow with the same id.
    pub fn add(&self, flow: Flow) -> Arc<Flow> {
        let flow = Arc::new(flow);
        self.flows
            .write()
            .insert(flow.id.to_string(), flow.clone());
        flow
    }

    /// Fetch a flow by id.
    pub fn get(&self, id: &FlowId) -> Result<Arc<Flow>> {
        self.flows
            .read()
            .get(&id.to_string())
            .cloned()
            .ok_or_else(|| RuntimeError::FlowNotFound(id.to_string()))
    }

    /// Remove a flow.
    pub fn remove(&self, id: &FlowId) -> Result<()> {
        self.flows
            .write()
            .remove(&id.to_string())
            .map(|_| ())
            .ok_or_else(|| RuntimeError::FlowNotFound(id.to_string()))
    }

    /// Ids of every registered flow.
    pub fn ids(&self) -> Vec<FlowId> {
        self.flows
            .read()
            .values()
            .map(|f| f.id.clone())
            .collect()
    }

    /// Number of registered flows.
    pub fn len(&self) -> usize {
        self.flows.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.flows.read().is_empty()
    }
}
