//! Broker registry
//!
//! Maps broker ids to their live connections so any connection can reach any
//! other when relaying. Filled once at startup and read concurrently after
//! that; entries are never removed, the whole registry is dropped on teardown.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::broker::protocol::BrokerProtocol;
use crate::utils::{GatewayError, Result};

#[derive(Default)]
pub struct BrokerRegistry {
    connections: RwLock<BTreeMap<String, Arc<dyn BrokerProtocol>>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `connection` under `broker_id`. Last writer wins.
    pub fn register(&self, broker_id: &str, connection: Arc<dyn BrokerProtocol>) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(broker_id.to_string(), connection);
    }

    pub fn get(&self, broker_id: &str) -> Result<Arc<dyn BrokerProtocol>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(broker_id)
            .cloned()
            .ok_or_else(|| GatewayError::BrokerNotFound(broker_id.to_string()))
    }

    /// Registered ids in ascending order.
    pub fn list_ids(&self) -> Vec<String> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
