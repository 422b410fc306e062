//! Registry — shared key/value service for session, pilot and resource
//! configuration.
//!
//! Agent-0 is the only writer; components hold clones and read.  Values are
//! JSON so heterogeneous payloads (RM inventory, `lm_info`, pilot config)
//! share one store.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::AgentError;

/// Shared registry handle.  Clone freely — backed by an `Arc`.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a serialisable value under `key`, replacing any previous value.
    pub async fn put<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Result<(), AgentError> {
        let value = serde_json::to_value(value)?;
        self.inner.write().await.insert(key.into(), value);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().await.get(key).cloned()
    }

    /// Fetch and deserialise, erroring on a missing key or shape mismatch.
    pub async fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, AgentError> {
        let value = self
            .get(key)
            .await
            .ok_or_else(|| AgentError::Config(format!("registry key not found: {key}")))?;
        Ok(serde_json::from_value(value)?)
    }

    /// All keys, sorted — used for the shutdown dump.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.inner.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
