//! Durable host facts shared between independent runs.
//!
//! A run records what it learned about a host (for example which raw device
//! and partition back a storage unit) and a later run reads it back. Facts
//! describe host state, not run success, so they are kept even when the run
//! that wrote them fails.
//!
//! - Keys are `(cluster_id, host, key)`; last writer wins, no history.
//! - A missing fact is reported as missing. [`FactScope::require`] turns it
//!   into [`LcmError::FactInconsistency`]; nothing substitutes a default.

pub mod file;
pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LcmError, Result};

pub use file::JsonFileFactStore;
pub use memory::MemoryFactStore;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FactKey {
    pub cluster_id: String,
    pub host: String,
    pub key: String,
}

impl FactKey {
    pub fn new(cluster_id: &str, host: &str, key: &str) -> Self {
        Self {
            cluster_id: cluster_id.to_string(),
            host: host.to_string(),
            key: key.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterFact {
    pub cluster_id: String,
    pub host: String,
    pub key: String,
    pub value: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
    pub writer_execution: Uuid,
}

impl ClusterFact {
    pub fn fact_key(&self) -> FactKey {
        FactKey::new(&self.cluster_id, &self.host, &self.key)
    }
}

/// Keyed fact persistence. Writes to a single key are atomic.
pub trait FactStore: Send + Sync {
    /// Record a fact, replacing any previous value for the key.
    fn write(&self, fact: ClusterFact) -> Result<()>;

    /// Read a fact. `None` means the fact was never written (or was removed).
    fn read(&self, cluster_id: &str, host: &str, key: &str) -> Result<Option<ClusterFact>>;

    /// Every fact recorded for one host of a cluster, sorted by key.
    fn list_host(&self, cluster_id: &str, host: &str) -> Result<Vec<ClusterFact>>;

    /// Every fact recorded for a cluster, sorted by host then key.
    fn list_cluster(&self, cluster_id: &str) -> Result<Vec<ClusterFact>>;

    /// Forget every fact of one host. Returns how many were removed.
    fn remove_host(&self, cluster_id: &str, host: &str) -> Result<usize>;
}

/// Fact access bound to one cluster and one writer execution, handed to the
/// playbook runner.
#[derive(Clone)]
pub struct FactScope {
    store: Arc<dyn FactStore>,
    cluster_id: String,
    execution_id: Uuid,
}

impl std::fmt::Debug for FactScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactScope")
            .field("cluster_id", &self.cluster_id)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl FactScope {
    pub fn new(store: Arc<dyn FactStore>, cluster_id: &str, execution_id: Uuid) -> Self {
        Self {
            store,
            cluster_id: cluster_id.to_string(),
            execution_id,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn write(&self, host: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.store.write(ClusterFact {
            cluster_id: self.cluster_id.clone(),
            host: host.to_string(),
            key: key.to_string(),
            value,
            recorded_at: Utc::now(),
            writer_execution: self.execution_id,
        })?;
        tracing::debug!(cluster_id = %self.cluster_id, host, key, execution_id = %self.execution_id, "Fact recorded");
        Ok(())
    }

    pub fn read(&self, host: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .store
            .read(&self.cluster_id, host, key)?
            .map(|f| f.value))
    }

    /// Read a fact the caller cannot proceed without.
    pub fn require(&self, host: &str, key: &str) -> Result<serde_json::Value> {
        match self.store.read(&self.cluster_id, host, key)? {
            Some(fact) => Ok(fact.value),
            None => {
                tracing::warn!(cluster_id = %self.cluster_id, host, key, "Required fact is missing");
                Err(LcmError::fact_missing(&self.cluster_id, host, key))
            }
        }
    }

    /// Read and decode a required fact; a value of the wrong shape is a
    /// `FactInconsistency` just like a missing one.
    pub fn require_as<T: DeserializeOwned>(&self, host: &str, key: &str) -> Result<T> {
        let value = self.require(host, key)?;
        serde_json::from_value(value).map_err(|e| LcmError::FactInconsistency {
            cluster_id: self.cluster_id.clone(),
            host: host.to_string(),
            key: key.to_string(),
            detail: format!("malformed value: {}", e),
        })
    }

    pub fn list_host(&self, host: &str) -> Result<Vec<ClusterFact>> {
        self.store.list_host(&self.cluster_id, host)
    }
}
