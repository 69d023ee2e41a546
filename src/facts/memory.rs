use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::facts::{ClusterFact, FactKey, FactStore};

/// In-process fact store.
#[derive(Debug, Default)]
pub struct MemoryFactStore {
    facts: RwLock<BTreeMap<FactKey, ClusterFact>>,
}

impl MemoryFactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_facts(facts: Vec<ClusterFact>) -> Self {
        Self {
            facts: RwLock::new(facts.into_iter().map(|f| (f.fact_key(), f)).collect()),
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, BTreeMap<FactKey, ClusterFact>> {
        self.facts.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, BTreeMap<FactKey, ClusterFact>> {
        self.facts.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Every fact, ordered by key
    pub fn all(&self) -> Vec<ClusterFact> {
        self.read_guard().values().cloned().collect()
    }

    pub(crate) fn insert(&self, fact: ClusterFact) {
        self.write_guard().insert(fact.fact_key(), fact);
    }
}

impl FactStore for MemoryFactStore {
    fn write(&self, fact: ClusterFact) -> Result<()> {
        self.insert(fact);
        Ok(())
    }

    fn read(&self, cluster_id: &str, host: &str, key: &str) -> Result<Option<ClusterFact>> {
        Ok(self
            .read_guard()
            .get(&FactKey::new(cluster_id, host, key))
            .cloned())
    }

    fn list_host(&self, cluster_id: &str, host: &str) -> Result<Vec<ClusterFact>> {
        Ok(self
            .read_guard()
            .values()
            .filter(|f| f.cluster_id == cluster_id && f.host == host)
            .cloned()
            .collect())
    }

    fn list_cluster(&self, cluster_id: &str) -> Result<Vec<ClusterFact>> {
        Ok(self
            .read_guard()
            .values()
            .filter(|f| f.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    fn remove_host(&self, cluster_id: &str, host: &str) -> Result<usize> {
        let mut facts = self.write_guard();
        let before = facts.len();
        facts.retain(|k, _| !(k.cluster_id == cluster_id && k.host == host));
        Ok(before - facts.len())
    }
}
