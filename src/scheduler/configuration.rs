use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{LcmError, Result};

/// One immutable version of a playbook configuration.
///
/// Editing a configuration appends a new version; existing versions are
/// never mutated, so an execution bound to `(id, version)` always sees the
/// exact snapshot it was submitted with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: Uuid,
    pub version: u64,
    pub name: String,
    pub cluster_id: String,
    pub playbook: String,
    pub hosts: Vec<String>,
    pub parameters: serde_json::Value,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Configuration {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for a brand new configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConfiguration {
    pub name: String,
    pub cluster_id: String,
    pub playbook: String,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub creator: String,
}

/// Changes applied on top of the latest version. Unset fields carry over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationEdit {
    pub name: Option<String>,
    pub hosts: Option<Vec<String>>,
    pub parameters: Option<serde_json::Value>,
    pub editor: String,
}

/// Versioned configuration storage.
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    versions: RwLock<HashMap<Uuid, Vec<Configuration>>>,
}

/// Remove duplicate hosts while keeping first-seen order.
fn normalize_hosts(hosts: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    hosts
        .into_iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty() && seen.insert(h.clone()))
        .collect()
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from previously exported versions.
    pub fn from_versions(configurations: Vec<Configuration>) -> Self {
        let mut versions: HashMap<Uuid, Vec<Configuration>> = HashMap::new();
        for cfg in configurations {
            versions.entry(cfg.id).or_default().push(cfg);
        }
        for history in versions.values_mut() {
            history.sort_by_key(|c| c.version);
        }
        Self {
            versions: RwLock::new(versions),
        }
    }

    /// Create version 1 of a new configuration.
    pub async fn create(&self, new: NewConfiguration) -> Result<Configuration> {
        let hosts = normalize_hosts(new.hosts);
        if hosts.is_empty() {
            return Err(LcmError::InvalidConfiguration(
                "host set cannot be empty".to_string(),
            ));
        }
        if new.playbook.trim().is_empty() {
            return Err(LcmError::InvalidConfiguration(
                "playbook cannot be empty".to_string(),
            ));
        }
        if new.cluster_id.trim().is_empty() {
            return Err(LcmError::InvalidConfiguration(
                "cluster id cannot be empty".to_string(),
            ));
        }

        let cfg = Configuration {
            id: Uuid::new_v4(),
            version: 1,
            name: new.name,
            cluster_id: new.cluster_id,
            playbook: new.playbook,
            hosts,
            parameters: new.parameters,
            creator: new.creator,
            created_at: Utc::now(),
            deleted_at: None,
        };

        self.versions
            .write()
            .await
            .insert(cfg.id, vec![cfg.clone()]);
        tracing::info!(configuration_id = %cfg.id, cluster_id = %cfg.cluster_id, playbook = %cfg.playbook, "Configuration created");
        Ok(cfg)
    }

    /// Append a new version with the edit applied to the latest one.
    pub async fn update(&self, id: Uuid, edit: ConfigurationEdit) -> Result<Configuration> {
        let mut versions = self.versions.write().await;
        let history = versions
            .get_mut(&id)
            .ok_or_else(|| LcmError::ConfigurationNotFound(id.to_string()))?;
        let latest = history
            .last()
            .ok_or_else(|| LcmError::ConfigurationNotFound(id.to_string()))?;
        if latest.is_deleted() {
            return Err(LcmError::ConfigurationDeleted(id));
        }

        let mut next = latest.clone();
        next.version += 1;
        next.creator = edit.editor;
        next.created_at = Utc::now();
        if let Some(name) = edit.name {
            next.name = name;
        }
        if let Some(hosts) = edit.hosts {
            let hosts = normalize_hosts(hosts);
            if hosts.is_empty() {
                return Err(LcmError::InvalidConfiguration(
                    "host set cannot be empty".to_string(),
                ));
            }
            next.hosts = hosts;
        }
        if let Some(parameters) = edit.parameters {
            next.parameters = parameters;
        }

        history.push(next.clone());
        tracing::info!(configuration_id = %id, version = next.version, "Configuration updated");
        Ok(next)
    }

    /// Soft-delete: appends a final version carrying `deleted_at`.
    pub async fn delete(&self, id: Uuid, actor: &str) -> Result<Configuration> {
        let mut versions = self.versions.write().await;
        let history = versions
            .get_mut(&id)
            .ok_or_else(|| LcmError::ConfigurationNotFound(id.to_string()))?;
        let latest = history
            .last()
            .ok_or_else(|| LcmError::ConfigurationNotFound(id.to_string()))?;
        if latest.is_deleted() {
            return Err(LcmError::ConfigurationDeleted(id));
        }

        let now = Utc::now();
        let mut tombstone = latest.clone();
        tombstone.version += 1;
        tombstone.creator = actor.to_string();
        tombstone.created_at = now;
        tombstone.deleted_at = Some(now);
        history.push(tombstone.clone());
        tracing::info!(configuration_id = %id, version = tombstone.version, "Configuration deleted");
        Ok(tombstone)
    }

    /// Get the latest version
    pub async fn latest(&self, id: Uuid) -> Option<Configuration> {
        self.versions
            .read()
            .await
            .get(&id)
            .and_then(|h| h.last().cloned())
    }

    /// Get an exact version
    pub async fn version(&self, id: Uuid, version: u64) -> Option<Configuration> {
        self.versions
            .read()
            .await
            .get(&id)
            .and_then(|h| h.iter().find(|c| c.version == version).cloned())
    }

    /// All versions of a configuration, oldest first
    pub async fn versions(&self, id: Uuid) -> Vec<Configuration> {
        self.versions
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Latest version of every configuration that is not deleted, sorted by creation time
    pub async fn list(&self) -> Vec<Configuration> {
        let versions = self.versions.read().await;
        let mut latest: Vec<Configuration> = versions
            .values()
            .filter_map(|h| h.last())
            .filter(|c| !c.is_deleted())
            .cloned()
            .collect();
        latest.sort_by_key(|c| c.created_at);
        latest
    }

    /// Every stored version, for snapshots.
    pub async fn export(&self) -> Vec<Configuration> {
        self.versions
            .read()
            .await
            .values()
            .flat_map(|h| h.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_config(hosts: &[&str]) -> NewConfiguration {
        NewConfiguration {
            name: "deploy".to_string(),
            cluster_id: "c1".to_string(),
            playbook: "cluster_deploy".to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            parameters: serde_json::json!({"journal_size": 512}),
            creator: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn create_starts_at_version_one() {
        let store = ConfigurationStore::new();
        let cfg = store.create(new_config(&["h1", "h2"])).await.unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.hosts, vec!["h1", "h2"]);
        assert!(!cfg.is_deleted());
    }

    #[tokio::test]
    async fn create_deduplicates_hosts() {
        let store = ConfigurationStore::new();
        let cfg = store
            .create(new_config(&["h1", " h2 ", "h1", ""]))
            .await
            .unwrap();
        assert_eq!(cfg.hosts, vec!["h1", "h2"]);
    }

    #[tokio::test]
    async fn create_rejects_empty_hosts() {
        let store = ConfigurationStore::new();
        let err = store.create(new_config(&[])).await.unwrap_err();
        assert!(matches!(err, LcmError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn update_appends_version_and_keeps_old() {
        let store = ConfigurationStore::new();
        let v1 = store.create(new_config(&["h1"])).await.unwrap();
        let v2 = store
            .update(
                v1.id,
                ConfigurationEdit {
                    hosts: Some(vec!["h1".to_string(), "h2".to_string()]),
                    editor: "bob".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(v2.version, 2);
        assert_eq!(v2.creator, "bob");
        assert_eq!(store.version(v1.id, 1).await.unwrap(), v1);
        assert_eq!(store.latest(v1.id).await.unwrap().hosts.len(), 2);
        assert_eq!(store.versions(v1.id).await.len(), 2);
    }

    #[tokio::test]
    async fn delete_is_a_final_version() {
        let store = ConfigurationStore::new();
        let v1 = store.create(new_config(&["h1"])).await.unwrap();
        let tombstone = store.delete(v1.id, "alice").await.unwrap();
        assert_eq!(tombstone.version, 2);
        assert!(tombstone.is_deleted());
        assert!(store.list().await.is_empty());

        let err = store
            .update(v1.id, ConfigurationEdit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::ConfigurationDeleted(_)));
    }

    #[tokio::test]
    async fn from_versions_restores_history() {
        let store = ConfigurationStore::new();
        let v1 = store.create(new_config(&["h1"])).await.unwrap();
        store
            .update(
                v1.id,
                ConfigurationEdit {
                    name: Some("renamed".to_string()),
                    editor: "bob".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let restored = ConfigurationStore::from_versions(store.export().await);
        assert_eq!(restored.versions(v1.id).await.len(), 2);
        assert_eq!(restored.latest(v1.id).await.unwrap().name, "renamed");
    }
}
