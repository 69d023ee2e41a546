use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::facts::{ClusterFact, FactStore, MemoryFactStore};

/// Fact store persisted as a JSON document.
///
/// Reads are served from memory. Every mutation rewrites the file through a
/// temporary file and a rename, and only lands in memory once it is on disk,
/// so a reader never sees a fact that a crash could lose.
///
/// Writes block on file I/O and sync. Async callers run them through
/// `tokio::task::spawn_blocking`, as the shell runner does.
#[derive(Debug)]
pub struct JsonFileFactStore {
    path: PathBuf,
    cache: MemoryFactStore,
    // Serializes file rewrites
    flush: Mutex<()>,
}

impl JsonFileFactStore {
    /// Open the store at `path`, loading existing facts if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let facts: Vec<ClusterFact> = if path.exists() {
            let data = fs::read(&path)?;
            if data.is_empty() {
                Vec::new()
            } else {
                serde_json::from_slice(&data)?
            }
        } else {
            Vec::new()
        };

        tracing::info!(path = %path.display(), facts = facts.len(), "Fact store opened");
        Ok(Self {
            path,
            cache: MemoryFactStore::from_facts(facts),
            flush: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, facts: &[ClusterFact]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(facts)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl FactStore for JsonFileFactStore {
    fn write(&self, fact: ClusterFact) -> Result<()> {
        let _flush = self.flush.lock().unwrap_or_else(|e| e.into_inner());
        let key = fact.fact_key();
        let mut next: Vec<ClusterFact> = self
            .cache
            .all()
            .into_iter()
            .filter(|f| f.fact_key() != key)
            .collect();
        next.push(fact.clone());
        self.persist(&next)?;
        self.cache.insert(fact);
        Ok(())
    }

    fn read(&self, cluster_id: &str, host: &str, key: &str) -> Result<Option<ClusterFact>> {
        self.cache.read(cluster_id, host, key)
    }

    fn list_host(&self, cluster_id: &str, host: &str) -> Result<Vec<ClusterFact>> {
        self.cache.list_host(cluster_id, host)
    }

    fn list_cluster(&self, cluster_id: &str) -> Result<Vec<ClusterFact>> {
        self.cache.list_cluster(cluster_id)
    }

    fn remove_host(&self, cluster_id: &str, host: &str) -> Result<usize> {
        let _flush = self.flush.lock().unwrap_or_else(|e| e.into_inner());
        let next: Vec<ClusterFact> = self
            .cache
            .all()
            .into_iter()
            .filter(|f| !(f.cluster_id == cluster_id && f.host == host))
            .collect();
        self.persist(&next)?;
        self.cache.remove_host(cluster_id, host)
    }
}
