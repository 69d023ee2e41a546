//! Per-cluster mutual exclusion.
//!
//! At most one execution holds a cluster's lock at any instant. Locks are
//! handed out as [`ClusterLease`] values: consuming the lease with
//! [`ClusterLease::release`] or dropping it releases the lock, so every exit
//! path of a run (success, failure, cancel, timeout, forced shutdown)
//! releases exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{LcmError, Result};

/// Current owner of a cluster lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub execution_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Lifetime counters, mostly useful to assert release-exactly-once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub grants: u64,
    pub releases: u64,
    /// Refused acquisition attempts, not distinct waiting executions. The
    /// queue retries a busy cluster on every scan and each retry counts.
    pub busy: u64,
}

#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<String, LockHolder>,
    stats: LockStats,
}

#[derive(Debug, Default)]
pub struct ClusterLockManager {
    table: Mutex<LockTable>,
    released: Notify,
}

/// Outcome of an acquisition attempt.
#[derive(Debug)]
pub enum LockAcquisition {
    Granted(ClusterLease),
    Busy { holder: Uuid },
}

impl LockAcquisition {
    /// The granted lease, or `ClusterBusy` naming the current holder.
    pub fn into_lease(self, cluster_id: &str) -> Result<ClusterLease> {
        match self {
            LockAcquisition::Granted(lease) => Ok(lease),
            LockAcquisition::Busy { holder } => Err(LcmError::ClusterBusy {
                cluster_id: cluster_id.to_string(),
                holder,
            }),
        }
    }
}

impl ClusterLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        // Every update is a single insert/remove, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to take the lock for `cluster_id` on behalf of `execution_id`.
    /// Never blocks.
    pub fn try_acquire(self: &Arc<Self>, cluster_id: &str, execution_id: Uuid) -> LockAcquisition {
        let mut table = self.table();
        if let Some(holder) = table.held.get(cluster_id) {
            let holder = holder.execution_id;
            table.stats.busy += 1;
            tracing::debug!(cluster_id, execution_id = %execution_id, holder = %holder, "Cluster busy");
            return LockAcquisition::Busy { holder };
        }

        table.held.insert(
            cluster_id.to_string(),
            LockHolder {
                execution_id,
                acquired_at: Utc::now(),
            },
        );
        table.stats.grants += 1;
        tracing::debug!(cluster_id, execution_id = %execution_id, "Cluster lock granted");

        LockAcquisition::Granted(ClusterLease {
            manager: Arc::clone(self),
            cluster_id: cluster_id.to_string(),
            execution_id,
            released: false,
        })
    }

    /// Release the lock if `execution_id` owns it.
    pub fn release(&self, cluster_id: &str, execution_id: Uuid) -> Result<()> {
        {
            let mut table = self.table();
            match table.held.get(cluster_id) {
                Some(holder) if holder.execution_id == execution_id => {
                    table.held.remove(cluster_id);
                    table.stats.releases += 1;
                }
                _ => {
                    return Err(LcmError::LockNotHeld {
                        cluster_id: cluster_id.to_string(),
                        execution_id,
                    })
                }
            }
        }
        tracing::debug!(cluster_id, execution_id = %execution_id, "Cluster lock released");
        self.released.notify_waiters();
        Ok(())
    }

    /// Operator override: drop the lock regardless of owner. Returns the
    /// previous holder. A lease still held by that execution becomes a no-op.
    pub fn force_release(&self, cluster_id: &str) -> Option<LockHolder> {
        let previous = {
            let mut table = self.table();
            let previous = table.held.remove(cluster_id);
            if previous.is_some() {
                table.stats.releases += 1;
            }
            previous
        };
        if let Some(ref holder) = previous {
            tracing::warn!(cluster_id, execution_id = %holder.execution_id, "Cluster lock force-released");
            self.released.notify_waiters();
        }
        previous
    }

    pub fn holder(&self, cluster_id: &str) -> Option<LockHolder> {
        self.table().held.get(cluster_id).cloned()
    }

    /// All held locks as `(cluster_id, holder)`
    pub fn held(&self) -> Vec<(String, LockHolder)> {
        self.table()
            .held
            .iter()
            .map(|(c, h)| (c.clone(), h.clone()))
            .collect()
    }

    pub fn stats(&self) -> LockStats {
        self.table().stats
    }

    /// Notified every time a lock is released.
    pub fn released(&self) -> &Notify {
        &self.released
    }
}

/// Exclusive right to run against one cluster.
#[derive(Debug)]
pub struct ClusterLease {
    manager: Arc<ClusterLockManager>,
    cluster_id: String,
    execution_id: Uuid,
    released: bool,
}

impl ClusterLease {
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Release the lock now.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.cluster_id, self.execution_id)
    }
}

impl Drop for ClusterLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.cluster_id, self.execution_id) {
            tracing::warn!(cluster_id = %self.cluster_id, error = %e, "Dropped lease no longer held");
        }
    }
}
