use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{LcmError, Result};
use crate::scheduler::lock::{ClusterLease, ClusterLockManager};

/// A submitted execution waiting for a worker and its cluster lock
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub execution_id: Uuid,
    pub cluster_id: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<QueuedEntry>,
    accepting: bool,
}

/// Bounded admission buffer.
///
/// Enqueue never blocks: a full or closed queue rejects immediately and the
/// caller decides whether to retry. Dequeue hands out the oldest entry whose
/// cluster lock is free; entries for a busy cluster keep their place, so a
/// cluster's executions start in submission order.
#[derive(Debug)]
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    enqueued: Notify,
}

impl ExecutionQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity),
                accepting: true,
            }),
            capacity,
            enqueued: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an execution at the back. Fails with `AdmissionRejected` if the
    /// queue is full or no longer accepting.
    pub fn try_enqueue(&self, execution_id: Uuid, cluster_id: &str) -> Result<()> {
        {
            let mut state = self.state();
            if !state.accepting {
                return Err(LcmError::AdmissionRejected(
                    "controller is shutting down".to_string(),
                ));
            }
            if state.pending.len() >= self.capacity {
                return Err(LcmError::AdmissionRejected(format!(
                    "queue is at capacity ({})",
                    self.capacity
                )));
            }
            state.pending.push_back(QueuedEntry {
                execution_id,
                cluster_id: cluster_id.to_string(),
                enqueued_at: Utc::now(),
            });
        }
        self.enqueued.notify_waiters();
        Ok(())
    }

    /// Re-admit an entry regardless of capacity (snapshot restore).
    pub fn restore(&self, execution_id: Uuid, cluster_id: &str) {
        self.state().pending.push_back(QueuedEntry {
            execution_id,
            cluster_id: cluster_id.to_string(),
            enqueued_at: Utc::now(),
        });
        self.enqueued.notify_waiters();
    }

    /// Remove and return the oldest entry whose cluster lock can be granted now,
    /// together with the granted lease.
    pub fn next_ready(&self, locks: &Arc<ClusterLockManager>) -> Option<(QueuedEntry, ClusterLease)> {
        let mut state = self.state();
        let mut ready = None;
        {
            let mut busy: HashSet<&str> = HashSet::new();
            for (pos, entry) in state.pending.iter().enumerate() {
                if busy.contains(entry.cluster_id.as_str()) {
                    continue;
                }
                match locks
                    .try_acquire(&entry.cluster_id, entry.execution_id)
                    .into_lease(&entry.cluster_id)
                {
                    Ok(lease) => {
                        ready = Some((pos, lease));
                        break;
                    }
                    Err(e) => {
                        tracing::trace!(execution_id = %entry.execution_id, error = %e, "Skipping entry");
                        busy.insert(entry.cluster_id.as_str());
                    }
                }
            }
        }

        let (pos, lease) = ready?;
        let entry = state.pending.remove(pos)?;
        Some((entry, lease))
    }

    /// Wait for the next ready entry. Returns `None` once `stop` is cancelled.
    pub async fn dequeue(
        &self,
        locks: &Arc<ClusterLockManager>,
        stop: &CancellationToken,
    ) -> Option<(QueuedEntry, ClusterLease)> {
        loop {
            // Register for wake-ups before scanning so no notification is lost
            let enqueued = self.enqueued.notified();
            let released = locks.released().notified();
            tokio::pin!(enqueued);
            tokio::pin!(released);
            enqueued.as_mut().enable();
            released.as_mut().enable();

            if stop.is_cancelled() {
                return None;
            }
            if let Some(ready) = self.next_ready(locks) {
                return Some(ready);
            }

            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = &mut enqueued => {}
                _ = &mut released => {}
            }
        }
    }

    /// Remove a queued entry. Returns false if it is not queued.
    pub fn remove(&self, execution_id: Uuid) -> bool {
        let mut state = self.state();
        let before = state.pending.len();
        state.pending.retain(|e| e.execution_id != execution_id);
        before != state.pending.len()
    }

    /// Stop accepting submissions
    pub fn close(&self) {
        self.state().accepting = false;
    }

    pub fn is_closed(&self) -> bool {
        !self.state().accepting
    }

    /// Take every remaining entry, oldest first
    pub fn drain_pending(&self) -> Vec<QueuedEntry> {
        self.state().pending.drain(..).collect()
    }

    /// Snapshot of queued entries, oldest first
    pub fn pending(&self) -> Vec<QueuedEntry> {
        self.state().pending.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.state().pending.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_when_full() {
        let queue = ExecutionQueue::with_capacity(2);
        queue.try_enqueue(Uuid::new_v4(), "c1").unwrap();
        queue.try_enqueue(Uuid::new_v4(), "c2").unwrap();
        assert!(queue.is_full());
        let err = queue.try_enqueue(Uuid::new_v4(), "c3").unwrap_err();
        assert!(matches!(err, LcmError::AdmissionRejected(_)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn rejects_when_closed() {
        let queue = ExecutionQueue::with_capacity(2);
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.try_enqueue(Uuid::new_v4(), "c1"),
            Err(LcmError::AdmissionRejected(_))
        ));
    }

    #[test]
    fn next_ready_is_fifo_across_clusters() {
        let queue = ExecutionQueue::with_capacity(8);
        let locks = Arc::new(ClusterLockManager::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.try_enqueue(first, "c1").unwrap();
        queue.try_enqueue(second, "c2").unwrap();

        let (entry, _lease_a) = queue.next_ready(&locks).unwrap();
        assert_eq!(entry.execution_id, first);
        let (entry, _lease_b) = queue.next_ready(&locks).unwrap();
        assert_eq!(entry.execution_id, second);
        assert!(queue.next_ready(&locks).is_none());
    }

    #[test]
    fn busy_counts_one_refusal_per_scan_and_cluster() {
        let queue = ExecutionQueue::with_capacity(8);
        let locks = Arc::new(ClusterLockManager::new());
        queue.try_enqueue(Uuid::new_v4(), "c1").unwrap();
        let (_entry, _lease) = queue.next_ready(&locks).unwrap();
        queue.try_enqueue(Uuid::new_v4(), "c1").unwrap();
        queue.try_enqueue(Uuid::new_v4(), "c1").unwrap();

        assert!(queue.next_ready(&locks).is_none());
        assert_eq!(locks.stats().busy, 1);
        assert!(queue.next_ready(&locks).is_none());
        assert_eq!(locks.stats().busy, 2);
        assert_eq!(locks.stats().grants, 1);
    }

    #[test]
    fn busy_cluster_is_skipped_but_keeps_order() {
        let queue = ExecutionQueue::with_capacity(8);
        let locks = Arc::new(ClusterLockManager::new());
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();
        let b1 = Uuid::new_v4();
        queue.try_enqueue(a1, "c1").unwrap();
        queue.try_enqueue(a2, "c1").unwrap();
        queue.try_enqueue(b1, "c2").unwrap();

        let (entry, lease_a1) = queue.next_ready(&locks).unwrap();
        assert_eq!(entry.execution_id, a1);

        // c1 is busy, so c2 goes next while a2 keeps its place
        let (entry, _lease_b1) = queue.next_ready(&locks).unwrap();
        assert_eq!(entry.execution_id, b1);
        assert!(queue.next_ready(&locks).is_none());
        assert_eq!(queue.len(), 1);

        lease_a1.release().unwrap();
        let (entry, _lease_a2) = queue.next_ready(&locks).unwrap();
        assert_eq!(entry.execution_id, a2);
    }

    #[test]
    fn remove_and_drain() {
        let queue = ExecutionQueue::with_capacity(4);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        queue.try_enqueue(a, "c1").unwrap();
        queue.try_enqueue(b, "c1").unwrap();
        assert!(queue.remove(a));
        assert!(!queue.remove(a));
        let drained = queue.drain_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].execution_id, b);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue_and_stops() {
        let queue = Arc::new(ExecutionQueue::with_capacity(4));
        let locks = Arc::new(ClusterLockManager::new());
        let stop = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let locks = locks.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                queue
                    .dequeue(&locks, &stop)
                    .await
                    .map(|(entry, _lease)| entry.execution_id)
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let id = Uuid::new_v4();
        queue.try_enqueue(id, "c1").unwrap();
        assert_eq!(waiter.await.unwrap(), Some(id));

        stop.cancel();
        assert!(queue.dequeue(&locks, &stop).await.is_none());
    }
}
