//! FIFO run queue with global concurrency and per-session serialization.
//!
//! Grounded on `app/agents/run_lane_queue.py`. The original uses
//! `asyncio.Condition` to combine "wait until I'm at the head of the queue"
//! with "wait until my session isn't already running"; Rust has no direct
//! equivalent, so this is rebuilt on a `tokio::sync::Mutex<QueueState>` guard
//! plus a `tokio::sync::Notify` broadcast on every state change, with the
//! global slot and per-session exclusion held as owned guards on the
//! returned [`QueueLease`] so they release automatically when it drops.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue entry cancelled")]
    Cancelled,
    #[error("timed out waiting for queue lease")]
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub run_id: String,
    pub session_id: String,
    pub source: String,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
}

/// An acquired slot: global concurrency permit plus exclusive per-session
/// lock, both released when dropped.
pub struct QueueLease {
    pub entry: QueueEntry,
    _session_guard: OwnedMutexGuard<()>,
    _global_permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionQueueStatus {
    Running {
        session_id: String,
        run_id: String,
        enqueued_at: DateTime<Utc>,
        started_at: Option<DateTime<Utc>>,
    },
    Queued {
        session_id: String,
        run_id: String,
        position: usize,
        queue_depth: usize,
        enqueued_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub max_global_concurrency: usize,
    pub active_count: usize,
    pub pending_count: usize,
    pub active: Vec<QueueEntry>,
    pub pending: Vec<QueueEntry>,
}

struct QueueState {
    pending: VecDeque<String>,
    entries: HashMap<String, QueueEntry>,
    active_by_session: HashMap<String, String>,
    session_locks: HashMap<String, Arc<Mutex<()>>>,
}

pub struct RunLaneQueue {
    max_global_concurrency: usize,
    global_semaphore: Arc<Semaphore>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl RunLaneQueue {
    pub fn new(max_global_concurrency: usize) -> Self {
        let cap = max_global_concurrency.max(1);
        Self {
            max_global_concurrency: cap,
            global_semaphore: Arc::new(Semaphore::new(cap)),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                entries: HashMap::new(),
                active_by_session: HashMap::new(),
                session_locks: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub async fn enqueue(&self, session_id: impl Into<String>, source: impl Into<String>) -> QueueEntry {
        let entry = QueueEntry {
            run_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            source: source.into(),
            enqueued_at: Utc::now(),
            started_at: None,
            cancelled: false,
        };
        {
            let mut state = self.state.lock().await;
            state.entries.insert(entry.run_id.clone(), entry.clone());
            state.pending.push_back(entry.run_id.clone());
        }
        self.notify.notify_waiters();
        entry
    }

    /// Marks `run_id` cancelled. If still pending it is removed from the
    /// queue immediately; if already active it is left to the holder to
    /// observe `cancelled` and wind down.
    pub async fn cancel(&self, run_id: &str) -> bool {
        let found = {
            let mut state = self.state.lock().await;
            match state.entries.get_mut(run_id) {
                None => false,
                Some(entry) => {
                    entry.cancelled = true;
                    if let Some(pos) = state.pending.iter().position(|id| id == run_id) {
                        state.pending.remove(pos);
                        state.entries.remove(run_id);
                    }
                    true
                }
            }
        };
        if found {
            self.notify.notify_waiters();
        }
        found
    }

    async fn wait_and_acquire(&self, entry: &QueueEntry) -> Result<QueueLease, QueueError> {
        loop {
            // Wait until this entry is at the head of the pending queue.
            loop {
                let state = self.state.lock().await;
                let cancelled = state
                    .entries
                    .get(&entry.run_id)
                    .map(|e| e.cancelled)
                    .unwrap_or(true);
                if cancelled {
                    return Err(QueueError::Cancelled);
                }
                let is_head = state
                    .pending
                    .front()
                    .map(|id| id == &entry.run_id)
                    .unwrap_or(false);
                if is_head {
                    break;
                }
                let notified = self.notify.notified();
                drop(state);
                notified.await;
            }

            let global_permit = self
                .global_semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");

            let session_lock = {
                let mut state = self.state.lock().await;
                state
                    .session_locks
                    .entry(entry.session_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            };
            let session_guard = session_lock.lock_owned().await;

            let mut state = self.state.lock().await;
            let cancelled = state
                .entries
                .get(&entry.run_id)
                .map(|e| e.cancelled)
                .unwrap_or(true);
            if cancelled {
                return Err(QueueError::Cancelled);
            }
            let is_still_head = state
                .pending
                .front()
                .map(|id| id == &entry.run_id)
                .unwrap_or(false);
            let session_busy = state.active_by_session.contains_key(&entry.session_id);

            if is_still_head && !session_busy {
                state.pending.pop_front();
                let started_at = Utc::now();
                if let Some(e) = state.entries.get_mut(&entry.run_id) {
                    e.started_at = Some(started_at);
                }
                state
                    .active_by_session
                    .insert(entry.session_id.clone(), entry.run_id.clone());
                drop(state);
                self.notify.notify_waiters();

                let mut leased_entry = entry.clone();
                leased_entry.started_at = Some(started_at);
                return Ok(QueueLease {
                    entry: leased_entry,
                    _session_guard: session_guard,
                    _global_permit: global_permit,
                });
            }

            drop(state);
            drop(session_guard);
            drop(global_permit);
            tokio::task::yield_now().await;
        }
    }

    /// Blocks until `entry` reaches the head of the queue and its session is
    /// free, or `timeout` elapses (no timeout if `None`).
    pub async fn acquire(
        &self,
        entry: &QueueEntry,
        timeout: Option<Duration>,
    ) -> Result<QueueLease, QueueError> {
        match timeout {
            Some(d) if !d.is_zero() => tokio::time::timeout(d, self.wait_and_acquire(entry))
                .await
                .map_err(|_| QueueError::TimedOut)?,
            _ => self.wait_and_acquire(entry).await,
        }
    }

    pub async fn release(&self, lease: QueueLease) {
        let session_id = lease.entry.session_id.clone();
        let run_id = lease.entry.run_id.clone();
        {
            let mut state = self.state.lock().await;
            if state.active_by_session.get(&session_id) == Some(&run_id) {
                state.active_by_session.remove(&session_id);
            }
            state.entries.remove(&run_id);
        }
        self.notify.notify_waiters();
        // Guards embedded in `lease` drop here, releasing the session lock
        // and global semaphore permit.
    }

    /// Enqueues, waits for a lease, runs `f` with the leased entry, then
    /// always releases — the closest Rust equivalent to the original's
    /// `@asynccontextmanager lease()`.
    pub async fn with_lease<F, Fut, T>(
        &self,
        session_id: impl Into<String>,
        source: impl Into<String>,
        timeout: Option<Duration>,
        f: F,
    ) -> Result<T, QueueError>
    where
        F: FnOnce(&QueueEntry) -> Fut,
        Fut: Future<Output = T>,
    {
        let entry = self.enqueue(session_id, source).await;
        let lease = self.acquire(&entry, timeout).await?;
        let result = f(&lease.entry).await;
        self.release(lease).await;
        Ok(result)
    }

    pub async fn session_queue_status(&self, session_id: &str) -> Option<SessionQueueStatus> {
        let state = self.state.lock().await;
        if let Some(run_id) = state.active_by_session.get(session_id) {
            let entry = state.entries.get(run_id)?;
            return Some(SessionQueueStatus::Running {
                session_id: session_id.to_string(),
                run_id: run_id.clone(),
                enqueued_at: entry.enqueued_at,
                started_at: entry.started_at,
            });
        }
        for (idx, run_id) in state.pending.iter().enumerate() {
            if let Some(entry) = state.entries.get(run_id) {
                if entry.session_id == session_id {
                    return Some(SessionQueueStatus::Queued {
                        session_id: session_id.to_string(),
                        run_id: run_id.clone(),
                        position: idx + 1,
                        queue_depth: state.pending.len(),
                        enqueued_at: entry.enqueued_at,
                    });
                }
            }
        }
        None
    }

    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        let pending = state
            .pending
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect();
        let active = state
            .active_by_session
            .values()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect();
        QueueSnapshot {
            max_global_concurrency: self.max_global_concurrency,
            active_count: state.active_by_session.len(),
            pending_count: state.pending.len(),
            active,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn enqueue_then_acquire_succeeds_for_sole_entry() {
        let queue = RunLaneQueue::new(2);
        let entry = queue.enqueue("s1", "api").await;
        let lease = queue.acquire(&entry, None).await.unwrap();
        assert_eq!(lease.entry.session_id, "s1");
        queue.release(lease).await;
    }

    #[tokio::test]
    async fn cancel_before_acquire_returns_cancelled_error() {
        let queue = RunLaneQueue::new(2);
        let entry = queue.enqueue("s1", "api").await;
        assert!(queue.cancel(&entry.run_id).await);
        let result = queue.acquire(&entry, None).await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
    }

    #[tokio::test]
    async fn cancel_of_unknown_run_id_returns_false() {
        let queue = RunLaneQueue::new(2);
        assert!(!queue.cancel("does-not-exist").await);
    }

    #[tokio::test]
    async fn second_entry_in_same_session_waits_for_first_release() {
        let queue = Arc::new(RunLaneQueue::new(4));
        let first = queue.enqueue("s1", "api").await;
        let second = queue.enqueue("s1", "api").await;

        let lease1 = queue.acquire(&first, None).await.unwrap();

        let second_done = Arc::new(AtomicBool::new(false));
        let queue2 = queue.clone();
        let flag = second_done.clone();
        let handle = tokio::spawn(async move {
            let lease2 = queue2.acquire(&second, None).await.unwrap();
            flag.store(true, Ordering::SeqCst);
            queue2.release(lease2).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!second_done.load(Ordering::SeqCst));

        queue.release(lease1).await;
        handle.await.unwrap();
        assert!(second_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn acquire_times_out_when_blocked() {
        let queue = RunLaneQueue::new(4);
        let first = queue.enqueue("s1", "api").await;
        let second = queue.enqueue("s1", "api").await;
        let lease1 = queue.acquire(&first, None).await.unwrap();

        let result = queue.acquire(&second, Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(QueueError::TimedOut)));

        queue.release(lease1).await;
    }

    #[tokio::test]
    async fn fifo_order_across_different_sessions() {
        let queue = Arc::new(RunLaneQueue::new(1));
        let a = queue.enqueue("s1", "api").await;
        let b = queue.enqueue("s2", "api").await;

        let lease_a = queue.acquire(&a, None).await.unwrap();

        let queue2 = queue.clone();
        let handle = tokio::spawn(async move { queue2.acquire(&b, None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        queue.release(lease_a).await;
        let lease_b = handle.await.unwrap().unwrap();
        assert_eq!(lease_b.entry.session_id, "s2");
    }

    #[tokio::test]
    async fn session_queue_status_reports_running_and_queued() {
        let queue = RunLaneQueue::new(4);
        let first = queue.enqueue("s1", "api").await;
        let _second = queue.enqueue("s1", "api").await;
        let lease = queue.acquire(&first, None).await.unwrap();

        let status = queue.session_queue_status("s1").await.unwrap();
        assert!(matches!(status, SessionQueueStatus::Running { .. }));

        queue.release(lease).await;
    }

    #[tokio::test]
    async fn snapshot_reports_counts() {
        let queue = RunLaneQueue::new(3);
        let _a = queue.enqueue("s1", "api").await;
        let _b = queue.enqueue("s2", "api").await;
        let snap = queue.snapshot().await;
        assert_eq!(snap.pending_count, 2);
        assert_eq!(snap.active_count, 0);
        assert_eq!(snap.max_global_concurrency, 3);
    }

    #[tokio::test]
    async fn with_lease_releases_after_closure_runs() {
        let queue = RunLaneQueue::new(2);
        let result = queue
            .with_lease("s1", "api", None, |entry| async move { entry.session_id.clone() })
            .await
            .unwrap();
        assert_eq!(result, "s1");
        assert!(queue.session_queue_status("s1").await.is_none());
    }
}
