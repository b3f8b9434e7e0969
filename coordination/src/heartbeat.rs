//! Periodic reactive tick that drains ready background tasks through an
//! executor.
//!
//! Grounded on `app/core/heartbeat.py::AgentHeartbeat`. The original
//! constructs a fresh orchestrator per tick to avoid sharing mutable
//! runtime state across parallel task executions; here that's modeled as
//! an injected [`TaskExecutor`] so this module stays free of a hard
//! dependency on the orchestrator.

use crate::scheduler::{AgentTask, TaskQueue, TaskStatus};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Staleness cutoff for `in_progress` tasks left behind by a crash.
pub const STALE_IN_PROGRESS_TIMEOUT_SECONDS: i64 = 3600;
/// Cap on how many ready tasks a single tick will consider for parallel
/// execution.
pub const MAX_PARALLEL_READY_TASKS: usize = 3;

/// Runs one [`AgentTask`] to completion, returning a result summary to
/// record on the task (and any error as the failure reason).
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &AgentTask) -> Result<String, String>;
}

/// Current status snapshot of the heartbeat loop.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HeartbeatStatus {
    pub running: bool,
    pub interval_seconds: u64,
    pub last_tick_at: i64,
    pub next_tick_at: i64,
}

/// Drives [`TaskQueue`] reconciliation and reactive task execution on a
/// fixed interval.
pub struct AgentHeartbeat {
    interval: Duration,
    queue: Arc<TaskQueue>,
    executor: Arc<dyn TaskExecutor>,
    running: AtomicBool,
    last_tick_at: AtomicI64,
    next_tick_at: AtomicI64,
}

impl AgentHeartbeat {
    pub fn new(interval: Duration, queue: Arc<TaskQueue>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            interval,
            queue,
            executor,
            running: AtomicBool::new(false),
            last_tick_at: AtomicI64::new(0),
            next_tick_at: AtomicI64::new(0),
        }
    }

    pub fn status(&self) -> HeartbeatStatus {
        HeartbeatStatus {
            running: self.running.load(Ordering::SeqCst),
            interval_seconds: self.interval.as_secs(),
            last_tick_at: self.last_tick_at.load(Ordering::SeqCst),
            next_tick_at: self.next_tick_at.load(Ordering::SeqCst),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.next_tick_at.store(0, Ordering::SeqCst);
        tracing::info!("agent heartbeat stopped");
    }

    /// Runs the heartbeat loop until [`Self::stop`] is called. Intended to
    /// be spawned as its own task; a single bad tick is logged and does not
    /// stop the loop.
    pub async fn start(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(interval_secs = self.interval.as_secs(), "agent heartbeat started");

        while self.running.load(Ordering::SeqCst) {
            self.last_tick_at.store(now_secs(), Ordering::SeqCst);
            if let Err(err) = self.tick().await {
                tracing::error!(error = %err, "error in heartbeat tick");
            }
            self.next_tick_at
                .store(now_secs() + self.interval.as_secs() as i64, Ordering::SeqCst);
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One iteration: reconcile stale/duplicate state, then run whatever
    /// ready tasks are available (in parallel when two or more are
    /// independently parallelizable).
    pub async fn tick(&self) -> Result<(), String> {
        let stale_count = self.queue.reconcile_stale_in_progress(STALE_IN_PROGRESS_TIMEOUT_SECONDS);
        if stale_count > 0 {
            tracing::warn!(count = stale_count, "marked stale in-progress task(s) as failed");
        }

        let deduped_count = self.queue.reconcile_duplicate_scheduled_active();
        if deduped_count > 0 {
            tracing::warn!(count = deduped_count, "coalesced duplicate active scheduled task(s)");
        }

        let ready_tasks = self.queue.list_ready_pending(MAX_PARALLEL_READY_TASKS);
        if ready_tasks.is_empty() {
            tracing::debug!("no ready pending tasks; skipping model invocation");
            return Ok(());
        }

        let parallel_ready: Vec<&AgentTask> = ready_tasks
            .iter()
            .filter(|t| self.queue.allows_parallel(t))
            .collect();

        if parallel_ready.len() >= 2 {
            tracing::info!(count = parallel_ready.len(), "parallel-ready task(s) detected");
            let futures = parallel_ready.into_iter().map(|t| self.process_task(t));
            futures::future::join_all(futures).await;
        } else {
            let task = &ready_tasks[0];
            tracing::info!(task_id = %task.id, title = %task.title, "reactive task detected");
            self.process_task(task).await;
        }

        Ok(())
    }

    async fn process_task(&self, task: &AgentTask) {
        tracing::info!(title = %task.title, "heartbeat picked up task");
        self.queue.update_task_status(&task.id, TaskStatus::InProgress, None);

        match self.executor.execute(task).await {
            Ok(summary) => {
                self.queue.update_task_status(&task.id, TaskStatus::Completed, Some(summary));
                tracing::info!(title = %task.title, "heartbeat task completed");
            }
            Err(reason) => {
                self.queue.update_task_status(&task.id, TaskStatus::Failed, Some(reason.clone()));
                tracing::error!(title = %task.title, error = %reason, "heartbeat task failed");
            }
        }
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
