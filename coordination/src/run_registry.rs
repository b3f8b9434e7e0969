//! Registry of live agent runs: abort signaling, steer-message injection,
//! turn tracking, and wall-clock watchdogs.
//!
//! Grounded on `app/agents/run_registry.py`. The original keeps `RunHandle`s
//! in a module-level dict and binds `asyncio.Event`/`asyncio.Queue`
//! primitives lazily to the running loop; here the registry is an explicit
//! `Arc<RunRegistry>` shared by the caller (no hidden globals), and
//! `asyncio.Event`'s is-set-or-wait duality is rebuilt as [`FlagEvent`] over
//! an `AtomicBool` + `tokio::sync::Notify`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("run {0:?} is already active")]
    AlreadyActive(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    TimedOut,
}

/// A boolean flag that can be waited on, standing in for `asyncio.Event`.
#[derive(Debug)]
pub struct FlagEvent {
    flag: AtomicBool,
    notify: Notify,
}

impl Default for FlagEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl FlagEvent {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits until `set` is called; returns immediately if already set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

struct MutableState {
    status: RunStatus,
    current_turn: u32,
    cancel_reason: Option<String>,
}

/// A single live agent run. Every orchestrator loop iteration should check
/// [`RunHandle::is_aborted`] and drain [`RunHandle::try_recv_steer`] between
/// tool calls.
pub struct RunHandle {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub max_turns: u32,
    abort: FlagEvent,
    done: FlagEvent,
    state: Mutex<MutableState>,
    current_turn_atomic: AtomicU32,
    steer_tx: mpsc::UnboundedSender<String>,
    steer_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl RunHandle {
    fn new(session_id: String, max_turns: u32) -> Self {
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            started_at: Utc::now(),
            max_turns,
            abort: FlagEvent::new(),
            done: FlagEvent::new(),
            state: Mutex::new(MutableState {
                status: RunStatus::Running,
                current_turn: 0,
                cancel_reason: None,
            }),
            current_turn_atomic: AtomicU32::new(0),
            steer_tx,
            steer_rx: Mutex::new(steer_rx),
            timeout_task: Mutex::new(None),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_set()
    }

    pub async fn wait_until_done(&self) {
        self.done.wait().await;
    }

    pub async fn status(&self) -> RunStatus {
        self.state.lock().await.status
    }

    pub async fn cancel_reason(&self) -> Option<String> {
        self.state.lock().await.cancel_reason.clone()
    }

    pub fn current_turn(&self) -> u32 {
        self.current_turn_atomic.load(Ordering::SeqCst)
    }

    /// Injects a steering message the orchestrator will pick up at the next
    /// drain point.
    pub fn steer(&self, message: impl Into<String>) {
        let _ = self.steer_tx.send(message.into());
    }

    /// Drains all currently queued steer messages without blocking.
    pub async fn drain_steer(&self) -> Vec<String> {
        let mut rx = self.steer_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            drained.push(msg);
        }
        drained
    }

    async fn mark(&self, status: RunStatus, reason: Option<String>) {
        let mut state = self.state.lock().await;
        state.status = status;
        state.cancel_reason = reason;
        drop(state);
        self.abort.set();
        self.done.set();
    }
}

pub struct RunRegistry {
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new run. `timeout_ms == 0` means no wall-clock watchdog.
    pub async fn register_run(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        max_turns: u32,
        timeout_ms: u64,
    ) -> Result<Arc<RunHandle>, RegistryError> {
        let session_id = session_id.into();
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&session_id) {
            return Err(RegistryError::AlreadyActive(session_id));
        }

        let handle = Arc::new(RunHandle::new(session_id.clone(), max_turns));
        runs.insert(session_id.clone(), handle.clone());
        drop(runs);

        if timeout_ms > 0 {
            let registry = self.clone();
            let watch_session = session_id.clone();
            let task = tokio::spawn(async move {
                registry.auto_abort(watch_session, timeout_ms).await;
            });
            *handle.timeout_task.lock().await = Some(task);
        }

        Ok(handle)
    }

    async fn auto_abort(self: Arc<Self>, session_id: String, timeout_ms: u64) {
        tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
        let run = {
            let runs = self.runs.lock().await;
            runs.get(&session_id).cloned()
        };
        if let Some(run) = run {
            if run.status().await == RunStatus::Running {
                run.mark(RunStatus::TimedOut, Some(format!("timeout_{timeout_ms}ms")))
                    .await;
            }
        }
    }

    pub async fn abort_run(&self, session_id: &str, reason: impl Into<String>) -> bool {
        let run = {
            let runs = self.runs.lock().await;
            runs.get(session_id).cloned()
        };
        let Some(run) = run else { return false };
        if run.status().await != RunStatus::Running {
            return false;
        }
        run.mark(RunStatus::Aborted, Some(reason.into())).await;
        if let Some(task) = run.timeout_task.lock().await.take() {
            task.abort();
        }
        true
    }

    pub async fn get_run(&self, session_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.lock().await.get(session_id).cloned()
    }

    pub async fn complete_run(&self, session_id: &str) {
        let run = {
            let mut runs = self.runs.lock().await;
            runs.remove(session_id)
        };
        let Some(run) = run else { return };
        run.mark(RunStatus::Completed, None).await;
        if let Some(task) = run.timeout_task.lock().await.take() {
            task.abort();
        }
    }

    /// Blocks until the run ends (completed/aborted/timed-out), or `timeout`
    /// elapses. Returns `false` if the session is unknown or times out.
    pub async fn wait_for_run_end(&self, session_id: &str, timeout: Option<Duration>) -> bool {
        let Some(run) = self.get_run(session_id).await else {
            return false;
        };
        match timeout {
            Some(d) => tokio::time::timeout(d, run.wait_until_done()).await.is_ok(),
            None => {
                run.wait_until_done().await;
                true
            }
        }
    }

    pub async fn list_active_runs(&self) -> Vec<Arc<RunHandle>> {
        self.runs.lock().await.values().cloned().collect()
    }

    /// Updates the turn counter; auto-aborts with `max_turns_reached` if
    /// `turn_num` exceeds `max_turns`.
    pub async fn update_run_turn(&self, session_id: &str, turn_num: u32) {
        let Some(run) = self.get_run(session_id).await else {
            return;
        };
        run.current_turn_atomic.store(turn_num, Ordering::SeqCst);
        {
            let mut state = run.state.lock().await;
            state.current_turn = turn_num;
        }
        if run.max_turns > 0 && turn_num > run.max_turns {
            run.mark(RunStatus::Aborted, Some("max_turns_reached".to_string()))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get_returns_running_handle() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.register_run("s1", 25, 0).await.unwrap();
        assert_eq!(handle.status().await, RunStatus::Running);
        assert!(registry.get_run("s1").await.is_some());
    }

    #[tokio::test]
    async fn register_twice_for_same_session_errors() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s1", 25, 0).await.unwrap();
        let err = registry.register_run("s1", 25, 0).await;
        assert!(matches!(err, Err(RegistryError::AlreadyActive(_))));
    }

    #[tokio::test]
    async fn abort_run_sets_abort_and_done() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.register_run("s1", 25, 0).await.unwrap();
        assert!(registry.abort_run("s1", "user_cancelled").await);
        assert!(handle.is_aborted());
        assert_eq!(handle.status().await, RunStatus::Aborted);
        assert_eq!(handle.cancel_reason().await.as_deref(), Some("user_cancelled"));
    }

    #[tokio::test]
    async fn abort_run_on_unknown_session_returns_false() {
        let registry = Arc::new(RunRegistry::new());
        assert!(!registry.abort_run("ghost", "x").await);
    }

    #[tokio::test]
    async fn complete_run_removes_from_registry() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s1", 25, 0).await.unwrap();
        registry.complete_run("s1").await;
        assert!(registry.get_run("s1").await.is_none());
    }

    #[tokio::test]
    async fn update_run_turn_auto_aborts_past_max_turns() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.register_run("s1", 3, 0).await.unwrap();
        registry.update_run_turn("s1", 2).await;
        assert_eq!(handle.status().await, RunStatus::Running);
        registry.update_run_turn("s1", 4).await;
        assert_eq!(handle.status().await, RunStatus::Aborted);
        assert_eq!(handle.cancel_reason().await.as_deref(), Some("max_turns_reached"));
    }

    #[tokio::test]
    async fn steer_messages_drain_in_order() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.register_run("s1", 25, 0).await.unwrap();
        handle.steer("first");
        handle.steer("second");
        let drained = handle.drain_steer().await;
        assert_eq!(drained, vec!["first".to_string(), "second".to_string()]);
        assert!(handle.drain_steer().await.is_empty());
    }

    #[tokio::test]
    async fn watchdog_times_out_running_run() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.register_run("s1", 25, 20).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(handle.status().await, RunStatus::TimedOut);
        assert!(handle.is_aborted());
    }

    #[tokio::test]
    async fn complete_run_cancels_pending_watchdog() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.register_run("s1", 25, 5_000).await.unwrap();
        registry.complete_run("s1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.status().await, RunStatus::Completed);
    }

    #[tokio::test]
    async fn wait_for_run_end_returns_true_once_completed() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s1", 25, 0).await.unwrap();
        let registry2 = registry.clone();
        let handle = tokio::spawn(async move { registry2.wait_for_run_end("s1", None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.complete_run("s1").await;
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_run_end_times_out() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s1", 25, 0).await.unwrap();
        let ended = registry
            .wait_for_run_end("s1", Some(Duration::from_millis(10)))
            .await;
        assert!(!ended);
    }

    #[tokio::test]
    async fn list_active_runs_reflects_registry_contents() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s1", 25, 0).await.unwrap();
        registry.register_run("s2", 25, 0).await.unwrap();
        assert_eq!(registry.list_active_runs().await.len(), 2);
        registry.complete_run("s1").await;
        assert_eq!(registry.list_active_runs().await.len(), 1);
    }
}
