//! Background task queue with dependency gating and PLAN_META encoding.
//!
//! Grounded on `app/core/scheduler.py`. Tasks persist their plan metadata
//! (step id, dependencies, parallelizability) inside the free-text
//! description using a delimited JSON preamble, so storage stays a plain
//! string column while the scheduler can still reason about dependency
//! graphs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

const PLAN_META_BEGIN: &str = "[[PLAN_META]]";
const PLAN_META_END: &str = "[[/PLAN_META]]";

/// Embeds `meta` as a JSON preamble ahead of the human-readable
/// `description`, recoverable with [`decode_plan_description`].
pub fn encode_plan_description(description: &str, meta: &Value) -> String {
    let payload = serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string());
    format!("{PLAN_META_BEGIN}{payload}{PLAN_META_END}\n{description}")
        .trim()
        .to_string()
}

/// Splits a stored description back into its plan metadata and the
/// human-readable remainder. Descriptions with no PLAN_META preamble (or a
/// malformed one) decode to an empty object and the text unchanged.
pub fn decode_plan_description(description: Option<&str>) -> (Value, String) {
    let text = description.unwrap_or("");
    if !text.starts_with(PLAN_META_BEGIN) {
        return (Value::Object(Default::default()), text.to_string());
    }
    let Some(end_idx) = text.find(PLAN_META_END) else {
        return (Value::Object(Default::default()), text.to_string());
    };
    let payload = &text[PLAN_META_BEGIN.len()..end_idx];
    let remainder = text[end_idx + PLAN_META_END.len()..].trim_start_matches(['\r', '\n']);

    match serde_json::from_str::<Value>(payload) {
        Ok(meta) => (meta, remainder.to_string()),
        Err(_) => (Value::Object(Default::default()), text.to_string()),
    }
}

/// Lifecycle status of a scheduled [`AgentTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A unit of background work the heartbeat picks up and runs through the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub priority: u8,
    pub result: Option<String>,
}

impl AgentTask {
    fn new(title: String, description: Option<String>, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            description,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            priority,
        result: None,
        }
    }

    /// Whether the task's description begins with the `[Scheduled]` prefix
    /// set by the cron manager, which gets a shorter staleness cutoff.
    pub fn is_scheduled(&self) -> bool {
        self.title.starts_with("[Scheduled] ")
    }
}

/// FIFO-ish in-memory task queue with dependency-aware readiness and
/// staleness reconciliation. Production deployments back this with
/// persistent storage; the in-memory `Vec` here mirrors the shape of the
/// original's DB-backed queries closely enough to swap in one later.
pub struct TaskQueue {
    tasks: Mutex<Vec<AgentTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_task(&self, title: impl Into<String>, description: impl Into<String>, priority: u8) -> AgentTask {
        let desc = description.into();
        let task = AgentTask::new(title.into(), if desc.is_empty() { None } else { Some(desc) }, priority);
        self.tasks.lock().unwrap().push(task.clone());
        task
    }

    pub fn list_pending(&self, limit: usize) -> Vec<AgentTask> {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Pending tasks whose `depends_on` step ids are all in the completed
    /// set, in queue order, capped at `limit`.
    pub fn list_ready_pending(&self, limit: usize) -> Vec<AgentTask> {
        let tasks = self.tasks.lock().unwrap();
        let completed_step_ids = Self::completed_plan_step_ids(&tasks);
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| Self::dependencies_satisfied(t, &completed_step_ids))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn has_active_task(&self, title: &str, description: Option<&str>) -> bool {
        self.tasks.lock().unwrap().iter().any(|t| {
            matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                && t.title == title
                && description.map_or(true, |d| t.description.as_deref().unwrap_or("") == d)
        })
    }

    pub fn update_task_status(&self, task_id: &str, status: TaskStatus, result: Option<String>) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
            task.status = status;
            task.updated_at = Utc::now();
            if result.is_some() {
                task.result = result;
            }
        }
    }

    /// Marks stale `in_progress` tasks as failed. Scheduled tasks use a
    /// tighter 900s cutoff regardless of `max_age_seconds` since they
    /// re-fire on their own cadence and shouldn't linger.
    pub fn reconcile_stale_in_progress(&self, max_age_seconds: i64) -> usize {
        let stale_before = Utc::now() - ChronoDuration::seconds(max_age_seconds.max(1));
        let scheduled_stale_before = Utc::now() - ChronoDuration::seconds(max_age_seconds.max(1).min(900));

        let mut tasks = self.tasks.lock().unwrap();
        let mut stale_count = 0;
        for task in tasks.iter_mut() {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let cutoff = if task.is_scheduled() {
                scheduled_stale_before
            } else {
                stale_before
            };
            if task.updated_at <= cutoff {
                stale_count += 1;
                task.status = TaskStatus::Failed;
                task.updated_at = Utc::now();
                task.result = Some(if task.is_scheduled() {
                    "Scheduled task exceeded max in-progress time (900s) and was marked stale.".to_string()
                } else {
                    format!("Task exceeded max in-progress time ({max_age_seconds}s) and was marked stale.")
                });
            }
        }
        stale_count
    }

    /// Collapses duplicate active `[Scheduled]` tasks for the same logical
    /// job down to one, keeping the running instance if any, else the
    /// oldest queued one.
    pub fn reconcile_duplicate_scheduled_active(&self) -> usize {
        let mut tasks = self.tasks.lock().unwrap();
        let mut groups: HashMap<(String, String), Vec<usize>> = HashMap::new();

        for (idx, task) in tasks.iter().enumerate() {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
                continue;
            }
            if !task.is_scheduled() {
                continue;
            }
            let key = (task.title.clone(), task.description.clone().unwrap_or_default());
            groups.entry(key).or_default().push(idx);
        }

        let mut deduped = 0;
        for (_, indices) in groups {
            if indices.len() <= 1 {
                continue;
            }
            let keep_idx = indices
                .iter()
                .copied()
                .filter(|&i| tasks[i].status == TaskStatus::InProgress)
                .min_by_key(|&i| tasks[i].updated_at)
                .or_else(|| indices.iter().copied().min_by_key(|&i| tasks[i].created_at))
                .unwrap();

            for idx in indices {
                if idx == keep_idx {
                    continue;
                }
                deduped += 1;
                tasks[idx].status = TaskStatus::Failed;
                tasks[idx].updated_at = Utc::now();
                tasks[idx].result =
                    Some("Duplicate scheduled task coalesced; another active run already exists.".to_string());
            }
        }
        deduped
    }

    pub fn get_task_prompt_description(&self, task: &AgentTask) -> String {
        decode_plan_description(task.description.as_deref()).1
    }

    pub fn allows_parallel(&self, task: &AgentTask) -> bool {
        let (meta, _) = decode_plan_description(task.description.as_deref());
        meta.get("parallelizable").and_then(Value::as_bool).unwrap_or(false)
    }

    fn completed_plan_step_ids(tasks: &[AgentTask]) -> HashSet<String> {
        tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| {
                let (meta, _) = decode_plan_description(t.description.as_deref());
                meta.get("step_id").map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            })
            .collect()
    }

    fn dependencies_satisfied(task: &AgentTask, completed_step_ids: &HashSet<String>) -> bool {
        let (meta, _) = decode_plan_description(task.description.as_deref());
        let Some(deps) = meta.get("depends_on").and_then(Value::as_array) else {
            return true;
        };
        deps.iter().all(|dep| {
            let key = match dep {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            completed_step_ids.contains(&key)
        })
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_description_round_trips() {
        let meta = serde_json::json!({"step_id": "1", "depends_on": []});
        let encoded = encode_plan_description("Do the thing", &meta);
        let (decoded_meta, remainder) = decode_plan_description(Some(&encoded));
        assert_eq!(decoded_meta["step_id"], "1");
        assert_eq!(remainder, "Do the thing");
    }

    #[test]
    fn decode_plain_description_has_empty_meta() {
        let (meta, remainder) = decode_plan_description(Some("just text, no meta"));
        assert_eq!(meta, Value::Object(Default::default()));
        assert_eq!(remainder, "just text, no meta");
    }

    #[test]
    fn decode_none_description() {
        let (meta, remainder) = decode_plan_description(None);
        assert_eq!(meta, Value::Object(Default::default()));
        assert_eq!(remainder, "");
    }

    #[test]
    fn ready_pending_respects_dependencies() {
        let q = TaskQueue::new();
        let step1_desc = encode_plan_description("step 1", &serde_json::json!({"step_id": "s1"}));
        let step2_desc = encode_plan_description(
            "step 2",
            &serde_json::json!({"step_id": "s2", "depends_on": ["s1"]}),
        );
        let t1 = q.add_task("Plan", step1_desc, 3);
        let _t2 = q.add_task("Plan", step2_desc, 3);

        let ready = q.list_ready_pending(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, t1.id);

        q.update_task_status(&t1.id, TaskStatus::Completed, None);
        let ready = q.list_ready_pending(10);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].title, "Plan");
        assert!(q.get_task_prompt_description(&ready[0]) == "step 2");
    }

    #[test]
    fn allows_parallel_reads_meta_flag() {
        let q = TaskQueue::new();
        let desc = encode_plan_description("go", &serde_json::json!({"parallelizable": true}));
        let t = q.add_task("Plan", desc, 3);
        assert!(q.allows_parallel(&t));
    }

    #[test]
    fn has_active_task_matches_title_and_description() {
        let q = TaskQueue::new();
        q.add_task("[Scheduled] digest", "daily digest", 4);
        assert!(q.has_active_task("[Scheduled] digest", Some("daily digest")));
        assert!(!q.has_active_task("[Scheduled] digest", Some("other")));
    }

    #[test]
    fn reconcile_duplicate_scheduled_active_keeps_one() {
        let q = TaskQueue::new();
        q.add_task("[Scheduled] digest", "daily digest", 4);
        q.add_task("[Scheduled] digest", "daily digest", 4);
        q.add_task("[Scheduled] digest", "daily digest", 4);

        let deduped = q.reconcile_duplicate_scheduled_active();
        assert_eq!(deduped, 2);

        let remaining_active = q
            .list_pending(10)
            .into_iter()
            .filter(|t| t.title == "[Scheduled] digest")
            .count();
        assert_eq!(remaining_active, 1);
    }
}
