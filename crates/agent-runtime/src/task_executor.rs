//! [`coordination::TaskExecutor`] adapter: runs one scheduled
//! [`coordination::AgentTask`] through the [`Orchestrator`].
//!
//! Grounded on `app/core/heartbeat.py`'s `_run_task_through_orchestrator`,
//! which builds a synthetic `task_<id>` session so the task's own run
//! never collides with a live user session in the run registry or lane
//! queue, and so [`coordination::planner::should_request_plan_approval`]'s
//! background-session carve-out applies automatically.

use std::sync::Arc;

use async_trait::async_trait;
use coordination::{AgentTask, TaskExecutor as CoordinationTaskExecutor};
use serde_json::Map;

use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::types::AgentRequest;

/// Bridges the heartbeat's [`coordination::TaskExecutor`] trait to one
/// shared [`Orchestrator`] instance.
pub struct OrchestratorTaskExecutor {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorTaskExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl CoordinationTaskExecutor for OrchestratorTaskExecutor {
    async fn execute(&self, task: &AgentTask) -> Result<String, String> {
        let prompt = coordination::decode_plan_description(task.description.as_deref()).1;
        let prompt = if prompt.trim().is_empty() { task.title.clone() } else { prompt };

        let request = AgentRequest {
            prompt,
            session_id: format!("task_{}", task.id),
            images: Vec::new(),
            model: None,
            channel: "heartbeat".to_string(),
            source_metadata: Map::new(),
        };

        match self.orchestrator.run(request).await {
            RunOutcome::Response(response) => {
                if response.metadata.error.is_some() {
                    Err(response.response)
                } else {
                    Ok(response.response)
                }
            }
            RunOutcome::Approval(_) => {
                Err("task requested plan approval, which background sessions never trigger".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_description_falls_back_to_task_title() {
        let task = AgentTask {
            id: "abc".to_string(),
            title: "Do the thing".to_string(),
            description: None,
            status: coordination::TaskStatus::Pending,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            priority: 3,
            result: None,
        };
        let (_, remainder) = coordination::decode_plan_description(task.description.as_deref());
        let prompt = if remainder.trim().is_empty() { task.title.clone() } else { remainder };
        assert_eq!(prompt, "Do the thing");
    }
}
