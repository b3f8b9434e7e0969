//! Tool-call and plan-approval gate: intercepts destructive actions and
//! requires explicit user approval before they run.
//!
//! Grounded on `app/core/guardian.py` (`SecurityPolicy` + `GuardianObject`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

/// What kind of action a pending [`ActionState`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ToolCall,
    PlanApproval,
}

/// Lifecycle status of a pending action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Consumed,
}

/// A tool call or plan intercepted by the guardian, awaiting a user
/// decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionState {
    pub id: String,
    pub action_type: ActionType,
    pub tool_name: String,
    pub tool_args: serde_json::Map<String, Value>,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
}

/// Tools and argument patterns that require explicit user approval before
/// they are allowed to run.
pub struct SecurityPolicy;

impl SecurityPolicy {
    const RESTRICTED_TOOLS: &'static [&'static str] = &[
        "delete_file",
        "move_file",
        "format_disk",
        "install_python_package",
        "run_shell_command",
    ];

    const SENSITIVE_SELF_MODIFY_PREFIXES: &'static [&'static str] = &["app/core", "app/agents"];

    /// Whether invoking `tool_name` with `args` requires approval.
    pub fn is_restricted(tool_name: &str, args: &serde_json::Map<String, Value>) -> bool {
        if Self::RESTRICTED_TOOLS.contains(&tool_name) {
            return true;
        }

        if tool_name == "self_modify_code" {
            return Self::self_modify_is_restricted(args);
        }

        if tool_name == "run_python_code" || tool_name == "python_repl" {
            let code = args
                .get("code")
                .or_else(|| args.get("script"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if code.contains("os.remove") || code.contains("shutil.rmtree") {
                return true;
            }
        }

        false
    }

    fn self_modify_is_restricted(args: &serde_json::Map<String, Value>) -> bool {
        let path_arg = args
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim();
        if path_arg.is_empty() {
            return true;
        }

        let candidate = PathBuf::from(path_arg);
        let normalized = normalize_lexically(&candidate);

        // A resolved path that escapes the project root (via `..`) is always
        // restricted; we can't meaningfully resolve symlinks without a real
        // filesystem root, so lexical normalization is the best available
        // signal, matching the original's best-effort `Path.resolve()` guard.
        if normalized
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return true;
        }

        let relative = normalized.to_string_lossy().to_lowercase().replace('\\', "/");
        for prefix in Self::SENSITIVE_SELF_MODIFY_PREFIXES {
            let p = prefix.to_lowercase();
            if relative == p || relative.starts_with(&format!("{p}/")) {
                return true;
            }
        }

        false
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn signature(tool_name: &str, args: &serde_json::Map<String, Value>) -> String {
    let mut pairs: Vec<(String, String)> = args
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    pairs.sort();
    format!("{tool_name}:{pairs:?}")
}

/// Tracks pending destructive actions and plan approvals awaiting user
/// sign-off. One instance is shared process-wide via `Arc`.
pub struct Guardian {
    pending: Mutex<HashMap<String, ActionState>>,
}

impl Guardian {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Checks whether a tool call is allowed to execute now. Returns
    /// `(is_allowed, reason, action_id)`: an unrestricted call is always
    /// allowed with no action id; a restricted call with a matching
    /// approved signature consumes that approval and is allowed; otherwise
    /// a new pending action is recorded and the call is blocked.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        tool_args: &serde_json::Map<String, Value>,
    ) -> (bool, String, Option<String>) {
        if !SecurityPolicy::is_restricted(tool_name, tool_args) {
            return (true, "Safe".to_string(), None);
        }

        let sig = signature(tool_name, tool_args);
        let mut pending = self.pending.lock().unwrap();

        let approved_id = pending.iter().find_map(|(id, state)| {
            if state.status == ActionStatus::Approved
                && signature(&state.tool_name, &state.tool_args) == sig
            {
                Some(id.clone())
            } else {
                None
            }
        });

        if let Some(id) = approved_id {
            if let Some(state) = pending.get_mut(&id) {
                state.status = ActionStatus::Consumed;
            }
            return (true, "Approved by user".to_string(), Some(id));
        }

        let action_id = format!("act_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        pending.insert(
            action_id.clone(),
            ActionState {
                id: action_id.clone(),
                action_type: ActionType::ToolCall,
                tool_name: tool_name.to_string(),
                tool_args: tool_args.clone(),
                status: ActionStatus::Pending,
                created_at: Utc::now(),
            },
        );

        tracing::warn!(tool = tool_name, action_id = %action_id, "guardian intercepted destructive action");

        (
            false,
            "Destructive action intercepted. User approval required.".to_string(),
            Some(action_id),
        )
    }

    /// Registers a plan awaiting approval before the orchestrator may
    /// execute it, returning the new action id.
    pub fn create_plan_approval(&self, session_id: &str, goal: &str, plan: Value) -> String {
        let action_id = format!("plan_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut tool_args = serde_json::Map::new();
        tool_args.insert("session_id".to_string(), Value::String(session_id.to_string()));
        tool_args.insert("goal".to_string(), Value::String(goal.to_string()));
        tool_args.insert("plan".to_string(), plan);

        self.pending.lock().unwrap().insert(
            action_id.clone(),
            ActionState {
                id: action_id.clone(),
                action_type: ActionType::PlanApproval,
                tool_name: "execute_plan".to_string(),
                tool_args,
                status: ActionStatus::Pending,
                created_at: Utc::now(),
            },
        );

        tracing::info!(action_id = %action_id, "guardian created plan approval request");
        action_id
    }

    pub fn approve_action(&self, action_id: &str) -> bool {
        self.set_status(action_id, ActionStatus::Approved)
    }

    pub fn reject_action(&self, action_id: &str) -> bool {
        self.set_status(action_id, ActionStatus::Rejected)
    }

    pub fn consume_action(&self, action_id: &str) -> bool {
        self.set_status(action_id, ActionStatus::Consumed)
    }

    fn set_status(&self, action_id: &str, status: ActionStatus) -> bool {
        let mut pending = self.pending.lock().unwrap();
        match pending.get_mut(action_id) {
            Some(state) => {
                state.status = status;
                true
            }
            None => false,
        }
    }

    pub fn get_action(&self, action_id: &str) -> Option<ActionState> {
        self.pending.lock().unwrap().get(action_id).cloned()
    }

    /// Lists pending actions, optionally narrowed to one [`ActionType`].
    pub fn list_pending_actions(&self, action_type: Option<ActionType>) -> Vec<ActionState> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.status == ActionStatus::Pending)
            .filter(|a| action_type.map_or(true, |t| a.action_type == t))
            .cloned()
            .collect()
    }
}

impl Default for Guardian {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn safe_tool_passes_without_action() {
        let g = Guardian::new();
        let (allowed, reason, action_id) = g.validate_tool_call("read_file", &args(&[("path", "a.txt")]));
        assert!(allowed);
        assert_eq!(reason, "Safe");
        assert!(action_id.is_none());
    }

    #[test]
    fn restricted_tool_is_blocked_and_recorded() {
        let g = Guardian::new();
        let (allowed, _, action_id) = g.validate_tool_call("delete_file", &args(&[("path", "a.txt")]));
        assert!(!allowed);
        let id = action_id.unwrap();
        assert!(g.get_action(&id).is_some());
        assert_eq!(g.list_pending_actions(None).len(), 1);
    }

    #[test]
    fn approving_then_retrying_same_call_is_allowed() {
        let g = Guardian::new();
        let call_args = args(&[("path", "a.txt")]);
        let (_, _, action_id) = g.validate_tool_call("delete_file", &call_args);
        g.approve_action(&action_id.unwrap());

        let (allowed, reason, action_id2) = g.validate_tool_call("delete_file", &call_args);
        assert!(allowed);
        assert_eq!(reason, "Approved by user");
        let consumed = g.get_action(&action_id2.unwrap()).unwrap();
        assert_eq!(consumed.status, ActionStatus::Consumed);
    }

    #[test]
    fn rejected_action_does_not_unblock_retry() {
        let g = Guardian::new();
        let call_args = args(&[("path", "a.txt")]);
        let (_, _, action_id) = g.validate_tool_call("delete_file", &call_args);
        g.reject_action(&action_id.unwrap());

        let (allowed, _, _) = g.validate_tool_call("delete_file", &call_args);
        assert!(!allowed);
    }

    #[test]
    fn self_modify_outside_sensitive_prefixes_is_allowed() {
        let allowed_args = args(&[("path", "app/tools/custom.py")]);
        assert!(!SecurityPolicy::is_restricted("self_modify_code", &allowed_args));
    }

    #[test]
    fn self_modify_inside_sensitive_prefix_is_restricted() {
        let restricted_args = args(&[("path", "app/core/guardian.py")]);
        assert!(SecurityPolicy::is_restricted("self_modify_code", &restricted_args));
    }

    #[test]
    fn self_modify_path_traversal_is_restricted() {
        let traversal_args = args(&[("path", "../../etc/passwd")]);
        assert!(SecurityPolicy::is_restricted("self_modify_code", &traversal_args));
    }

    #[test]
    fn self_modify_missing_path_is_restricted() {
        let no_path = serde_json::Map::new();
        assert!(SecurityPolicy::is_restricted("self_modify_code", &no_path));
    }

    #[test]
    fn dangerous_python_snippet_is_restricted() {
        let code_args = args(&[("code", "import os\nos.remove('/etc/passwd')")]);
        assert!(SecurityPolicy::is_restricted("run_python_code", &code_args));
    }

    #[test]
    fn plan_approval_round_trip() {
        let g = Guardian::new();
        let action_id = g.create_plan_approval("s1", "clean the kitchen", serde_json::json!({"steps": []}));
        let action = g.get_action(&action_id).unwrap();
        assert_eq!(action.action_type, ActionType::PlanApproval);
        assert_eq!(action.status, ActionStatus::Pending);

        assert!(g.approve_action(&action_id));
        assert_eq!(g.get_action(&action_id).unwrap().status, ActionStatus::Approved);
    }
}
