//! Consumer-facing request/response envelope and streaming events.
//!
//! Grounded on `app/api/routes/chat.py` (request/response shapes) and
//! `app/core/orchestrator.py`'s `stream_callback` event names — the layer
//! that lives "one level up" from `coordination`, per that crate's own
//! module doc.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound request from any channel (UI, Telegram, Discord, or a
/// heartbeat-driven background task).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    pub session_id: String,
    #[serde(default)]
    pub images: Vec<String>,
    /// Explicit `"provider/model"` override, bypassing the router.
    #[serde(default)]
    pub model: Option<String>,
    pub channel: String,
    #[serde(default)]
    pub source_metadata: Map<String, Value>,
}

/// Per-run bookkeeping surfaced back to the caller alongside the answer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseMetadata {
    pub intent: Option<String>,
    pub model_used: Option<String>,
    pub tools_used: Vec<String>,
    pub failover_attempts: Vec<String>,
    pub memory_used: usize,
    pub relationship_memory_used: usize,
    pub source_channel: String,
    pub channel: String,
    pub queue_wait_seconds: f64,
    /// Populated only on the error response shape (§6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Successful (or canned-error) reply to one [`AgentRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentResponse {
    pub response: String,
    pub metadata: ResponseMetadata,
    pub session_id: String,
}

impl AgentResponse {
    pub fn error(session_id: impl Into<String>, channel: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            response: message.clone(),
            metadata: ResponseMetadata {
                channel: channel.to_string(),
                source_channel: channel.to_string(),
                error: Some(message),
                status: Some("error".to_string()),
                ..Default::default()
            },
            session_id: session_id.into(),
        }
    }
}

/// Returned in place of an [`AgentResponse`] when the planner decided the
/// run needs sign-off before any tool executes (§6 plan-approval workflow).
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequired {
    pub approval_required: bool,
    pub action_id: String,
    pub plan_summary: String,
    pub session_id: String,
}

/// SSE-like progress events emitted while a run is in flight. `phase`
/// values mirror the original's `queued`, `queued_done`, `evaluating`,
/// `memory`, `routing`, `executing`, `approval`, `recovery`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum StreamEvent {
    #[serde(rename = "phase")]
    Phase { phase: String, message: String },
    #[serde(rename = "intent")]
    Intent { intent: String },
    #[serde(rename = "tool_start")]
    ToolStart { turn: u32, tools: Vec<String> },
    #[serde(rename = "tool_done")]
    ToolDone { turn: u32, results: Vec<ToolResultPreview> },
    #[serde(rename = "response_chunk")]
    ResponseChunk { text: String },
    #[serde(rename = "complete")]
    Complete {
        response: String,
        metadata: ResponseMetadata,
    },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "keepalive")]
    Keepalive {},
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResultPreview {
    pub tool: String,
    pub preview: String,
}

impl ToolResultPreview {
    /// Truncates `text` to the first 200 chars, matching the execution
    /// loop's `tool_done` preview convention.
    pub fn new(tool: impl Into<String>, text: &str) -> Self {
        let preview: String = text.chars().take(200).collect();
        Self {
            tool: tool.into(),
            preview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_sets_error_shape() {
        let resp = AgentResponse::error("s1", "ui", "boom");
        assert_eq!(resp.metadata.status.as_deref(), Some("error"));
        assert_eq!(resp.metadata.error.as_deref(), Some("boom"));
        assert_eq!(resp.response, "boom");
    }

    #[test]
    fn tool_result_preview_truncates_to_200_chars() {
        let long = "x".repeat(500);
        let preview = ToolResultPreview::new("read_local_file", &long);
        assert_eq!(preview.preview.chars().count(), 200);
    }

    #[test]
    fn stream_event_serializes_with_event_tag() {
        let event = StreamEvent::Phase {
            phase: "queued".to_string(),
            message: "waiting for a free lane".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "phase");
        assert_eq!(json["data"]["phase"], "queued");
    }
}
