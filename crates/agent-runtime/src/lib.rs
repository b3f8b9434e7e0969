//! Consumer-facing surface of the personal-assistant agent runtime: request
//! and response envelopes, the HTTP-backed chat model adapter, the default
//! tool registry, the top-level orchestrator, and the heartbeat task
//! executor. The binary in `main.rs` wires these together; library
//! consumers (tests, alternate front-ends) can use this crate directly.

pub mod chat_model_adapter;
pub mod orchestrator;
pub mod task_executor;
pub mod tools;
pub mod types;

pub use chat_model_adapter::{HttpChatModel, HttpChatModelFactory, ProviderEndpoint};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use task_executor::OrchestratorTaskExecutor;
pub use types::{AgentRequest, AgentResponse, ApprovalRequired, ResponseMetadata, StreamEvent, ToolResultPreview};
