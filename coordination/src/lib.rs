//! Agent orchestration core.
//!
//! This crate holds the hard part of a personal-assistant runtime: the
//! execution loop that coordinates model invocation, tool dispatch, and
//! failover across providers; the per-session run registry and lane queue
//! that serialize concurrent requests; the context manager that sanitizes
//! and windows conversation history; the error classifier and recovery
//! planner; and the memory tiers (sliding window, short-term daily
//! summaries, durable relationship facts, vector/lexical RAG) that feed
//! the loop's context block.
//!
//! The consumer-facing request/response envelope, the top-level
//! orchestrator that sequences these phases per request, and the
//! scheduler/heartbeat binary that drains background tasks live one layer
//! up, in `agent-runtime`.

#![allow(clippy::uninlined_format_args)]

pub mod agent_profile;
pub mod channel_formatter;
pub mod chat_model;
pub mod context_manager;
pub mod error_classifier;
pub mod execution_loop;
pub mod failover;
pub mod guardian;
pub mod heartbeat;
pub mod memory;
pub mod message;
pub mod planner;
pub mod run_lane_queue;
pub mod run_registry;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod tool;

// Re-export core data model types
pub use message::{Content, ContentPart, Message, ToolCall};
pub use session::{Session, MAX_SESSION_MESSAGES};

// Re-export error classification types
pub use error_classifier::{
    backoff_delay, classify_error, plan_recovery, ClassifiedError, ErrorClass, RecoveryStrategy,
};

// Re-export failover types
pub use failover::{FailoverAttempt, FailoverChain, ModelCandidate};

// Re-export run tracking types
pub use run_lane_queue::{QueueEntry, QueueError, QueueLease, QueueSnapshot, RunLaneQueue, SessionQueueStatus};
pub use run_registry::{RegistryError, RunHandle, RunRegistry, RunStatus};

// Re-export context window assembly types
pub use context_manager::{
    group_messages, is_dead_response, optimize_context, sanitize_messages, ContextFileCache,
    MAX_MESSAGE_WINDOW, SUMMARY_INTERVAL,
};

// Re-export agent identity / tool-gating types
pub use agent_profile::{filter_tools_for_profile, AgentProfile, ALLOW_ALL};

// Re-export configuration types
pub use settings::{DefaultProvider, Settings};

// Re-export channel formatting types
pub use channel_formatter::{
    format_response_for_channel, normalize_channel, split_response_for_channel, ChannelType,
};

// Re-export guardian / security policy types
pub use guardian::{ActionState, ActionStatus, ActionType, Guardian, SecurityPolicy};

// Re-export tool trait/registry types
pub use tool::{Tool, ToolError, ToolRegistry};

// Re-export chat model trait/mock types
pub use chat_model::{
    AssistantMessage, ChatModel, ChatModelError, ChatModelFactory, MockChatModel, MockChatModelFactory,
};

// Re-export planner types
pub use planner::{
    build_execution_plan, build_execution_plan_with_meta_model, evaluate, evaluate_with_meta_model,
    meta_timeout, route_request, route_request_with_meta_model, should_request_plan_approval,
    BACKGROUND_TASK_MARKER, EvaluatorOutput, Plan, PlanStep, RouterDecision,
};

// Re-export execution loop types
pub use execution_loop::{
    run_turn_loop, select_tools, ExecutionLoopConfig, LoopResult, FALLBACK_ANSWER, MAX_TURNS,
};

// Re-export scheduler types
pub use scheduler::{
    decode_plan_description, encode_plan_description, AgentTask, TaskQueue, TaskStatus,
};

// Re-export heartbeat types
pub use heartbeat::{
    AgentHeartbeat, HeartbeatStatus, TaskExecutor, MAX_PARALLEL_READY_TASKS,
    STALE_IN_PROGRESS_TIMEOUT_SECONDS,
};

// Re-export memory tier types
pub use memory::{
    dedupe_fragments, LexicalMemoryIndex, MemoryError, MemoryFragment, MemoryIndex,
    MemoryIndexError, RelationshipFact, RelationshipFactInput, RelationshipMemoryStore,
    ShortTermDayListing, ShortTermMemory, ShortTermMemoryManager, ShortTermStore, SessionStore,
    SessionStoreError,
};
