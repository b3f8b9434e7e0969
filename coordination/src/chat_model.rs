//! Opaque chat-model boundary the execution loop programs against.
//!
//! Grounded on `app/agents/model_factory.py`/`app/agents/providers/*`: the
//! original wraps each provider SDK (openai, anthropic, ollama, ...) behind
//! a common `ainvoke(messages) -> AIMessage` call after binding a tool list.
//! Concrete provider wiring is out of scope for this core (`spec.md` §1
//! treats the chat model as opaque); this module defines the trait plus a
//! scriptable mock used by tests and by callers with no provider configured.

use crate::message::{Content, Message, ToolCall};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum ChatModelError {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("request timed out")]
    Timeout,
    #[error("no provider registered for {provider:?}")]
    UnknownProvider { provider: String },
}

/// One model turn: text content plus any tool calls it requested. Kept
/// distinct from [`Message::Assistant`] so providers don't need to know
/// about session persistence — [`AssistantMessage::into_message`] bridges
/// the two.
#[derive(Debug, Clone)]
pub struct AssistantMessage {
    pub content: Content,
    pub tool_calls: Vec<ToolCall>,
    /// Best-effort status/error hint surfaced by the provider SDK
    /// (e.g. an HTTP status code), consumed by the error classifier.
    pub status_code: Option<u16>,
}

impl AssistantMessage {
    pub fn text(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
            status_code: None,
        }
    }

    pub fn with_tool_calls(content: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            status_code: None,
        }
    }

    pub fn into_message(self) -> Message {
        if self.tool_calls.is_empty() {
            Message::assistant_text(self.content)
        } else {
            Message::assistant_with_tools(self.content, self.tool_calls)
        }
    }
}

/// A single bound chat model: one `(provider, model)` candidate with tools
/// already attached. Implementors should be cheap to construct per turn —
/// the execution loop rebinds tools whenever the tool selection changes.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn provider(&self) -> &str;
    fn model(&self) -> &str;

    /// Invokes the model with the given message window, returning its
    /// response. `tool_schemas` mirrors the currently bound tool set; a
    /// provider with no tool-calling support may ignore it.
    async fn ainvoke(
        &self,
        messages: &[Message],
        tool_schemas: &[Value],
    ) -> Result<AssistantMessage, ChatModelError>;
}

/// Resolves `(provider, model_id)` pairs from the failover chain into
/// callable [`ChatModel`]s. Grounded on `app/agents/model_factory.py`'s
/// `get_model_for_provider` dispatch.
pub trait ChatModelFactory: Send + Sync {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ChatModel>, ChatModelError>;
}

/// Scripted chat model for tests and for running the loop with no
/// provider configured: pops one canned response per call, repeating the
/// last entry once the queue is drained.
pub struct MockChatModel {
    provider: String,
    model: String,
    responses: Mutex<VecDeque<Result<AssistantMessage, ChatModelError>>>,
    last: Mutex<Option<Result<AssistantMessage, ChatModelError>>>,
}

impl MockChatModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            responses: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(AssistantMessage::text(text.into())));
    }

    pub fn push_tool_call(&self, text: impl Into<String>, calls: Vec<ToolCall>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(AssistantMessage::with_tool_calls(text.into(), calls)));
    }

    pub fn push_error(&self, err: ChatModelError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }
}

fn clone_result(
    r: &Result<AssistantMessage, ChatModelError>,
) -> Result<AssistantMessage, ChatModelError> {
    match r {
        Ok(msg) => Ok(msg.clone()),
        Err(ChatModelError::Provider(s)) => Err(ChatModelError::Provider(s.clone())),
        Err(ChatModelError::Timeout) => Err(ChatModelError::Timeout),
        Err(ChatModelError::UnknownProvider { provider }) => Err(ChatModelError::UnknownProvider {
            provider: provider.clone(),
        }),
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn ainvoke(
        &self,
        _messages: &[Message],
        _tool_schemas: &[Value],
    ) -> Result<AssistantMessage, ChatModelError> {
        let mut queue = self.responses.lock().unwrap();
        if let Some(next) = queue.pop_front() {
            let cloned = clone_result(&next);
            *self.last.lock().unwrap() = Some(next);
            return cloned;
        }
        let last = self.last.lock().unwrap();
        match last.as_ref() {
            Some(r) => clone_result(r),
            None => Ok(AssistantMessage::text("(mock model has no scripted response)")),
        }
    }
}

/// Resolves every candidate to the same [`MockChatModel`] factory-built
/// instance family — used in tests that exercise failover without real
/// provider credentials.
pub struct MockChatModelFactory;

impl ChatModelFactory for MockChatModelFactory {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ChatModel>, ChatModelError> {
        Ok(Arc::new(MockChatModel::new(provider, model)))
    }
}
