//! Conversation message model shared by the context manager, session store,
//! and execution loop.
//!
//! Mirrors the four-role message taxonomy (`User`, `Assistant`, `System`,
//! `Tool`) that the provider-facing chat APIs expect, plus an open
//! `additional` map so provider-opaque fields (thought signatures, etc.)
//! round-trip through persistence without schema growth.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(alias = "id")]
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            args,
        }
    }
}

/// One part of a multipart message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageRef { image_ref: String },
}

/// Message content: either a plain string or an ordered list of typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.trim().is_empty(),
            Content::Parts(p) => p.is_empty(),
        }
    }

    /// Concatenate the `.text` of any text-typed parts; returns the string
    /// as-is for plain text content.
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageRef { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

/// Tagged message variant over the four conversational roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: Content,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        additional: Map<String, Value>,
    },
    Assistant {
        content: Content,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        additional: Map<String, Value>,
    },
    System {
        content: Content,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        additional: Map<String, Value>,
    },
    Tool {
        content: Content,
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        additional: Map<String, Value>,
    },
}

impl Message {
    pub fn user(content: impl Into<Content>) -> Self {
        Message::User {
            content: content.into(),
            additional: Map::new(),
        }
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Message::System {
            content: content.into(),
            additional: Map::new(),
        }
    }

    pub fn assistant_text(content: impl Into<Content>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls: Vec::new(),
            additional: Map::new(),
        }
    }

    pub fn assistant_with_tools(content: impl Into<Content>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls,
            additional: Map::new(),
        }
    }

    pub fn tool(
        content: impl Into<Content>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            additional: Map::new(),
        }
    }

    pub fn content(&self) -> &Content {
        match self {
            Message::User { content, .. }
            | Message::Assistant { content, .. }
            | Message::System { content, .. }
            | Message::Tool { content, .. } => content,
        }
    }

    pub fn set_content(&mut self, new_content: Content) {
        match self {
            Message::User { content, .. }
            | Message::Assistant { content, .. }
            | Message::System { content, .. }
            | Message::Tool { content, .. } => *content = new_content,
        }
    }

    pub fn tool_calls(&self) -> Option<&[ToolCall]> {
        match self {
            Message::Assistant { tool_calls, .. } if !tool_calls.is_empty() => Some(tool_calls),
            _ => None,
        }
    }

    pub fn is_assistant_with_tool_calls(&self) -> bool {
        self.tool_calls().is_some()
    }

    pub fn is_plain_assistant(&self) -> bool {
        matches!(self, Message::Assistant { tool_calls, .. } if tool_calls.is_empty())
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Message::User { .. })
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System { .. })
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, Message::Tool { .. })
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
            Message::System { .. } => "system",
            Message::Tool { .. } => "tool",
        }
    }
}
