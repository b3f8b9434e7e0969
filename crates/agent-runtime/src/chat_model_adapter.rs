//! HTTP-backed [`ChatModel`] implementation.
//!
//! Grounded on `app/agents/model_factory.py`/`app/agents/providers/*`: the
//! original wraps each provider SDK behind a uniform `ainvoke`. Rust has no
//! single crate covering every configured provider's native wire format
//! (Anthropic/Gemini are not OpenAI-compatible), so this module targets the
//! `/chat/completions` shape directly with `reqwest`, which every
//! configured provider except Anthropic and Gemini exposes verbatim
//! (openai, openrouter, deepseek, kimi, nvidia, ollama, llamacpp). Native
//! Anthropic/Gemini wiring is out of scope for this pass — see DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordination::{
    AssistantMessage, ChatModel, ChatModelError, ChatModelFactory, Content, ContentPart, Message,
    ToolCall,
};
use serde_json::{Map, Value};

/// Per-provider connection details resolved from [`coordination::Settings`].
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Resolves `(provider, model)` candidates to [`HttpChatModel`]s bound
/// against the matching provider endpoint. Unknown providers yield
/// [`ChatModelError::UnknownProvider`], giving the failover chain somewhere
/// to rotate away from rather than panicking.
pub struct HttpChatModelFactory {
    client: reqwest::Client,
    endpoints: HashMap<String, ProviderEndpoint>,
}

impl HttpChatModelFactory {
    pub fn new(endpoints: HashMap<String, ProviderEndpoint>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }
}

impl ChatModelFactory for HttpChatModelFactory {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ChatModel>, ChatModelError> {
        let endpoint = self.endpoints.get(provider).ok_or_else(|| ChatModelError::UnknownProvider {
            provider: provider.to_string(),
        })?;
        Ok(Arc::new(HttpChatModel {
            client: self.client.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            endpoint: endpoint.clone(),
        }))
    }
}

/// One bound `(provider, model)` candidate, calling an OpenAI-compatible
/// `/chat/completions` endpoint.
pub struct HttpChatModel {
    client: reqwest::Client,
    provider: String,
    model: String,
    endpoint: ProviderEndpoint,
}

fn message_to_wire(message: &Message) -> Value {
    match message {
        Message::System { content, .. } => serde_json::json!({
            "role": "system",
            "content": content.as_text(),
        }),
        Message::User { content, .. } => serde_json::json!({
            "role": "user",
            "content": content_to_wire(content),
        }),
        Message::Assistant { content, tool_calls, .. } => {
            let mut obj = serde_json::json!({
                "role": "assistant",
                "content": content.as_text(),
            });
            if !tool_calls.is_empty() {
                obj["tool_calls"] = Value::Array(
                    tool_calls
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "id": c.call_id,
                                "type": "function",
                                "function": {"name": c.name, "arguments": Value::Object(c.args.clone()).to_string()},
                            })
                        })
                        .collect(),
                );
            }
            obj
        }
        Message::Tool { content, tool_call_id, .. } => serde_json::json!({
            "role": "tool",
            "content": content.as_text(),
            "tool_call_id": tool_call_id,
        }),
    }
}

fn content_to_wire(content: &Content) -> Value {
    match content {
        Content::Text(text) => Value::String(text.clone()),
        Content::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => serde_json::json!({"type": "text", "text": text}),
                    ContentPart::ImageRef { image_ref } => serde_json::json!({
                        "type": "image_url",
                        "image_url": {"url": image_ref},
                    }),
                })
                .collect(),
        ),
    }
}

fn parse_tool_calls(value: &Value) -> Vec<ToolCall> {
    value
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    let id = c.get("id")?.as_str()?.to_string();
                    let function = c.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let args_str = function.get("arguments").and_then(Value::as_str).unwrap_or("{}");
                    let args: Map<String, Value> = serde_json::from_str(args_str).unwrap_or_default();
                    Some(ToolCall::new(id, name, args))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn ainvoke(
        &self,
        messages: &[Message],
        tool_schemas: &[Value],
    ) -> Result<AssistantMessage, ChatModelError> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
        });
        if !tool_schemas.is_empty() {
            body["tools"] = Value::Array(
                tool_schemas
                    .iter()
                    .map(|s| serde_json::json!({"type": "function", "function": s}))
                    .collect(),
            );
        }

        let url = format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&body).timeout(Duration::from_secs(90));
        if let Some(key) = &self.endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ChatModelError::Timeout
            } else {
                ChatModelError::Provider(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatModelError::Provider(format!("{status}: {body}")));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ChatModelError::Provider(e.to_string()))?;

        let choice = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| ChatModelError::Provider("missing choices[0].message in response".to_string()))?;

        let text = choice.get("content").and_then(Value::as_str).unwrap_or("").to_string();
        let tool_calls = choice
            .get("tool_calls")
            .map(parse_tool_calls)
            .unwrap_or_default();
        let status_code = payload.get("status_code").and_then(Value::as_u64).map(|v| v as u16);

        let mut assistant = if tool_calls.is_empty() {
            AssistantMessage::text(text)
        } else {
            AssistantMessage::with_tool_calls(text, tool_calls)
        };
        assistant.status_code = status_code;
        Ok(assistant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_errors_without_dialing_out() {
        let factory = HttpChatModelFactory::new(HashMap::new());
        let err = factory.resolve("openai", "gpt-4").unwrap_err();
        assert!(matches!(err, ChatModelError::UnknownProvider { .. }));
    }

    #[test]
    fn resolve_binds_configured_endpoint() {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "openrouter".to_string(),
            ProviderEndpoint {
                base_url: "https://openrouter.ai/api/v1".to_string(),
                api_key: Some("key".to_string()),
            },
        );
        let factory = HttpChatModelFactory::new(endpoints);
        let model = factory.resolve("openrouter", "qwen/qwen3").unwrap();
        assert_eq!(model.provider(), "openrouter");
        assert_eq!(model.model(), "qwen/qwen3");
    }

    #[test]
    fn parse_tool_calls_extracts_name_and_args() {
        let raw = serde_json::json!([{
            "id": "call_1",
            "type": "function",
            "function": {"name": "read_local_file", "arguments": "{\"path\": \"a.txt\"}"},
        }]);
        let calls = parse_tool_calls(&raw);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_local_file");
        assert_eq!(calls[0].args.get("path").unwrap(), "a.txt");
    }
}
