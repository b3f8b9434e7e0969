//! Tool trait and registry: the polymorphic seam between the execution loop
//! and concrete capabilities (file I/O, search, scheduling, etc).
//!
//! Grounded on `app/agents/tools/*` — the original registers plain async
//! functions with a JSON schema under `app/core/tool_registry.py`; here that
//! becomes a `Tool` trait object so the loop never needs to know which
//! concrete tools are bound, mirroring the teacher's `reviewer_tools`
//! trait-object registration pattern.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool {0:?} not found")]
    NotFound(String),
    #[error("tool {tool} failed: {message}")]
    Failed { tool: String, message: String },
    #[error("tool {tool} timed out after {seconds}s")]
    TimedOut { tool: String, seconds: u64 },
}

/// One callable capability the model may invoke. Implementors are expected
/// to be cheap to clone-by-`Arc` and safe to call concurrently — the
/// execution loop dispatches a turn's tool calls in parallel.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable name the model refers to this tool by in a `ToolCall`.
    fn name(&self) -> &str;

    /// One-line description shown to the model when tools are bound.
    fn description(&self) -> &str;

    /// JSON Schema (draft-07 style object schema) describing accepted args.
    fn schema(&self) -> Value;

    /// Executes the tool, returning the text to embed in the `Tool` message
    /// sent back to the model. Tool-level failures should be returned as
    /// `Err` so the execution loop can classify and (if appropriate) retry
    /// them rather than silently degrading to placeholder text.
    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError>;
}

/// Lookup table of tools bound for one execution loop run, keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Narrows this registry down to `names`, preserving registration
    /// order of the surviving entries. Unknown names are silently skipped —
    /// the caller (execution loop) logs which ones didn't resolve.
    pub fn subset(&self, names: &[String]) -> ToolRegistry {
        let mut out = ToolRegistry::new();
        for name in names {
            if let Some(tool) = self.tools.get(name) {
                out.tools.insert(name.clone(), tool.clone());
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schema list in the shape providers expect when binding tools to a
    /// model call.
    pub fn schemas(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "parameters": t.schema(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echoes the `text` argument back."
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
            Ok(args.get("text").and_then(Value::as_str).unwrap_or("").to_string())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl Tool for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn invoke(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
            Err(ToolError::Failed {
                tool: "broken".to_string(),
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn invoke_echo_returns_arg() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        let mut args = Map::new();
        args.insert("text".to_string(), Value::String("hi".to_string()));
        let out = reg.get("echo").unwrap().invoke(&args).await.unwrap();
        assert_eq!(out, "hi");
    }

    #[tokio::test]
    async fn failing_tool_surfaces_error() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(AlwaysFails));
        let err = reg.get("broken").unwrap().invoke(&Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }

    #[test]
    fn subset_preserves_only_named_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(Echo));
        reg.register(Arc::new(AlwaysFails));
        let narrowed = reg.subset(&["echo".to_string(), "ghost".to_string()]);
        assert_eq!(narrowed.len(), 1);
        assert!(narrowed.contains("echo"));
    }

    #[test]
    fn get_unknown_tool_is_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }
}
