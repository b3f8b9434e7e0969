//! `self_modify_code`: write/append/replace against a single file, scoped
//! to operate only on relative, non-escaping paths. Requests touching a
//! sensitive prefix are gated by
//! `coordination::guardian::SecurityPolicy::is_restricted`.
//!
//! Grounded on `app/tools/self_modify_tools.py`.

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};
use std::path::{Component, Path, PathBuf};

pub struct SelfModifyCode;

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

#[async_trait]
impl Tool for SelfModifyCode {
    fn name(&self) -> &str {
        "self_modify_code"
    }

    fn description(&self) -> &str {
        "Modifies a text file via one of `write` (overwrite/create), `append`, or `replace` \
         (swap one exact occurrence of search_text for content). Requires user approval for \
         paths under sensitive prefixes."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path, relative to the working directory"},
                "operation": {"type": "string", "enum": ["write", "append", "replace"]},
                "content": {"type": "string", "description": "Content to write/append, or the replacement text"},
                "search_text": {"type": "string", "description": "Required for `replace`: the single exact occurrence to swap out"},
            },
            "required": ["path", "operation"],
        })
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let path_arg = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed {
                tool: self.name().to_string(),
                message: "missing required argument `path`".to_string(),
            })?;

        let normalized = normalize_lexically(Path::new(path_arg));
        if normalized.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("path '{path_arg}' escapes the working directory"),
            });
        }

        let operation = args.get("operation").and_then(Value::as_str).unwrap_or("");
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");

        match operation {
            "write" => {
                if let Some(parent) = normalized.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await.map_err(|e| ToolError::Failed {
                            tool: self.name().to_string(),
                            message: format!("creating parent dirs: {e}"),
                        })?;
                    }
                }
                tokio::fs::write(&normalized, content).await.map_err(|e| ToolError::Failed {
                    tool: self.name().to_string(),
                    message: format!("writing {path_arg}: {e}"),
                })?;
                Ok(format!("Wrote {} chars to {path_arg}", content.len()))
            }
            "append" => {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&normalized)
                    .await
                    .map_err(|e| ToolError::Failed {
                        tool: self.name().to_string(),
                        message: format!("opening {path_arg} for append: {e}"),
                    })?;
                file.write_all(content.as_bytes()).await.map_err(|e| ToolError::Failed {
                    tool: self.name().to_string(),
                    message: format!("appending to {path_arg}: {e}"),
                })?;
                Ok(format!("Appended {} chars to {path_arg}", content.len()))
            }
            "replace" => {
                let search_text = args.get("search_text").and_then(Value::as_str).unwrap_or("");
                if search_text.is_empty() {
                    return Err(ToolError::Failed {
                        tool: self.name().to_string(),
                        message: "search_text is required for the replace operation".to_string(),
                    });
                }
                let current = tokio::fs::read_to_string(&normalized).await.map_err(|e| ToolError::Failed {
                    tool: self.name().to_string(),
                    message: format!("reading {path_arg}: {e}"),
                })?;
                let occurrences = current.matches(search_text).count();
                if occurrences == 0 {
                    return Err(ToolError::Failed {
                        tool: self.name().to_string(),
                        message: "search_text not found in file".to_string(),
                    });
                }
                if occurrences > 1 {
                    return Err(ToolError::Failed {
                        tool: self.name().to_string(),
                        message: "search_text matched multiple places; provide a more specific search_text".to_string(),
                    });
                }
                let updated = current.replacen(search_text, content, 1);
                tokio::fs::write(&normalized, updated).await.map_err(|e| ToolError::Failed {
                    tool: self.name().to_string(),
                    message: format!("writing {path_arg}: {e}"),
                })?;
                Ok(format!("Replaced 1 occurrence in {path_arg}"))
            }
            other => Err(ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("invalid operation '{other}'; use write, append, or replace"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_creates_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");

        let mut args = Map::new();
        args.insert("path".to_string(), Value::String(path.to_string_lossy().into_owned()));
        args.insert("operation".to_string(), Value::String("write".to_string()));
        args.insert("content".to_string(), Value::String("hello".to_string()));
        let out = SelfModifyCode.invoke(&args).await.unwrap();
        assert!(out.contains("Wrote"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let mut args = Map::new();
        args.insert("path".to_string(), Value::String("../../etc/passwd".to_string()));
        args.insert("operation".to_string(), Value::String("write".to_string()));
        let err = SelfModifyCode.invoke(&args).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }

    #[tokio::test]
    async fn replace_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.txt");
        tokio::fs::write(&path, "a b a").await.unwrap();

        let mut args = Map::new();
        args.insert("path".to_string(), Value::String(path.to_string_lossy().into_owned()));
        args.insert("operation".to_string(), Value::String("replace".to_string()));
        args.insert("search_text".to_string(), Value::String("a".to_string()));
        args.insert("content".to_string(), Value::String("x".to_string()));
        let err = SelfModifyCode.invoke(&args).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }
}
