//! `write_local_file`: overwrites (or creates) a file on the local
//! filesystem, creating parent directories as needed.
//!
//! Grounded on `app/tools/local_system.py::write_local_file`.

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};
use std::path::Path;

pub struct WriteLocalFile;

#[async_trait]
impl Tool for WriteLocalFile {
    fn name(&self) -> &str {
        "write_local_file"
    }

    fn description(&self) -> &str {
        "Writes content to a file on the local filesystem, overwriting the entire file."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file to write"},
                "content": {"type": "string", "description": "Full file content"},
            },
            "required": ["path", "content"],
        })
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed {
                tool: self.name().to_string(),
                message: "missing required argument `path`".to_string(),
            })?;
        let content = args.get("content").and_then(Value::as_str).unwrap_or("");

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| ToolError::Failed {
                    tool: self.name().to_string(),
                    message: format!("creating parent dirs for {path}: {e}"),
                })?;
            }
        }

        tokio::fs::write(path, content).await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("writing {path}: {e}"),
        })?;

        Ok(format!("Successfully wrote {} bytes to {path}", content.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/out.txt");
        let mut args = Map::new();
        args.insert("path".to_string(), Value::String(path.to_string_lossy().into_owned()));
        args.insert("content".to_string(), Value::String("hi there".to_string()));

        let out = WriteLocalFile.invoke(&args).await.unwrap();
        assert!(out.contains("8 bytes"));
        let written = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(written, "hi there");
    }
}
