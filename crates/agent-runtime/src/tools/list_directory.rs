//! `list_directory`: lists entries under a local directory.
//!
//! Grounded on `app/tools/context_tools.py::list_context_files`'s plain
//! listing format, adapted to a real directory read.

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};

pub struct ListDirectory;

#[async_trait]
impl Tool for ListDirectory {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "Lists files and subdirectories under a local directory path."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory to list (defaults to the current directory)"},
            },
        })
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");

        let mut entries = tokio::fs::read_dir(path).await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("listing {path}: {e}"),
        })?;

        let mut lines = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("reading entry in {path}: {e}"),
        })? {
            let file_type = entry.file_type().await.map_err(|e| ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("stat-ing entry in {path}: {e}"),
            })?;
            let marker = if file_type.is_dir() { "/" } else { "" };
            lines.push(format!("{}{marker}", entry.file_name().to_string_lossy()));
        }
        lines.sort();

        if lines.is_empty() {
            Ok(format!("{path} is empty."))
        } else {
            Ok(lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_files_and_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let mut args = Map::new();
        args.insert("path".to_string(), Value::String(dir.path().to_string_lossy().into_owned()));
        let out = ListDirectory.invoke(&args).await.unwrap();
        assert!(out.contains("a.txt"));
        assert!(out.contains("sub/"));
    }

    #[tokio::test]
    async fn missing_directory_is_a_failed_error() {
        let mut args = Map::new();
        args.insert("path".to_string(), Value::String("/no/such/dir".to_string()));
        let err = ListDirectory.invoke(&args).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }
}
