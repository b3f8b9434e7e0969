//! `delete_file`: removes a single file. Always gated by the guardian —
//! see `coordination::guardian::SecurityPolicy::RESTRICTED_TOOLS`.

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};

pub struct DeleteFile;

#[async_trait]
impl Tool for DeleteFile {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Deletes a single file from the local filesystem. Requires user approval."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file to delete"},
            },
            "required": ["path"],
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

        let metadata = tokio::fs::metadata(path).await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("{path}: {e}"),
        })?;
        if metadata.is_dir() {
            return Err(ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("{path} is a directory, not a file"),
            });
        }

        tokio::fs::remove_file(path).await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("deleting {path}: {e}"),
        })?;

        Ok(format!("Deleted {path}"))
    }
}
