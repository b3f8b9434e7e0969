//! `read_local_file`: reads a file from the local filesystem, truncating
//! large files rather than flooding the context window.
//!
//! Grounded on `app/tools/local_system.py::read_local_file` (50KB cap).

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};

const MAX_BYTES: usize = 50 * 1024;

pub struct ReadLocalFile;

#[async_trait]
impl Tool for ReadLocalFile {
    fn name(&self) -> &str {
        "read_local_file"
    }

    fn description(&self) -> &str {
        "Reads a file from the local filesystem. Files larger than 50KB are truncated."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path to the file to read"},
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

        let bytes = tokio::fs::read(path).await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("reading {path}: {e}"),
        })?;

        if bytes.len() <= MAX_BYTES {
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            let head = String::from_utf8_lossy(&bytes[..MAX_BYTES]).into_owned();
            Ok(format!(
                "{head}\n... [TRUNCATED - file is {:.1}KB, showing first 50KB]",
                bytes.len() as f64 / 1024.0
            ))
        }
    }
}
