//! `search_web`: looks up information on the open web via the Brave Search
//! API.
//!
//! Grounded on `app/tools/web_search.py`: the original tries Brave first
//! and falls back to DuckDuckGo scraping when no API key is configured.
//! DuckDuckGo's scrape-only surface has no ecosystem-standard Rust crate,
//! so this keeps only the Brave path and reports unavailability when no
//! key is configured, same as the original's `SEARCH_AVAILABLE` guard.

use async_trait::async_trait;
use coordination::{Tool, ToolError};
use serde_json::{Map, Value};
use std::time::Duration;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

pub struct SearchWeb {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl SearchWeb {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[async_trait]
impl Tool for SearchWeb {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Searches the web for information not available in local memory. Returns up to 5 results with title, link, and snippet."
    }

    fn schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The search query"},
            },
            "required": ["query"],
        })
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed {
                tool: self.name().to_string(),
                message: "missing required argument `query`".to_string(),
            })?;

        let Some(api_key) = &self.api_key else {
            return Ok("Web search is currently unavailable: no search provider is configured.".to_string());
        };

        let response = self
            .client
            .get(BRAVE_ENDPOINT)
            .query(&[("q", query), ("count", "5")])
            .header("X-Subscription-Token", api_key)
            .header("Accept", "application/json")
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("calling search provider: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Failed {
                tool: self.name().to_string(),
                message: format!("search provider returned {status}"),
            });
        }

        let payload: Value = response.json().await.map_err(|e| ToolError::Failed {
            tool: self.name().to_string(),
            message: format!("parsing search provider response: {e}"),
        })?;

        let results = payload
            .get("web")
            .and_then(|w| w.get("results"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if results.is_empty() {
            return Ok("No results found.".to_string());
        }

        let formatted: Vec<String> = results
            .iter()
            .take(5)
            .map(|r| {
                let title = r.get("title").and_then(Value::as_str).unwrap_or("No Title");
                let link = r.get("url").and_then(Value::as_str).unwrap_or("");
                let snippet = r.get("description").and_then(Value::as_str).unwrap_or("");
                format!("Title: {title}\nLink: {link}\nSnippet: {snippet}")
            })
            .collect();

        Ok(formatted.join("\n---\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_search_reports_unavailability_without_dialing_out() {
        let tool = SearchWeb::new(None);
        let mut args = Map::new();
        args.insert("query".to_string(), Value::String("rust async traits".to_string()));
        let out = tool.invoke(&args).await.unwrap();
        assert!(out.contains("unavailable"));
    }

    #[tokio::test]
    async fn missing_query_is_a_failed_error() {
        let tool = SearchWeb::new(Some("key".to_string()));
        let err = tool.invoke(&Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed { .. }));
    }
}
