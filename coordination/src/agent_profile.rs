//! Agent identity and tool-allowlist gating.
//!
//! Grounded on `app/core/models.py::AgentProfile` and the filtering
//! performed in `app/agents/orchestrator.py::_lazy_load_all_tools` (the
//! `"all" not in allowed_tools` check that narrows a profile's tool set
//! down to a named subset before tools are bound to the model).

use serde::{Deserialize, Serialize};

/// Sentinel entry in `allowed_tools` that grants access to every registered
/// tool rather than an explicit subset.
pub const ALLOW_ALL: &str = "all";

/// Definition of an agent's capabilities and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_allowed_tools() -> Vec<String> {
    vec![ALLOW_ALL.to_string()]
}

impl AgentProfile {
    /// Construct a profile with unrestricted tool access.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            system_prompt: system_prompt.into(),
            allowed_tools: default_allowed_tools(),
            parent_id: None,
            provider: None,
            model: None,
        }
    }

    /// Whether every registered tool is available to this profile.
    pub fn allows_all_tools(&self) -> bool {
        self.allowed_tools.iter().any(|t| t == ALLOW_ALL)
    }

    /// Whether a specific named tool is available to this profile.
    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.allows_all_tools() || self.allowed_tools.iter().any(|t| t == tool_name)
    }

    /// Narrow a candidate tool list down to the names this profile permits,
    /// preserving input order. Mirrors the orchestrator's lazy tool-binding
    /// filter: no profile, or an `allow_all` profile, passes everything
    /// through unchanged.
    pub fn filter_tools<'a, T>(&self, candidates: &'a [T], name_of: impl Fn(&T) -> &str) -> Vec<&'a T> {
        if self.allows_all_tools() {
            return candidates.iter().collect();
        }
        candidates
            .iter()
            .filter(|t| self.allows_tool(name_of(t)))
            .collect()
    }
}

/// Narrows a tool list by an optional profile. With no profile, every tool
/// passes through — matching the orchestrator's `if self.agent_profile and
/// ...` short circuit.
pub fn filter_tools_for_profile<'a, T>(
    profile: Option<&AgentProfile>,
    candidates: &'a [T],
    name_of: impl Fn(&T) -> &str,
) -> Vec<&'a T> {
    match profile {
        Some(p) => p.filter_tools(candidates, name_of),
        None => candidates.iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with(tools: &[&str]) -> AgentProfile {
        let mut p = AgentProfile::new("p1", "assistant", "primary assistant", "You are helpful.");
        p.allowed_tools = tools.iter().map(|s| s.to_string()).collect();
        p
    }

    #[test]
    fn default_profile_allows_all() {
        let p = AgentProfile::new("p1", "assistant", "desc", "prompt");
        assert!(p.allows_all_tools());
        assert!(p.allows_tool("anything"));
    }

    #[test]
    fn explicit_subset_denies_others() {
        let p = profile_with(&["search_web", "read_file"]);
        assert!(p.allows_tool("search_web"));
        assert!(!p.allows_tool("send_email"));
    }

    #[test]
    fn filter_tools_preserves_order_and_subset() {
        let p = profile_with(&["b", "c"]);
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let filtered = p.filter_tools(&candidates, |s| s.as_str());
        assert_eq!(filtered, vec!["b", "c"]);
    }

    #[test]
    fn filter_tools_all_passes_everything() {
        let p = profile_with(&[ALLOW_ALL]);
        let candidates = vec!["a".to_string(), "b".to_string()];
        let filtered = p.filter_tools(&candidates, |s| s.as_str());
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn no_profile_passes_everything() {
        let candidates = vec!["a".to_string(), "b".to_string()];
        let filtered = filter_tools_for_profile(None, &candidates, |s| s.as_str());
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn serde_round_trip_defaults_allowed_tools() {
        let json = r#"{"id":"p1","name":"n","description":"d","system_prompt":"s"}"#;
        let p: AgentProfile = serde_json::from_str(json).unwrap();
        assert!(p.allows_all_tools());
    }
}
