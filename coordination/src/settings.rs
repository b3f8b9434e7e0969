//! Process-wide configuration, loaded from environment variables.
//!
//! Grounded on `app/core/config.py::Settings`. The original builds on
//! `pydantic_settings.BaseSettings`, which has no equivalent dependency in
//! this workspace; `Default` plus `Settings::from_env` reproduces the same
//! "typed defaults, overridden by env" contract.

use std::env;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

/// Default LLM provider, matching the set of providers the failover chain
/// knows how to rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultProvider {
    Openai,
    Anthropic,
    Ollama,
    Llamacpp,
    Gemini,
    Openrouter,
    Deepseek,
    Kimi,
    Nvidia,
}

impl std::str::FromStr for DefaultProvider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::Openai),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            "llamacpp" => Ok(Self::Llamacpp),
            "gemini" => Ok(Self::Gemini),
            "openrouter" => Ok(Self::Openrouter),
            "deepseek" => Ok(Self::Deepseek),
            "kimi" => Ok(Self::Kimi),
            "nvidia" => Ok(Self::Nvidia),
            _ => Err(()),
        }
    }
}

/// Process-wide configuration envelope. Constructed once at startup via
/// [`Settings::from_env`] and shared through the runtime as an `Arc`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_name: String,
    pub backend_port: u16,

    pub default_llm_provider: DefaultProvider,
    /// `"provider/model"` the failover chain's `default` alias (spec §4.3
    /// step 2) resolves to.
    pub default_model: String,
    /// `"provider/model"` the failover chain's `smart` alias (spec §4.3
    /// step 3) resolves to — reasoning-heavy/coding tasks prefer this.
    pub smart_model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub kimi_api_key: Option<String>,
    pub kimi_base_url: String,
    pub nvidia_api_key: Option<String>,
    pub nvidia_base_url: String,
    pub nvidia_model: String,
    pub brave_search_api_key: Option<String>,

    pub ollama_base_url: String,
    pub ollama_model: String,

    pub persist_directory: String,
    pub relationship_memory_file: String,

    /// Overall wall-clock budget for one orchestrator run, in milliseconds.
    pub agent_run_timeout_ms: u64,
    /// Per-model-call timeout.
    pub agent_llm_timeout_seconds: u64,
    /// Per-tool-call timeout.
    pub agent_tool_timeout_seconds: u64,
    pub agent_tool_retry_attempts: u32,
    pub agent_execution_max_attempts: u32,
    pub agent_require_plan_approval: bool,
    pub agent_max_concurrent_runs: usize,
    pub agent_queue_wait_timeout_seconds: u64,

    pub telegram_polling_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_allowed_users: Option<String>,
    pub discord_bot_token: Option<String>,

    pub heartbeat_interval_seconds: u64,

    pub node_runtime_enabled: bool,
    pub node_runtime_name: String,
    pub node_runtime_allow_system_run: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: "personal-assistant".to_string(),
            backend_port: 13579,

            default_llm_provider: DefaultProvider::Openrouter,
            default_model: "openrouter/openrouter/auto".to_string(),
            smart_model: "openrouter/qwen/qwen3-vl-30b-a3b-thinking".to_string(),
            openai_api_key: None,
            anthropic_api_key: None,
            google_api_key: None,
            deepseek_api_key: None,
            openrouter_api_key: None,
            kimi_api_key: None,
            kimi_base_url: "https://api.moonshot.cn/v1".to_string(),
            nvidia_api_key: None,
            nvidia_base_url: "https://integrate.api.nvidia.com/v1".to_string(),
            nvidia_model: "moonshotai/kimi-k2.5".to_string(),
            brave_search_api_key: None,

            ollama_base_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),

            persist_directory: "./db".to_string(),
            relationship_memory_file: "data/memories/relationship/default_user.json".to_string(),

            agent_run_timeout_ms: 180_000,
            agent_llm_timeout_seconds: 90,
            agent_tool_timeout_seconds: 120,
            agent_tool_retry_attempts: 3,
            agent_execution_max_attempts: 4,
            agent_require_plan_approval: false,
            agent_max_concurrent_runs: 2,
            agent_queue_wait_timeout_seconds: 300,

            telegram_polling_enabled: true,
            telegram_bot_token: None,
            telegram_allowed_users: None,
            discord_bot_token: None,

            heartbeat_interval_seconds: 1800,

            node_runtime_enabled: true,
            node_runtime_name: "Assistant Local Node".to_string(),
            node_runtime_allow_system_run: false,
        }
    }
}

impl Settings {
    /// Build settings from defaults overridden by whatever environment
    /// variables are present. Unset or unparseable values fall back to
    /// their default rather than erroring, matching the original's
    /// permissive `pydantic_settings` behavior for optional fields.
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            project_name: env_string("PROJECT_NAME", &base.project_name),
            backend_port: env_parsed("BACKEND_PORT", base.backend_port),

            default_llm_provider: env::var("DEFAULT_LLM_PROVIDER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(base.default_llm_provider),
            default_model: env_string("DEFAULT_MODEL", &base.default_model),
            smart_model: env_string("SMART_MODEL", &base.smart_model),
            openai_api_key: env_opt_string("OPENAI_API_KEY"),
            anthropic_api_key: env_opt_string("ANTHROPIC_API_KEY"),
            google_api_key: env_opt_string("GOOGLE_API_KEY"),
            deepseek_api_key: env_opt_string("DEEPSEEK_API_KEY"),
            openrouter_api_key: env_opt_string("OPENROUTER_API_KEY"),
            kimi_api_key: env_opt_string("KIMI_API_KEY"),
            kimi_base_url: env_string("KIMI_BASE_URL", &base.kimi_base_url),
            nvidia_api_key: env_opt_string("NVIDIA_API_KEY"),
            nvidia_base_url: env_string("NVIDIA_BASE_URL", &base.nvidia_base_url),
            nvidia_model: env_string("NVIDIA_MODEL", &base.nvidia_model),
            brave_search_api_key: env_opt_string("BRAVE_SEARCH_API_KEY"),

            ollama_base_url: env_string("OLLAMA_BASE_URL", &base.ollama_base_url),
            ollama_model: env_string("OLLAMA_MODEL", &base.ollama_model),

            persist_directory: env_string("PERSIST_DIRECTORY", &base.persist_directory),
            relationship_memory_file: env_string(
                "RELATIONSHIP_MEMORY_FILE",
                &base.relationship_memory_file,
            ),

            agent_run_timeout_ms: env_parsed("AGENT_RUN_TIMEOUT_MS", base.agent_run_timeout_ms),
            agent_llm_timeout_seconds: env_parsed(
                "AGENT_LLM_TIMEOUT_SECONDS",
                base.agent_llm_timeout_seconds,
            ),
            agent_tool_timeout_seconds: env_parsed(
                "AGENT_TOOL_TIMEOUT_SECONDS",
                base.agent_tool_timeout_seconds,
            ),
            agent_tool_retry_attempts: env_parsed(
                "AGENT_TOOL_RETRY_ATTEMPTS",
                base.agent_tool_retry_attempts,
            ),
            agent_execution_max_attempts: env_parsed(
                "AGENT_EXECUTION_MAX_ATTEMPTS",
                base.agent_execution_max_attempts,
            ),
            agent_require_plan_approval: env_bool(
                "AGENT_REQUIRE_PLAN_APPROVAL",
                base.agent_require_plan_approval,
            ),
            agent_max_concurrent_runs: env_parsed(
                "AGENT_MAX_CONCURRENT_RUNS",
                base.agent_max_concurrent_runs,
            ),
            agent_queue_wait_timeout_seconds: env_parsed(
                "AGENT_QUEUE_WAIT_TIMEOUT_SECONDS",
                base.agent_queue_wait_timeout_seconds,
            ),

            telegram_polling_enabled: env_bool(
                "TELEGRAM_POLLING_ENABLED",
                base.telegram_polling_enabled,
            ),
            telegram_bot_token: env_opt_string("TELEGRAM_BOT_TOKEN"),
            telegram_allowed_users: env_opt_string("TELEGRAM_ALLOWED_USERS"),
            discord_bot_token: env_opt_string("DISCORD_BOT_TOKEN"),

            heartbeat_interval_seconds: env_parsed(
                "HEARTBEAT_INTERVAL_SECONDS",
                base.heartbeat_interval_seconds,
            ),

            node_runtime_enabled: env_bool("NODE_RUNTIME_ENABLED", base.node_runtime_enabled),
            node_runtime_name: env_string("NODE_RUNTIME_NAME", &base.node_runtime_name),
            node_runtime_allow_system_run: env_bool(
                "NODE_RUNTIME_ALLOW_SYSTEM_RUN",
                base.node_runtime_allow_system_run,
            ),
        }
    }

    /// Parses `TELEGRAM_ALLOWED_USERS` into individual user IDs.
    pub fn telegram_allowed_user_ids(&self) -> Vec<String> {
        self.telegram_allowed_users
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_source() {
        let s = Settings::default();
        assert_eq!(s.backend_port, 13579);
        assert_eq!(s.agent_run_timeout_ms, 180_000);
        assert_eq!(s.heartbeat_interval_seconds, 1800);
        assert_eq!(s.default_llm_provider, DefaultProvider::Openrouter);
    }

    #[test]
    fn unknown_provider_string_falls_back_to_default() {
        let parsed: Result<DefaultProvider, ()> = "not-a-provider".parse();
        assert!(parsed.is_err());
    }

    #[test]
    fn telegram_allowed_user_ids_splits_and_trims() {
        let mut s = Settings::default();
        s.telegram_allowed_users = Some(" 111, 222 ,333".to_string());
        assert_eq!(s.telegram_allowed_user_ids(), vec!["111", "222", "333"]);
    }

    #[test]
    fn telegram_allowed_user_ids_empty_when_unset() {
        let s = Settings::default();
        assert!(s.telegram_allowed_user_ids().is_empty());
    }
}
