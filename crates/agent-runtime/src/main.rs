//! Binary entry point: either runs one request through the orchestrator and
//! prints the reply, or starts the scheduler/heartbeat loop that drains
//! background tasks on a fixed interval.
//!
//! Grounded on `app/main.py`'s two run modes (API server / background
//! worker); this crate exposes them as CLI subcommands instead of an HTTP
//! server, since the API surface itself is out of scope here (see
//! DESIGN.md).

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use coordination::{
    AgentHeartbeat, ContextFileCache, Guardian, RelationshipMemoryStore, RunLaneQueue, RunRegistry,
    Settings, SessionStore, ShortTermMemoryManager, TaskQueue,
};

use agent_runtime::chat_model_adapter::{HttpChatModelFactory, ProviderEndpoint};
use agent_runtime::orchestrator::{Orchestrator, RunOutcome};
use agent_runtime::task_executor::OrchestratorTaskExecutor;
use agent_runtime::types::AgentRequest;
use agent_runtime::tools::build_default_registry;

#[derive(Parser)]
#[command(name = "agent-runtime", about = "Personal-assistant agent orchestration runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a single prompt through the orchestrator and prints the reply.
    Run {
        #[arg(long)]
        session_id: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "ui")]
        channel: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// Starts the heartbeat loop, draining scheduled/ready background
    /// tasks on `HEARTBEAT_INTERVAL_SECONDS`.
    Heartbeat,
}

fn build_endpoints(settings: &Settings) -> HashMap<String, ProviderEndpoint> {
    let mut endpoints = HashMap::new();
    if let Some(key) = &settings.openai_api_key {
        endpoints.insert(
            "openai".to_string(),
            ProviderEndpoint {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: Some(key.clone()),
            },
        );
    }
    if let Some(key) = &settings.openrouter_api_key {
        endpoints.insert(
            "openrouter".to_string(),
            ProviderEndpoint {
                base_url: "https://openrouter.ai/api/v1".to_string(),
                api_key: Some(key.clone()),
            },
        );
    }
    if let Some(key) = &settings.deepseek_api_key {
        endpoints.insert(
            "deepseek".to_string(),
            ProviderEndpoint {
                base_url: "https://api.deepseek.com/v1".to_string(),
                api_key: Some(key.clone()),
            },
        );
    }
    if let Some(key) = &settings.kimi_api_key {
        endpoints.insert(
            "kimi".to_string(),
            ProviderEndpoint {
                base_url: settings.kimi_base_url.clone(),
                api_key: Some(key.clone()),
            },
        );
    }
    if let Some(key) = &settings.nvidia_api_key {
        endpoints.insert(
            "nvidia".to_string(),
            ProviderEndpoint {
                base_url: settings.nvidia_base_url.clone(),
                api_key: Some(key.clone()),
            },
        );
    }
    endpoints.insert(
        "ollama".to_string(),
        ProviderEndpoint {
            base_url: settings.ollama_base_url.clone(),
            api_key: None,
        },
    );
    endpoints
}

fn build_orchestrator(settings: Settings) -> anyhow::Result<Orchestrator> {
    let settings = Arc::new(settings);
    let endpoints = build_endpoints(&settings);

    let sessions = Arc::new(SessionStore::new(format!("{}/sessions", settings.persist_directory))?);
    let relationship_memory = Arc::new(RelationshipMemoryStore::new(settings.relationship_memory_file.clone())?);
    let short_term_memory = Arc::new(ShortTermMemoryManager::new(format!(
        "{}/short_term",
        settings.persist_directory
    ))?);

    Ok(Orchestrator {
        settings: settings.clone(),
        registry: Arc::new(RunRegistry::new()),
        queue: Arc::new(RunLaneQueue::new(settings.agent_max_concurrent_runs)),
        guardian: Arc::new(Guardian::new()),
        sessions,
        relationship_memory,
        short_term_memory,
        vector_memory: Arc::new(coordination::LexicalMemoryIndex::new()),
        file_cache: Arc::new(ContextFileCache::new()),
        tools: build_default_registry(settings.brave_search_api_key.clone()),
        core_tools: vec![
            "read_local_file".to_string(),
            "write_local_file".to_string(),
            "list_directory".to_string(),
            "search_web".to_string(),
        ],
        model_factory: Arc::new(HttpChatModelFactory::new(endpoints)),
        system_prompt: format!(
            "You are {}, a personal assistant with access to local tools. Be concise and helpful.",
            settings.project_name
        ),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command {
        Command::Run {
            session_id,
            prompt,
            channel,
            model,
        } => {
            let orchestrator = build_orchestrator(settings)?;
            let request = AgentRequest {
                prompt,
                session_id,
                images: Vec::new(),
                model,
                channel,
                source_metadata: serde_json::Map::new(),
            };
            match orchestrator.run(request).await {
                RunOutcome::Response(response) => {
                    println!("{}", response.response);
                }
                RunOutcome::Approval(approval) => {
                    println!(
                        "Plan approval required (action_id={}): {}",
                        approval.action_id, approval.plan_summary
                    );
                }
            }
        }
        Command::Heartbeat => {
            let interval = std::time::Duration::from_secs(settings.heartbeat_interval_seconds);
            let orchestrator = Arc::new(build_orchestrator(settings)?);
            let queue = Arc::new(TaskQueue::new());
            let executor = Arc::new(OrchestratorTaskExecutor::new(orchestrator));
            let heartbeat = Arc::new(AgentHeartbeat::new(interval, queue, executor));
            tracing::info!("starting heartbeat loop");
            heartbeat.start().await;
        }
    }

    Ok(())
}
