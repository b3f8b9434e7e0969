//! Top-level request sequencing: queueing, evaluation, memory retrieval,
//! routing, plan approval, context assembly, and the turn loop.
//!
//! Grounded on `app/core/orchestrator.py::Orchestrator.process_request`. The
//! original runs this as one long async method guarded by a per-session
//! lock and a global semaphore; here those two concerns are
//! `coordination::RunLaneQueue::with_lease`, and everything inside the
//! lease mirrors the original's phase order: evaluate, retrieve memory,
//! route, maybe request plan approval, assemble context, run the turn
//! loop (retrying on turn-limit exhaustion), then persist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use coordination::{
    dedupe_fragments, optimize_context, should_request_plan_approval, ChatModelFactory,
    ContextFileCache, ExecutionLoopConfig, FailoverChain, Guardian, Message, MemoryIndex,
    ModelCandidate, RelationshipMemoryStore, RunLaneQueue, RunRegistry, Session, SessionStore,
    Settings, ShortTermMemoryManager, ToolRegistry,
};

use crate::types::{AgentRequest, AgentResponse, ApprovalRequired, ResponseMetadata};

/// Either a completed reply or a pending plan sign-off, returned from one
/// [`Orchestrator::run`] call.
pub enum RunOutcome {
    Response(AgentResponse),
    Approval(ApprovalRequired),
}

/// Holds everything a request needs to run end to end. One instance is
/// shared (behind `Arc`s internally, or cloned cheaply) across every
/// request the runtime serves, plus one constructed per heartbeat task
/// execution.
pub struct Orchestrator {
    pub settings: Arc<Settings>,
    pub registry: Arc<RunRegistry>,
    pub queue: Arc<RunLaneQueue>,
    pub guardian: Arc<Guardian>,
    pub sessions: Arc<SessionStore>,
    pub relationship_memory: Arc<RelationshipMemoryStore>,
    pub short_term_memory: Arc<ShortTermMemoryManager>,
    pub vector_memory: Arc<dyn MemoryIndex>,
    pub file_cache: Arc<ContextFileCache>,
    pub tools: ToolRegistry,
    pub core_tools: Vec<String>,
    pub model_factory: Arc<dyn ChatModelFactory>,
    pub system_prompt: String,
}

const SYSTEM_PROMPT_TOKEN_BUDGET: usize = 32_000;
const MEMORY_RESULTS_PER_QUERY: usize = 4;
const RELATIONSHIP_RESULTS: usize = 5;

impl Orchestrator {
    /// Resolves this request's `(provider, model)` failover chain from
    /// `settings`, honoring an explicit `request.model` override as the
    /// preferred first candidate.
    fn failover_chain(&self, request: &AgentRequest) -> FailoverChain {
        let mut active: Vec<ModelCandidate> = Vec::new();
        let mut push = |provider: &str, model: &str, has_key: bool| {
            if has_key {
                active.push((provider.to_string(), model.to_string()));
            }
        };
        push("openrouter", "openrouter/auto", self.settings.openrouter_api_key.is_some());
        push("openai", "gpt-4o-mini", self.settings.openai_api_key.is_some());
        push("deepseek", "deepseek-chat", self.settings.deepseek_api_key.is_some());
        push("kimi", "moonshot-v1-8k", self.settings.kimi_api_key.is_some());
        push(
            "nvidia",
            &self.settings.nvidia_model,
            self.settings.nvidia_api_key.is_some(),
        );
        push("ollama", &self.settings.ollama_model, true);

        let seed_defaults = vec![
            ("openrouter".to_string(), "openrouter/auto".to_string()),
            ("ollama".to_string(), self.settings.ollama_model.clone()),
        ];

        let parse_candidate = |spec: &str| -> Option<ModelCandidate> {
            let (provider, model) = spec.split_once('/')?;
            Some((provider.to_string(), model.to_string()))
        };

        let preferred = request.model.as_deref().and_then(parse_candidate);
        // Spec §4.3 steps 2-3: the `default`/`smart` aliases resolve to
        // whichever concrete candidate `Settings` points them at.
        let default_alias = parse_candidate(&self.settings.default_model);
        let smart_alias = parse_candidate(&self.settings.smart_model);

        FailoverChain::new_with_aliases(active, seed_defaults, preferred, default_alias, smart_alias)
    }

    /// Retrieves relationship facts and vector/lexical memory for this
    /// request's evaluator queries, rendering the relationship block and
    /// deduped fragment list the system prompt and metadata need. Per spec
    /// §4.11, queries are deduplicated and an empty list falls back to the
    /// trimmed prompt.
    async fn retrieve_memory(
        &self,
        queries: &[String],
        primary_query: &str,
    ) -> (String, Vec<coordination::MemoryFragment>) {
        let relationship_block = self.relationship_memory.to_context_block(primary_query, RELATIONSHIP_RESULTS);
        let deduped = dedupe_queries_or_fallback(queries, primary_query);

        let mut fragments = Vec::new();
        for query in &deduped {
            match self.vector_memory.search(query, MEMORY_RESULTS_PER_QUERY).await {
                Ok(found) => fragments.extend(found),
                Err(err) => {
                    tracing::warn!(query, error = %err, "memory search failed; continuing without this query");
                }
            }
        }
        (relationship_block, dedupe_fragments(fragments))
    }

    /// Resolves the "fast meta-model" spec §4.6 calls `evaluate`/`route`/
    /// `plan` against: the `default` alias's configured candidate. Returns
    /// `None` if the alias is malformed or the factory can't resolve it, in
    /// which case every meta-call falls back to its deterministic heuristic.
    fn resolve_meta_model(&self) -> Option<Arc<dyn coordination::ChatModel>> {
        let (provider, model) = self.settings.default_model.split_once('/')?;
        self.model_factory.resolve(provider, model).ok()
    }

    /// Runs one [`AgentRequest`] through the full pipeline: queue lease,
    /// evaluation, memory, routing, optional plan approval, context
    /// assembly, turn loop (retried per §4.9 on turn-limit exhaustion), and
    /// persistence.
    pub async fn run(&self, request: AgentRequest) -> RunOutcome {
        let queue_source = request.channel.clone();
        let session_id = request.session_id.clone();
        let timeout = if self.settings.agent_queue_wait_timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.settings.agent_queue_wait_timeout_seconds))
        };

        let result = self
            .queue
            .with_lease(session_id.clone(), queue_source, timeout, |entry| {
                let enqueued_at = entry.enqueued_at;
                async move { self.run_leased(request, enqueued_at).await }
            })
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => RunOutcome::Response(AgentResponse::error(
                session_id,
                "ui",
                "Request timed out waiting for a free execution lane.",
            )),
        }
    }

    async fn run_leased(
        &self,
        request: AgentRequest,
        enqueued_at: chrono::DateTime<chrono::Utc>,
    ) -> RunOutcome {
        let started = Instant::now();
        let queue_wait_seconds = (chrono::Utc::now() - enqueued_at).num_milliseconds().max(0) as f64 / 1000.0;

        let meta_model = self.resolve_meta_model();
        let meta_model_ref = meta_model.as_deref();
        let meta_timeout = coordination::meta_timeout(self.settings.agent_llm_timeout_seconds);

        let evaluation = coordination::evaluate_with_meta_model(&request.prompt, meta_model_ref, meta_timeout).await;

        let (relationship_block, memory_fragments) =
            self.retrieve_memory(&evaluation.memory_queries, &request.prompt).await;

        let available_tools = self.tools.names();
        let (default_provider, default_model) = self
            .failover_chain(&request)
            .current()
            .cloned()
            .unwrap_or_else(|| ("ollama".to_string(), self.settings.ollama_model.clone()));
        let routing = coordination::route_request_with_meta_model(
            &request.prompt,
            &available_tools,
            &default_provider,
            &default_model,
            meta_model_ref,
            meta_timeout,
        )
        .await;

        if should_request_plan_approval(
            &request.prompt,
            &request.session_id,
            &routing.selected_tools,
            self.settings.agent_require_plan_approval,
        ) {
            let plan = coordination::build_execution_plan_with_meta_model(&request.prompt, meta_model_ref, meta_timeout).await;
            let plan_value = serde_json::to_value(&plan).unwrap_or(serde_json::Value::Null);
            let action_id = self.guardian.create_plan_approval(&request.session_id, &evaluation.intent, plan_value);
            return RunOutcome::Approval(ApprovalRequired {
                approval_required: true,
                action_id,
                plan_summary: format!("{}: {} step(s)", plan.name, plan.steps.len()),
                session_id: request.session_id,
            });
        }

        let mut session = self.sessions.load(&request.session_id);
        session.touch();
        if !request.source_metadata.is_empty() {
            for (k, v) in &request.source_metadata {
                session.metadata.insert(k.clone(), v.clone());
            }
        }

        let short_term_context = self.short_term_memory.get_today_context(&request.session_id);
        let memory_block = render_memory_block(&memory_fragments);
        let short_term_and_memory = [short_term_context, memory_block, relationship_block]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let windowed = optimize_context(
            SYSTEM_PROMPT_TOKEN_BUDGET,
            &self.file_cache,
            &self.system_prompt,
            &session.messages,
            &request.prompt,
            &session.context_files,
            &short_term_and_memory,
        );

        let mut messages = windowed;
        messages.push(Message::user(request.prompt.clone()));

        let turn_tools = coordination::select_tools(&self.tools, &self.core_tools, &routing.selected_tools, &[]);

        let mut failover = self.failover_chain(&request);
        let config = ExecutionLoopConfig {
            llm_timeout_seconds: self.settings.agent_llm_timeout_seconds,
            tool_timeout_seconds: self.settings.agent_tool_timeout_seconds,
            tool_retry_attempts: self.settings.agent_tool_retry_attempts,
        };

        let max_attempts = self.settings.agent_execution_max_attempts.max(1);
        let mut loop_result = None;
        for attempt in 0..max_attempts {
            if attempt > 0 {
                messages.push(Message::user(
                    "Please wrap up and give a final answer now; you're running long on this request.",
                ));
            }

            if let Err(err) = self
                .registry
                .register_run(request.session_id.clone(), coordination::MAX_TURNS, self.settings.agent_run_timeout_ms)
                .await
            {
                tracing::warn!(session_id = %request.session_id, error = %err, "run already active for session");
                return RunOutcome::Response(AgentResponse::error(
                    request.session_id.clone(),
                    &request.channel,
                    "Another run is already active for this session.",
                ));
            }

            let result = coordination::run_turn_loop(
                &self.registry,
                &request.session_id,
                self.model_factory.as_ref(),
                &mut failover,
                &turn_tools,
                &self.guardian,
                &mut messages,
                &config,
            )
            .await;

            self.registry.complete_run(&request.session_id);
            let hit_limit = result.hit_turn_limit;
            loop_result = Some(result);
            if !hit_limit {
                break;
            }
        }

        let loop_result = loop_result.expect("loop runs at least once since max_attempts.max(1) >= 1");

        for message in &loop_result.new_messages {
            session.push(message.clone());
        }
        if let Err(err) = self.sessions.save(&session) {
            tracing::error!(session_id = %request.session_id, error = %err, "failed to persist session");
        }

        if session.unsummarized().len() >= coordination::SUMMARY_INTERVAL {
            let range = format!("messages {}-{}", session.last_summary_index, session.messages.len());
            let summary = summarize_recent(session.unsummarized());
            if let Err(err) = self
                .short_term_memory
                .add_memory(&request.session_id, &summary, &range)
            {
                tracing::warn!(session_id = %request.session_id, error = %err, "failed to record short-term memory");
            }
            let mark_at = session.messages.len();
            session.mark_summarized_up_to(mark_at);
            let _ = self.sessions.save(&session);
        }

        let metadata = ResponseMetadata {
            intent: Some(evaluation.intent),
            model_used: failover.current().map(|(p, m)| format!("{p}/{m}")),
            tools_used: loop_result.tools_used,
            failover_attempts: loop_result.failover_attempts,
            memory_used: memory_fragments.len(),
            relationship_memory_used: RELATIONSHIP_RESULTS,
            source_channel: request.channel.clone(),
            channel: request.channel.clone(),
            queue_wait_seconds,
            error: None,
            status: None,
        };

        tracing::info!(
            session_id = %request.session_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            hit_turn_limit = loop_result.hit_turn_limit,
            "request completed"
        );

        RunOutcome::Response(AgentResponse {
            response: loop_result.answer,
            metadata,
            session_id: request.session_id,
        })
    }
}

/// §4.11: deduplicate evaluator memory queries, falling back to the
/// trimmed prompt when none remain.
fn dedupe_queries_or_fallback(queries: &[String], primary_query: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<String> = queries.iter().filter(|q| seen.insert(q.as_str())).cloned().collect();
    let trimmed_prompt = primary_query.trim();
    if deduped.is_empty() && !trimmed_prompt.is_empty() {
        deduped.push(trimmed_prompt.to_string());
    }
    deduped
}

fn render_memory_block(fragments: &[coordination::MemoryFragment]) -> String {
    if fragments.is_empty() {
        return String::new();
    }
    let mut block = String::from("--- RETRIEVED MEMORY ---\n");
    for fragment in fragments {
        block.push_str(&format!("- {}\n", fragment.text));
    }
    block
}

/// Deliberately simple extractive summary used as the §4.10 short-term
/// memory record: joins user-turn content, capped so the daily store
/// doesn't grow unbounded on chatty sessions.
fn summarize_recent(messages: &[Message]) -> String {
    let joined: Vec<String> = messages
        .iter()
        .filter(|m| m.is_user())
        .map(|m| m.content().as_text())
        .collect();
    let text = joined.join(" / ");
    text.chars().take(500).collect()
}
