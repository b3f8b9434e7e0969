//! Bounded tool-calling turn loop: the core of one orchestrator run.
//!
//! Grounded on `app/agents/execution_loop.py`'s `_run_turns` method. Each
//! [`run_turn_loop`] call drives one [`crate::run_registry::RunHandle`]
//! through at most [`MAX_TURNS`] turns, dispatching tool calls concurrently
//! through a [`ToolRegistry`], rotating models on recoverable errors via a
//! [`FailoverChain`], and detecting stuck loops and hallucinated tool text
//! along the way. The deadline-race/detach pattern for model invocation
//! follows the teacher's `harness` task-cancellation idiom: the losing
//! branch of a `tokio::select!` is never awaited again, so its eventual
//! panic/error is silently dropped when the `JoinHandle` itself is dropped.

use crate::chat_model::{AssistantMessage, ChatModel, ChatModelError, ChatModelFactory};
use crate::context_manager::sanitize_messages;
use crate::error_classifier::{classify_error, plan_recovery, ClassifiedError, RecoveryStrategy};
use crate::failover::FailoverChain;
use crate::guardian::Guardian;
use crate::message::{Content, Message, ToolCall};
use crate::run_registry::RunRegistry;
use crate::tool::ToolRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Hard cap on turns within a single execution-loop run. Distinct from
/// [`crate::run_registry::RunHandle::max_turns`] — see the registry's
/// own doc comment for why the two are not the same knob.
pub const MAX_TURNS: u32 = 30;

/// How many consecutive empty-text turns we'll nudge before giving up and
/// finalizing with the canned fallback answer.
pub const NUDGE_LIMIT: u32 = 3;

/// Consecutive identical tool-call batches that trigger the loop-break path.
pub const LOOP_BREAK_REPEATS: usize = 3;

pub const FALLBACK_ANSWER: &str =
    "I wasn't able to generate a response. Please try again or rephrase your request.";

const PLACEHOLDER_TEXTS: &[&str] = &[
    "(empty response)",
    "(calling tools)",
    "(thinking)",
    "(continued)",
    "(system)",
];

/// Providers known not to support tool binding; skipped by failover when
/// the current turn requires bound tools.
const TOOL_UNFRIENDLY_FAILOVER_PROVIDERS: &[&str] = &["ollama"];

/// Per-run knobs threaded in from [`crate::settings::Settings`].
#[derive(Debug, Clone)]
pub struct ExecutionLoopConfig {
    pub llm_timeout_seconds: u64,
    pub tool_timeout_seconds: u64,
    pub tool_retry_attempts: u32,
}

/// Outcome of a completed (or aborted) turn loop.
#[derive(Debug)]
pub struct LoopResult {
    pub answer: String,
    /// Messages to append to the session: the final turn's assistant/tool
    /// traffic plus any steer messages drained along the way. Does not
    /// include the leading system message or pre-existing history, which
    /// the caller already owns. `None` final-assistant entries (elided
    /// per §4.7 finalization) are simply omitted.
    pub new_messages: Vec<Message>,
    pub tools_used: Vec<String>,
    pub failover_attempts: Vec<String>,
    pub hit_turn_limit: bool,
    pub aborted_reason: Option<String>,
}

/// Selects the tool subset for one run: `core ∪ router ∪ session_dynamic`,
/// falling back to every registered tool when the union has fewer than 3
/// members (binding a near-empty tool set is rarely what the user wants).
pub fn select_tools(
    registry: &ToolRegistry,
    core_tools: &[String],
    router_tools: &[String],
    session_dynamic_tools: &[String],
) -> ToolRegistry {
    let mut names: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for n in core_tools.iter().chain(router_tools).chain(session_dynamic_tools) {
        if seen.insert(n.clone()) {
            names.push(n.clone());
        }
    }

    let subset = registry.subset(&names);
    if subset.len() < 3 {
        registry.subset(&registry.names())
    } else {
        subset
    }
}

fn is_hallucinated_tool_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("**tool call**") || (lower.contains("executing tool") && text.len() < 200)
}

fn is_placeholder_text(text: &str) -> bool {
    let trimmed = text.trim().to_lowercase();
    PLACEHOLDER_TEXTS.contains(&trimmed.as_str())
}

fn batch_signature(calls: &[ToolCall]) -> String {
    calls
        .iter()
        .map(|c| {
            let mut keys: Vec<&String> = c.args.keys().collect();
            keys.sort();
            let rendered: Vec<String> = keys
                .iter()
                .map(|k| format!("{k}={}", c.args.get(*k).map(|v| v.to_string()).unwrap_or_default()))
                .collect();
            format!("{}({})", c.name, rendered.join(","))
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn extract_text(content: &Content) -> String {
    content.as_text()
}

fn nudge_message(tool_result_seen: bool) -> Message {
    if tool_result_seen {
        Message::user(
            "You already have tool results above. Use them to write a direct text answer now \
             — do not call more tools and do not leave the response empty.",
        )
    } else {
        Message::user(
            "Your previous response was empty. Please answer the request directly in text.",
        )
    }
}

/// Advances `failover` past any candidate whose provider can't take bound
/// tools, when the caller needs a bound call. Returns the failure reason
/// recorded on the final successful (or exhausting) advance, if any.
fn advance_failover(failover: &mut FailoverChain, reason: &str, require_tool_friendly: bool) -> bool {
    if !failover.advance(reason.to_string()) {
        return false;
    }
    if require_tool_friendly {
        while let Some((provider, _)) = failover.current() {
            if TOOL_UNFRIENDLY_FAILOVER_PROVIDERS.contains(&provider.as_str()) {
                if !failover.advance("tool_unfriendly_provider_skipped".to_string()) {
                    return false;
                }
            } else {
                break;
            }
        }
    }
    failover.current().is_some()
}

/// Resolves `provider`/`model` against `factory`, returning `None` (so the
/// caller falls back to an unbound forced-text call) if resolution fails.
fn resolve_model(factory: &dyn ChatModelFactory, candidate: Option<&(String, String)>) -> Option<Arc<dyn ChatModel>> {
    let (provider, model) = candidate?;
    factory.resolve(provider, model).ok()
}

/// Invokes `model` under a deadline, detaching (not aborting) the losing
/// task on timeout so an opaque SDK that ignores cancellation can't block
/// the caller — its eventual result is simply dropped.
async fn invoke_with_deadline(
    model: Arc<dyn ChatModel>,
    messages: Vec<Message>,
    tool_schemas: Vec<Value>,
    timeout: Duration,
) -> Result<AssistantMessage, ChatModelError> {
    let handle = tokio::spawn(async move { model.ainvoke(&messages, &tool_schemas).await });
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(ChatModelError::Provider(format!(
            "model invocation task failed: {join_err}"
        ))),
        Err(_) => {
            tracing::warn!("model invocation exceeded deadline; detaching losing task");
            Err(ChatModelError::Timeout)
        }
    }
}

fn retryable_tool_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timeout", "timed out", "429", "connection reset", "connection refused", "temporarily unavailable"]
        .iter()
        .any(|marker| lower.contains(marker))
}

/// Dispatches one tool call: guardian check, then invoke with bounded
/// retries on retryable errors. Returns `(tool_call_id, result_text)`.
async fn dispatch_tool_call(
    tools: &ToolRegistry,
    guardian: &Guardian,
    call: ToolCall,
    tool_timeout: Duration,
    max_attempts: u32,
) -> (String, String) {
    let (allowed, reason, action_id) = guardian.validate_tool_call(&call.name, &call.args);
    if !allowed {
        let action = action_id.unwrap_or_default();
        return (
            call.call_id,
            format!(
                "Action blocked: {reason} (action_id: {action}). Ask the user to approve this \
                 action before retrying."
            ),
        );
    }

    let Some(tool) = tools.get(&call.name) else {
        return (call.call_id, format!("Error: unknown tool {:?}", call.name));
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::time::timeout(tool_timeout, tool.invoke(&call.args)).await;
        match outcome {
            Ok(Ok(output)) => return (call.call_id, output),
            Ok(Err(err)) => {
                let msg = err.to_string();
                if attempt < max_attempts && retryable_tool_error(&msg) {
                    let delay = (0.75 * attempt as f64).min(3.0);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    continue;
                }
                return (call.call_id, format!("Error: {msg}"));
            }
            Err(_) => {
                if attempt < max_attempts {
                    let delay = (0.75 * attempt as f64).min(3.0);
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    continue;
                }
                return (
                    call.call_id,
                    format!("Error: tool {} timed out after {}s", call.name, tool_timeout.as_secs()),
                );
            }
        }
    }
}

async fn dispatch_tool_batch(
    tools: &ToolRegistry,
    guardian: &Guardian,
    calls: &[ToolCall],
    tool_timeout: Duration,
    max_attempts: u32,
) -> Vec<(ToolCall, String)> {
    let futures = calls.iter().cloned().map(|call| {
        let name = call.name.clone();
        let fut = dispatch_tool_call(tools, guardian, call, tool_timeout, max_attempts);
        async move {
            let (id, text) = fut.await;
            (ToolCall::new(id, name.clone(), Default::default()), text)
        }
    });
    let results = futures::future::join_all(futures).await;
    calls
        .iter()
        .zip(results.into_iter())
        .map(|(original, (_, text))| (original.clone(), text))
        .collect()
}

fn clamp_secs(v: u64, lo: u64, hi: u64) -> u64 {
    v.clamp(lo, hi)
}

/// Runs the bounded turn loop for one request. `messages` is the already
/// windowed/sanitized context built by
/// [`crate::context_manager::optimize_context`] with the current user
/// message appended; it is mutated in place and the caller may inspect it
/// afterward for the full transcript. `failover.current()` supplies the
/// first model candidate; on recoverable errors the chain is advanced and
/// the rotation is recorded in the returned [`LoopResult`].
pub async fn run_turn_loop(
    registry: &RunRegistry,
    session_id: &str,
    factory: &dyn ChatModelFactory,
    failover: &mut FailoverChain,
    tools: &ToolRegistry,
    guardian: &Guardian,
    messages: &mut Vec<Message>,
    config: &ExecutionLoopConfig,
) -> LoopResult {
    let llm_timeout = Duration::from_secs(clamp_secs(config.llm_timeout_seconds, 1, 30));
    let tool_timeout = Duration::from_secs(config.tool_timeout_seconds.max(1));

    let mut new_messages: Vec<Message> = Vec::new();
    let mut tools_used: Vec<String> = Vec::new();
    let mut failover_attempts: Vec<String> = Vec::new();
    let mut recent_batch_signatures: Vec<String> = Vec::new();
    let mut nudge_count = 0u32;
    let mut wrapped_up = false;
    let mut forced_unbound = false;

    let base_tool_schemas = tools.schemas();

    let Some(run) = registry.get_run(session_id).await else {
        return LoopResult {
            answer: "[Run cancelled: run not registered]".to_string(),
            new_messages,
            tools_used,
            failover_attempts,
            hit_turn_limit: false,
            aborted_reason: Some("run_not_registered".to_string()),
        };
    };

    let mut turn: u32 = 0;
    loop {
        if run.is_aborted() {
            let reason = run.cancel_reason().await.unwrap_or_else(|| "unknown".to_string());
            return LoopResult {
                answer: format!("[Run cancelled: {reason}]"),
                new_messages,
                tools_used,
                failover_attempts,
                hit_turn_limit: false,
                aborted_reason: Some(reason),
            };
        }

        for steer in run.drain_steer().await {
            let msg = Message::user(format!("[USER STEERING]: {steer}"));
            messages.push(msg.clone());
            new_messages.push(msg);
        }

        turn += 1;
        registry.update_run_turn(session_id, turn).await;
        if run.is_aborted() {
            let reason = run.cancel_reason().await.unwrap_or_else(|| "turn_limit".to_string());
            return LoopResult {
                answer: format!("[Run cancelled: {reason}]"),
                new_messages,
                tools_used,
                failover_attempts,
                hit_turn_limit: reason == "max_turns_reached",
                aborted_reason: Some(reason),
            };
        }

        if turn > MAX_TURNS {
            break;
        }

        if turn >= MAX_TURNS.saturating_sub(2) && !wrapped_up {
            wrapped_up = true;
            forced_unbound = true;
            let directive = Message::user(
                "You are almost out of turns. Stop calling tools and respond to the user with a \
                 final text answer now.",
            );
            messages.push(directive.clone());
            new_messages.push(directive);
        }

        let tool_schemas = if forced_unbound { Vec::new() } else { base_tool_schemas.clone() };
        let model = match resolve_model(factory, failover.current()) {
            Some(m) => m,
            None => break,
        };

        // §4.7 step 5: re-sanitize every turn, not just once before the loop
        // starts — steering/wrap-up/tool messages accumulated since the last
        // turn could otherwise violate the turn-ordering invariants (no two
        // consecutive plain-Assistant messages, no orphaned tool_calls).
        *messages = sanitize_messages(messages);

        let invoke_result =
            invoke_with_deadline(model.clone(), messages.clone(), tool_schemas.clone(), llm_timeout).await;

        let assistant = match invoke_result {
            Ok(assistant) => assistant,
            Err(err) => {
                let classified = classify_error(&err.to_string(), "model_invocation", None, None);
                let strategy = plan_recovery(&classified, failover.attempts().len() as u32 + 1);
                match handle_invoke_error(&classified, strategy, failover, !forced_unbound, messages) {
                    InvokeErrorOutcome::RetrySameTurn(reason) => {
                        turn -= 1;
                        failover_attempts.push(reason);
                        continue;
                    }
                    InvokeErrorOutcome::RetryReducedContext => {
                        reduce_context(messages);
                        turn -= 1;
                        continue;
                    }
                    InvokeErrorOutcome::Terminate(text) => {
                        return LoopResult {
                            answer: text,
                            new_messages,
                            tools_used,
                            failover_attempts,
                            hit_turn_limit: false,
                            aborted_reason: None,
                        };
                    }
                }
            }
        };

        if assistant.tool_calls.is_empty() {
            let text = extract_text(&assistant.content);

            if is_hallucinated_tool_text(&text) {
                let assistant_msg = Message::assistant_text(text);
                messages.push(assistant_msg.clone());
                new_messages.push(assistant_msg);
                let trap = Message::user(
                    "You wrote tool-call-looking text instead of actually calling a tool. Use the \
                     real tool-call mechanism, or answer in plain text if no tool is needed.",
                );
                messages.push(trap.clone());
                new_messages.push(trap);
                continue;
            }

            let effective_text = if is_placeholder_text(&text) { String::new() } else { text };

            if effective_text.trim().is_empty() && nudge_count < NUDGE_LIMIT {
                nudge_count += 1;
                let tool_result_seen = messages.iter().any(|m| m.is_tool());
                let nudge = nudge_message(tool_result_seen);
                messages.push(nudge.clone());
                new_messages.push(nudge);
                continue;
            }

            let final_text = if effective_text.trim().is_empty() {
                FALLBACK_ANSWER.to_string()
            } else {
                effective_text
            };

            if !final_text.trim().is_empty() && final_text != FALLBACK_ANSWER {
                let assistant_msg = Message::assistant_text(final_text.clone());
                new_messages.push(assistant_msg);
            }

            return LoopResult {
                answer: final_text,
                new_messages,
                tools_used,
                failover_attempts,
                hit_turn_limit: false,
                aborted_reason: None,
            };
        }

        let signature = batch_signature(&assistant.tool_calls);
        recent_batch_signatures.push(signature.clone());
        if recent_batch_signatures.len() > LOOP_BREAK_REPEATS {
            recent_batch_signatures.remove(0);
        }
        let looping = recent_batch_signatures.len() == LOOP_BREAK_REPEATS
            && recent_batch_signatures.iter().all(|s| s == &signature);

        let assistant_content = if extract_text(&assistant.content).trim().is_empty() {
            Content::text("(calling tools)")
        } else {
            assistant.content.clone()
        };
        let assistant_msg = Message::assistant_with_tools(assistant_content, assistant.tool_calls.clone());
        messages.push(assistant_msg.clone());
        new_messages.push(assistant_msg);

        if looping {
            forced_unbound = true;
            let stop_directive = Message::user(
                "You keep calling the same tool with the same arguments. Stop calling tools and \
                 answer in text now.",
            );
            messages.push(stop_directive.clone());
            new_messages.push(stop_directive);
            continue;
        }

        let results = dispatch_tool_batch(
            tools,
            guardian,
            &assistant.tool_calls,
            tool_timeout,
            config.tool_retry_attempts.max(1),
        )
        .await;

        for (call, output) in results {
            if !tools_used.contains(&call.name) {
                tools_used.push(call.name.clone());
            }
            let tool_msg = Message::tool(output, call.call_id.clone(), call.name.clone());
            messages.push(tool_msg.clone());
            new_messages.push(tool_msg);
        }
    }

    // Finalization: one last forced, unbound, text-only call.
    let directive = Message::user(format!(
        "You used all {turn} turns without finishing. Stop calling tools and respond with text now."
    ));
    messages.push(directive.clone());
    new_messages.push(directive);

    let forced_answer = match resolve_model(factory, failover.current()) {
        Some(model) => match invoke_with_deadline(model, messages.clone(), Vec::new(), llm_timeout).await {
            Ok(assistant) => extract_text(&assistant.content),
            Err(_) => String::new(),
        },
        None => String::new(),
    };

    let cleaned = if is_placeholder_text(&forced_answer) { String::new() } else { forced_answer };

    if cleaned.trim().is_empty() {
        LoopResult {
            answer: FALLBACK_ANSWER.to_string(),
            new_messages,
            tools_used,
            failover_attempts,
            hit_turn_limit: true,
            aborted_reason: None,
        }
    } else {
        new_messages.push(Message::assistant_text(cleaned.clone()));
        LoopResult {
            answer: cleaned,
            new_messages,
            tools_used,
            failover_attempts,
            hit_turn_limit: true,
            aborted_reason: None,
        }
    }
}

enum InvokeErrorOutcome {
    RetrySameTurn(String),
    RetryReducedContext,
    Terminate(String),
}

fn handle_invoke_error(
    classified: &ClassifiedError,
    strategy: RecoveryStrategy,
    failover: &mut FailoverChain,
    tools_bound: bool,
    messages: &mut [Message],
) -> InvokeErrorOutcome {
    match strategy {
        RecoveryStrategy::RotateModel | RecoveryStrategy::CompactContext => {
            if advance_failover(failover, &classified.message, tools_bound) {
                if let Some((provider, model)) = failover.current() {
                    patch_system_note(messages, provider, model);
                }
                return InvokeErrorOutcome::RetrySameTurn(classified.message.clone());
            }
            InvokeErrorOutcome::Terminate(terminal_text_for(classified))
        }
        RecoveryStrategy::ReduceContext => InvokeErrorOutcome::RetryReducedContext,
        _ => {
            if messages.len() > 5 {
                InvokeErrorOutcome::RetryReducedContext
            } else {
                InvokeErrorOutcome::Terminate(terminal_text_for(classified))
            }
        }
    }
}

fn terminal_text_for(classified: &ClassifiedError) -> String {
    use crate::error_classifier::ErrorClass;
    match classified.class {
        ErrorClass::AuthError => "I'm having trouble reaching the language model right now (system error). Please try again later.".to_string(),
        _ => "I'm having trouble completing that right now. Please try rephrasing your request.".to_string(),
    }
}

fn patch_system_note(messages: &mut [Message], provider: &str, model: &str) {
    if let Some(first) = messages.first_mut() {
        if first.is_system() {
            let mut text = first.content().as_text();
            text.push_str(&format!(
                "\n\n[SYSTEM NOTE: You are running on {provider}/{model}. Respond concisely.]"
            ));
            first.set_content(Content::text(text));
        }
    }
}

fn reduce_context(messages: &mut Vec<Message>) {
    let system: Vec<Message> = messages.iter().filter(|m| m.is_system()).cloned().collect();
    let rest: Vec<Message> = messages.iter().filter(|m| !m.is_system()).cloned().collect();
    let tail_start = rest.len().saturating_sub(4);
    let mut reduced = system;
    reduced.extend(rest[tail_start..].iter().cloned());
    *messages = reduced;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_model::MockChatModel;
    use crate::run_registry::RunRegistry;
    use serde_json::Map;

    struct SingleModelFactory(Arc<MockChatModel>);

    impl ChatModelFactory for SingleModelFactory {
        fn resolve(&self, _provider: &str, _model: &str) -> Result<Arc<dyn ChatModel>, ChatModelError> {
            Ok(self.0.clone())
        }
    }

    fn config() -> ExecutionLoopConfig {
        ExecutionLoopConfig {
            llm_timeout_seconds: 5,
            tool_timeout_seconds: 5,
            tool_retry_attempts: 2,
        }
    }

    #[tokio::test]
    async fn happy_path_returns_text_with_no_tools() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s1", 30, 0).await.unwrap();

        let model = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        model.push_text("Hello there!");
        let factory = SingleModelFactory(model);

        let mut failover = FailoverChain::new(
            vec![("openrouter".to_string(), "kimi-k2".to_string())],
            vec![],
            None,
        );
        let tools = ToolRegistry::new();
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("you are helpful"), Message::user("hello")];

        let result = run_turn_loop(&registry, "s1", &factory, &mut failover, &tools, &guardian, &mut messages, &config()).await;

        assert_eq!(result.answer, "Hello there!");
        assert!(result.tools_used.is_empty());
        assert!(result.aborted_reason.is_none());
    }

    #[tokio::test]
    async fn tool_call_then_text_records_tool_used() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s2", 30, 0).await.unwrap();

        let model = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        model.push_tool_call(
            "",
            vec![ToolCall::new("c1", "read_local_file", Map::new())],
        );
        model.push_text("Summary: the file says hi.");
        let factory = SingleModelFactory(model);

        let mut failover = FailoverChain::new(
            vec![("openrouter".to_string(), "kimi-k2".to_string())],
            vec![],
            None,
        );
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoingTool));
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("you are helpful"), Message::user("read the file")];

        let result = run_turn_loop(&registry, "s2", &factory, &mut failover, &tools, &guardian, &mut messages, &config()).await;

        assert_eq!(result.answer, "Summary: the file says hi.");
        assert_eq!(result.tools_used, vec!["read_local_file".to_string()]);
    }

    struct EchoingTool;

    #[async_trait::async_trait]
    impl crate::tool::Tool for EchoingTool {
        fn name(&self) -> &str {
            "read_local_file"
        }
        fn description(&self) -> &str {
            "reads a local file"
        }
        fn schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }
        async fn invoke(&self, _args: &serde_json::Map<String, Value>) -> Result<String, crate::tool::ToolError> {
            Ok("file contents: hi".to_string())
        }
    }

    #[tokio::test]
    async fn identical_tool_batches_trigger_loop_break() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s3", 30, 0).await.unwrap();

        let model = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        for _ in 0..5 {
            model.push_tool_call("", vec![ToolCall::new("c1", "read_local_file", Map::new())]);
        }
        model.push_text("final forced answer");
        let factory = SingleModelFactory(model);

        let mut failover = FailoverChain::new(
            vec![("openrouter".to_string(), "kimi-k2".to_string())],
            vec![],
            None,
        );
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoingTool));
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("you are helpful"), Message::user("loop please")];

        let result = run_turn_loop(&registry, "s3", &factory, &mut failover, &tools, &guardian, &mut messages, &config()).await;

        assert_eq!(result.answer, "final forced answer");
    }

    #[tokio::test]
    async fn aborted_run_short_circuits_immediately() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s4", 30, 0).await.unwrap();
        registry.abort_run("s4", "user_cancelled").await;

        let model = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        model.push_text("should not be reached");
        let factory = SingleModelFactory(model);

        let mut failover = FailoverChain::new(
            vec![("openrouter".to_string(), "kimi-k2".to_string())],
            vec![],
            None,
        );
        let tools = ToolRegistry::new();
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("sys"), Message::user("hi")];

        let result = run_turn_loop(&registry, "s4", &factory, &mut failover, &tools, &guardian, &mut messages, &config()).await;

        assert!(result.answer.contains("user_cancelled"));
        assert_eq!(result.aborted_reason.as_deref(), Some("user_cancelled"));
    }

    #[test]
    fn select_tools_falls_back_to_all_when_union_too_small() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoingTool));
        let selected = select_tools(&registry, &[], &["read_local_file".to_string()], &[]);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn hallucinated_tool_text_is_detected() {
        assert!(is_hallucinated_tool_text("**Tool Call**: read_local_file"));
        assert!(is_hallucinated_tool_text("executing tool now"));
        assert!(!is_hallucinated_tool_text("here is a long answer that happens to mention executing tool somewhere deep in a much longer piece of text that exceeds two hundred characters in total length so it should not trip the detector at all no matter what"));
    }

    #[test]
    fn placeholder_text_is_recognized() {
        assert!(is_placeholder_text("(thinking)"));
        assert!(!is_placeholder_text("a real answer"));
    }

    #[test]
    fn batch_signature_is_order_sensitive_on_args_but_stable() {
        let mut args1 = serde_json::Map::new();
        args1.insert("b".to_string(), Value::String("2".to_string()));
        args1.insert("a".to_string(), Value::String("1".to_string()));
        let call1 = ToolCall::new("id1", "t", args1);

        let mut args2 = serde_json::Map::new();
        args2.insert("a".to_string(), Value::String("1".to_string()));
        args2.insert("b".to_string(), Value::String("2".to_string()));
        let call2 = ToolCall::new("id2", "t", args2);

        assert_eq!(batch_signature(&[call1]), batch_signature(&[call2]));
    }

    /// Resolves each `(provider, model)` pair to its own scripted
    /// [`MockChatModel`], so failover rotation can be observed switching
    /// between distinct response queues.
    struct MultiModelFactory(std::collections::HashMap<(String, String), Arc<MockChatModel>>);

    impl ChatModelFactory for MultiModelFactory {
        fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ChatModel>, ChatModelError> {
            self.0
                .get(&(provider.to_string(), model.to_string()))
                .cloned()
                .map(|m| m as Arc<dyn ChatModel>)
                .ok_or_else(|| ChatModelError::UnknownProvider { provider: provider.to_string() })
        }
    }

    #[tokio::test]
    async fn mid_loop_rate_limit_rotates_to_next_candidate() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s5", 30, 0).await.unwrap();

        let primary = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        primary.push_error(ChatModelError::Provider("429 Too Many Requests".to_string()));
        let secondary = Arc::new(MockChatModel::new("anthropic", "claude-haiku"));
        secondary.push_text("answered from the rotated model");

        let mut models = std::collections::HashMap::new();
        models.insert(("openrouter".to_string(), "kimi-k2".to_string()), primary);
        models.insert(("anthropic".to_string(), "claude-haiku".to_string()), secondary);
        let factory = MultiModelFactory(models);

        let mut failover = FailoverChain::new(
            vec![
                ("openrouter".to_string(), "kimi-k2".to_string()),
                ("anthropic".to_string(), "claude-haiku".to_string()),
            ],
            vec![],
            None,
        );
        let tools = ToolRegistry::new();
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("you are helpful"), Message::user("hello")];

        let result =
            run_turn_loop(&registry, "s5", &factory, &mut failover, &tools, &guardian, &mut messages, &config())
                .await;

        assert_eq!(result.answer, "answered from the rotated model");
        assert_eq!(result.failover_attempts.len(), 1);
        assert!(result.failover_attempts[0].contains("429"));
        assert_eq!(failover.current(), Some(&("anthropic".to_string(), "claude-haiku".to_string())));
        // The system prompt should carry the rotation note for the model's benefit.
        assert!(messages[0].content().as_text().contains("anthropic/claude-haiku"));
    }

    #[tokio::test]
    async fn exhausted_failover_after_auth_error_terminates_with_system_error_text() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s6", 30, 0).await.unwrap();

        let primary = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        primary.push_error(ChatModelError::Provider("401 Unauthorized: bad api key".to_string()));
        let mut models = std::collections::HashMap::new();
        models.insert(("openrouter".to_string(), "kimi-k2".to_string()), primary);
        let factory = MultiModelFactory(models);

        let mut failover = FailoverChain::new(
            vec![("openrouter".to_string(), "kimi-k2".to_string())],
            vec![],
            None,
        );
        let tools = ToolRegistry::new();
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("you are helpful"), Message::user("hello")];

        let result =
            run_turn_loop(&registry, "s6", &factory, &mut failover, &tools, &guardian, &mut messages, &config())
                .await;

        assert!(result.answer.contains("system error"));
    }

    #[tokio::test]
    async fn turn_limit_overflow_wraps_up_on_unbound_model_and_marks_hit_turn_limit() {
        let registry = Arc::new(RunRegistry::new());
        registry.register_run("s7", 30, 0).await.unwrap();

        let model = Arc::new(MockChatModel::new("openrouter", "kimi-k2"));
        for _ in 0..(MAX_TURNS + 2) {
            model.push_tool_call("", vec![ToolCall::new("c1", "read_local_file", Map::new())]);
        }
        let factory = SingleModelFactory(model);

        let mut failover = FailoverChain::new(
            vec![("openrouter".to_string(), "kimi-k2".to_string())],
            vec![],
            None,
        );
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoingTool));
        let guardian = Guardian::new();
        let mut messages = vec![Message::system("you are helpful"), Message::user("never stop")];

        let result = run_turn_loop(&registry, "s7", &factory, &mut failover, &tools, &guardian, &mut messages, &config()).await;

        assert!(result.hit_turn_limit);
    }
}
