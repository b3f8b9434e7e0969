//! Evaluator, router, and plan builder: the meta-reasoning pass that runs
//! once per request before the execution loop starts.
//!
//! Grounded on `app/agents/orchestrator_planning.py`. The original drives
//! `evaluate_prompt`/`route_request`/`build_execution_plan` as structured
//! JSON calls against a small, cheap "meta" model (`_invoke_with_timeout`,
//! clamped to `[5, 20]` seconds) and falls back to a deterministic result
//! on any exception. The `_with_meta_model` functions below reproduce that:
//! they call the given [`ChatModel`] for structured JSON, parse its text
//! response, and fall back to the matching deterministic `evaluate`/
//! `route_request`/`build_execution_plan` function (still exported as the
//! no-model path, and what callers use when no meta-model is configured)
//! on invoke error, timeout, or unparseable JSON.

use crate::chat_model::ChatModel;
use crate::message::Message;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Output of the evaluator pass: a short restatement of what the user
/// wants plus search queries to seed memory retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorOutput {
    pub intent: String,
    pub memory_queries: Vec<String>,
}

/// Output of the router pass: which tools to bind and which model
/// candidate to prefer for this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub selected_tools: Vec<String>,
    pub provider: String,
    pub model_name: String,
    pub reasoning: String,
}

/// One node in a [`Plan`]'s dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    3
}

/// A multi-step plan the orchestrator may route through plan approval
/// before enqueuing as background tasks (see [`crate::scheduler`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

impl PlanStep {
    /// Encodes this step's dependency metadata the way [`crate::scheduler`]
    /// expects it embedded in a task description.
    pub fn to_meta(&self) -> Value {
        serde_json::json!({
            "step_id": self.id,
            "depends_on": self.depends_on,
            "parallelizable": self.parallelizable,
        })
    }
}

/// Words/phrases whose presence signals the user is asking for multi-step,
/// longer-running work rather than a single-turn answer. Verbatim from
/// `orchestrator_planning.py::_PLANNING_CUES`.
static PLANNING_CUES: &[&str] = &[
    "plan",
    "roadmap",
    "break",
    "phases",
    "long running",
    "step by step",
    "multi-step",
    "project",
];

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-zA-Z0-9']+").unwrap());
static SENTENCE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bthen\b|[.;\n]+").unwrap());
static STOPWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "to", "of", "in", "on", "for",
        "and", "or", "but", "with", "my", "me", "i", "you", "your", "it", "this", "that", "please",
        "can", "could", "would", "should", "do", "does", "did", "will", "just",
    ]
});

fn keywords(text: &str, max: usize) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in WORD_RE.find_iter(&lower) {
        let w = m.as_str();
        if w.len() <= 2 || STOPWORDS.contains(&w) {
            continue;
        }
        if seen.insert(w.to_string()) {
            out.push(w.to_string());
            if out.len() >= max {
                break;
            }
        }
    }
    out
}

/// Restates the user's prompt as a short intent string and derives memory
/// search queries from its salient terms. This is the model-free fallback;
/// a real deployment may instead route this through a cheap meta-model
/// call and fall back to this on error/timeout.
pub fn evaluate(prompt: &str) -> EvaluatorOutput {
    let trimmed = prompt.trim();
    let intent = if trimmed.is_empty() {
        "continue the conversation".to_string()
    } else {
        let first_sentence = SENTENCE_SPLIT_RE
            .split(trimmed)
            .next()
            .unwrap_or(trimmed)
            .trim();
        if first_sentence.is_empty() {
            trimmed.to_string()
        } else {
            first_sentence.to_string()
        }
    };

    let kws = keywords(trimmed, 6);
    let mut memory_queries = Vec::new();
    if !kws.is_empty() {
        memory_queries.push(kws.join(" "));
    }
    if kws.len() > 3 {
        memory_queries.push(kws[..3].join(" "));
    }

    EvaluatorOutput { intent, memory_queries }
}

/// Picks the tool subset and preferred model candidate for this request.
/// `available_tools` is whatever the caller's registry currently exposes;
/// the fallback selects tools whose name textually overlaps the prompt,
/// plus always includes nothing extra beyond what the execution loop's
/// `CORE_TOOLS` union already guarantees.
pub fn route_request(
    prompt: &str,
    available_tools: &[String],
    default_provider: &str,
    default_model: &str,
) -> RouterDecision {
    let prompt_lower = prompt.to_lowercase();
    let kws = keywords(&prompt_lower, 12);

    let selected_tools: Vec<String> = available_tools
        .iter()
        .filter(|name| {
            let name_lower = name.to_lowercase();
            kws.iter().any(|k| name_lower.contains(k.as_str()))
        })
        .cloned()
        .collect();

    let reasoning = if selected_tools.is_empty() {
        "no tool-name keyword overlap with the prompt; deferring to the core tool set".to_string()
    } else {
        format!(
            "selected {} tool(s) by keyword overlap with the prompt",
            selected_tools.len()
        )
    };

    RouterDecision {
        selected_tools,
        provider: default_provider.to_string(),
        model_name: default_model.to_string(),
        reasoning,
    }
}

/// Marker the heartbeat's synthesized task prompts carry; background task
/// executions never re-trigger plan approval for their own already-approved
/// plan, matching `orchestrator_planning.py`'s `"Background Task
/// Execution:" in user_prompt` carve-out.
pub const BACKGROUND_TASK_MARKER: &str = "Background Task Execution:";

/// Whether `prompt` asks for a durable, multi-step plan rather than a
/// single-turn response. True iff: approval is globally required; the
/// session is not a background/subagent session (`task_*`, `sub-*`,
/// `heartbeat_session`, or a prompt carrying [`BACKGROUND_TASK_MARKER`]);
/// at least one tool was selected by the router; and the prompt contains a
/// planning cue.
pub fn should_request_plan_approval(
    prompt: &str,
    session_id: &str,
    selected_tools: &[String],
    require_plan_approval: bool,
) -> bool {
    if !require_plan_approval {
        return false;
    }
    if session_id.starts_with("task_") || session_id.starts_with("sub-") || session_id == "heartbeat_session" {
        return false;
    }
    if prompt.contains(BACKGROUND_TASK_MARKER) {
        return false;
    }
    if selected_tools.is_empty() {
        return false;
    }
    let lower = prompt.to_lowercase();
    PLANNING_CUES.iter().any(|cue| lower.contains(cue))
}

/// Decomposes `goal` into a linear sequence of steps by splitting on
/// "then"/sentence boundaries. This is a deliberately simple fallback
/// decomposer — a real deployment routes this through the meta-model and
/// only falls back to this when that call fails.
pub fn build_execution_plan(goal: &str) -> Plan {
    let trimmed = goal.trim();
    let clauses: Vec<String> = SENTENCE_SPLIT_RE
        .split(trimmed)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let clauses = if clauses.is_empty() {
        vec![trimmed.to_string()]
    } else {
        clauses
    };

    let mut steps = Vec::with_capacity(clauses.len());
    for (idx, clause) in clauses.iter().enumerate() {
        let id = (idx + 1).to_string();
        let depends_on = if idx == 0 { Vec::new() } else { vec![idx.to_string()] };
        steps.push(PlanStep {
            id,
            title: clause.chars().take(60).collect(),
            description: clause.clone(),
            depends_on,
            parallelizable: false,
            priority: 3,
        });
    }

    Plan {
        name: trimmed.chars().take(60).collect(),
        goal: trimmed.to_string(),
        steps,
    }
}

/// Normalizes plan steps per spec §4.6: ensures every step has an id
/// (`s{idx}` fallback, 1-based), drops self- and unknown-step dependencies,
/// clamps priority to `[1, 5]`, and forces `parallelizable=false` whenever
/// dependencies remain. Applied to whatever the meta-model returns, since
/// unlike the deterministic fallback it isn't guaranteed to already satisfy
/// these invariants.
fn normalize_plan_steps(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let assigned_ids: Vec<String> = steps
        .iter()
        .enumerate()
        .map(|(idx, s)| {
            let trimmed = s.id.trim();
            if trimmed.is_empty() {
                format!("s{}", idx + 1)
            } else {
                trimmed.to_string()
            }
        })
        .collect();
    let known_ids: std::collections::HashSet<&str> = assigned_ids.iter().map(String::as_str).collect();

    steps
        .into_iter()
        .zip(assigned_ids)
        .map(|(step, id)| {
            let depends_on: Vec<String> = step
                .depends_on
                .into_iter()
                .filter(|d| d != &id && known_ids.contains(d.as_str()))
                .collect();
            let parallelizable = step.parallelizable && depends_on.is_empty();
            PlanStep {
                id,
                title: step.title,
                description: step.description,
                depends_on,
                parallelizable,
                priority: step.priority.clamp(1, 5),
            }
        })
        .collect()
}

/// Clamps a configured LLM timeout to the `[5, 20]` second window spec §4.6
/// mandates for meta-model calls (distinct from the execution loop's own
/// `[1, 30]` second clamp on per-turn model invocation).
pub fn meta_timeout(configured_seconds: u64) -> Duration {
    Duration::from_secs(configured_seconds.clamp(5, 20))
}

/// Invokes `model` with a system/user message pair asking for JSON-only
/// output, under `timeout`, and parses the response text as JSON. Returns
/// `None` on invoke error, timeout, or a response that isn't valid JSON —
/// callers fall back to the deterministic heuristic on `None`.
async fn call_meta_json(model: &dyn ChatModel, system_prompt: &str, user_prompt: &str, timeout: Duration) -> Option<Value> {
    let messages = [Message::system(system_prompt), Message::user(user_prompt)];
    let invoke = model.ainvoke(&messages, &[]);
    let assistant = match tokio::time::timeout(timeout, invoke).await {
        Ok(Ok(assistant)) => assistant,
        Ok(Err(_)) | Err(_) => return None,
    };
    let text = assistant.content.as_text();
    let json_slice = extract_json_object(&text).unwrap_or(&text);
    serde_json::from_str(json_slice).ok()
}

/// Meta-model responses sometimes wrap JSON in prose or code fences; find
/// the outermost `{...}` span so a strict `serde_json::from_str` still
/// succeeds.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Structured-JSON evaluator pass against `meta_model`, falling back to
/// [`evaluate`] on any failure. `timeout` should come from [`meta_timeout`].
pub async fn evaluate_with_meta_model(prompt: &str, meta_model: Option<&dyn ChatModel>, timeout: Duration) -> EvaluatorOutput {
    if let Some(model) = meta_model {
        let system = "You are the 'Evaluator' of an AI agent. Analyze the user's prompt to \
                      understand their intent and what memory context is needed. Output JSON only, \
                      with keys: intent (short summary string) and memory_queries (list of 1-3 search \
                      query strings for the vector DB).";
        if let Some(value) = call_meta_json(model, system, prompt, timeout).await {
            if let Ok(parsed) = serde_json::from_value::<EvaluatorOutput>(value) {
                return parsed;
            }
        }
    }
    evaluate(prompt)
}

/// Structured-JSON router pass against `meta_model`, falling back to
/// [`route_request`] on any failure.
pub async fn route_request_with_meta_model(
    prompt: &str,
    available_tools: &[String],
    default_provider: &str,
    default_model: &str,
    meta_model: Option<&dyn ChatModel>,
    timeout: Duration,
) -> RouterDecision {
    if let Some(model) = meta_model {
        let tool_names = available_tools.join(", ");
        let system = format!(
            "You are the 'Router' of an AI agent. Based on the user prompt, decide: (1) which tools \
             are needed from this list: [{tool_names}] — return an empty list if none; (2) which LLM \
             provider/model to use, preferring alias 'default' for simple tasks and alias 'smart' for \
             reasoning-heavy or coding tasks. Output JSON only, with keys: selected_tools (list of \
             strings), provider (string), model_name (string), reasoning (short string)."
        );
        if let Some(value) = call_meta_json(model, &system, prompt, timeout).await {
            if let Ok(parsed) = serde_json::from_value::<RouterDecision>(value) {
                return parsed;
            }
        }
    }
    route_request(prompt, available_tools, default_provider, default_model)
}

/// Structured-JSON plan-builder pass against `meta_model`, falling back to
/// [`build_execution_plan`] on any failure. The meta-model's steps are run
/// through [`normalize_plan_steps`] regardless of path, since an LLM
/// response isn't guaranteed to already satisfy the step invariants.
pub async fn build_execution_plan_with_meta_model(goal: &str, meta_model: Option<&dyn ChatModel>, timeout: Duration) -> Plan {
    let mut plan = if let Some(model) = meta_model {
        let system = "You are a planning specialist. Build an execution plan for a long-running \
                      agent workflow: 2-8 concrete steps, each with id, title, description, \
                      depends_on, parallelizable, and priority (1-5). Use depends_on to model strict \
                      ordering; mark parallelizable=true only when no dependency blocks it. Ensure \
                      dependencies only reference existing step ids. Output JSON only, with keys: \
                      name, goal, steps.";
        match call_meta_json(model, system, goal, timeout).await {
            Some(value) => serde_json::from_value::<Plan>(value).unwrap_or_else(|_| build_execution_plan(goal)),
            None => build_execution_plan(goal),
        }
    } else {
        build_execution_plan(goal)
    };
    plan.steps = normalize_plan_steps(plan.steps);
    plan
}
