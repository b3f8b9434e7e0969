//! Builds the bounded, provider-safe message window sent to the model each
//! turn: dead-response filtering, atomic tool-call grouping, token-budget
//! windowing, and turn-ordering sanitization.
//!
//! Grounded verbatim on `app/agents/context_manager.py`; the dead-response
//! pattern/substring sets, binary extension set, and the windowing/reserve
//! arithmetic are carried over unchanged. `Message` stands in for the
//! original's `langchain_core.messages.BaseMessage` hierarchy.

use crate::message::{Content, Message};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;

/// Max number of atomic message groups kept in the live window.
pub const MAX_MESSAGE_WINDOW: usize = 10;
/// New messages between auto-summarizations (consumed by the scheduler, not
/// this module, but defined here since it is windowing policy).
pub const SUMMARY_INTERVAL: usize = 10;

static DEAD_RESPONSE_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "(empty response)",
        "[no response was generated]",
        "(empty)",
        "(thinking)",
        "i processed your request but wasn't able to generate a response. please try rephrasing or starting a new session.",
        "i processed your request but wasn't able to formulate a response.",
        "i apologize, but i encountered an unexpected issue and could not generate a response. please try again.",
        "i wasn't able to generate a response. please try again or rephrase your request.",
        "max execution turns (5) reached. i was unable to generate a summary. please try again or rephrase your request.",
        "max execution turns (5) reached without final answer and summary failed.",
        "max execution turns (15) reached. i was unable to generate a summary. please try again or rephrase your request.",
        "max execution turns (30) reached. i was unable to generate a summary. please try again or rephrase your request.",
    ]
});

static DEAD_RESPONSE_SUBSTRINGS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "i need your permission",
        "i would need",
        "i will need your",
        "i need to confirm",
        "to proceed, i need",
        "to do this, i need",
        "to ensure i can access",
        "i am ready to check",
        "i'm ready to check",
        "please provide",
        "i'll need your",
        "error communicating with",
        "encountered a system error",
    ]
});

static BINARY_EXTENSIONS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        ".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp", ".tiff", ".mp3", ".wav", ".ogg", ".m4a",
        ".flac", ".aac", ".mp4", ".avi", ".mov", ".mkv", ".webm", ".pdf", ".zip", ".tar", ".gz",
        ".7z", ".rar", ".exe", ".dll", ".bin", ".iso",
    ]
});

/// True if `content` is a placeholder/failure response that should be
/// stripped from history before it poisons future turns with a feedback loop.
pub fn is_dead_response(content: &str) -> bool {
    let stripped = content.trim();
    if stripped.is_empty() {
        return true;
    }
    let lower = stripped.to_lowercase();
    if DEAD_RESPONSE_PATTERNS.iter().any(|p| *p == lower) {
        return true;
    }
    if stripped.len() < 400 {
        return DEAD_RESPONSE_SUBSTRINGS.iter().any(|sub| lower.contains(sub));
    }
    false
}

fn estimate_tokens(text: &str) -> usize {
    text.len() / 4
}

type CacheKey = String;
type CacheVersion = (u64, u64);

/// Reads and renders context files with an mtime+size keyed cache to avoid
/// repeated disk I/O across turns. One instance is shared per session.
pub struct ContextFileCache {
    entries: Mutex<HashMap<CacheKey, (CacheVersion, String)>>,
}

impl Default for ContextFileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextFileCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Renders the `--- ACTIVE CONTEXT FILES ---` block for the given paths.
    /// Unreadable/missing/binary files degrade to an inline marker rather
    /// than failing the whole turn.
    pub fn render(&self, files: &[String]) -> String {
        if files.is_empty() {
            return String::new();
        }

        let mut parts = vec!["\n\n--- ACTIVE CONTEXT FILES ---".to_string()];
        let mut cache = self.entries.lock().unwrap();

        for file_path in files {
            let abs_path = match std::fs::canonicalize(file_path) {
                Ok(p) => p,
                Err(_) => Path::new(file_path).to_path_buf(),
            };
            let key = abs_path.to_string_lossy().to_string();

            if !abs_path.exists() {
                cache.remove(&key);
                parts.push(format!(
                    "<file path=\"{file_path}\">\n[FILE NOT FOUND]\n</file>"
                ));
                continue;
            }

            let ext = abs_path
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            if BINARY_EXTENSIONS.iter().any(|b| *b == ext) {
                parts.push(format!(
                    "<file path=\"{file_path}\">\n[BINARY/MEDIA FILE - CONTENT OMITTED. USE TOOLS TO PROCESS THIS FILE.]\n</file>"
                ));
                continue;
            }

            let meta = match std::fs::metadata(&abs_path) {
                Ok(m) => m,
                Err(e) => {
                    cache.remove(&key);
                    parts.push(format!(
                        "<file path=\"{file_path}\">\n[ERROR READING FILE: {e}]\n</file>"
                    ));
                    continue;
                }
            };
            let version = (
                meta.modified()
                    .ok()
                    .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                meta.len(),
            );

            if let Some((cached_version, rendered)) = cache.get(&key) {
                if *cached_version == version {
                    parts.push(rendered.clone());
                    continue;
                }
            }

            match std::fs::read_to_string(&abs_path) {
                Ok(mut contents) => {
                    if contents.len() > 20_000 {
                        contents.truncate(20_000);
                        contents.push_str("\n... [TRUNCATED - FILE TOO LARGE]");
                    }
                    let rendered = format!("<file path=\"{file_path}\">\n{contents}\n</file>");
                    cache.insert(key, (version, rendered.clone()));
                    parts.push(rendered);
                }
                Err(e) => {
                    cache.remove(&key);
                    parts.push(format!(
                        "<file path=\"{file_path}\">\n[ERROR READING FILE: {e}]\n</file>"
                    ));
                }
            }
        }

        parts.join("\n")
    }
}

/// Groups messages into atomic units that must stay together: an
/// assistant-with-tool-calls message followed by its tool result messages.
/// Standalone messages are single-element groups.
pub fn group_messages(history: &[Message]) -> Vec<Vec<Message>> {
    let mut groups = Vec::new();
    let mut i = 0;
    while i < history.len() {
        let msg = &history[i];
        if msg.is_assistant_with_tool_calls() {
            let mut group = vec![msg.clone()];
            let mut j = i + 1;
            while j < history.len() && history[j].is_tool() {
                group.push(history[j].clone());
                j += 1;
            }
            groups.push(group);
            i = j;
        } else {
            groups.push(vec![msg.clone()]);
            i += 1;
        }
    }
    groups
}

fn non_empty_or(content: &Content, fallback: &str) -> Content {
    if content.is_empty() {
        Content::text(fallback)
    } else {
        content.clone()
    }
}

/// Enforces provider turn-ordering rules (modeled on Gemini's strict
/// alternation): leading system messages kept, first body message must be a
/// user message, assistant-with-tool-calls must be followed only by matching
/// tool messages, orphaned tool messages are dropped, consecutive plain
/// assistant messages are merged, and no message is ever left with empty
/// content.
pub fn sanitize_messages(messages: &[Message]) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut result = Vec::new();
    let mut idx = 0;
    while idx < messages.len() && messages[idx].is_system() {
        let content = non_empty_or(messages[idx].content(), "(system)");
        result.push(Message::system(content));
        idx += 1;
    }

    let body = &messages[idx..];
    let mut sanitized: Vec<Message> = Vec::new();

    let mut i = 0;
    while i < body.len() {
        let msg = &body[i];

        if msg.is_tool() {
            let prev_has_tool_calls = sanitized
                .last()
                .map(|m| m.is_assistant_with_tool_calls())
                .unwrap_or(false);
            if prev_has_tool_calls {
                sanitized.push(msg.clone());
            }
            i += 1;
            continue;
        }

        if let Message::Assistant { tool_calls, content, .. } = msg {
            if !tool_calls.is_empty() {
                let mut tool_msgs = Vec::new();
                let mut j = i + 1;
                while j < body.len() && body[j].is_tool() {
                    if let Message::Tool {
                        content: tc,
                        tool_call_id,
                        tool_name,
                        ..
                    } = &body[j]
                    {
                        let content = non_empty_or(tc, "(empty result)");
                        tool_msgs.push(Message::tool(content, tool_call_id.clone(), tool_name.clone()));
                    }
                    j += 1;
                }
                if !tool_msgs.is_empty() {
                    let patched_content = non_empty_or(content, "(calling tools)");
                    sanitized.push(Message::assistant_with_tools(patched_content, tool_calls.clone()));
                    sanitized.extend(tool_msgs);
                    i = j;
                    continue;
                } else {
                    let fallback = non_empty_or(content, "(tool call attempted)");
                    sanitized.push(Message::assistant_text(fallback));
                }
            } else {
                let ai_content = non_empty_or(content, "(empty response)");
                let merge = sanitized
                    .last()
                    .map(|m| m.is_plain_assistant())
                    .unwrap_or(false);
                if merge {
                    let prev_text = sanitized.last().unwrap().content().as_text();
                    let merged = format!("{prev_text}\n{}", ai_content.as_text());
                    let last = sanitized.last_mut().unwrap();
                    last.set_content(Content::text(merged));
                } else {
                    sanitized.push(Message::assistant_text(ai_content));
                }
            }
        } else {
            sanitized.push(msg.clone());
        }

        i += 1;
    }

    if let Some(first) = sanitized.first() {
        if !first.is_user() {
            sanitized.insert(0, Message::user("(continued conversation)"));
        }
    }

    let mut finalized = Vec::with_capacity(result.len() + sanitized.len());
    finalized.extend(result.drain(..));
    for m in sanitized {
        if m.content().is_empty() {
            let patched = match &m {
                Message::User { .. } => Message::user("(continued)"),
                Message::Assistant { tool_calls, .. } if !tool_calls.is_empty() => {
                    Message::assistant_with_tools("(calling tools)", tool_calls.clone())
                }
                Message::Assistant { .. } => Message::assistant_text("[processing]"),
                Message::System { .. } => Message::system("(system)"),
                Message::Tool {
                    tool_call_id,
                    tool_name,
                    ..
                } => Message::tool("(empty result)", tool_call_id.clone(), tool_name.clone()),
            };
            finalized.push(patched);
        } else {
            finalized.push(m);
        }
    }
    finalized
}

/// Builds the final, budgeted, sanitized message window for one model call.
///
/// `max_tokens` is the model's context window; roughly 30% is reserved for
/// the assembled system prompt, the incoming prompt, and the model's
/// response, leaving the rest (floored at 8000) for history.
pub fn optimize_context(
    max_tokens: usize,
    file_cache: &ContextFileCache,
    system_prompt: &str,
    history: &[Message],
    new_prompt: &str,
    context_files: &[String],
    short_term_context: &str,
) -> Vec<Message> {
    let file_context_str = file_cache.render(context_files);

    let mut parts = vec![system_prompt.to_string()];
    if !short_term_context.is_empty() {
        parts.push(short_term_context.to_string());
    }
    if !file_context_str.is_empty() {
        parts.push(file_context_str);
    }
    let full_system_prompt = parts.join("\n\n");

    // Drop dead assistant responses, and the human prompt that preceded
    // them, before windowing — otherwise a poisoned session keeps re-feeding
    // its own failures back into the model.
    let mut cleaned_history: Vec<Message> = Vec::with_capacity(history.len());
    for msg in history {
        if msg.is_plain_assistant() {
            if is_dead_response(&msg.content().as_text()) {
                if matches!(cleaned_history.last(), Some(m) if m.is_user()) {
                    cleaned_history.pop();
                }
                continue;
            }
        }
        cleaned_history.push(msg.clone());
    }

    let groups = group_messages(&cleaned_history);

    let system_tokens = estimate_tokens(&full_system_prompt);
    let prompt_tokens = estimate_tokens(new_prompt);
    let reserved = system_tokens + prompt_tokens + 4000;
    let token_budget = max_tokens.saturating_sub(reserved).max(8000);

    let mut selected_groups: Vec<Vec<Message>> = Vec::new();
    let mut group_count = 0usize;
    let mut used_tokens = 0usize;

    for group in groups.iter().rev() {
        let group_tokens: usize = group
            .iter()
            .map(|m| estimate_tokens(&m.content().as_text()))
            .sum();
        if used_tokens + group_tokens > token_budget && !selected_groups.is_empty() {
            break;
        }
        selected_groups.insert(0, group.clone());
        used_tokens += group_tokens;
        group_count += 1;
        if group_count >= MAX_MESSAGE_WINDOW {
            break;
        }
    }

    let selected_history: Vec<Message> = selected_groups.into_iter().flatten().collect();

    let mut all_msgs = vec![Message::system(full_system_prompt)];
    all_msgs.extend(selected_history);
    sanitize_messages(&all_msgs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use serde_json::Map;

    #[test]
    fn detects_exact_dead_responses() {
        assert!(is_dead_response("(empty response)"));
        assert!(is_dead_response("  (Empty Response)  "));
        assert!(is_dead_response(""));
        assert!(is_dead_response("   "));
    }

    #[test]
    fn detects_substring_dead_responses_only_when_short() {
        assert!(is_dead_response("I would need your explicit confirmation."));
        let long_legit = "a".repeat(500) + " i would need more detail eventually";
        assert!(!is_dead_response(&long_legit));
    }

    #[test]
    fn real_responses_are_not_dead() {
        assert!(!is_dead_response("Here is the weather forecast for today."));
    }

    #[test]
    fn group_messages_keeps_tool_call_groups_atomic() {
        let history = vec![
            Message::user("hi"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::new("c1", "read_file", Map::new())],
            ),
            Message::tool("contents", "c1", "read_file"),
            Message::assistant_text("done"),
        ];
        let groups = group_messages(&history);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].len(), 2);
    }

    #[test]
    fn sanitize_drops_orphaned_tool_message() {
        let history = vec![Message::user("hi"), Message::tool("oops", "c1", "read_file")];
        let out = sanitize_messages(&history);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_user());
    }

    #[test]
    fn sanitize_merges_consecutive_plain_assistant_messages() {
        let history = vec![
            Message::user("hi"),
            Message::assistant_text("first"),
            Message::assistant_text("second"),
        ];
        let out = sanitize_messages(&history);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].content().as_text(), "first\nsecond");
    }

    #[test]
    fn sanitize_inserts_leading_user_message_if_missing() {
        let history = vec![Message::assistant_text("orphan reply")];
        let out = sanitize_messages(&history);
        assert!(out[0].is_user());
    }

    #[test]
    fn sanitize_patches_empty_system_message() {
        let history = vec![Message::system(""), Message::user("hi")];
        let out = sanitize_messages(&history);
        assert_eq!(out[0].content().as_text(), "(system)");
    }

    #[test]
    fn sanitize_drops_tool_calls_when_no_matching_tool_messages() {
        let history = vec![
            Message::user("hi"),
            Message::assistant_with_tools(
                "",
                vec![ToolCall::new("c1", "read_file", Map::new())],
            ),
        ];
        let out = sanitize_messages(&history);
        assert!(!out.last().unwrap().is_assistant_with_tool_calls());
    }

    #[test]
    fn optimize_context_windows_to_max_message_window_groups() {
        let cache = ContextFileCache::new();
        let mut history = Vec::new();
        for i in 0..30 {
            history.push(Message::user(format!("msg {i}")));
        }
        let out = optimize_context(128_000, &cache, "system", &history, "new prompt", &[], "");
        // 1 system message + at most MAX_MESSAGE_WINDOW user groups
        assert!(out.len() <= 1 + MAX_MESSAGE_WINDOW);
        assert!(out[0].is_system());
    }

    #[test]
    fn optimize_context_strips_dead_response_and_its_prompt() {
        let cache = ContextFileCache::new();
        let history = vec![
            Message::user("do the thing"),
            Message::assistant_text("(empty response)"),
            Message::user("hello"),
            Message::assistant_text("hi there"),
        ];
        let out = optimize_context(128_000, &cache, "system", &history, "next", &[], "");
        let texts: Vec<String> = out.iter().map(|m| m.content().as_text()).collect();
        assert!(!texts.iter().any(|t| t == "do the thing"));
    }

    #[test]
    fn render_reports_missing_file() {
        let cache = ContextFileCache::new();
        let out = cache.render(&["/nonexistent/path/should/not/exist.rs".to_string()]);
        assert!(out.contains("FILE NOT FOUND"));
    }
}
