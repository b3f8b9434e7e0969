//! Formats and splits model responses for delivery on a specific channel.
//!
//! Grounded on `app/core/response_formatter.py`. UI and Discord keep
//! markdown-rich text; Telegram gets degraded to plain text since its
//! client-side markdown parser is far less forgiving.

use once_cell::sync::Lazy;
use regex::Regex;

/// Delivery channel a response is being formatted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Ui,
    Telegram,
    Discord,
}

impl ChannelType {
    fn max_len(self) -> usize {
        match self {
            Self::Ui => 48,
            Self::Telegram => 4000,
            Self::Discord => 1900,
        }
    }
}

/// Maps an arbitrary channel string onto a known [`ChannelType`], defaulting
/// to `Ui` for anything unrecognized (including `None`).
pub fn normalize_channel(channel: Option<&str>) -> ChannelType {
    match channel.unwrap_or("ui").trim().to_lowercase().as_str() {
        "telegram" => ChannelType::Telegram,
        "discord" => ChannelType::Discord,
        _ => ChannelType::Ui,
    }
}

static MARKDOWN_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(.*?)\]\((https?://[^\s)]+)\)").unwrap());
static ANGLE_LINK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<(https?://[^>]+)>").unwrap());
static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s*").unwrap());
static BLOCKQUOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}>\s?").unwrap());
static BULLET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}[-*+]\s+").unwrap());
static FENCE_OPEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```([a-zA-Z0-9_-]+)?\n").unwrap());

fn sanitize_common(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n");
    let trimmed = normalized.trim();
    let linked = MARKDOWN_LINK_RE.replace_all(trimmed, "$1 ($2)");
    ANGLE_LINK_RE.replace_all(&linked, "$1").into_owned()
}

fn to_plain_text_markdown(text: &str) -> String {
    let out = HEADING_RE.replace_all(text, "");
    let out = BLOCKQUOTE_RE.replace_all(&out, "");
    let out = BULLET_RE.replace_all(&out, "- ");
    let out = FENCE_OPEN_RE.replace_all(&out, "Code:\n");
    out.replace("```", "")
        .replace("**", "")
        .replace("__", "")
        .replace('`', "")
}

/// Formats a model response for the given channel: UI and Discord preserve
/// markdown, Telegram gets flattened to plain text.
pub fn format_response_for_channel(text: &str, channel: Option<&str>) -> String {
    let content = sanitize_common(text);
    match normalize_channel(channel) {
        ChannelType::Telegram => to_plain_text_markdown(&content),
        ChannelType::Ui | ChannelType::Discord => content,
    }
}

/// Splits a response into channel-sized chunks, preferring to break on
/// paragraph then word boundaries so chunks don't split mid-word.
pub fn split_response_for_channel(text: &str, channel: Option<&str>) -> Vec<String> {
    let max_len = normalize_channel(channel).max_len();
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let remaining_len = chars.len() - start;
        if remaining_len <= max_len {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window = &chars[start..start + max_len];
        let half = (max_len as f64 * 0.5) as usize;

        let mut split_at = window.iter().rposition(|&c| c == '\n');
        if split_at.map(|p| p < half).unwrap_or(true) {
            split_at = window.iter().rposition(|&c| c == ' ');
        }
        let split_at = match split_at {
            Some(p) if p >= half => p,
            _ => max_len,
        };

        let chunk: String = window[..split_at].iter().collect();
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        start += split_at;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_channel_defaults_to_ui() {
        assert_eq!(normalize_channel(None), ChannelType::Ui);
        assert_eq!(normalize_channel(Some("bogus")), ChannelType::Ui);
        assert_eq!(normalize_channel(Some("Telegram")), ChannelType::Telegram);
        assert_eq!(normalize_channel(Some(" discord ")), ChannelType::Discord);
    }

    #[test]
    fn telegram_strips_markdown() {
        let text = "# Heading\n**bold** and `code` and\n```rust\nlet x = 1;\n```\n> quote\n- item";
        let formatted = format_response_for_channel(text, Some("telegram"));
        assert!(!formatted.contains('#'));
        assert!(!formatted.contains("**"));
        assert!(!formatted.contains('`'));
        assert!(formatted.contains("Code:"));
    }

    #[test]
    fn ui_and_discord_preserve_markdown() {
        let text = "# Heading\n**bold**";
        assert_eq!(format_response_for_channel(text, Some("ui")), text);
        assert_eq!(format_response_for_channel(text, Some("discord")), text);
    }

    #[test]
    fn sanitize_common_rewrites_links() {
        let text = "See [docs](https://example.com/page) and <https://raw.example.com>";
        let formatted = format_response_for_channel(text, Some("ui"));
        assert!(formatted.contains("docs (https://example.com/page)"));
        assert!(formatted.contains("https://raw.example.com"));
        assert!(!formatted.contains('<'));
    }

    #[test]
    fn split_response_short_text_single_chunk() {
        let chunks = split_response_for_channel("hello", Some("ui"));
        assert_eq!(chunks, vec!["hello"]);
    }

    #[test]
    fn split_response_empty_text_no_chunks() {
        assert!(split_response_for_channel("", Some("ui")).is_empty());
    }

    #[test]
    fn split_response_breaks_on_paragraph_boundary() {
        let long_line = "word ".repeat(20);
        let text = format!("{}\n{}", long_line, long_line);
        let chunks = split_response_for_channel(&text, Some("ui"));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 48);
        }
    }

    #[test]
    fn split_response_respects_channel_limits() {
        let text = "x".repeat(5000);
        let telegram_chunks = split_response_for_channel(&text, Some("telegram"));
        for chunk in &telegram_chunks {
            assert!(chunk.chars().count() <= 4000);
        }
    }
}
