//! Per-conversation session state: message history, attached context files,
//! and the summarization watermark.
//!
//! Grounded on `original_source/app/core/models.py`'s `Session` shape and the
//! teacher's `memory/store.rs` struct-plus-impl idiom.

use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Hard cap on retained messages per session; enforced by [`Session::push`].
pub const MAX_SESSION_MESSAGES: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub messages: Vec<Message>,
    /// Absolute paths of files the user has attached to this session.
    #[serde(default)]
    pub context_files: Vec<String>,
    /// Index into `messages` up to which a short-term summary already
    /// exists; everything before it may be safely dropped from the live
    /// window. Never goes negative — decremented in lockstep when messages
    /// are trimmed from the front.
    #[serde(default)]
    pub last_summary_index: usize,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
            context_files: Vec::new(),
            last_summary_index: 0,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message, then enforce [`MAX_SESSION_MESSAGES`] by dropping
    /// from the front. `last_summary_index` is decremented by however many
    /// messages were dropped, clamped at 0 — it must never point past the
    /// start of the retained window.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();

        if self.messages.len() > MAX_SESSION_MESSAGES {
            let overflow = self.messages.len() - MAX_SESSION_MESSAGES;
            self.messages.drain(0..overflow);
            self.last_summary_index = self.last_summary_index.saturating_sub(overflow);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Messages not yet covered by a short-term summary.
    pub fn unsummarized(&self) -> &[Message] {
        &self.messages[self.last_summary_index.min(self.messages.len())..]
    }

    pub fn mark_summarized_up_to(&mut self, index: usize) {
        self.last_summary_index = index.min(self.messages.len());
    }

    pub fn add_context_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.context_files.contains(&path) {
            self.context_files.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(i: usize) -> Message {
        Message::user(format!("m{i}"))
    }

    #[test]
    fn push_below_cap_keeps_everything() {
        let mut s = Session::new("s1");
        for i in 0..10 {
            s.push(msg(i));
        }
        assert_eq!(s.messages.len(), 10);
        assert_eq!(s.last_summary_index, 0);
    }

    #[test]
    fn push_past_cap_drops_oldest_and_decrements_summary_index() {
        let mut s = Session::new("s1");
        for i in 0..(MAX_SESSION_MESSAGES + 5) {
            s.push(msg(i));
        }
        assert_eq!(s.messages.len(), MAX_SESSION_MESSAGES);
        // first retained message should be m5
        assert_eq!(s.messages[0].content().as_text(), "m5");
    }

    #[test]
    fn last_summary_index_never_goes_below_zero() {
        let mut s = Session::new("s1");
        s.last_summary_index = 2;
        for i in 0..(MAX_SESSION_MESSAGES + 10) {
            s.push(msg(i));
        }
        assert_eq!(s.last_summary_index, 0);
    }

    #[test]
    fn last_summary_index_decrements_by_exact_overflow_when_positive() {
        let mut s = Session::new("s1");
        for i in 0..MAX_SESSION_MESSAGES {
            s.push(msg(i));
        }
        s.last_summary_index = 50;
        s.push(msg(9999));
        assert_eq!(s.last_summary_index, 49);
        assert_eq!(s.messages.len(), MAX_SESSION_MESSAGES);
    }

    #[test]
    fn unsummarized_respects_index() {
        let mut s = Session::new("s1");
        for i in 0..5 {
            s.push(msg(i));
        }
        s.mark_summarized_up_to(3);
        assert_eq!(s.unsummarized().len(), 2);
    }

    #[test]
    fn add_context_file_dedupes() {
        let mut s = Session::new("s1");
        s.add_context_file("/a.rs");
        s.add_context_file("/a.rs");
        s.add_context_file("/b.rs");
        assert_eq!(s.context_files, vec!["/a.rs".to_string(), "/b.rs".to_string()]);
    }

    #[test]
    fn round_trip_serde() {
        let mut s = Session::new("s1");
        s.push(msg(0));
        let json = serde_json::to_string(&s).unwrap();
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, s.session_id);
        assert_eq!(parsed.messages.len(), 1);
    }
}
