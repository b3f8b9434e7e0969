//! Vector-memory adapter boundary.
//!
//! The real embedding-backed vector store is out of scope for this core
//! (`spec.md` §1 treats it as an opaque `MemoryIndex`); this module defines
//! the trait the execution loop programs against plus a lexical fallback
//! implementation, grounded on `app/memory/vector_memory.py`'s public
//! surface (`search`, `add`) and scored the same token-overlap way as
//! [`crate::memory::relationship::RelationshipMemoryStore::search`].

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// One retrieved memory fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryFragment {
    pub key: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryIndexError {
    #[error("memory index unavailable: {0}")]
    Unavailable(String),
}

/// Vector + lexical fallback memory search, behind a trait so the real
/// embedding-backed store can be swapped in without touching the execution
/// loop. `search` and `upsert` mirror `vector_memory.py::search`/`upsert`.
#[async_trait::async_trait]
pub trait MemoryIndex: Send + Sync {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<MemoryFragment>, MemoryIndexError>;
    async fn upsert(&self, key: &str, text: &str) -> Result<(), MemoryIndexError>;
}

/// In-process lexical-overlap index used when no embedding backend is
/// configured, and in tests. Not a production vector store — a faithful
/// stand-in for the opaque interface.
#[derive(Default)]
pub struct LexicalMemoryIndex {
    entries: RwLock<HashMap<String, String>>,
}

impl LexicalMemoryIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn tokenize(text: &str) -> HashSet<String> {
        let re = Regex::new(r"[a-z0-9_]+").unwrap();
        re.find_iter(&text.to_lowercase())
            .map(|m| m.as_str().to_string())
            .filter(|t| t.len() > 2)
            .collect()
    }
}

#[async_trait::async_trait]
impl MemoryIndex for LexicalMemoryIndex {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<MemoryFragment>, MemoryIndexError> {
        let entries = self.entries.read().unwrap();
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let query_tokens = Self::tokenize(query);
        let mut scored: Vec<MemoryFragment> = entries
            .iter()
            .filter_map(|(key, text)| {
                let text_tokens = Self::tokenize(text);
                let overlap = query_tokens.intersection(&text_tokens).count();
                let contains = text.to_lowercase().contains(&query.trim().to_lowercase());
                let score = overlap as f64 + if contains { 1.5 } else { 0.0 };
                if score > 0.0 || query.trim().is_empty() {
                    Some(MemoryFragment {
                        key: key.clone(),
                        text: text.clone(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        scored.truncate(top_k.max(1));
        Ok(scored)
    }

    async fn upsert(&self, key: &str, text: &str) -> Result<(), MemoryIndexError> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), text.to_string());
        Ok(())
    }
}

/// Deduplicates fragments by `text`, preserving first-seen order —
/// mirrors the distilled memory-retrieval step that merges relationship
/// and vector results before rendering the context block.
pub fn dedupe_fragments(fragments: Vec<MemoryFragment>) -> Vec<MemoryFragment> {
    let mut seen = HashSet::new();
    fragments
        .into_iter()
        .filter(|f| seen.insert(f.text.clone()))
        .collect()
}
