//! Structured durable-memory tier for user relationship context: stable
//! facts about preferences, habits, recurring projects, and communication
//! style, upserted and searched by tag/token overlap.
//!
//! Grounded verbatim on `app/memory/relationship_memory.py`; `serde_json`
//! file storage replaces pydantic's `model_dump`/`json.load`.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn normalize_fact(text: &str) -> String {
    let trimmed = text.trim().trim_end_matches(['.', '!', '?']);
    let ws = Regex::new(r"\s+").unwrap();
    ws.replace_all(trimmed, " ").trim().to_string()
}

fn clamp_confidence(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

fn today() -> String {
    chrono::Utc::now().date_naive().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipFactInput {
    pub fact: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipFact {
    pub fact: String,
    pub normalized_fact: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub confidence: f64,
    pub first_confirmed: String,
    pub last_confirmed: String,
    pub confirmations: u32,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelationshipMemoryStoreModel {
    #[serde(default = "default_profile_id")]
    profile_id: String,
    #[serde(default)]
    facts: Vec<RelationshipFact>,
}

fn default_profile_id() -> String {
    "default_user".to_string()
}

impl Default for RelationshipMemoryStoreModel {
    fn default() -> Self {
        Self {
            profile_id: default_profile_id(),
            facts: Vec::new(),
        }
    }
}

/// File-backed store of durable relationship facts, one JSON document per
/// deployment (not per session — relationship facts are about the user).
pub struct RelationshipMemoryStore {
    storage_path: PathBuf,
}

impl RelationshipMemoryStore {
    pub fn new(storage_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        if let Some(parent) = storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { storage_path })
    }

    fn load(&self) -> RelationshipMemoryStoreModel {
        if self.storage_path.exists() {
            if let Ok(contents) = std::fs::read_to_string(&self.storage_path) {
                if let Ok(parsed) = serde_json::from_str(&contents) {
                    return parsed;
                }
            }
        }
        RelationshipMemoryStoreModel::default()
    }

    fn save(&self, store: &RelationshipMemoryStoreModel) -> Result<(), MemoryError> {
        let json = serde_json::to_string_pretty(store)?;
        std::fs::write(&self.storage_path, json)?;
        Ok(())
    }

    /// Inserts new facts or reinforces matching existing ones (by
    /// normalized text), bumping confidence slightly and merging tags on
    /// each repeated confirmation.
    pub fn upsert_facts(
        &self,
        facts: &[RelationshipFactInput],
        source: &str,
    ) -> Result<Vec<RelationshipFact>, MemoryError> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let today = today();
        let mut store = self.load();
        let mut changed = Vec::new();

        for item in facts {
            let normalized = normalize_fact(&item.fact);
            if normalized.is_empty() {
                continue;
            }
            let normalized_lower = normalized.to_lowercase();
            let mut tags: Vec<String> = item
                .tags
                .iter()
                .filter_map(|t| {
                    let t = t.trim();
                    if t.is_empty() {
                        None
                    } else {
                        Some(t.to_lowercase())
                    }
                })
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            tags.sort();
            let confidence = clamp_confidence(item.confidence);

            if let Some(existing) = store
                .facts
                .iter_mut()
                .find(|f| f.normalized_fact == normalized_lower)
            {
                let merged: HashSet<String> = existing
                    .tags
                    .iter()
                    .cloned()
                    .chain(tags.iter().cloned())
                    .collect();
                existing.tags = merged.into_iter().collect();
                existing.tags.sort();
                existing.last_confirmed = today.clone();
                existing.confirmations += 1;
                existing.confidence = clamp_confidence(existing.confidence.max(confidence) + 0.03);
                if !source.is_empty() {
                    existing.source = source.to_string();
                }
                changed.push(existing.clone());
                continue;
            }

            let fact = RelationshipFact {
                fact: normalized,
                normalized_fact: normalized_lower.clone(),
                tags,
                confidence,
                first_confirmed: today.clone(),
                last_confirmed: today.clone(),
                confirmations: 1,
                source: source.to_string(),
            };
            store.facts.push(fact.clone());
            changed.push(fact);
        }

        if !changed.is_empty() {
            self.save(&store)?;
        }
        Ok(changed)
    }

    pub fn list_facts(&self) -> Vec<RelationshipFact> {
        self.load().facts
    }

    pub fn delete_fact(&self, fact: &str) -> Result<bool, MemoryError> {
        let normalized = normalize_fact(fact).to_lowercase();
        if normalized.is_empty() {
            return Ok(false);
        }
        let mut store = self.load();
        let before = store.facts.len();
        store.facts.retain(|f| f.normalized_fact != normalized);
        if store.facts.len() < before {
            self.save(&store)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Scores facts by confidence, query substring/token overlap, tag
    /// overlap, and a small same-day recency bump, returning the top `k`.
    pub fn search(&self, query: &str, k: usize, min_confidence: f64) -> Vec<RelationshipFact> {
        let store = self.load();
        if store.facts.is_empty() {
            return Vec::new();
        }

        let safe_k = k.max(1);
        let query_lower = query.trim().to_lowercase();
        let token_re = Regex::new(r"[a-z0-9_]+").unwrap();
        let query_tokens: HashSet<String> = token_re
            .find_iter(&query_lower)
            .map(|m| m.as_str().to_string())
            .filter(|t| t.len() > 2)
            .collect();

        let today = today();
        let mut scored: Vec<(f64, RelationshipFact)> = Vec::new();
        for fact in &store.facts {
            if fact.confidence < min_confidence {
                continue;
            }
            let fact_text = fact.fact.to_lowercase();
            let fact_tokens: HashSet<String> = token_re
                .find_iter(&fact_text)
                .map(|m| m.as_str().to_string())
                .filter(|t| t.len() > 2)
                .collect();
            let tag_tokens: HashSet<String> = fact.tags.iter().map(|t| t.to_lowercase()).collect();

            let mut score = fact.confidence * 2.0;
            if !query_lower.is_empty() {
                if fact_text.contains(&query_lower) {
                    score += 2.5;
                }
                let overlap = query_tokens.intersection(&fact_tokens).count();
                score += overlap as f64 * 0.35;
                let tag_overlap = query_tokens.intersection(&tag_tokens).count();
                score += tag_overlap as f64 * 0.5;
            }
            if fact.last_confirmed == today {
                score += 0.15;
            }

            if score > 0.0 {
                scored.push((score, fact.clone()));
            }
        }

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap()
                .then_with(|| b.1.confidence.partial_cmp(&a.1.confidence).unwrap())
                .then_with(|| b.1.last_confirmed.cmp(&a.1.last_confirmed))
        });
        scored.into_iter().take(safe_k).map(|(_, f)| f).collect()
    }

    /// Renders the top matches as a high-priority context block for the
    /// system prompt, or the empty string if nothing matched.
    pub fn to_context_block(&self, query: &str, k: usize) -> String {
        let facts = self.search(query, k, 0.55);
        if facts.is_empty() {
            return String::new();
        }
        let mut lines = vec!["--- RELATIONSHIP MEMORY (HIGH PRIORITY) ---".to_string()];
        for fact in &facts {
            let tags = if fact.tags.is_empty() {
                "user_profile".to_string()
            } else {
                fact.tags.join(", ")
            };
            lines.push(format!(
                "- {} [tags: {}; confidence: {:.2}; last_confirmed: {}]",
                fact.fact, tags, fact.confidence, fact.last_confirmed
            ));
        }
        lines.push("--- END RELATIONSHIP MEMORY ---".to_string());
        lines.join("\n")
    }
}

#[allow(dead_code)]
fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, RelationshipMemoryStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relationship.json");
        let store = RelationshipMemoryStore::new(path).unwrap();
        (dir, store)
    }

    #[test]
    fn upsert_creates_new_fact() {
        let (_dir, store) = store();
        let facts = store
            .upsert_facts(
                &[RelationshipFactInput {
                    fact: "Prefers terse code review comments.".to_string(),
                    tags: vec!["style".to_string()],
                    confidence: 0.8,
                }],
                "user_profile_auto",
            )
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].confirmations, 1);
        assert_eq!(facts[0].fact, "Prefers terse code review comments");
    }

    #[test]
    fn upsert_reinforces_existing_fact() {
        let (_dir, store) = store();
        let input = RelationshipFactInput {
            fact: "Likes Rust.".to_string(),
            tags: vec!["lang".to_string()],
            confidence: 0.6,
        };
        store.upsert_facts(&[input.clone()], "a").unwrap();
        let second = store.upsert_facts(&[input], "b").unwrap();
        assert_eq!(second[0].confirmations, 2);
        assert!(second[0].confidence > 0.6);
        assert_eq!(second[0].source, "b");
    }

    #[test]
    fn upsert_skips_blank_fact() {
        let (_dir, store) = store();
        let changed = store
            .upsert_facts(
                &[RelationshipFactInput {
                    fact: "   ".to_string(),
                    tags: vec![],
                    confidence: 0.5,
                }],
                "x",
            )
            .unwrap();
        assert!(changed.is_empty());
    }

    #[test]
    fn delete_fact_removes_matching_entry() {
        let (_dir, store) = store();
        store
            .upsert_facts(
                &[RelationshipFactInput {
                    fact: "Owns a cat.".to_string(),
                    tags: vec![],
                    confidence: 0.9,
                }],
                "x",
            )
            .unwrap();
        assert!(store.delete_fact("Owns a cat.").unwrap());
        assert!(store.list_facts().is_empty());
    }

    #[test]
    fn search_filters_by_min_confidence_and_ranks_by_overlap() {
        let (_dir, store) = store();
        store
            .upsert_facts(
                &[
                    RelationshipFactInput {
                        fact: "Works on distributed databases.".to_string(),
                        tags: vec!["work".to_string()],
                        confidence: 0.9,
                    },
                    RelationshipFactInput {
                        fact: "Might like jazz.".to_string(),
                        tags: vec![],
                        confidence: 0.3,
                    },
                ],
                "x",
            )
            .unwrap();
        let results = store.search("database", 4, 0.55);
        assert_eq!(results.len(), 1);
        assert!(results[0].fact.contains("databases"));
    }

    #[test]
    fn to_context_block_empty_when_no_matches() {
        let (_dir, store) = store();
        assert_eq!(store.to_context_block("anything", 4), "");
    }

    #[test]
    fn to_context_block_renders_bounds() {
        let (_dir, store) = store();
        store
            .upsert_facts(
                &[RelationshipFactInput {
                    fact: "Deploys on Fridays, carefully.".to_string(),
                    tags: vec!["ops".to_string()],
                    confidence: 0.95,
                }],
                "x",
            )
            .unwrap();
        let block = store.to_context_block("deploy", 4);
        assert!(block.starts_with("--- RELATIONSHIP MEMORY"));
        assert!(block.ends_with("--- END RELATIONSHIP MEMORY ---"));
    }
}
