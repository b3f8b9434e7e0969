//! Ephemeral, end-of-day conversation summaries that bridge the sliding
//! message window and the durable relationship/vector tiers.
//!
//! Grounded verbatim on `app/memory/short_term.py`: one JSON file per
//! `(session_id, date)` under `<storage_dir>/<session_id>/<date>.json`.

use super::relationship::MemoryError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermMemory {
    pub summary: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message_range: String,
    #[serde(default = "default_session_id")]
    pub session_id: String,
}

fn default_session_id() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermStore {
    pub session_id: String,
    pub date: String,
    #[serde(default)]
    pub memories: Vec<ShortTermMemory>,
}

/// A listing entry returned by [`ShortTermMemoryManager::list_all`].
#[derive(Debug, Clone, Serialize)]
pub struct ShortTermDayListing {
    pub date: String,
    pub count: usize,
    pub memories: Vec<ShortTermMemory>,
}

/// Manages one JSON file per session per day of short-term summaries.
pub struct ShortTermMemoryManager {
    storage_dir: PathBuf,
}

impl ShortTermMemoryManager {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self { storage_dir })
    }

    fn store_path(&self, session_id: &str, target_date: NaiveDate) -> std::io::Result<PathBuf> {
        let session_dir = self.storage_dir.join(session_id);
        std::fs::create_dir_all(&session_dir)?;
        Ok(session_dir.join(format!("{target_date}.json")))
    }

    fn load_store(&self, session_id: &str, target_date: NaiveDate) -> ShortTermStore {
        if let Ok(path) = self.store_path(session_id, target_date) {
            if path.exists() {
                if let Ok(contents) = std::fs::read_to_string(&path) {
                    if let Ok(parsed) = serde_json::from_str(&contents) {
                        return parsed;
                    }
                }
            }
        }
        ShortTermStore {
            session_id: session_id.to_string(),
            date: target_date.to_string(),
            memories: Vec::new(),
        }
    }

    fn save_store(&self, store: &ShortTermStore) -> Result<(), MemoryError> {
        let date = NaiveDate::parse_from_str(&store.date, "%Y-%m-%d")
            .unwrap_or_else(|_| Utc::now().date_naive());
        let path = self.store_path(&store.session_id, date)?;
        let json = serde_json::to_string_pretty(store)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn add_memory(
        &self,
        session_id: &str,
        summary: &str,
        message_range: &str,
    ) -> Result<ShortTermMemory, MemoryError> {
        let today = Utc::now().date_naive();
        let mut store = self.load_store(session_id, today);
        let memory = ShortTermMemory {
            summary: summary.to_string(),
            timestamp: Utc::now(),
            message_range: message_range.to_string(),
            session_id: session_id.to_string(),
        };
        store.memories.push(memory.clone());
        self.save_store(&store)?;
        Ok(memory)
    }

    pub fn get_today_memories(&self, session_id: &str) -> Vec<ShortTermMemory> {
        self.load_store(session_id, Utc::now().date_naive()).memories
    }

    /// Renders today's memories as a system-prompt-ready context block.
    pub fn get_today_context(&self, session_id: &str) -> String {
        let memories = self.get_today_memories(session_id);
        if memories.is_empty() {
            return String::new();
        }
        let mut lines = vec!["--- SHORT-TERM MEMORY (Today's Conversation History) ---".to_string()];
        for mem in &memories {
            lines.push(format!("[{}] {}", mem.timestamp.format("%H:%M"), mem.summary));
        }
        lines.push("--- END SHORT-TERM MEMORY ---".to_string());
        lines.join("\n")
    }

    /// Removes entries older than `older_than_hours`, deleting any day file
    /// that becomes empty. `session_id == None` sweeps every session.
    pub fn cleanup_old_memories(&self, session_id: Option<&str>, older_than_hours: i64) -> (usize, usize) {
        let now = Utc::now();
        let cutoff = chrono::Duration::hours(older_than_hours);

        let session_dirs: Vec<PathBuf> = match session_id {
            Some(id) => vec![self.storage_dir.join(id)],
            None => std::fs::read_dir(&self.storage_dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.path())
                        .filter(|p| p.is_dir())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let mut total_removed_memories = 0;
        let mut total_removed_files = 0;

        for session_dir in session_dirs {
            if !session_dir.exists() {
                continue;
            }
            let current_session_id = session_id
                .map(|s| s.to_string())
                .unwrap_or_else(|| session_dir.file_name().unwrap().to_string_lossy().to_string());

            let Ok(entries) = std::fs::read_dir(&session_dir) else {
                continue;
            };
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(date_str) = file_name.strip_suffix(".json") else {
                    continue;
                };
                let Ok(file_date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
                    continue;
                };

                let mut store = self.load_store(&current_session_id, file_date);
                let before = store.memories.len();
                store
                    .memories
                    .retain(|mem| now.signed_duration_since(mem.timestamp) < cutoff);

                if store.memories.len() < before {
                    total_removed_memories += before - store.memories.len();
                    let _ = self.save_store(&store);
                }
                if store.memories.is_empty() {
                    if std::fs::remove_file(&path).is_ok() {
                        total_removed_files += 1;
                    }
                }
            }
        }

        (total_removed_memories, total_removed_files)
    }

    /// Lists every day-file for a session (for API/debug surfaces).
    pub fn list_all(&self, session_id: &str) -> Vec<ShortTermDayListing> {
        let session_dir = self.storage_dir.join(session_id);
        if !session_dir.exists() {
            return Vec::new();
        }
        let Ok(entries) = std::fs::read_dir(&session_dir) else {
            return Vec::new();
        };
        let mut filenames: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(|s| s.to_string()))
            .filter(|n| n.ends_with(".json"))
            .collect();
        filenames.sort();

        filenames
            .into_iter()
            .filter_map(|filename| {
                let date_str = filename.strip_suffix(".json")?.to_string();
                let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").ok()?;
                let store = self.load_store(session_id, date);
                Some(ShortTermDayListing {
                    date: date_str,
                    count: store.memories.len(),
                    memories: store.memories,
                })
            })
            .collect()
    }
}
