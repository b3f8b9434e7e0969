//! Persistent conversation state: one JSON document per `session_id`.
//!
//! Grounded on `app/core/session_store.py` (file-backed `AgentSession`
//! persistence) and structurally on [`crate::memory::relationship::RelationshipMemoryStore`]'s
//! load/save idiom, generalized from "one document total" to "one document
//! per session_id". Concurrent readers may observe a stale-but-consistent
//! snapshot (§5); writers are serialized per session_id through an
//! in-process lock so two concurrent `save` calls for the same session
//! never interleave, matching the "SessionStore serializes per-session disk
//! writes" resource policy.

use crate::session::Session;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// File-backed [`Session`] persistence, one document per `session_id`
/// under `storage_dir/<session_id>.json`.
pub struct SessionStore {
    storage_dir: PathBuf,
    /// Per-session write locks, so concurrent saves for the *same* session
    /// serialize while different sessions never block each other.
    write_locks: RwLock<HashMap<String, Mutex<()>>>,
}

impl SessionStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            write_locks: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.storage_dir.join(format!("{}.json", sanitize_id(session_id)))
    }

    /// Loads a session, creating a fresh empty one if no document exists
    /// yet. A corrupt document is treated as absent rather than propagated,
    /// matching the teacher's "never let a bad on-disk blob crash the run"
    /// posture in `relationship.rs::load`.
    pub fn load(&self, session_id: &str) -> Session {
        let path = self.path_for(session_id);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            if let Ok(session) = serde_json::from_str::<Session>(&contents) {
                return session;
            }
        }
        Session::new(session_id)
    }

    /// Persists `session` under its own id, serialized against any other
    /// concurrent save for the same `session_id`.
    pub fn save(&self, session: &Session) -> Result<(), SessionStoreError> {
        self.with_session_lock(&session.session_id, || {
            let json = serde_json::to_string_pretty(session)?;
            let path = self.path_for(&session.session_id);
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
    }

    pub fn delete(&self, session_id: &str) -> Result<bool, SessionStoreError> {
        let path = self.path_for(session_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.path_for(session_id).exists()
    }

    fn with_session_lock<T>(
        &self,
        session_id: &str,
        f: impl FnOnce() -> Result<T, SessionStoreError>,
    ) -> Result<T, SessionStoreError> {
        {
            let locks = self.write_locks.read().unwrap();
            if let Some(lock) = locks.get(session_id) {
                let _guard = lock.lock().unwrap();
                return f();
            }
        }
        let mut locks = self.write_locks.write().unwrap();
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Mutex::new(()));
        let lock = locks.get(session_id).unwrap();
        let _guard = lock.lock().unwrap();
        f()
    }
}

/// Defends against path traversal through a hostile `session_id`
/// (e.g. `"../../etc/passwd"`) reaching the filesystem.
fn sanitize_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
