//! Session continuity: remember the last model and CLI session per target so
//! follow-up requests can resume where the previous run left off.
//!
//! The execution manager applies the store when a request actually starts
//! and records into it on the terminal path, so a request that waited in the
//! queue resumes the session of the run it waited behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use super::execution::DispatchRequest;
use crate::error::Result;

/// Last known preferences for one target.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionPreference {
    pub last_model: Option<String>,
    pub last_session_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// `targetKey -> SessionPreference`, optionally persisted as JSON.
pub struct SessionStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, SessionPreference>>,
    /// Generation of the newest serialized snapshot.
    generation: AtomicU64,
    /// Generation last written to disk; writers never go backwards.
    written: Arc<Mutex<u64>>,
}

impl SessionStore {
    /// Store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_entries(None, BTreeMap::new())
    }

    fn with_entries(path: Option<PathBuf>, entries: BTreeMap<String, SessionPreference>) -> Self {
        Self {
            path,
            entries: RwLock::new(entries),
            generation: AtomicU64::new(0),
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Load from a JSON file. A missing file starts empty.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self::with_entries(Some(path.to_path_buf()), entries))
    }

    pub fn get(&self, target_key: &str) -> Option<SessionPreference> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_key)
            .cloned()
    }

    pub fn record_model(&self, target_key: &str, model: &str) {
        self.update(target_key, |pref| pref.last_model = Some(model.to_string()));
    }

    pub fn record_session(&self, target_key: &str, session_id: &str) {
        self.update(target_key, |pref| {
            pref.last_session_id = Some(session_id.to_string())
        });
    }

    /// Forget a target's session so the next request starts fresh.
    pub fn forget(&self, target_key: &str) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(target_key)
            .is_some();
        if removed {
            self.persist();
        }
        removed
    }

    fn update<F: FnOnce(&mut SessionPreference)>(&self, target_key: &str, f: F) {
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let pref = entries.entry(target_key.to_string()).or_default();
            f(pref);
            pref.updated_at = Some(Utc::now());
        }
        self.persist();
    }

    /// Fill in a request's missing session and model from the target's
    /// history. Sessions are only resumed when the request asks for it.
    pub fn apply(&self, request: &mut DispatchRequest) {
        let Some(pref) = self.get(&request.target_key()) else {
            return;
        };

        if request.continue_session && request.resume_session_id.is_none() {
            request.resume_session_id = pref.last_session_id;
        }
        if request.model.is_none() {
            request.model = pref.last_model;
        }
    }

    /// Serialize the current entries and tag them with a new generation.
    fn snapshot(&self) -> Result<(u64, String)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let content = serde_json::to_string_pretty(&*entries)?;
        Ok((self.generation.fetch_add(1, Ordering::SeqCst) + 1, content))
    }

    /// Write the store to disk on the calling thread.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let (generation, content) = self.snapshot()?;
        write_if_newer(&self.written, generation, path, &content)
    }

    /// Save in the background when running inside tokio, inline otherwise.
    fn persist(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let (generation, content) = match self.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!("Failed to serialize session store: {}", e);
                return;
            }
        };

        let written = Arc::clone(&self.written);
        let write = move || {
            if let Err(e) = write_if_newer(&written, generation, &path, &content) {
                tracing::warn!("Failed to save session store: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }
}

/// Write `content` unless a newer snapshot already reached the disk.
fn write_if_newer(written: &Mutex<u64>, generation: u64, path: &Path, content: &str) -> Result<()> {
    let mut last = written.lock().unwrap_or_else(PoisonError::into_inner);
    if generation <= *last {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    *last = generation;
    Ok(())
}
