//! Persistent client-side state: the bounded history cache and the
//! preferences blob. Both files degrade to defaults when missing or
//! malformed, and write failures never reach callers; the in-memory view
//! stays authoritative for the session.

mod prefs;

pub use prefs::{Preferences, PrefsStore};

use std::fs;
use std::path::{Path, PathBuf};

use refdesk_core::HistoryRecord;
use thiserror::Error;
use tracing::warn;

/// Records retained at most; inserts beyond this evict the oldest entries.
pub const HISTORY_CAP: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bounded, recency-ordered cache of history records backed by one JSON file.
///
/// Order is significant for display priority: the most recently
/// created-or-updated record sits first. Every mutation persists
/// synchronously before returning.
pub struct HistoryStore {
    path: PathBuf,
    records: Vec<HistoryRecord>,
}

impl HistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = load_records(&path);
        Self { path, records }
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn find_by_run(&self, run_id: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.matches_run(run_id))
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<&HistoryRecord> {
        self.records.iter().find(|r| r.matches_session(session_id))
    }

    /// Replace the whole list with a reconciliation result.
    pub fn replace_all(&mut self, records: Vec<HistoryRecord>) {
        self.records = records;
        self.records.truncate(HISTORY_CAP);
        self.persist();
    }

    pub fn insert_front(&mut self, record: HistoryRecord) {
        self.records.insert(0, record);
        self.records.truncate(HISTORY_CAP);
        self.persist();
    }

    /// Move an existing record to the front without altering its content.
    pub fn promote(&mut self, id: &str) {
        if let Some(pos) = self.records.iter().position(|r| r.id == id) {
            let record = self.records.remove(pos);
            self.records.insert(0, record);
            self.persist();
        }
    }

    /// Mutate the first record matching `pick`, promote it to the front and
    /// persist. Returns false when nothing matched.
    pub fn update_where<P, F>(&mut self, mut pick: P, mutate: F) -> bool
    where
        P: FnMut(&HistoryRecord) -> bool,
        F: FnOnce(&mut HistoryRecord),
    {
        let Some(pos) = self.records.iter().position(|r| pick(r)) else {
            return false;
        };
        let mut record = self.records.remove(pos);
        mutate(&mut record);
        self.records.insert(0, record);
        self.persist();
        true
    }

    pub fn remove_by_run_id(&mut self, run_id: &str) -> Option<HistoryRecord> {
        let pos = self.records.iter().position(|r| r.matches_run(run_id))?;
        let removed = self.records.remove(pos);
        self.persist();
        Some(removed)
    }

    /// Write the current list; failures are logged and swallowed.
    pub fn persist(&self) {
        if let Err(err) = save_records(&self.path, &self.records) {
            warn!("history_save_failed: {err}");
        }
    }
}

fn load_records(path: &Path) -> Vec<HistoryRecord> {
    if let Ok(content) = fs::read_to_string(path) {
        match serde_json::from_str::<Vec<HistoryRecord>>(&content) {
            Ok(records) => return records,
            Err(err) => warn!("history_load_failed: {}: {err}", path.display()),
        }
    }
    Vec::new()
}

fn save_records(path: &Path, records: &[HistoryRecord]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(records)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
