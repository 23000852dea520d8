use std::collections::{HashMap, HashSet};
use std::fmt;

use refdesk_core::HistoryRecord;

/// Token identifying one logical unit of in-flight work, used to guarantee
/// at most one visible indicator and one poller per unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingKey {
    /// A server-confirmed running run.
    Run(String),
    /// An optimistic client request that has not produced a run id yet.
    Session(String),
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingKey::Run(id) => f.write_str(id),
            PendingKey::Session(id) => write!(f, "session:{id}"),
        }
    }
}

/// Work in flight but not yet reflected by the server, plus the
/// server-confirmed running sets produced by reconciliation.
#[derive(Debug, Default)]
pub(crate) struct PendingState {
    pub sessions: HashSet<String>,
    pub running_run_ids: HashSet<String>,
    pub running_by_session: HashMap<String, String>,
}

impl PendingState {
    /// Confirmed running run first (via the record's run id, then its
    /// session), optimistic session flag as the fallback.
    pub fn resolve_running_key(&self, record: &HistoryRecord) -> Option<PendingKey> {
        if let Some(run_id) = &record.run_id {
            if self.running_run_ids.contains(run_id) {
                return Some(PendingKey::Run(run_id.clone()));
            }
        }
        if let Some(session_id) = &record.session_id {
            if let Some(run_id) = self.running_by_session.get(session_id) {
                return Some(PendingKey::Run(run_id.clone()));
            }
            if self.sessions.contains(session_id) {
                return Some(PendingKey::Session(session_id.clone()));
            }
        }
        None
    }

    /// Forget everything tied to a run that finished or was deleted.
    pub fn clear_run(&mut self, run_id: &str, session_id: Option<&str>) {
        self.running_run_ids.remove(run_id);
        self.running_by_session.retain(|_, id| id != run_id);
        if let Some(session_id) = session_id {
            self.sessions.remove(session_id);
        }
    }
}
