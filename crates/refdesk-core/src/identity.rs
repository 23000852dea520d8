//! Resolves whether two representations name the same logical unit of work.
//!
//! A record's `run_id` is unknown until the server assigns one; `session_id`
//! arrives earlier (at search time) and is the only correlation key in that
//! window. Run-id equality therefore takes precedence, with session equality
//! as the fallback that ties optimistic pre-run state to its eventual run.

use crate::record::HistoryRecord;
use crate::run::RunInfo;

/// Equal and non-null.
pub fn same_key(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

impl HistoryRecord {
    pub fn matches_run(&self, run_id: &str) -> bool {
        same_key(self.run_id.as_deref(), Some(run_id))
    }

    pub fn matches_session(&self, session_id: &str) -> bool {
        same_key(self.session_id.as_deref(), Some(session_id))
    }

    /// Same run, or session-related when no run id ties them yet.
    pub fn is_related_to(&self, run: &RunInfo) -> bool {
        same_key(self.run_id.as_deref(), Some(&run.id))
            || same_key(self.session_id.as_deref(), run.session_id.as_deref())
    }
}
