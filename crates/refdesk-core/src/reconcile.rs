//! One-time merge of the authoritative server run ledger into the local
//! record cache, run at startup or on manual refresh.

use std::collections::{HashMap, HashSet};

use crate::record::HistoryRecord;
use crate::run::RunInfo;

/// Result of merging a server run list with locally cached records.
///
/// `running_run_ids` and `running_by_session` feed the pending tracker so
/// in-flight indicators and pollers can be derived without another pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub records: Vec<HistoryRecord>,
    pub running_run_ids: HashSet<String>,
    pub running_by_session: HashMap<String, String>,
}

/// Server projections first (in server-reported order), then the local
/// records the server knows nothing about, in their prior order.
///
/// A local record survives only if its run id is absent from the server run
/// set AND its session id is absent from the server session set; anything
/// else is superseded by the server projection. The server ledger may carry
/// several runs for one session (choose, then analyze); the first row listed
/// wins so the result never holds two records with the same non-null key.
pub fn reconcile(server_runs: &[RunInfo], local_records: Vec<HistoryRecord>) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();
    let mut seen_runs: HashSet<&str> = HashSet::new();
    let mut seen_sessions: HashSet<&str> = HashSet::new();

    for run in server_runs {
        if run.is_running() {
            outcome.running_run_ids.insert(run.id.clone());
            if let Some(session_id) = &run.session_id {
                outcome
                    .running_by_session
                    .entry(session_id.clone())
                    .or_insert_with(|| run.id.clone());
            }
        }
        if !seen_runs.insert(run.id.as_str()) {
            continue;
        }
        if let Some(session_id) = run.session_id.as_deref() {
            if !seen_sessions.insert(session_id) {
                continue;
            }
        }
        outcome.records.push(HistoryRecord::from_run(run));
    }

    let server_run_ids: HashSet<&str> = server_runs.iter().map(|r| r.id.as_str()).collect();
    let server_sessions: HashSet<&str> = server_runs
        .iter()
        .filter_map(|r| r.session_id.as_deref())
        .collect();

    for record in local_records {
        let run_known = record
            .run_id
            .as_deref()
            .is_some_and(|id| server_run_ids.contains(id));
        let session_known = record
            .session_id
            .as_deref()
            .is_some_and(|id| server_sessions.contains(id));
        if !run_known && !session_known {
            outcome.records.push(record);
        }
    }

    outcome
}
