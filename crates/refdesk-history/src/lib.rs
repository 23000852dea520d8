//! History reconciliation and asynchronous-run tracking.
//!
//! [`HistoryService`] is the single context object owning the record store,
//! the pending tracker and the poller registry. Every mutation of
//! client-side state flows through it, so independent instances (one per
//! application, one per test) never interfere. All shared state sits behind
//! one mutex and no lock is held across an await: patches land in the order
//! their responses arrive, and reconciliation serializes with them.

mod pending;
mod poller;

pub use pending::PendingKey;
pub use poller::POLL_INTERVAL;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use refdesk_client::{
    ApiError, ChooseResponse, PipelineResponse, RunsBackend, SearchResponse,
    SynopsisBuildResponse,
};
use refdesk_core::record::selection_rows;
use refdesk_core::{
    reconcile, HistoryRecord, RecordPatch, RunInfo, RunStatus, SearchQuery, SynopsisInfo,
};
use refdesk_store::HistoryStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pending::PendingState;

pub struct HistoryService {
    backend: Arc<dyn RunsBackend>,
    state: Mutex<ServiceState>,
}

struct ServiceState {
    store: HistoryStore,
    active_id: Option<String>,
    pending: PendingState,
    pollers: HashMap<String, JoinHandle<()>>,
}

impl ServiceState {
    fn apply_patch<P>(&mut self, pick: P, patch: RecordPatch) -> bool
    where
        P: FnMut(&HistoryRecord) -> bool,
    {
        let now = Utc::now();
        let applied = self.store.update_where(pick, |record| {
            patch.apply(record);
            record.updated_at = now.max(record.updated_at);
        });
        if !applied {
            debug!("patch_target_missing");
        }
        applied
    }
}

impl HistoryService {
    pub fn new(backend: Arc<dyn RunsBackend>, store: HistoryStore) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: Mutex::new(ServiceState {
                store,
                active_id: None,
                pending: PendingState::default(),
                pollers: HashMap::new(),
            }),
        })
    }

    /// Snapshot of the record list, most recent first.
    pub async fn records(&self) -> Vec<HistoryRecord> {
        self.state.lock().await.store.records().to_vec()
    }

    pub async fn active_record(&self) -> Option<HistoryRecord> {
        let state = self.state.lock().await;
        let id = state.active_id.as_deref()?;
        state.store.get(id).cloned()
    }

    pub async fn set_active(&self, id: Option<String>) {
        self.state.lock().await.active_id = id;
    }

    /// The single token marking this record's work in flight, if any.
    pub async fn pending_key_for(&self, record: &HistoryRecord) -> Option<PendingKey> {
        self.state.lock().await.pending.resolve_running_key(record)
    }

    /// Merge the server-side run ledger into the local cache and start a
    /// poller for every run still in flight. Fails open: when the ledger is
    /// unreachable the local cache stands as-is.
    pub async fn refresh(self: Arc<Self>, limit: usize) -> Result<usize, ApiError> {
        let runs = match self.backend.list_runs(limit).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!("runs_list_failed: {err}");
                return Err(err);
            }
        };
        let running = {
            let mut state = self.state.lock().await;
            let local = state.store.records().to_vec();
            let outcome = reconcile(&runs, local);
            state.store.replace_all(outcome.records);
            state.pending.running_run_ids = outcome.running_run_ids.clone();
            state.pending.running_by_session = outcome.running_by_session;
            outcome.running_run_ids
        };
        for run_id in &running {
            self.clone().track_run(run_id).await;
        }
        Ok(runs.len())
    }

    /// Record a search that produced at least one match (optimistic: no run
    /// exists yet, the session id is the only server-side key).
    pub async fn record_search(&self, query: SearchQuery, resp: &SearchResponse) -> HistoryRecord {
        let mut record = HistoryRecord::new(query);
        record.session_id = resp.session_id.clone();
        record.xls_path = resp.xls_path.clone();
        record.matches_count = Some(resp.matches_count);
        record.reference_options_count = Some(resp.reference_options_count);

        let mut state = self.state.lock().await;
        state.store.insert_front(record.clone());
        state.active_id = Some(record.id.clone());
        record
    }

    /// Mark a client-initiated pipeline request as in flight before the
    /// server has assigned any run id.
    pub async fn begin_pending(&self, session_id: &str) {
        self.state
            .lock()
            .await
            .pending
            .sessions
            .insert(session_id.to_string());
    }

    /// Drop the optimistic marker (request failed or was folded in).
    pub async fn end_pending(&self, session_id: &str) {
        self.state.lock().await.pending.sessions.remove(session_id);
    }

    /// Fold a choose-reference result into the session's record.
    pub async fn apply_choose(&self, resp: &ChooseResponse) {
        let patch = RecordPatch {
            run_id: Some(resp.run_id.clone()),
            status: Some(RunStatus::Done),
            mode: Some("choose".to_string()),
            selected_reference_drug: Some(resp.selected_reference_drug.clone()),
            selection_rows_count: resp.selected_reference_rows_count,
            selection_rows: selection_rows(resp.selection_payload.as_ref()),
            selection_file_path: resp.saved_json_path.clone(),
            ..Default::default()
        };
        self.patch_by_session(&resp.session_id, patch).await;
        self.end_pending(&resp.session_id).await;
    }

    /// Fold a full pipeline result (selection + analysis) into the session's
    /// record.
    pub async fn apply_pipeline(&self, resp: &PipelineResponse) {
        let mut patch = RecordPatch {
            run_id: Some(resp.selection.run_id.clone()),
            status: Some(RunStatus::Done),
            mode: Some("pipeline".to_string()),
            selected_reference_drug: Some(resp.selection.selected_reference_drug.clone()),
            selection_rows_count: resp.selection.selected_reference_rows_count,
            selection_rows: selection_rows(resp.selection.selection_payload.as_ref()),
            selection_file_path: resp.selection.saved_json_path.clone(),
            analysis_path: resp.router.saved_response_path.clone(),
            ..Default::default()
        };
        if let Some(text) = &resp.router.analysis_text {
            patch = patch.with_analysis_text(text);
        }
        self.patch_by_session(&resp.selection.session_id, patch).await;
        self.end_pending(&resp.selection.session_id).await;
    }

    /// Fold a synopsis build result into the owning run's record.
    pub async fn apply_synopsis_build(&self, run_id: &str, resp: &SynopsisBuildResponse) {
        let status = if resp.download_url.is_some() {
            RunStatus::Done
        } else {
            RunStatus::Running
        };
        let patch = RecordPatch {
            synopsis_run_id: resp.synopsis_run_id.clone(),
            synopsis_status: Some(status),
            synopsis_docx_url: resp.download_url.clone(),
            ..Default::default()
        };
        self.patch_by_run(run_id, patch).await;
    }

    /// Merge a polled synopsis state into the owning run's record, leaving
    /// every other field alone.
    pub async fn apply_synopsis_info(&self, run_id: &str, info: &SynopsisInfo) {
        let patch = RecordPatch {
            synopsis_run_id: Some(info.id.clone()),
            synopsis_status: Some(info.status),
            synopsis_docx_url: info.download_url.clone(),
            ..Default::default()
        };
        self.patch_by_run(run_id, patch).await;
    }

    /// Patch the unique record holding this session id. Absent target is a
    /// silent no-op: creation is explicit, never a patch side effect.
    pub async fn patch_by_session(&self, session_id: &str, patch: RecordPatch) -> bool {
        self.state
            .lock()
            .await
            .apply_patch(|r| r.matches_session(session_id), patch)
    }

    /// Patch the unique record holding this run id.
    pub async fn patch_by_run(&self, run_id: &str, patch: RecordPatch) -> bool {
        self.state
            .lock()
            .await
            .apply_patch(|r| r.matches_run(run_id), patch)
    }

    /// Materialize a record for a server run the client has never seen, e.g.
    /// a run that appears in the ledger after a reload. Idempotent.
    pub async fn ensure_from_run(&self, run: &RunInfo) -> bool {
        let mut state = self.state.lock().await;
        if state.store.find_by_run(&run.id).is_some() {
            return false;
        }
        state.store.insert_front(HistoryRecord::from_run(run));
        true
    }

    /// Drop the record for a deleted run, cancel its poller and clear the
    /// active pointer when it pointed at the deleted record.
    pub async fn remove_by_run_id(&self, run_id: &str) -> Option<HistoryRecord> {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.pollers.remove(run_id) {
            handle.abort();
        }
        let removed = state.store.remove_by_run_id(run_id)?;
        if state.active_id.as_deref() == Some(removed.id.as_str()) {
            state.active_id = None;
        }
        state
            .pending
            .clear_run(run_id, removed.session_id.as_deref());
        Some(removed)
    }
}
