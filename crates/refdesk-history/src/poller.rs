//! Fixed-interval polling of outstanding runs and synopsis jobs.
//!
//! A poller is an owned tokio task registered per tracked key, so a second
//! start for the same key is a no-op and deleting the record aborts the loop
//! deterministically. Retry is fixed-interval with no attempt ceiling: a
//! transport error and a not-done-yet answer are handled identically, and
//! the loop runs until a terminal status is observed or tracking is
//! abandoned.

use std::sync::Arc;
use std::time::Duration;

use refdesk_core::{RecordPatch, RunInfo};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::HistoryService;

/// Delay between successive status fetches; errors retry on the same cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(3500);

impl HistoryService {
    /// Start polling `run_id` until the server reports it done. Calling this
    /// for a run that is already tracked is a no-op.
    pub async fn track_run(self: Arc<Self>, run_id: &str) {
        let mut state = self.state.lock().await;
        if state.pollers.contains_key(run_id) {
            return;
        }
        let service = Arc::clone(&self);
        let id = run_id.to_string();
        let handle = tokio::spawn(async move {
            service.poll_run(&id).await;
        });
        state.pollers.insert(run_id.to_string(), handle);
    }

    /// Start polling the synopsis attached to `run_id` until it reaches a
    /// terminal state. Deduplicated like [`HistoryService::track_run`].
    pub async fn track_synopsis(self: Arc<Self>, run_id: &str) {
        let key = synopsis_key(run_id);
        let mut state = self.state.lock().await;
        if state.pollers.contains_key(&key) {
            return;
        }
        let service = Arc::clone(&self);
        let id = run_id.to_string();
        let handle = tokio::spawn(async move {
            service.poll_synopsis(&id).await;
        });
        state.pollers.insert(key, handle);
    }

    /// Wait for every tracked poller to finish. Used by callers that need
    /// all outstanding work drained before exiting.
    pub async fn join_pollers(&self) {
        loop {
            let handle = {
                let mut state = self.state.lock().await;
                let key = state.pollers.keys().next().cloned();
                key.and_then(|key| state.pollers.remove(&key))
            };
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    pub async fn tracked_runs(&self) -> usize {
        self.state.lock().await.pollers.len()
    }

    async fn poll_run(&self, run_id: &str) {
        loop {
            match self.backend.get_run(run_id).await {
                Ok(run) if run.status.is_done() => {
                    self.finish_run(&run).await;
                    return;
                }
                Ok(_) => debug!("run_not_done: {run_id}"),
                Err(err) => warn!("run_poll_failed: {run_id}: {err}"),
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Apply the terminal payload and clear every pending trace of the run.
    async fn finish_run(&self, run: &RunInfo) {
        if !self.ensure_from_run(run).await {
            self.patch_by_run(&run.id, RecordPatch::from_run(run)).await;
        }
        let mut state = self.state.lock().await;
        state.pending.clear_run(&run.id, run.session_id.as_deref());
        state.pollers.remove(&run.id);
    }

    async fn poll_synopsis(&self, run_id: &str) {
        loop {
            match self.backend.get_synopsis(run_id).await {
                Ok(Some(info)) if info.status.is_terminal() => {
                    self.apply_synopsis_info(run_id, &info).await;
                    let mut state = self.state.lock().await;
                    state.pollers.remove(&synopsis_key(run_id));
                    return;
                }
                Ok(Some(info)) => {
                    self.apply_synopsis_info(run_id, &info).await;
                }
                Ok(None) => debug!("synopsis_not_found: {run_id}"),
                Err(err) => warn!("synopsis_poll_failed: {run_id}: {err}"),
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

fn synopsis_key(run_id: &str) -> String {
    format!("synopsis:{run_id}")
}
