use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use refdesk_client::{ApiError, ChooseResponse, RunsBackend, SearchResponse};
use refdesk_core::{HistoryRecord, RecordPatch, RunInfo, RunStatus, SearchQuery, SynopsisInfo};
use refdesk_history::{HistoryService, PendingKey};
use refdesk_store::HistoryStore;
use tempfile::TempDir;
use tokio::time::timeout;

const DRAIN_LIMIT: Duration = Duration::from_secs(120);

/// Backend that replays scripted answers; an exhausted script keeps
/// returning `fallback_run` so an accidental extra poll shows up as an
/// inflated fetch count instead of a hang.
#[derive(Default)]
struct ScriptedBackend {
    runs_list: Mutex<Vec<RunInfo>>,
    run_fetches: Mutex<VecDeque<Result<RunInfo, ApiError>>>,
    fallback_run: Mutex<Option<RunInfo>>,
    fetch_count: AtomicUsize,
    synopsis_fetches: Mutex<VecDeque<Result<Option<SynopsisInfo>, ApiError>>>,
}

impl ScriptedBackend {
    fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    fn script_run(&self, answer: Result<RunInfo, ApiError>) {
        self.run_fetches.lock().expect("lock").push_back(answer);
    }

    fn script_synopsis(&self, answer: Result<Option<SynopsisInfo>, ApiError>) {
        self.synopsis_fetches.lock().expect("lock").push_back(answer);
    }
}

#[async_trait]
impl RunsBackend for ScriptedBackend {
    async fn list_runs(&self, _limit: usize) -> Result<Vec<RunInfo>, ApiError> {
        Ok(self.runs_list.lock().expect("lock").clone())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, ApiError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if let Some(answer) = self.run_fetches.lock().expect("lock").pop_front() {
            return answer;
        }
        if let Some(run) = self.fallback_run.lock().expect("lock").clone() {
            return Ok(run);
        }
        Err(ApiError::Api {
            message: format!("script exhausted for {run_id}"),
            details: None,
        })
    }

    async fn get_synopsis(&self, run_id: &str) -> Result<Option<SynopsisInfo>, ApiError> {
        self.synopsis_fetches
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or(Err(ApiError::Api {
                message: format!("script exhausted for {run_id}"),
                details: None,
            }))
    }
}

fn query() -> SearchQuery {
    SearchQuery {
        mnn: "Ибупрофен".to_string(),
        routes: "перорально".to_string(),
        base_form: "таблетки".to_string(),
        release_type: "обычное".to_string(),
        dosage: "200 мг".to_string(),
    }
}

fn run(id: &str, session_id: Option<&str>, status: RunStatus) -> RunInfo {
    RunInfo {
        id: id.to_string(),
        session_id: session_id.map(str::to_string),
        status,
        created_at: Some("2026-03-01T10:00:00".to_string()),
        started_at: None,
        finished_at: None,
        mode: Some("pipeline".to_string()),
        query: Some(query()),
        matches_count: Some(12),
        reference_options_count: Some(2),
        selected_reference_drug: None,
        selection_rows_count: None,
        selection_payload: None,
        selection_file_path: None,
        router_output_text: None,
        router_output_path: None,
    }
}

fn done_run(id: &str, session_id: Option<&str>) -> RunInfo {
    let mut run = run(id, session_id, RunStatus::Done);
    run.selected_reference_drug = Some("Нурофен".to_string());
    run.router_output_text = Some("Анализ завершен.".to_string());
    run
}

fn search_response(session_id: &str) -> SearchResponse {
    SearchResponse {
        session_id: Some(session_id.to_string()),
        xls_path: Some("реестр.xls".to_string()),
        query: Some(query()),
        matches_count: 12,
        reference_options_count: 2,
        reference_options: Vec::new(),
        match_rows_preview: Vec::new(),
        message: None,
    }
}

fn service_with(
    backend: &Arc<ScriptedBackend>,
    dir: &TempDir,
) -> Arc<HistoryService> {
    let store = HistoryStore::open(dir.path().join("history.json"));
    HistoryService::new(backend.clone(), store)
}

async fn drain(service: &HistoryService) {
    timeout(DRAIN_LIMIT, service.join_pollers())
        .await
        .expect("pollers must terminate");
}

#[tokio::test(start_paused = true)]
async fn poller_fetches_until_done_then_stops() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script_run(Ok(run("r1", Some("s1"), RunStatus::Running)));
    backend.script_run(Ok(run("r1", Some("s1"), RunStatus::Running)));
    backend.script_run(Ok(done_run("r1", Some("s1"))));
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    service.clone().track_run("r1").await;
    drain(&service).await;

    assert_eq!(backend.fetches(), 3);
    let records = service.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.run_id.as_deref(), Some("r1"));
    assert_eq!(record.status, Some(RunStatus::Done));
    assert_eq!(record.selected_reference_drug.as_deref(), Some("Нурофен"));
    assert!(service.pending_key_for(record).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn transport_errors_retry_on_the_same_cadence() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script_run(Err(ApiError::Api {
        message: "timeout".to_string(),
        details: None,
    }));
    backend.script_run(Ok(done_run("r1", None)));
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    service.clone().track_run("r1").await;
    drain(&service).await;

    assert_eq!(backend.fetches(), 2);
    assert_eq!(service.records().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn tracking_an_already_tracked_run_is_a_noop() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script_run(Ok(run("r1", None, RunStatus::Running)));
    backend.script_run(Ok(done_run("r1", None)));
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    service.clone().track_run("r1").await;
    service.clone().track_run("r1").await;
    drain(&service).await;

    assert_eq!(backend.fetches(), 2);
    assert_eq!(service.records().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn ensure_from_run_materializes_exactly_once() {
    let backend = Arc::new(ScriptedBackend::default());
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);
    let run = done_run("r1", Some("s1"));

    assert!(service.ensure_from_run(&run).await);
    assert!(!service.ensure_from_run(&run).await);
    assert_eq!(service.records().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn search_then_choose_patches_one_record() {
    let backend = Arc::new(ScriptedBackend::default());
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    let record = service
        .record_search(query(), &search_response("s1"))
        .await;
    assert_eq!(record.matches_count, Some(12));
    assert_eq!(record.reference_options_count, Some(2));
    assert!(record.selected_reference_drug.is_none());

    service.begin_pending("s1").await;
    let key = service.pending_key_for(&record).await.expect("pending");
    assert_eq!(key, PendingKey::Session("s1".to_string()));

    service
        .apply_choose(&ChooseResponse {
            run_id: "r1".to_string(),
            session_id: "s1".to_string(),
            saved_json_path: Some("выбор.json".to_string()),
            selected_reference_drug: "Нурофен".to_string(),
            selected_reference_rows_count: Some(4),
            selection_payload: None,
        })
        .await;

    let records = service.records().await;
    assert_eq!(records.len(), 1);
    let patched = &records[0];
    assert_eq!(patched.id, record.id);
    assert_eq!(patched.run_id.as_deref(), Some("r1"));
    assert_eq!(patched.selected_reference_drug.as_deref(), Some("Нурофен"));
    assert_eq!(patched.matches_count, Some(12));
    assert!(patched.updated_at >= record.updated_at);
    assert!(service.pending_key_for(patched).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn refresh_supersedes_local_only_session_records() {
    let backend = Arc::new(ScriptedBackend::default());
    let dir = TempDir::new().expect("tempdir");

    let before = service_with(&backend, &dir);
    before.record_search(query(), &search_response("s1")).await;
    drop(before);

    *backend.runs_list.lock().expect("lock") = vec![done_run("r1", Some("s1"))];
    let service = service_with(&backend, &dir);
    assert_eq!(service.records().await.len(), 1);

    service.clone().refresh(20).await.expect("refresh");
    let records = service.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].run_id.as_deref(), Some("r1"));
    assert_eq!(records[0].session_id.as_deref(), Some("s1"));
    assert_eq!(service.tracked_runs().await, 0);
}

#[tokio::test(start_paused = true)]
async fn refresh_failure_leaves_the_cache_untouched() {
    let backend = Arc::new(ScriptedBackend::default());
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);
    service.record_search(query(), &search_response("s1")).await;

    struct DownBackend;
    #[async_trait]
    impl RunsBackend for DownBackend {
        async fn list_runs(&self, _limit: usize) -> Result<Vec<RunInfo>, ApiError> {
            Err(ApiError::Api {
                message: "connection refused".to_string(),
                details: None,
            })
        }
        async fn get_run(&self, _run_id: &str) -> Result<RunInfo, ApiError> {
            unreachable!("refresh must not fetch runs")
        }
        async fn get_synopsis(&self, _run_id: &str) -> Result<Option<SynopsisInfo>, ApiError> {
            unreachable!("refresh must not fetch synopses")
        }
    }

    let offline = HistoryService::new(
        Arc::new(DownBackend),
        HistoryStore::open(dir.path().join("history.json")),
    );
    let cached: Vec<HistoryRecord> = offline.records().await;
    assert_eq!(cached.len(), 1);
    assert!(offline.clone().refresh(20).await.is_err());
    assert_eq!(offline.records().await, cached);
}

#[tokio::test(start_paused = true)]
async fn refresh_polls_running_runs_to_completion() {
    let backend = Arc::new(ScriptedBackend::default());
    *backend.runs_list.lock().expect("lock") = vec![run("r1", Some("s1"), RunStatus::Running)];
    backend.script_run(Ok(done_run("r1", Some("s1"))));
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    service.clone().refresh(20).await.expect("refresh");
    let records = service.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Some(RunStatus::Running));
    let key = service.pending_key_for(&records[0]).await.expect("pending");
    assert_eq!(key, PendingKey::Run("r1".to_string()));

    drain(&service).await;
    assert_eq!(backend.fetches(), 1);
    let records = service.records().await;
    assert_eq!(records[0].status, Some(RunStatus::Done));
    assert!(service.pending_key_for(&records[0]).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn delete_aborts_the_poller_and_clears_the_active_pointer() {
    let backend = Arc::new(ScriptedBackend::default());
    *backend.fallback_run.lock().expect("lock") = Some(run("r1", Some("s1"), RunStatus::Running));
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    let run = run("r1", Some("s1"), RunStatus::Running);
    service.ensure_from_run(&run).await;
    let record = service.records().await.remove(0);
    service.set_active(Some(record.id.clone())).await;
    service.clone().track_run("r1").await;
    assert_eq!(service.tracked_runs().await, 1);

    let removed = service.remove_by_run_id("r1").await.expect("removed");
    assert_eq!(removed.id, record.id);
    assert_eq!(service.tracked_runs().await, 0);
    assert!(service.active_record().await.is_none());
    assert!(service.records().await.is_empty());
    drain(&service).await;
}

#[tokio::test(start_paused = true)]
async fn synopsis_polling_merges_without_disturbing_siblings() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.script_synopsis(Ok(Some(SynopsisInfo {
        id: "syn1".to_string(),
        created_at: None,
        status: RunStatus::Running,
        output_docx_path: None,
        download_url: None,
        error_text: None,
    })));
    backend.script_synopsis(Ok(Some(SynopsisInfo {
        id: "syn1".to_string(),
        created_at: None,
        status: RunStatus::Done,
        output_docx_path: Some("downloads/synopsis_r1.docx".to_string()),
        download_url: Some("/downloads/synopsis_r1.docx".to_string()),
        error_text: None,
    })));
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);
    service.ensure_from_run(&done_run("r1", Some("s1"))).await;

    service.clone().track_synopsis("r1").await;
    drain(&service).await;

    let records = service.records().await;
    let record = &records[0];
    assert_eq!(record.synopsis_run_id.as_deref(), Some("syn1"));
    assert_eq!(record.synopsis_status, Some(RunStatus::Done));
    assert_eq!(
        record.synopsis_docx_url.as_deref(),
        Some("/downloads/synopsis_r1.docx")
    );
    assert_eq!(record.selected_reference_drug.as_deref(), Some("Нурофен"));
}

#[tokio::test(start_paused = true)]
async fn patching_an_unknown_target_is_a_silent_noop() {
    let backend = Arc::new(ScriptedBackend::default());
    let dir = TempDir::new().expect("tempdir");
    let service = service_with(&backend, &dir);

    let applied = service.patch_by_session("s9", RecordPatch::default()).await;
    assert!(!applied);
    assert!(service.records().await.is_empty());
}
