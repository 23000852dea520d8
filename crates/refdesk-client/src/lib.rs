//! HTTP client for the reference-drug analysis service.
//!
//! Request/response shapes mirror the service wire format. Every response
//! carries an `ok` flag; `ok = false` (or a non-2xx status) maps to
//! [`ApiError::Api`] with the server's diagnostic payload attached.

use std::time::Duration;

use async_trait::async_trait;
use refdesk_core::{ReferenceOption, RunInfo, RunStatus, SearchQuery, SynopsisInfo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Pipeline analysis and synopsis builds include a remote LLM round trip.
const PIPELINE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message}")]
    Api {
        message: String,
        details: Option<String>,
    },
    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// How the operator names the chosen reference option.
#[derive(Debug, Clone)]
pub enum ReferenceChoice {
    /// 1-based index into the session's option list.
    OptionIndex(usize),
    /// Exact reference drug name from the option list.
    DrugName(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub xls_path: Option<String>,
    #[serde(default)]
    pub query: Option<SearchQuery>,
    #[serde(default)]
    pub matches_count: i64,
    #[serde(default)]
    pub reference_options_count: i64,
    #[serde(default)]
    pub reference_options: Vec<ReferenceOption>,
    #[serde(default)]
    pub match_rows_preview: Vec<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl SearchResponse {
    pub fn has_matches(&self) -> bool {
        self.matches_count > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChooseResponse {
    pub run_id: String,
    pub session_id: String,
    #[serde(default)]
    pub saved_json_path: Option<String>,
    pub selected_reference_drug: String,
    #[serde(default)]
    pub selected_reference_rows_count: Option<i64>,
    #[serde(default)]
    pub selection_payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub selection: SelectionResult,
    pub router: RouterResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub run_id: String,
    pub session_id: String,
    #[serde(default)]
    pub saved_json_path: Option<String>,
    pub selected_reference_drug: String,
    #[serde(default)]
    pub selected_reference_rows_count: Option<i64>,
    #[serde(default)]
    pub selection_payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterResult {
    pub reference_drug: String,
    #[serde(default)]
    pub saved_response_path: Option<String>,
    #[serde(default)]
    pub analysis_text: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynopsisOptions {
    pub template_path: Option<String>,
    pub prompt_path: Option<String>,
    pub output_docx: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynopsisBuildResponse {
    #[serde(default)]
    pub synopsis_run_id: Option<String>,
    pub run_id: String,
    #[serde(default)]
    pub output_docx_path: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service: String,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub sessions_count: Option<i64>,
    #[serde(default)]
    pub cached_workbooks: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<Value>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, ApiError> {
        debug!("api_get: {path_and_query}");
        let resp = self.http.get(self.endpoint(path_and_query)).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        parse_payload(status.is_success(), status.as_u16(), &text)
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<T, ApiError> {
        debug!("api_post: {path}");
        let resp = self
            .http
            .post(self.endpoint(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        parse_payload(status.is_success(), status.as_u16(), &text)
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        xls_path: Option<&str>,
    ) -> Result<SearchResponse, ApiError> {
        let mut body = serde_json::to_value(query)?;
        if let Some(path) = xls_path {
            body["xls_path"] = Value::String(path.to_string());
        }
        self.post_json("/reference/search", &body, REQUEST_TIMEOUT)
            .await
    }

    pub async fn choose_reference(
        &self,
        session_id: &str,
        choice: &ReferenceChoice,
        save_json_path: Option<&str>,
    ) -> Result<ChooseResponse, ApiError> {
        let body = choice_body(session_id, choice, save_json_path, None);
        self.post_json("/reference/choose", &body, REQUEST_TIMEOUT)
            .await
    }

    pub async fn run_pipeline(
        &self,
        session_id: &str,
        choice: &ReferenceChoice,
        save_json_path: Option<&str>,
        save_router_output_path: Option<&str>,
    ) -> Result<PipelineResponse, ApiError> {
        let body = choice_body(session_id, choice, save_json_path, save_router_output_path);
        self.post_json("/pipeline/analyze", &body, PIPELINE_TIMEOUT)
            .await
    }

    pub async fn list_runs(
        &self,
        limit: usize,
        status: Option<RunStatus>,
    ) -> Result<Vec<RunInfo>, ApiError> {
        #[derive(Deserialize)]
        struct RunsResponse {
            #[serde(default)]
            runs: Vec<RunInfo>,
        }
        let mut path = format!("/runs/list?limit={limit}");
        if let Some(status) = status {
            path.push_str("&status=");
            path.push_str(status.as_str());
        }
        let resp: RunsResponse = self.get_json(&path).await?;
        Ok(resp.runs)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunInfo, ApiError> {
        #[derive(Deserialize)]
        struct RunResponse {
            run: RunInfo,
        }
        let resp: RunResponse = self.get_json(&format!("/runs/get?run_id={run_id}")).await?;
        Ok(resp.run)
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "run_id": run_id });
        let _: Value = self.post_json("/runs/delete", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    pub async fn build_synopsis(
        &self,
        run_id: &str,
        options: &SynopsisOptions,
    ) -> Result<SynopsisBuildResponse, ApiError> {
        let mut body = serde_json::json!({ "run_id": run_id });
        if let Some(path) = &options.template_path {
            body["template_path"] = Value::String(path.clone());
        }
        if let Some(path) = &options.prompt_path {
            body["prompt_path"] = Value::String(path.clone());
        }
        if let Some(name) = &options.output_docx {
            body["output_docx"] = Value::String(name.clone());
        }
        self.post_json("/synopsis/build", &body, PIPELINE_TIMEOUT)
            .await
    }

    pub async fn get_synopsis(&self, run_id: &str) -> Result<Option<SynopsisInfo>, ApiError> {
        #[derive(Deserialize)]
        struct SynopsisResponse {
            #[serde(default)]
            synopsis: Option<SynopsisInfo>,
        }
        let resp: SynopsisResponse = self
            .get_json(&format!("/synopsis/get?run_id={run_id}"))
            .await?;
        Ok(resp.synopsis)
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        self.get_json("/health").await
    }
}

fn choice_body(
    session_id: &str,
    choice: &ReferenceChoice,
    save_json_path: Option<&str>,
    save_router_output_path: Option<&str>,
) -> Value {
    let mut body = serde_json::json!({ "session_id": session_id });
    match choice {
        ReferenceChoice::OptionIndex(index) => {
            body["option_index"] = Value::from(*index);
        }
        ReferenceChoice::DrugName(name) => {
            body["reference_drug"] = Value::String(name.clone());
        }
    }
    if let Some(path) = save_json_path {
        body["save_json_path"] = Value::String(path.to_string());
    }
    if let Some(path) = save_router_output_path {
        body["save_router_output_path"] = Value::String(path.to_string());
    }
    body
}

/// Split the envelope check from transport so the mapping is testable.
fn parse_payload<T: DeserializeOwned>(
    status_ok: bool,
    status_code: u16,
    text: &str,
) -> Result<T, ApiError> {
    let envelope: Envelope = serde_json::from_str(text).unwrap_or(Envelope {
        ok: status_ok,
        error: None,
        details: None,
    });
    if !status_ok || !envelope.ok {
        let message = envelope
            .error
            .unwrap_or_else(|| format!("server returned HTTP {status_code}"));
        let details = envelope.details.map(|value| match value {
            Value::String(text) => text,
            other => other.to_string(),
        });
        return Err(ApiError::Api { message, details });
    }
    Ok(serde_json::from_str(text)?)
}

/// The run-status surface the history subsystem polls through; tests swap in
/// a scripted fake.
#[async_trait]
pub trait RunsBackend: Send + Sync {
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunInfo>, ApiError>;
    async fn get_run(&self, run_id: &str) -> Result<RunInfo, ApiError>;
    async fn get_synopsis(&self, run_id: &str) -> Result<Option<SynopsisInfo>, ApiError>;
}

#[async_trait]
impl RunsBackend for ApiClient {
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunInfo>, ApiError> {
        ApiClient::list_runs(self, limit, None).await
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, ApiError> {
        ApiClient::get_run(self, run_id).await
    }

    async fn get_synopsis(&self, run_id: &str) -> Result<Option<SynopsisInfo>, ApiError> {
        ApiClient::get_synopsis(self, run_id).await
    }
}
