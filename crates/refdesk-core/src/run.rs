use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::query::SearchQuery;

/// Lifecycle state the server reports for runs and synopsis jobs.
///
/// Unknown values deserialize to [`RunStatus::Unknown`] so a newer server
/// cannot break the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Done,
    Error,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
            RunStatus::Unknown => "unknown",
        }
    }

    /// The only status that ends run polling.
    pub fn is_done(&self) -> bool {
        matches!(self, RunStatus::Done)
    }

    /// Synopsis jobs additionally finish in `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// One row of the server's run ledger, as returned by `/runs/list` and
/// `/runs/get`. Consumed, never owned: once observed it supersedes any
/// locally optimistic record sharing its session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default, deserialize_with = "lenient_query")]
    pub query: Option<SearchQuery>,
    #[serde(default)]
    pub matches_count: Option<i64>,
    #[serde(default)]
    pub reference_options_count: Option<i64>,
    #[serde(default)]
    pub selected_reference_drug: Option<String>,
    #[serde(default)]
    pub selection_rows_count: Option<i64>,
    #[serde(default)]
    pub selection_payload: Option<Value>,
    #[serde(default)]
    pub selection_file_path: Option<String>,
    #[serde(default)]
    pub router_output_text: Option<String>,
    #[serde(default)]
    pub router_output_path: Option<String>,
}

impl RunInfo {
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }
}

/// Latest synopsis job for a run, from `/synopsis/get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynopsisInfo {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub output_docx_path: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub error_text: Option<String>,
}

/// One candidate reference product offered by a search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceOption {
    pub reference_drug: String,
    pub rows_count: i64,
    #[serde(default)]
    pub sample_rows: Vec<SampleRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleRow {
    #[serde(default)]
    pub trade_name: Option<String>,
    #[serde(default)]
    pub drug_form: Option<String>,
    #[serde(default)]
    pub dosage: Option<String>,
}

/// Older ledger rows may carry a query shape this client no longer knows;
/// treat anything that does not decode as absent.
fn lenient_query<'de, D>(deserializer: D) -> Result<Option<SearchQuery>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}
