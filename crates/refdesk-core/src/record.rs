use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::query::SearchQuery;
use crate::run::{RunInfo, RunStatus};

/// Longest analysis excerpt kept alongside the full text for list rendering.
pub const ANALYSIS_PREVIEW_CHARS: usize = 400;

/// One conversation/search unit held by the client.
///
/// A record is addressable by up to three keys: the locally generated `id`
/// (stable for the record's lifetime, never reused), the server `session_id`
/// assigned when a search produces candidates, and the server `run_id`
/// assigned once an asynchronous job exists. It is created either
/// optimistically when a search yields matches, or materialized from a
/// server-reported run the client has never seen; it is mutated only through
/// [`RecordPatch`] application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub query: Option<SearchQuery>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub xls_path: Option<String>,
    #[serde(default)]
    pub matches_count: Option<i64>,
    #[serde(default)]
    pub reference_options_count: Option<i64>,
    #[serde(default)]
    pub selected_reference_drug: Option<String>,
    #[serde(default)]
    pub selection_rows_count: Option<i64>,
    #[serde(default)]
    pub selection_rows: Option<Value>,
    #[serde(default)]
    pub selection_file_path: Option<String>,
    #[serde(default)]
    pub analysis_text: Option<String>,
    #[serde(default)]
    pub analysis_preview: Option<String>,
    #[serde(default)]
    pub analysis_path: Option<String>,
    #[serde(default)]
    pub synopsis_run_id: Option<String>,
    #[serde(default)]
    pub synopsis_status: Option<RunStatus>,
    #[serde(default)]
    pub synopsis_docx_url: Option<String>,
}

impl HistoryRecord {
    fn blank() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: None,
            run_id: None,
            created_at: now,
            updated_at: now,
            query: None,
            status: None,
            mode: None,
            xls_path: None,
            matches_count: None,
            reference_options_count: None,
            selected_reference_drug: None,
            selection_rows_count: None,
            selection_rows: None,
            selection_file_path: None,
            analysis_text: None,
            analysis_preview: None,
            analysis_path: None,
            synopsis_run_id: None,
            synopsis_status: None,
            synopsis_docx_url: None,
        }
    }

    /// A fresh optimistic record for a search that produced matches.
    pub fn new(query: SearchQuery) -> Self {
        let mut record = Self::blank();
        record.query = Some(query);
        record
    }

    /// Project a server run into a record (lazy materialization after a
    /// reload, or the server side of reconciliation).
    pub fn from_run(run: &RunInfo) -> Self {
        let mut record = Self::blank();
        RecordPatch::from_run(run).apply(&mut record);
        record
    }
}

/// Named-field partial update over a [`HistoryRecord`].
///
/// Every field is an explicit option: present fields overwrite, absent fields
/// leave the record untouched, so applying a patch twice yields the same
/// record as applying it once and a later stage never erases what an earlier
/// stage wrote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub query: Option<SearchQuery>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub xls_path: Option<String>,
    #[serde(default)]
    pub matches_count: Option<i64>,
    #[serde(default)]
    pub reference_options_count: Option<i64>,
    #[serde(default)]
    pub selected_reference_drug: Option<String>,
    #[serde(default)]
    pub selection_rows_count: Option<i64>,
    #[serde(default)]
    pub selection_rows: Option<Value>,
    #[serde(default)]
    pub selection_file_path: Option<String>,
    #[serde(default)]
    pub analysis_text: Option<String>,
    #[serde(default)]
    pub analysis_preview: Option<String>,
    #[serde(default)]
    pub analysis_path: Option<String>,
    #[serde(default)]
    pub synopsis_run_id: Option<String>,
    #[serde(default)]
    pub synopsis_status: Option<RunStatus>,
    #[serde(default)]
    pub synopsis_docx_url: Option<String>,
}

impl RecordPatch {
    /// Overwrite exactly the fields this patch names.
    pub fn apply(&self, record: &mut HistoryRecord) {
        if let Some(v) = &self.session_id {
            record.session_id = Some(v.clone());
        }
        if let Some(v) = &self.run_id {
            record.run_id = Some(v.clone());
        }
        if let Some(v) = &self.query {
            record.query = Some(v.clone());
        }
        if let Some(v) = self.status {
            record.status = Some(v);
        }
        if let Some(v) = &self.mode {
            record.mode = Some(v.clone());
        }
        if let Some(v) = &self.xls_path {
            record.xls_path = Some(v.clone());
        }
        if let Some(v) = self.matches_count {
            record.matches_count = Some(v);
        }
        if let Some(v) = self.reference_options_count {
            record.reference_options_count = Some(v);
        }
        if let Some(v) = &self.selected_reference_drug {
            record.selected_reference_drug = Some(v.clone());
        }
        if let Some(v) = self.selection_rows_count {
            record.selection_rows_count = Some(v);
        }
        if let Some(v) = &self.selection_rows {
            record.selection_rows = Some(v.clone());
        }
        if let Some(v) = &self.selection_file_path {
            record.selection_file_path = Some(v.clone());
        }
        if let Some(v) = &self.analysis_text {
            record.analysis_text = Some(v.clone());
        }
        if let Some(v) = &self.analysis_preview {
            record.analysis_preview = Some(v.clone());
        }
        if let Some(v) = &self.analysis_path {
            record.analysis_path = Some(v.clone());
        }
        if let Some(v) = &self.synopsis_run_id {
            record.synopsis_run_id = Some(v.clone());
        }
        if let Some(v) = self.synopsis_status {
            record.synopsis_status = Some(v);
        }
        if let Some(v) = &self.synopsis_docx_url {
            record.synopsis_docx_url = Some(v.clone());
        }
    }

    /// Everything a server run can contribute to its record.
    pub fn from_run(run: &RunInfo) -> Self {
        Self {
            session_id: run.session_id.clone(),
            run_id: Some(run.id.clone()),
            query: run.query.clone(),
            status: Some(run.status),
            mode: run.mode.clone(),
            matches_count: run.matches_count,
            reference_options_count: run.reference_options_count,
            selected_reference_drug: run.selected_reference_drug.clone(),
            selection_rows_count: run.selection_rows_count,
            selection_rows: selection_rows(run.selection_payload.as_ref()),
            selection_file_path: run.selection_file_path.clone(),
            analysis_text: run.router_output_text.clone(),
            analysis_preview: run.router_output_text.as_deref().map(preview),
            analysis_path: run.router_output_path.clone(),
            ..Self::default()
        }
    }

    /// Set the full analysis text together with its derived preview.
    pub fn with_analysis_text(mut self, text: &str) -> Self {
        self.analysis_text = Some(text.to_string());
        self.analysis_preview = Some(preview(text));
        self
    }
}

/// Truncate analysis text for list display, on a character boundary.
pub fn preview(text: &str) -> String {
    if text.chars().count() <= ANALYSIS_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut excerpt: String = text.chars().take(ANALYSIS_PREVIEW_CHARS).collect();
    excerpt.push('…');
    excerpt
}

/// The selection rows embedded in a selection payload, kept opaque.
pub fn selection_rows(payload: Option<&Value>) -> Option<Value> {
    payload.and_then(|p| p.get("selected_reference_rows")).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run(id: &str, session_id: Option<&str>, status: RunStatus) -> RunInfo {
        RunInfo {
            id: id.to_string(),
            session_id: session_id.map(str::to_string),
            status,
            created_at: Some("2026-03-01T10:00:00".to_string()),
            started_at: None,
            finished_at: None,
            mode: Some("pipeline".to_string()),
            query: None,
            matches_count: Some(12),
            reference_options_count: Some(2),
            selected_reference_drug: Some("Нурофен".to_string()),
            selection_rows_count: Some(4),
            selection_payload: Some(json!({"selected_reference_rows": [{"trade_name": "Нурофен"}]})),
            selection_file_path: None,
            router_output_text: Some("Анализ завершен.".to_string()),
            router_output_path: Some("out/r1.md".to_string()),
        }
    }

    #[test]
    fn patch_application_is_idempotent() {
        let mut record = HistoryRecord::new(SearchQuery {
            mnn: "Ибупрофен".to_string(),
            routes: "перорально".to_string(),
            base_form: "таблетки".to_string(),
            release_type: "обычное".to_string(),
            dosage: "200 мг".to_string(),
        });
        let patch = RecordPatch {
            run_id: Some("r1".to_string()),
            selected_reference_drug: Some("Нурофен".to_string()),
            ..Default::default()
        };

        patch.apply(&mut record);
        let once = record.clone();
        patch.apply(&mut record);
        assert_eq!(record, once);
    }

    #[test]
    fn patch_does_not_disturb_sibling_fields() {
        let run = sample_run("r1", Some("s1"), RunStatus::Done);
        let mut record = HistoryRecord::from_run(&run);
        assert_eq!(record.analysis_text.as_deref(), Some("Анализ завершен."));

        let patch = RecordPatch {
            selected_reference_drug: Some("Миг".to_string()),
            ..Default::default()
        };
        patch.apply(&mut record);

        assert_eq!(record.selected_reference_drug.as_deref(), Some("Миг"));
        assert_eq!(record.analysis_text.as_deref(), Some("Анализ завершен."));
        assert_eq!(record.run_id.as_deref(), Some("r1"));
    }

    #[test]
    fn run_projection_carries_result_fields() {
        let run = sample_run("r1", Some("s1"), RunStatus::Done);
        let record = HistoryRecord::from_run(&run);

        assert_eq!(record.run_id.as_deref(), Some("r1"));
        assert_eq!(record.session_id.as_deref(), Some("s1"));
        assert_eq!(record.status, Some(RunStatus::Done));
        assert_eq!(record.matches_count, Some(12));
        assert_eq!(record.analysis_preview.as_deref(), Some("Анализ завершен."));
        assert!(record.selection_rows.is_some());
        assert!(record.synopsis_run_id.is_none());
    }

    #[test]
    fn long_analysis_text_is_truncated_for_preview() {
        let text = "я".repeat(ANALYSIS_PREVIEW_CHARS + 50);
        let patch = RecordPatch::default().with_analysis_text(&text);
        let excerpt = patch.analysis_preview.expect("preview");
        assert_eq!(excerpt.chars().count(), ANALYSIS_PREVIEW_CHARS + 1);
        assert!(excerpt.ends_with('…'));
        assert_eq!(patch.analysis_text.expect("full text").len(), text.len());
    }

    #[test]
    fn persisted_shape_is_camel_case() {
        let record = HistoryRecord::from_run(&sample_run("r1", Some("s1"), RunStatus::Done));
        let raw = serde_json::to_value(&record).expect("serialize");
        assert!(raw.get("runId").is_some());
        assert!(raw.get("selectedReferenceDrug").is_some());
        assert!(raw.get("run_id").is_none());
    }
}
