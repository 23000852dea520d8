pub mod identity;
pub mod query;
pub mod reconcile;
pub mod record;
pub mod run;

pub use query::{QueryError, SearchQuery};
pub use reconcile::{reconcile, ReconcileOutcome};
pub use record::{HistoryRecord, RecordPatch, ANALYSIS_PREVIEW_CHARS};
pub use run::{ReferenceOption, RunInfo, RunStatus, SampleRow, SynopsisInfo};
