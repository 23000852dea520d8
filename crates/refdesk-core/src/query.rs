use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The immutable search parameters that start a history record.
///
/// Field names match the service wire format; all five are required by the
/// server, so [`SearchQuery::validate`] is checked before any request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub mnn: String,
    pub routes: String,
    pub base_form: String,
    pub release_type: String,
    pub dosage: String,
}

#[derive(Debug, Error)]
#[error("missing required fields: {}", fields.join(", "))]
pub struct QueryError {
    pub fields: Vec<&'static str>,
}

impl SearchQuery {
    pub fn validate(&self) -> Result<(), QueryError> {
        let mut fields = Vec::new();
        for (name, value) in [
            ("mnn", &self.mnn),
            ("routes", &self.routes),
            ("base_form", &self.base_form),
            ("release_type", &self.release_type),
            ("dosage", &self.dosage),
        ] {
            if value.trim().is_empty() {
                fields.push(name);
            }
        }
        if fields.is_empty() {
            Ok(())
        } else {
            Err(QueryError { fields })
        }
    }
}
