use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Drawer flags remembered between sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub history_drawer_open: bool,
    #[serde(default)]
    pub details_drawer_open: bool,
}

/// Preferences file, recoverable independently of the history cache.
pub struct PrefsStore {
    path: PathBuf,
}

impl PrefsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Preferences {
        if let Ok(content) = fs::read_to_string(&self.path) {
            if let Ok(prefs) = serde_json::from_str::<Preferences>(&content) {
                return prefs;
            }
            warn!("prefs_load_failed: {}", self.path.display());
        }
        Preferences::default()
    }

    pub fn save(&self, prefs: &Preferences) {
        let result = (|| -> Result<(), crate::StoreError> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let payload = serde_json::to_string_pretty(prefs)?;
            fs::write(&self.path, payload)?;
            Ok(())
        })();
        if let Err(err) = result {
            warn!("prefs_save_failed: {err}");
        }
    }
}
