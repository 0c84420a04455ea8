//! Category denylist for classifier noise.

use std::collections::HashSet;

use tracing::info;

use crate::config::CategoryConfig;
use crate::models::task::category_key;

/// Normalized set of category labels that never become tasks.
#[derive(Debug, Clone, Default)]
pub struct CategoryDenylist {
    version: u32,
    labels: HashSet<String>,
}

impl CategoryDenylist {
    /// Build from configuration. Labels are trimmed and lowercased; blanks are dropped.
    #[must_use]
    pub fn from_config(config: &CategoryConfig) -> Self {
        let labels: HashSet<String> = config
            .denylist
            .iter()
            .map(|label| category_key(label))
            .filter(|label| !label.is_empty())
            .collect();
        info!(version = config.version, labels = labels.len(), "category denylist loaded");
        Self {
            version: config.version,
            labels,
        }
    }

    /// Whether a category is noise. An empty category always is.
    #[must_use]
    pub fn is_denied(&self, category: &str) -> bool {
        let key = category_key(category);
        key.is_empty() || self.labels.contains(&key)
    }

    /// Configured denylist revision.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }
}
