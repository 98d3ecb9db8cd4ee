//! Duration history.
//!
//! Elapsed seconds per canonical test id, stored as a flat JSON object at
//! `<root>/.yea_cache/durations.json`. The sharder reads it. `run
//! --store-durations` merges the current run into it.
//!
//! ```json
//! {
//!   "2.7": 12.5,
//!   "3.1.0-1-a": 0.84
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

/// Observed test durations, keyed by canonical id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurationHistory {
    entries: HashMap<String, f64>,
}

impl DurationHistory {
    /// Loads the history file.
    ///
    /// A missing or unreadable file yields an empty history; sharding then
    /// falls back to uniform estimates.
    pub fn load(path: &Path) -> Self {
        tracing::debug!("Loading duration history from: {}", path.display());

        if !path.exists() {
            tracing::debug!("Duration history does not exist, starting empty");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, f64>>(&contents) {
                Ok(entries) => {
                    tracing::debug!("Loaded {} durations", entries.len());
                    Self { entries }
                }
                Err(e) => {
                    tracing::warn!("Failed to parse duration history, ignoring it: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read duration history, ignoring it: {}", e);
                Self::default()
            }
        }
    }

    /// Writes the history, keys sorted, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create directory: {}", parent.display())
            })?;
        }

        let sorted: BTreeMap<&String, &f64> = self.entries.iter().collect();
        let contents =
            serde_json::to_string_pretty(&sorted).context("Failed to serialize durations")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        tracing::debug!("Saved {} durations to {}", self.entries.len(), path.display());
        Ok(())
    }

    /// Records durations, replacing older values for the same ids.
    pub fn merge(&mut self, observed: impl IntoIterator<Item = (String, f64)>) {
        for (id, secs) in observed {
            self.entries.insert(id, secs);
        }
    }

    pub fn get(&self, id: &str) -> Option<f64> {
        self.entries.get(id).copied()
    }

    pub fn as_map(&self) -> &HashMap<String, f64> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
