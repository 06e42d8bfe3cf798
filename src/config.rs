//! Run configuration.
//!
//! Loaded from a JSON file with [`HarvestConfig::from_file`]; every field has
//! a default so a partial file (or none at all) is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::model::CommonData;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Catalog base, e.g. `https://pypi.python.org/`
    pub repo_uri: String,

    /// Release-metadata endpoint; `{name}` is replaced with the package name
    pub releases_uri: String,

    /// Worker count; `None` means twice the available parallelism
    pub workers: Option<usize>,

    /// Attempts per job before it is dropped
    pub max_attempts: u32,

    pub index_timeout_secs: Option<u64>,
    pub detail_timeout_secs: Option<u64>,

    /// `None` keeps the job queue unbounded; `Some(n)` blocks enqueue at `n`
    pub queue_capacity: Option<usize>,

    /// Delay between polls while draining the completion channel
    pub drain_poll_ms: u64,

    /// Stop after this many index entries
    pub max_packages: Option<usize>,

    /// Category every harvested package is filed under
    pub category: String,

    pub common: CommonData,

    /// Named lookup tables (e.g. `"licenses"`) for the normalization step
    pub conversions: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            repo_uri: "https://pypi.python.org/".to_string(),
            releases_uri: "https://pypi.python.org/pypi/{name}/json".to_string(),
            workers: None,
            max_attempts: 100,
            index_timeout_secs: None,
            detail_timeout_secs: Some(2),
            queue_capacity: None,
            drain_poll_ms: 1000,
            max_packages: None,
            category: "dev-python".to_string(),
            common: CommonData::default(),
            conversions: BTreeMap::new(),
        }
    }
}

impl HarvestConfig {
    /// Reads a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or deserialized.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn with_repo_uri(mut self, repo_uri: impl Into<String>) -> Self {
        self.repo_uri = repo_uri.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity.max(1));
        self
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll_ms = u64::try_from(poll.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_max_packages(mut self, max_packages: usize) -> Self {
        self.max_packages = Some(max_packages);
        self
    }

    /// Effective pool size, fixed for one run.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(2)
        })
    }

    pub fn index_uri(&self) -> String {
        format!("{}/simple", self.repo_uri.trim_end_matches('/'))
    }

    pub fn detail_uri(&self, package: &str, version: &str) -> String {
        format!(
            "{}/pypi/{}/{}",
            self.repo_uri.trim_end_matches('/'),
            package,
            version
        )
    }

    pub fn releases_uri_for(&self, package: &str) -> String {
        self.releases_uri.replace("{name}", package)
    }

    pub fn index_timeout(&self) -> Option<Duration> {
        self.index_timeout_secs.map(Duration::from_secs)
    }

    pub fn detail_timeout(&self) -> Option<Duration> {
        self.detail_timeout_secs.map(Duration::from_secs)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}
