//! Collaborator seams of the harvester and the error types they speak.
//!
//! - [`Fetcher`] retrieves one document; the pipeline owns retry policy.
//! - [`ReleaseSource`] enumerates the known versions of a package.
//! - [`LicenseNormalizer`] maps raw license strings through a lookup table.
//! - [`PackageSink`] receives the normalized records; nothing is read back.

use crate::config::HarvestConfig;
use crate::model::{CanonicalRecord, CommonData, PackageId};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Failure to obtain an interpretable payload for a job.
///
/// Every variant is retried by the worker loop up to the configured bound.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Request to '{uri}' failed: {message}")]
    Request { uri: String, message: String },

    #[error("'{uri}' answered with HTTP status {status}")]
    Status { uri: String, status: u16 },

    #[error("'{uri}' timed out after {timeout_ms}ms")]
    Timeout { uri: String, timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container could not be unpacked
    #[error("Failed to unpack '{name}': {message}")]
    Archive { name: String, message: String },

    /// Single-stream payload could not be decompressed
    #[error("Failed to decompress '{name}': {message}")]
    Decompress { name: String, message: String },
}

/// Document did not have the expected shape.
///
/// Never propagated past the parser boundary: callers of
/// [`parse_index`](crate::harvest::formats::index::parse_index) and
/// [`parse_detail`](crate::harvest::formats::detail::parse_detail) get an
/// empty result instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Index document has no body container")]
    IndexUnavailable,

    #[error("Missing element: {0}")]
    MissingElement(String),

    #[error("Malformed file row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}

/// Persistence collaborator failure.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Unknown category '{0}'")]
    UnknownCategory(String),

    #[error("Failed to serialize records: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Collaborators
// ============================================================================

/// Raw document as named by the job (or by an archive member).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Payload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// Performs a single retrieval. No retry happens here.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Retrieves `uri`, naming the payload `output`.
    ///
    /// A `timeout` of `None` waits for the transport's own limit.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on network failure or a non-success status.
    async fn fetch(
        &self,
        uri: &str,
        output: &str,
        timeout: Option<Duration>,
    ) -> Result<Payload, DownloadError>;
}

/// Known releases of one package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseListing {
    pub versions: Vec<String>,
    pub summary: Option<String>,
}

/// Enumerates known versions per package name.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Failure degrades to an empty listing; implementations log it.
    async fn releases(&self, package: &str) -> ReleaseListing;
}

/// Maps a raw value through a named conversion table (e.g. `"licenses"`).
pub trait LicenseNormalizer: Send + Sync {
    fn normalize(&self, context: &HarvestConfig, table: &str, raw: &str) -> String;
}

/// Looks the value up in [`HarvestConfig::conversions`], falling back to the
/// raw value when the table or the key is missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigConversions;

impl LicenseNormalizer for ConfigConversions {
    fn normalize(&self, context: &HarvestConfig, table: &str, raw: &str) -> String {
        context
            .conversions
            .get(table)
            .and_then(|entries| entries.get(raw))
            .cloned()
            .unwrap_or_else(|| raw.to_string())
    }
}

/// Write-only package database.
pub trait PackageSink {
    fn add_category(&mut self, name: &str) -> Result<(), SinkError>;

    fn set_common_data(&mut self, category: &str, data: &CommonData) -> Result<(), SinkError>;

    fn add_package(&mut self, id: PackageId, record: CanonicalRecord) -> Result<(), SinkError>;
}
