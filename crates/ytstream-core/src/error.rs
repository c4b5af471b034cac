//! Error types for ytstream core operations.
//!
//! Per-provider failures are modelled by [`ProviderError`](crate::provider::ProviderError)
//! and never leave the resolver on their own: they are collected into
//! [`Error::AllProvidersExhausted`] when every tier has failed.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A single failed provider attempt, kept for the exhaustion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Label of the tier the provider belongs to (or `sticky`).
    pub tier: String,
    /// Provider name.
    pub provider: String,
    /// Human-readable failure reason.
    pub reason: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.tier, self.provider, self.reason)
    }
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    if attempts.is_empty() {
        return "no providers configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur while operating the byte cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache directory could not be prepared.
    #[error("Cache initialization failed: {reason}")]
    InitializationFailed {
        /// Why initialization failed.
        reason: String,
    },

    /// A payload was smaller than the minimum valid size and was discarded.
    #[error("Partial download for {video_id}: {bytes} bytes (minimum {minimum})")]
    PartialDownload {
        /// Track the payload belonged to.
        video_id: String,
        /// Bytes received.
        bytes: u64,
        /// Minimum accepted size.
        minimum: u64,
    },

    /// Persisting bytes to disk failed.
    #[error("Disk write failed at {path}: {reason}")]
    WriteFailed {
        /// Target path.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// The metadata store lock was poisoned by a panicking writer.
    #[error("Metadata store lock poisoned")]
    LockPoisoned,
}

/// Errors that can occur while downloading audio bytes.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Every ranked format failed to download.
    #[error("No downloadable format for {video_id}: {reason}")]
    NoDownloadableFormat {
        /// Track being downloaded.
        video_id: String,
        /// Last failure seen.
        reason: String,
    },

    /// The upstream server answered with an error status.
    #[error("HTTP {status} while downloading {video_id}")]
    HttpStatus {
        /// Track being downloaded.
        video_id: String,
        /// Status code.
        status: u16,
    },

    /// Transport-level failure.
    #[error("Network error while downloading {video_id}: {reason}")]
    Network {
        /// Track being downloaded.
        video_id: String,
        /// Underlying reason.
        reason: String,
    },

    /// The library-ingest collaborator rejected the file.
    #[error("Library ingest failed for {video_id}: {reason}")]
    IngestFailed {
        /// Track being ingested.
        video_id: String,
        /// Underlying reason.
        reason: String,
    },
}

/// Errors that can occur in ytstream core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed track identifier, rejected before any network call.
    #[error("Invalid track identifier: {0}")]
    InvalidIdentifier(String),

    /// Every provider in every tier failed.
    #[error("All providers exhausted for {id}: {}", summarize(.attempts))]
    AllProvidersExhausted {
        /// Normalized identifier.
        id: String,
        /// Aggregated per-attempt reasons, in attempt order.
        attempts: Vec<AttemptFailure>,
    },

    /// Byte cache error.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Download error.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Metadata database error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Build an [`Error::InvalidIdentifier`] from anything displayable.
    pub fn invalid_identifier(raw: impl fmt::Display) -> Self {
        Self::InvalidIdentifier(raw.to_string())
    }

    /// Whether this error only reflects a cache-miss style condition.
    #[must_use]
    pub const fn is_partial_download(&self) -> bool {
        matches!(self, Self::Cache(CacheError::PartialDownload { .. }))
    }
}
