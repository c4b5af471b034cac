//! Hand-off of downloaded tracks to a music library.
//!
//! The library itself (scanning, tagging, database) lives elsewhere. This
//! module only defines the seam and a folder-backed implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DownloadError, Result};
use crate::identifier::TrackId;

/// Maximum file stem length produced by [`sanitize_filename`].
const MAX_FILENAME_LEN: usize = 200;

/// A cached track plus the tags the caller knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    /// Track id.
    pub id: TrackId,
    /// Cached audio file.
    pub source_path: PathBuf,
    /// Track title.
    pub title: Option<String>,
    /// Artist name.
    pub artist: Option<String>,
    /// Album name.
    pub album: Option<String>,
    /// Cover art URL.
    pub artwork_url: Option<String>,
}

impl IngestRequest {
    /// File stem for the library copy: `<artist> - <title>`, the title
    /// alone, or the id when neither is known.
    pub fn display_name(&self) -> String {
        let title = self.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
        let artist = self.artist.as_deref().map(str::trim).filter(|a| !a.is_empty());
        match (artist, title) {
            (Some(artist), Some(title)) => format!("{artist} - {title}"),
            (None, Some(title)) => title.to_string(),
            _ => self.id.to_string(),
        }
    }
}

/// Receives finished downloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LibraryIngest: Send + Sync {
    /// Add the track to the library and return where it ended up.
    async fn ingest(&self, request: IngestRequest) -> Result<PathBuf>;
}

/// Copies tracks into a flat folder.
#[derive(Debug, Clone)]
pub struct FolderIngest {
    library_dir: PathBuf,
}

impl FolderIngest {
    /// Create an ingest targeting `library_dir`. The folder is created on
    /// first use.
    pub fn new(library_dir: impl Into<PathBuf>) -> Self {
        Self {
            library_dir: library_dir.into(),
        }
    }

    /// Target folder.
    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    fn target_for(&self, request: &IngestRequest) -> PathBuf {
        let mut stem = sanitize_filename(&request.display_name());
        if stem.is_empty() {
            stem = request.id.to_string();
        }
        let extension = request
            .source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin");
        self.library_dir.join(format!("{stem}.{extension}"))
    }
}

#[async_trait]
impl LibraryIngest for FolderIngest {
    async fn ingest(&self, request: IngestRequest) -> Result<PathBuf> {
        let failed = |e: std::io::Error| DownloadError::IngestFailed {
            video_id: request.id.to_string(),
            reason: e.to_string(),
        };

        tokio::fs::create_dir_all(&self.library_dir)
            .await
            .map_err(failed)?;

        let target = self.target_for(&request);
        let bytes = tokio::fs::copy(&request.source_path, &target)
            .await
            .map_err(failed)?;

        info!(
            "Ingested {} into library as {} ({} bytes)",
            request.id,
            target.display(),
            bytes
        );
        Ok(target)
    }
}

/// Make a string safe to use as a file name on every common filesystem.
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .map(|c| {
            if invalid_chars.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = sanitized.trim().trim_matches('.').trim();
    trimmed.chars().take(MAX_FILENAME_LEN).collect()
}
