//! Track identifier parsing and normalization.
//!
//! A [`TrackId`] is the normalized, validated form of whatever the caller
//! handed in: a bare `YouTube` video id, a vendor-prefixed id such as
//! `yt:dQw4w9WgXcQ`, or a full watch URL.
//!
//! # Examples
//!
//! ```rust
//! use ytstream_core::identifier::TrackId;
//!
//! let id = TrackId::parse("ytm:dQw4w9WgXcQ").unwrap();
//! assert_eq!(id.as_str(), "dQw4w9WgXcQ");
//!
//! let id = TrackId::parse("https://youtu.be/dQw4w9WgXcQ?t=42").unwrap();
//! assert_eq!(id.as_str(), "dQw4w9WgXcQ");
//!
//! assert!(TrackId::parse("not an id").is_err());
//! ```

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Vendor prefixes stripped during normalization (matched case-insensitively).
const VENDOR_PREFIXES: [&str; 5] = ["ytmusic:", "youtube:", "ytm:", "yt:", "yt-"];

#[allow(clippy::unwrap_used)]
static VIDEO_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

/// Normalized identifier of a remote audio track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TrackId(String);

impl TrackId {
    /// Parse and validate a raw identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] when the normalized value is not an
    /// 11-character video id.
    pub fn parse(raw: &str) -> Result<Self> {
        // Real ids may legitimately start with something that looks like a prefix.
        let trimmed = raw.trim();
        if VIDEO_ID_RE.is_match(trimmed) {
            return Ok(Self(trimmed.to_string()));
        }

        let normalized = Self::normalize(raw);
        let candidate = extract_from_url(&normalized).unwrap_or(normalized);

        if VIDEO_ID_RE.is_match(&candidate) {
            Ok(Self(candidate))
        } else {
            Err(Error::invalid_identifier(raw.trim()))
        }
    }

    /// Strip whitespace and known vendor prefixes without validating.
    #[must_use]
    pub fn normalize(raw: &str) -> String {
        let mut value = raw.trim();
        loop {
            let lower = value.to_ascii_lowercase();
            let Some(prefix) = VENDOR_PREFIXES.iter().find(|p| lower.starts_with(*p)) else {
                break;
            };
            value = value[prefix.len()..].trim_start();
        }
        value.to_string()
    }

    /// The normalized identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical watch URL for this track.
    #[must_use]
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

/// Pull the video id out of a `YouTube` URL, if the value is one.
fn extract_from_url(value: &str) -> Option<String> {
    let url = Url::parse(value)
        .ok()
        .filter(Url::has_host)
        .or_else(|| Url::parse(&format!("https://{value}")).ok())?;
    let host = url.host_str()?;
    let short = host == "youtu.be";
    if !short && host != "youtube.com" && !host.ends_with(".youtube.com") {
        return None;
    }

    if let Some((_, id)) = url.query_pairs().find(|(key, _)| key == "v") {
        return Some(id.trim().to_string()).filter(|id| !id.is_empty());
    }

    let mut segments = url.path_segments()?;
    let id = if short {
        segments.next()?
    } else {
        segments
            .skip_while(|s| !["shorts", "embed", "live"].iter().any(|m| s.eq_ignore_ascii_case(m)))
            .nth(1)?
    };
    (!id.is_empty()).then(|| id.to_string())
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TrackId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TrackId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TrackId> for String {
    fn from(id: TrackId) -> Self {
        id.0
    }
}

impl std::str::FromStr for TrackId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
