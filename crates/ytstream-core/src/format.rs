//! Audio formats, format ranking, and resolved stream expiry.
//!
//! Providers hand back raw format lists; [`ResolvedStream::from_formats`] is
//! the single place where unusable formats are dropped, the remainder is
//! ranked, and the expiry of the signed URLs is derived.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Default codec preferred by the ranking policy.
pub const DEFAULT_PREFERRED_CODEC: &str = "opus";

/// Lifetime assumed for stream URLs that carry no `expire` parameter (5 hours).
pub const DEFAULT_STREAM_TTL: Duration = Duration::from_secs(5 * 60 * 60);

/// Safety margin subtracted from a URL's embedded expiry (5 minutes).
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A single audio rendition offered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Normalized codec name (`opus`, `mp4a`, ...).
    pub codec: String,
    /// Bitrate in bits per second.
    pub bitrate_bps: u64,
    /// Duration in seconds, when the provider reports it.
    #[serde(default)]
    pub duration_sec: Option<f64>,
    /// Stream URL. A format without one can never be selected.
    #[serde(default)]
    pub url: Option<String>,
    /// Payload size in bytes, when known.
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Base MIME type without parameters (`audio/webm`).
    pub mime_type: String,
    /// Provider quality label (`AUDIO_QUALITY_MEDIUM`, `128 kbps`, ...).
    #[serde(default)]
    pub quality_label: Option<String>,
}

impl AudioFormat {
    /// Build a format from a full MIME string such as `audio/webm; codecs="opus"`.
    ///
    /// `codec_hint` is used when the MIME string carries no `codecs` parameter.
    #[must_use]
    pub fn from_mime(
        mime: &str,
        codec_hint: Option<&str>,
        bitrate_bps: u64,
        url: Option<String>,
    ) -> Self {
        let (mime_type, codec) = split_mime(mime);
        let codec = codec
            .or_else(|| codec_hint.map(normalize_codec))
            .unwrap_or_default();
        Self {
            codec,
            bitrate_bps,
            duration_sec: None,
            url,
            size_bytes: None,
            mime_type,
            quality_label: None,
        }
    }

    /// Whether this format has an absolute http(s) URL.
    #[must_use]
    pub fn is_playable(&self) -> bool {
        self.url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .is_some_and(|u| matches!(u.scheme(), "http" | "https"))
    }

    /// File extension used when this format is stored in the byte cache.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "audio/webm" => "webm",
            "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
            "audio/mpeg" => "mp3",
            "audio/ogg" => "ogg",
            _ => match self.codec.as_str() {
                "opus" | "vorbis" => "webm",
                "mp4a" | "aac" => "m4a",
                "mp3" => "mp3",
                _ => "bin",
            },
        }
    }

    /// Unix time at which the signed URL stops working, if it says so.
    #[must_use]
    pub fn url_expiry(&self) -> Option<u64> {
        self.url.as_deref().and_then(parse_url_expiry)
    }

    fn rank_key(&self, preferred_codec: &str) -> (bool, u64) {
        (self.codec.eq_ignore_ascii_case(preferred_codec), self.bitrate_bps)
    }
}

/// Split a MIME string into its base type and normalized codec.
#[must_use]
pub fn split_mime(mime: &str) -> (String, Option<String>) {
    let mut parts = mime.split(';');
    let base = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let codec = parts
        .filter_map(|p| p.trim().strip_prefix("codecs="))
        .map(|c| c.trim_matches(|ch| ch == '"' || ch == '\''))
        .filter_map(|c| c.split(',').next())
        .map(normalize_codec)
        .find(|c| !c.is_empty());
    (base, codec)
}

/// Normalize a codec string: lowercase, profile suffix removed (`mp4a.40.2` -> `mp4a`).
#[must_use]
pub fn normalize_codec(codec: &str) -> String {
    codec
        .trim()
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Read the `expire` value from a signed stream URL.
///
/// Supports both the query form (`?expire=1700000000`) and the path form
/// used by some CDNs (`/expire/1700000000/`).
#[must_use]
pub fn parse_url_expiry(url: &str) -> Option<u64> {
    let parsed = Url::parse(url).ok()?;
    if let Some(value) = parsed
        .query_pairs()
        .find(|(key, _)| key == "expire")
        .and_then(|(_, value)| value.parse().ok())
    {
        return Some(value);
    }

    let mut segments = parsed.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "expire" {
            return segments.next().and_then(|v| v.parse().ok());
        }
    }
    None
}

/// Ranking and expiry policy applied to every provider result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPolicy {
    /// Codec ranked above all others regardless of bitrate.
    pub preferred_codec: String,
    /// Lifetime assumed when the chosen URL has no embedded expiry.
    pub default_ttl: Duration,
    /// Margin subtracted from an embedded expiry.
    pub expiry_margin: Duration,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            preferred_codec: DEFAULT_PREFERRED_CODEC.to_string(),
            default_ttl: DEFAULT_STREAM_TTL,
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
        }
    }
}

impl StreamPolicy {
    /// Expiry of a stream whose best format is `best`, evaluated at `now`.
    #[must_use]
    pub fn expiry_for(&self, best: &AudioFormat, now: u64) -> u64 {
        best.url_expiry().map_or_else(
            || now.saturating_add(self.default_ttl.as_secs()),
            |expire| expire.saturating_sub(self.expiry_margin.as_secs()),
        )
    }
}

/// A ranked set of playable formats with a computed expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStream {
    /// Playable formats, best first.
    pub formats: Vec<AudioFormat>,
    /// Unix time after which the URLs must not be used.
    pub expires_at: u64,
    /// Track title, when the provider reported one.
    #[serde(default)]
    pub title: Option<String>,
    /// Track duration in seconds, when known.
    #[serde(default)]
    pub duration_sec: Option<f64>,
}

impl ResolvedStream {
    /// Rank `formats` under `policy` and derive the expiry.
    ///
    /// Returns `None` when no playable format remains.
    #[must_use]
    pub fn from_formats(
        formats: Vec<AudioFormat>,
        title: Option<String>,
        duration_sec: Option<f64>,
        policy: &StreamPolicy,
    ) -> Option<Self> {
        Self::from_formats_at(formats, title, duration_sec, policy, unix_now())
    }

    /// Same as [`ResolvedStream::from_formats`] with an explicit clock.
    #[must_use]
    pub fn from_formats_at(
        formats: Vec<AudioFormat>,
        title: Option<String>,
        duration_sec: Option<f64>,
        policy: &StreamPolicy,
        now: u64,
    ) -> Option<Self> {
        let mut formats: Vec<AudioFormat> =
            formats.into_iter().filter(AudioFormat::is_playable).collect();
        formats.sort_by(|a, b| {
            b.rank_key(&policy.preferred_codec)
                .cmp(&a.rank_key(&policy.preferred_codec))
        });

        let best = formats.first()?;
        let expires_at = policy.expiry_for(best, now);
        let duration_sec = duration_sec.or(best.duration_sec);

        Some(Self {
            formats,
            expires_at,
            title,
            duration_sec,
        })
    }

    /// The top-ranked format.
    #[must_use]
    pub fn best(&self) -> Option<&AudioFormat> {
        self.formats.first()
    }

    /// Whether the stream is still usable at `now`.
    #[must_use]
    pub const fn is_fresh_at(&self, now: u64) -> bool {
        now < self.expires_at
    }

    /// Whether the stream is still usable right now.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(unix_now())
    }
}
