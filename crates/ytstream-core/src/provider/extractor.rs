//! Last-resort provider backed by the `rusty_ytdl` extractor.
//!
//! The extractor fetches the watch page and player JS itself and deciphers
//! signatures locally, so it works when every remote API is down. It is
//! slow, which is why it sits in the last tier with the longest deadline.

use std::time::Duration;

use async_trait::async_trait;
use rusty_ytdl::{Video, VideoOptions, VideoQuality, VideoSearchOptions};
use tracing::debug;

use super::{Provider, ProviderError};
use crate::format::{AudioFormat, ResolvedStream, StreamPolicy};
use crate::identifier::TrackId;

/// Provider name used for logging and sticky selection.
pub const EXTRACTOR_PROVIDER_NAME: &str = "extractor:rusty_ytdl";

/// Full-extraction fallback.
#[derive(Debug, Clone)]
pub struct ExtractorProvider {
    policy: StreamPolicy,
}

impl ExtractorProvider {
    /// Create the extractor provider.
    #[must_use]
    pub const fn new(policy: StreamPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Provider for ExtractorProvider {
    fn name(&self) -> &str {
        EXTRACTOR_PROVIDER_NAME
    }

    async fn resolve(
        &self,
        id: &TrackId,
        _timeout: Duration,
    ) -> Result<ResolvedStream, ProviderError> {
        let options = VideoOptions {
            quality: VideoQuality::HighestAudio,
            filter: VideoSearchOptions::Audio,
            ..Default::default()
        };

        let video = Video::new_with_options(id.as_str(), options)
            .map_err(|e| ProviderError::Extraction(e.to_string()))?;
        let info = video
            .get_info()
            .await
            .map_err(|e| ProviderError::Extraction(e.to_string()))?;

        debug!(
            "{} extracted {} formats for {}",
            EXTRACTOR_PROVIDER_NAME,
            info.formats.len(),
            id
        );

        let duration = info
            .video_details
            .length_seconds
            .parse::<f64>()
            .ok()
            .filter(|d| *d > 0.0);

        let formats = info
            .formats
            .iter()
            .filter(|f| f.has_audio && !f.has_video)
            .map(|f| {
                let mime = f.mime_type.mime.to_string();
                let mut format = AudioFormat::from_mime(
                    &mime,
                    f.mime_type.codecs.first().map(String::as_str),
                    f.bitrate,
                    Some(f.url.clone()).filter(|u| !u.is_empty()),
                );
                format.size_bytes = f
                    .content_length
                    .as_deref()
                    .and_then(|n| n.parse().ok())
                    .filter(|n| *n > 0);
                format.duration_sec = duration;
                format
            })
            .collect();

        let title = Some(info.video_details.title.clone()).filter(|t| !t.is_empty());
        ResolvedStream::from_formats(formats, title, duration, &self.policy)
            .ok_or(ProviderError::NoPlayableFormats)
    }
}
