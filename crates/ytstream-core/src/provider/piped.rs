//! Piped API provider (`GET {instance}/streams/{id}`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Provider, ProviderError, get_json, lenient_f64, lenient_u64, trim_base};
use crate::format::{AudioFormat, ResolvedStream, StreamPolicy};
use crate::identifier::TrackId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PipedStreams {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    duration: Option<f64>,
    #[serde(default)]
    audio_streams: Vec<PipedAudioStream>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipedAudioStream {
    #[serde(default)]
    url: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    bitrate: Option<u64>,
    #[serde(default)]
    codec: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    content_length: Option<u64>,
}

/// One Piped API instance.
#[derive(Debug, Clone)]
pub struct PipedProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    policy: StreamPolicy,
}

impl PipedProvider {
    /// Create a provider for the instance at `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, policy: StreamPolicy) -> Self {
        let base_url = trim_base(base_url);
        let name = format!("piped:{}", host_of(&base_url));
        Self {
            client,
            base_url,
            name,
            policy,
        }
    }
}

pub(crate) fn host_of(base_url: &str) -> String {
    reqwest::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| base_url.to_string())
}

pub(crate) fn parse_streams(
    body: PipedStreams,
    policy: &StreamPolicy,
) -> Result<ResolvedStream, ProviderError> {
    if let Some(error) = body.error.or(body.message)
        && body.audio_streams.is_empty()
    {
        return Err(ProviderError::Unplayable(error));
    }

    let duration = body.duration.filter(|d| *d > 0.0);
    let formats = body
        .audio_streams
        .into_iter()
        .map(|s| {
            let mime = s.mime_type.as_deref().unwrap_or("audio/webm");
            let mut format = AudioFormat::from_mime(
                mime,
                s.codec.as_deref(),
                s.bitrate.unwrap_or(0),
                s.url.filter(|u| !u.is_empty()),
            );
            format.size_bytes = s.content_length.filter(|n| *n > 0);
            format.quality_label = s.quality;
            format.duration_sec = duration;
            format
        })
        .collect();

    ResolvedStream::from_formats(formats, body.title, duration, policy)
        .ok_or(ProviderError::NoPlayableFormats)
}

#[async_trait]
impl Provider for PipedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(
        &self,
        id: &TrackId,
        timeout: Duration,
    ) -> Result<ResolvedStream, ProviderError> {
        let url = format!("{}/streams/{}", self.base_url, id);
        debug!("{} -> GET {}", self.name, url);
        let body: PipedStreams = get_json(self.client.get(&url), timeout).await?;
        parse_streams(body, &self.policy)
    }
}
