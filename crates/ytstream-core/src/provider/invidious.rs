//! Invidious API provider (`GET {instance}/api/v1/videos/{id}`).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::piped::host_of;
use super::{Provider, ProviderError, get_json, lenient_f64, lenient_u64, trim_base};
use crate::format::{AudioFormat, ResolvedStream, StreamPolicy};
use crate::identifier::TrackId;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InvidiousVideo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    length_seconds: Option<f64>,
    #[serde(default)]
    adaptive_formats: Vec<InvidiousFormat>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvidiousFormat {
    #[serde(default)]
    url: Option<String>,
    #[serde(default, rename = "type")]
    mime: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    bitrate: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    clen: Option<u64>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    audio_quality: Option<String>,
}

/// One Invidious instance.
#[derive(Debug, Clone)]
pub struct InvidiousProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    policy: StreamPolicy,
}

impl InvidiousProvider {
    /// Create a provider for the instance at `base_url`.
    #[must_use]
    pub fn new(client: reqwest::Client, base_url: &str, policy: StreamPolicy) -> Self {
        let base_url = trim_base(base_url);
        let name = format!("invidious:{}", host_of(&base_url));
        Self {
            client,
            base_url,
            name,
            policy,
        }
    }
}

pub(crate) fn parse_video(
    body: InvidiousVideo,
    policy: &StreamPolicy,
) -> Result<ResolvedStream, ProviderError> {
    if let Some(error) = body.error {
        return Err(ProviderError::Unplayable(error));
    }

    let duration = body.length_seconds.filter(|d| *d > 0.0);
    let formats = body
        .adaptive_formats
        .into_iter()
        .filter(|f| f.mime.as_deref().is_some_and(|m| m.starts_with("audio/")))
        .map(|f| {
            let mime = f.mime.as_deref().unwrap_or_default();
            let mut format = AudioFormat::from_mime(
                mime,
                f.encoding.as_deref(),
                f.bitrate.unwrap_or(0),
                f.url.filter(|u| !u.is_empty()),
            );
            format.size_bytes = f.clen.filter(|n| *n > 0);
            format.quality_label = f.audio_quality;
            format.duration_sec = duration;
            format
        })
        .collect();

    ResolvedStream::from_formats(formats, body.title, duration, policy)
        .ok_or(ProviderError::NoPlayableFormats)
}

#[async_trait]
impl Provider for InvidiousProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(
        &self,
        id: &TrackId,
        timeout: Duration,
    ) -> Result<ResolvedStream, ProviderError> {
        let url = format!("{}/api/v1/videos/{}", self.base_url, id);
        debug!("{} -> GET {}", self.name, url);
        let request = self
            .client
            .get(&url)
            .query(&[("fields", "title,lengthSeconds,adaptiveFormats,error")]);
        let body: InvidiousVideo = get_json(request, timeout).await?;
        parse_video(body, &self.policy)
    }
}
