//! InnerTube player API provider, one instance per client flavor.
//!
//! Different clients get different treatment from the player endpoint: some
//! receive direct URLs, others only a `signatureCipher` that needs player JS
//! to decode. Cipher-only formats have no `url` here and are never selected;
//! tracks that only come back ciphered fall through to the extractor tier.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{Provider, ProviderError, get_json, lenient_f64, lenient_u64, trim_base};
use crate::format::{AudioFormat, ResolvedStream, StreamPolicy};
use crate::identifier::TrackId;

/// Default InnerTube host.
pub const DEFAULT_INNERTUBE_BASE_URL: &str = "https://www.youtube.com";

/// InnerTube client flavors, in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InnerTubeClient {
    /// iOS app client.
    #[serde(rename = "IOS")]
    Ios,
    /// Android VR client.
    #[serde(rename = "ANDROID_VR")]
    AndroidVr,
    /// Embedded TV player.
    #[serde(rename = "TVHTML5_SIMPLY_EMBEDDED_PLAYER")]
    TvEmbedded,
    /// YouTube Music web client.
    #[serde(rename = "WEB_REMIX")]
    WebRemix,
}

struct ClientProfile {
    name: &'static str,
    version: &'static str,
    id: u32,
    user_agent: &'static str,
    device_make: Option<&'static str>,
    device_model: Option<&'static str>,
    os_name: Option<&'static str>,
    os_version: Option<&'static str>,
    android_sdk_version: Option<u32>,
}

const IOS: ClientProfile = ClientProfile {
    name: "IOS",
    version: "20.03.02",
    id: 5,
    user_agent: "com.google.ios.youtube/20.03.02 (iPhone16,2; U; CPU iOS 18_2_1 like Mac OS X;)",
    device_make: Some("Apple"),
    device_model: Some("iPhone16,2"),
    os_name: Some("iPhone"),
    os_version: Some("18.2.1.22C161"),
    android_sdk_version: None,
};

const ANDROID_VR: ClientProfile = ClientProfile {
    name: "ANDROID_VR",
    version: "1.62.27",
    id: 28,
    user_agent: "com.google.android.apps.youtube.vr.oculus/1.62.27 (Linux; U; Android 12L; eureka-user Build/SQ3A.220605.009.A1) gzip",
    device_make: Some("Oculus"),
    device_model: Some("Quest 3"),
    os_name: Some("Android"),
    os_version: Some("12L"),
    android_sdk_version: Some(32),
};

const TV_EMBEDDED: ClientProfile = ClientProfile {
    name: "TVHTML5_SIMPLY_EMBEDDED_PLAYER",
    version: "2.0",
    id: 85,
    user_agent: "Mozilla/5.0 (PlayStation; PlayStation 4/12.00) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.4 Safari/605.1.15",
    device_make: None,
    device_model: None,
    os_name: None,
    os_version: None,
    android_sdk_version: None,
};

const WEB_REMIX: ClientProfile = ClientProfile {
    name: "WEB_REMIX",
    version: "1.20250122.01.00",
    id: 67,
    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    device_make: None,
    device_model: None,
    os_name: None,
    os_version: None,
    android_sdk_version: None,
};

impl InnerTubeClient {
    /// All flavors in default priority order.
    pub const ALL: [Self; 4] = [Self::Ios, Self::AndroidVr, Self::TvEmbedded, Self::WebRemix];

    const fn profile(self) -> &'static ClientProfile {
        match self {
            Self::Ios => &IOS,
            Self::AndroidVr => &ANDROID_VR,
            Self::TvEmbedded => &TV_EMBEDDED,
            Self::WebRemix => &WEB_REMIX,
        }
    }

    /// Wire name of the client.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.profile().name
    }

    fn context(self, id: &TrackId) -> serde_json::Value {
        let profile = self.profile();
        let mut client = json!({
            "clientName": profile.name,
            "clientVersion": profile.version,
            "hl": "en",
            "gl": "US",
            "timeZone": "UTC",
            "utcOffsetMinutes": 0,
        });
        if let (Some(make), Some(model), Some(os), Some(os_version)) = (
            profile.device_make,
            profile.device_model,
            profile.os_name,
            profile.os_version,
        ) {
            client["deviceMake"] = json!(make);
            client["deviceModel"] = json!(model);
            client["osName"] = json!(os);
            client["osVersion"] = json!(os_version);
        }
        if let Some(sdk) = profile.android_sdk_version {
            client["androidSdkVersion"] = json!(sdk);
        }

        let mut context = json!({ "client": client });
        if self == Self::TvEmbedded {
            context["thirdParty"] = json!({ "embedUrl": id.watch_url() });
        }

        json!({
            "videoId": id.as_str(),
            "context": context,
            "contentCheckOk": true,
            "racyCheckOk": true,
        })
    }
}

impl fmt::Display for InnerTubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PlayerResponse {
    #[serde(default)]
    playability_status: Option<PlayabilityStatus>,
    #[serde(default)]
    video_details: Option<VideoDetails>,
    #[serde(default)]
    streaming_data: Option<StreamingData>,
}

#[derive(Debug, Deserialize)]
struct PlayabilityStatus {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetails {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    length_seconds: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingData {
    #[serde(default)]
    adaptive_formats: Vec<PlayerFormat>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerFormat {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    bitrate: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    content_length: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    approx_duration_ms: Option<u64>,
    #[serde(default)]
    audio_quality: Option<String>,
}

pub(crate) fn parse_player(
    body: PlayerResponse,
    policy: &StreamPolicy,
) -> Result<ResolvedStream, ProviderError> {
    if let Some(status) = body.playability_status {
        let state = status.status.unwrap_or_default();
        if state != "OK" {
            let reason = status.reason.unwrap_or(state);
            return Err(ProviderError::Unplayable(reason));
        }
    }

    let (title, length) = body
        .video_details
        .map(|d| (d.title, d.length_seconds))
        .unwrap_or_default();
    let length = length.filter(|d| *d > 0.0);

    let formats = body
        .streaming_data
        .map(|s| s.adaptive_formats)
        .unwrap_or_default()
        .into_iter()
        .filter(|f| {
            f.mime_type
                .as_deref()
                .is_some_and(|m| m.starts_with("audio/"))
        })
        .map(|f| {
            let mut format = AudioFormat::from_mime(
                f.mime_type.as_deref().unwrap_or_default(),
                None,
                f.bitrate.unwrap_or(0),
                f.url.filter(|u| !u.is_empty()),
            );
            format.size_bytes = f.content_length.filter(|n| *n > 0);
            format.duration_sec = f
                .approx_duration_ms
                .map(|ms| ms as f64 / 1000.0)
                .or(length);
            format.quality_label = f.audio_quality;
            format
        })
        .collect();

    ResolvedStream::from_formats(formats, title, length, policy)
        .ok_or(ProviderError::NoPlayableFormats)
}

/// InnerTube `/player` provider for one client flavor.
#[derive(Debug, Clone)]
pub struct InnerTubeProvider {
    client: reqwest::Client,
    base_url: String,
    kind: InnerTubeClient,
    name: String,
    policy: StreamPolicy,
}

impl InnerTubeProvider {
    /// Create a provider for `kind` against `base_url`.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        kind: InnerTubeClient,
        policy: StreamPolicy,
    ) -> Self {
        Self {
            client,
            base_url: trim_base(base_url),
            kind,
            name: format!("innertube:{kind}"),
            policy,
        }
    }

    /// The client flavor.
    #[must_use]
    pub const fn kind(&self) -> InnerTubeClient {
        self.kind
    }
}

#[async_trait]
impl Provider for InnerTubeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(
        &self,
        id: &TrackId,
        timeout: Duration,
    ) -> Result<ResolvedStream, ProviderError> {
        let profile = self.kind.profile();
        let url = format!("{}/youtubei/v1/player?prettyPrint=false", self.base_url);
        debug!("{} -> POST {} ({})", self.name, url, id);

        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::USER_AGENT, profile.user_agent)
            .header("X-YouTube-Client-Name", profile.id.to_string())
            .header("X-YouTube-Client-Version", profile.version)
            .json(&self.kind.context(id));
        if self.kind == InnerTubeClient::WebRemix {
            request = request
                .header(reqwest::header::ORIGIN, "https://music.youtube.com")
                .header(reqwest::header::REFERER, "https://music.youtube.com/");
        }

        let body: PlayerResponse = get_json(request, timeout).await?;
        parse_player(body, &self.policy)
    }
}
