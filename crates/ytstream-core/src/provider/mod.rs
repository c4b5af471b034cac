//! Upstream resolution backends.
//!
//! Every backend implements [`Provider`]: given a track id and a deadline,
//! return a ranked [`ResolvedStream`] or say why not. The resolver never
//! needs to know which API sits behind a provider.
//!
//! Backends are grouped into [`ProviderTier`]s. A tier is either raced (all
//! providers at once, first success wins) or walked in order. The default
//! chain built by [`ProviderChain::from_config`] is:
//!
//! | Tier        | Strategy   | Providers                                   |
//! |-------------|------------|---------------------------------------------|
//! | `fast`      | race       | one [`PipedProvider`] / [`InvidiousProvider`] per instance |
//! | `secondary` | sequential | one [`InnerTubeProvider`] per client flavor |
//! | `extractor` | sequential | [`ExtractorProvider`]                       |

mod extractor;
mod innertube;
mod invidious;
mod piped;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::format::ResolvedStream;
use crate::identifier::TrackId;
use crate::resolver::ResolverConfig;

pub use extractor::{EXTRACTOR_PROVIDER_NAME, ExtractorProvider};
pub use innertube::{DEFAULT_INNERTUBE_BASE_URL, InnerTubeClient, InnerTubeProvider};
pub use invidious::InvidiousProvider;
pub use piped::PipedProvider;

/// Why a single provider attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The attempt did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Connection, TLS or protocol failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered with a non-success status.
    #[error("HTTP {0}")]
    HttpStatus(u16),

    /// Upstream says the track cannot be played.
    #[error("not playable: {0}")]
    Unplayable(String),

    /// The answer contained no format with a usable URL.
    #[error("no playable formats")]
    NoPlayableFormats,

    /// The answer could not be decoded.
    #[error("invalid response: {0}")]
    Decode(String),

    /// The local extractor failed.
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::HttpStatus(status.as_u16())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// An upstream resolution backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable name, used for logging and as the sticky-provider key.
    fn name(&self) -> &str;

    /// Resolve `id` to a ranked stream.
    ///
    /// `timeout` is advisory for the provider's own I/O; the resolver
    /// enforces it independently.
    async fn resolve(&self, id: &TrackId, timeout: Duration)
    -> Result<ResolvedStream, ProviderError>;
}

/// How the providers of a tier are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierStrategy {
    /// All at once, first success wins.
    Race,
    /// One after another, in order.
    Sequential,
}

/// A priority group of providers.
#[derive(Clone)]
pub struct ProviderTier {
    /// Label used in logs and failure reports.
    pub label: String,
    /// How the providers are tried.
    pub strategy: TierStrategy,
    /// Deadline for each attempt in this tier.
    pub timeout: Duration,
    /// Providers, in priority order.
    pub providers: Vec<Arc<dyn Provider>>,
}

impl ProviderTier {
    /// Create an empty tier.
    #[must_use]
    pub fn new(label: impl Into<String>, strategy: TierStrategy, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            strategy,
            timeout,
            providers: Vec::new(),
        }
    }

    /// Append a provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }
}

impl fmt::Debug for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTier")
            .field("label", &self.label)
            .field("strategy", &self.strategy)
            .field("timeout", &self.timeout)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Ordered list of tiers.
#[derive(Debug, Clone, Default)]
pub struct ProviderChain {
    tiers: Vec<ProviderTier>,
}

impl ProviderChain {
    /// Build a chain from explicit tiers.
    #[must_use]
    pub const fn new(tiers: Vec<ProviderTier>) -> Self {
        Self { tiers }
    }

    /// Build the default three-tier chain.
    #[must_use]
    pub fn from_config(config: &ResolverConfig, client: &reqwest::Client) -> Self {
        let policy = config.stream_policy();

        let mut fast = ProviderTier::new("fast", TierStrategy::Race, config.fast_timeout());
        for base in &config.piped_instances {
            fast = fast.with_provider(Arc::new(PipedProvider::new(
                client.clone(),
                base,
                policy.clone(),
            )));
        }
        for base in &config.invidious_instances {
            fast = fast.with_provider(Arc::new(InvidiousProvider::new(
                client.clone(),
                base,
                policy.clone(),
            )));
        }

        let mut secondary = ProviderTier::new(
            "secondary",
            TierStrategy::Sequential,
            config.secondary_timeout(),
        );
        for kind in &config.innertube_clients {
            secondary = secondary.with_provider(Arc::new(InnerTubeProvider::new(
                client.clone(),
                &config.innertube_base_url,
                *kind,
                policy.clone(),
            )));
        }

        let mut tiers = vec![fast, secondary];
        if config.enable_extractor {
            tiers.push(
                ProviderTier::new(
                    "extractor",
                    TierStrategy::Sequential,
                    config.extractor_timeout(),
                )
                .with_provider(Arc::new(ExtractorProvider::new(policy))),
            );
        }

        Self::new(tiers.into_iter().filter(|t| !t.providers.is_empty()).collect())
    }

    /// Tiers in priority order.
    #[must_use]
    pub fn tiers(&self) -> &[ProviderTier] {
        &self.tiers
    }

    /// Find a provider by name, with the tier it belongs to.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<(&ProviderTier, &Arc<dyn Provider>)> {
        self.tiers.iter().find_map(|tier| {
            tier.providers
                .iter()
                .find(|p| p.name() == name)
                .map(|p| (tier, p))
        })
    }

    /// Total number of providers across tiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.iter().map(|t| t.providers.len()).sum()
    }

    /// Whether the chain has no providers at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Send a request and decode the JSON body.
pub(crate) async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let response = request.timeout(timeout).send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::from(e)
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::HttpStatus(status.as_u16()));
    }

    let body = response.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(timeout)
        } else {
            ProviderError::from(e)
        }
    })?;
    serde_json::from_slice(&body).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// Strip a trailing slash so paths can be appended with `format!`.
pub(crate) fn trim_base(base: &str) -> String {
    base.trim().trim_end_matches('/').to_string()
}

/// Accept a number, a numeric string, or null.
pub(crate) fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Int(n)) => u64::try_from(n).ok(),
        Some(Raw::Float(f)) if f >= 0.0 => Some(f as u64),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Same as [`lenient_u64`] but for fractional values.
pub(crate) fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Num(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}
