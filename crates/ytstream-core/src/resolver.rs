//! Track id to playable stream resolution.
//!
//! Resolution order:
//!
//! 1. the metadata cache (fresh hit returns immediately);
//! 2. the sticky provider alone, under its own tier's deadline;
//! 3. each tier of the [`ProviderChain`] in order, raced or sequential.
//!
//! The first success is re-ranked under the resolver's [`StreamPolicy`],
//! written back to the metadata cache, and its provider becomes sticky.
//! Failures are collected and only surface, all together, as
//! [`Error::AllProvidersExhausted`]. Failed resolutions are not cached.
//! A provider whose URLs already fall inside the expiry margin has failed.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AttemptFailure, Error, Result};
use crate::format::{
    DEFAULT_EXPIRY_MARGIN, DEFAULT_PREFERRED_CODEC, DEFAULT_STREAM_TTL, ResolvedStream,
    StreamPolicy,
};
use crate::identifier::TrackId;
use crate::metadata_cache::MetadataCache;
use crate::provider::{
    DEFAULT_INNERTUBE_BASE_URL, InnerTubeClient, Provider, ProviderChain, ProviderError,
    ProviderTier, TierStrategy,
};

/// Default per-attempt deadline for the fast tier.
pub const DEFAULT_FAST_TIMEOUT_SECS: u64 = 5;

/// Default per-attempt deadline for the secondary tier.
pub const DEFAULT_SECONDARY_TIMEOUT_SECS: u64 = 8;

/// Default deadline for the extractor.
pub const DEFAULT_EXTRACTOR_TIMEOUT_SECS: u64 = 30;

/// Default upper bound on how long a metadata row is served (6 hours).
pub const DEFAULT_MAX_METADATA_TTL_SECS: u64 = 6 * 60 * 60;

/// Upper bound for any configured per-attempt deadline.
pub const MAX_TIMEOUT_SECS: u64 = 120;

const STICKY_LABEL: &str = "sticky";

/// Resolver and provider chain options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Piped API instances, one fast-tier provider each.
    #[serde(default = "default_piped_instances")]
    pub piped_instances: Vec<String>,

    /// Invidious instances, one fast-tier provider each.
    #[serde(default = "default_invidious_instances")]
    pub invidious_instances: Vec<String>,

    /// InnerTube client flavors for the secondary tier, in priority order.
    #[serde(default = "default_innertube_clients")]
    pub innertube_clients: Vec<InnerTubeClient>,

    /// InnerTube host.
    #[serde(default = "default_innertube_base_url")]
    pub innertube_base_url: String,

    /// Whether the extractor tier is enabled.
    #[serde(default = "default_true")]
    pub enable_extractor: bool,

    /// Whether the last successful provider is tried first.
    #[serde(default = "default_true")]
    pub sticky_provider: bool,

    /// Per-attempt deadline in the fast tier.
    #[serde(default = "default_fast_timeout")]
    pub fast_timeout_secs: u64,

    /// Per-attempt deadline in the secondary tier.
    #[serde(default = "default_secondary_timeout")]
    pub secondary_timeout_secs: u64,

    /// Deadline for the extractor.
    #[serde(default = "default_extractor_timeout")]
    pub extractor_timeout_secs: u64,

    /// Codec ranked first.
    #[serde(default = "default_preferred_codec")]
    pub preferred_codec: String,

    /// Lifetime assumed for URLs without an embedded expiry.
    #[serde(default = "default_stream_ttl")]
    pub default_ttl_secs: u64,

    /// Margin subtracted from an embedded expiry.
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,

    /// Upper bound on how long a metadata row is served.
    #[serde(default = "default_max_metadata_ttl")]
    pub max_metadata_ttl_secs: u64,
}

fn default_piped_instances() -> Vec<String> {
    vec![
        "https://pipedapi.kavin.rocks".to_string(),
        "https://pipedapi.adminforge.de".to_string(),
    ]
}

fn default_invidious_instances() -> Vec<String> {
    vec![
        "https://inv.nadeko.net".to_string(),
        "https://invidious.nerdvpn.de".to_string(),
    ]
}

fn default_innertube_clients() -> Vec<InnerTubeClient> {
    InnerTubeClient::ALL.to_vec()
}

fn default_innertube_base_url() -> String {
    DEFAULT_INNERTUBE_BASE_URL.to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_fast_timeout() -> u64 {
    DEFAULT_FAST_TIMEOUT_SECS
}

const fn default_secondary_timeout() -> u64 {
    DEFAULT_SECONDARY_TIMEOUT_SECS
}

const fn default_extractor_timeout() -> u64 {
    DEFAULT_EXTRACTOR_TIMEOUT_SECS
}

fn default_preferred_codec() -> String {
    DEFAULT_PREFERRED_CODEC.to_string()
}

const fn default_stream_ttl() -> u64 {
    DEFAULT_STREAM_TTL.as_secs()
}

const fn default_expiry_margin() -> u64 {
    DEFAULT_EXPIRY_MARGIN.as_secs()
}

const fn default_max_metadata_ttl() -> u64 {
    DEFAULT_MAX_METADATA_TTL_SECS
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            piped_instances: default_piped_instances(),
            invidious_instances: default_invidious_instances(),
            innertube_clients: default_innertube_clients(),
            innertube_base_url: default_innertube_base_url(),
            enable_extractor: true,
            sticky_provider: true,
            fast_timeout_secs: DEFAULT_FAST_TIMEOUT_SECS,
            secondary_timeout_secs: DEFAULT_SECONDARY_TIMEOUT_SECS,
            extractor_timeout_secs: DEFAULT_EXTRACTOR_TIMEOUT_SECS,
            preferred_codec: default_preferred_codec(),
            default_ttl_secs: DEFAULT_STREAM_TTL.as_secs(),
            expiry_margin_secs: DEFAULT_EXPIRY_MARGIN.as_secs(),
            max_metadata_ttl_secs: DEFAULT_MAX_METADATA_TTL_SECS,
        }
    }
}

impl ResolverConfig {
    /// Clamp deadlines into `1..=MAX_TIMEOUT_SECS` and normalize the codec.
    pub fn validate(&mut self) {
        for secs in [
            &mut self.fast_timeout_secs,
            &mut self.secondary_timeout_secs,
            &mut self.extractor_timeout_secs,
        ] {
            *secs = (*secs).clamp(1, MAX_TIMEOUT_SECS);
        }
        self.preferred_codec = self.preferred_codec.trim().to_ascii_lowercase();
        self.max_metadata_ttl_secs = self.max_metadata_ttl_secs.max(1);
    }

    /// Ranking and expiry policy derived from this config.
    #[must_use]
    pub fn stream_policy(&self) -> StreamPolicy {
        StreamPolicy {
            preferred_codec: self.preferred_codec.clone(),
            default_ttl: Duration::from_secs(self.default_ttl_secs),
            expiry_margin: Duration::from_secs(self.expiry_margin_secs),
        }
    }

    /// Fast tier deadline.
    #[must_use]
    pub const fn fast_timeout(&self) -> Duration {
        Duration::from_secs(self.fast_timeout_secs)
    }

    /// Secondary tier deadline.
    #[must_use]
    pub const fn secondary_timeout(&self) -> Duration {
        Duration::from_secs(self.secondary_timeout_secs)
    }

    /// Extractor deadline.
    #[must_use]
    pub const fn extractor_timeout(&self) -> Duration {
        Duration::from_secs(self.extractor_timeout_secs)
    }

    /// Metadata row lifetime bound.
    #[must_use]
    pub const fn max_metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.max_metadata_ttl_secs)
    }
}

/// The provider that produced the last success. Advisory only.
#[derive(Debug, Default)]
pub struct StickyProvider {
    name: RwLock<Option<String>>,
}

impl StickyProvider {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current sticky provider name.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        match self.name.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Remember `name`.
    pub fn set(&self, name: &str) {
        match self.name.write() {
            Ok(mut guard) => *guard = Some(name.to_string()),
            Err(poisoned) => *poisoned.into_inner() = Some(name.to_string()),
        }
    }

    /// Forget the sticky provider.
    pub fn clear(&self) {
        match self.name.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

type TierOutcome = std::result::Result<(String, ResolvedStream), Vec<AttemptFailure>>;

/// Resolver over a provider chain and the metadata cache.
#[derive(Debug)]
pub struct Resolver {
    chain: ProviderChain,
    metadata: Arc<MetadataCache>,
    sticky: Arc<StickyProvider>,
    policy: StreamPolicy,
    config: ResolverConfig,
}

impl Resolver {
    /// Create a resolver.
    #[must_use]
    pub fn new(
        chain: ProviderChain,
        metadata: Arc<MetadataCache>,
        sticky: Arc<StickyProvider>,
        config: ResolverConfig,
    ) -> Self {
        let policy = config.stream_policy();
        Self {
            chain,
            metadata,
            sticky,
            policy,
            config,
        }
    }

    /// The provider chain.
    #[must_use]
    pub const fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// Name of the current sticky provider.
    #[must_use]
    pub fn sticky(&self) -> Option<String> {
        self.sticky.get()
    }

    /// Drop the cached metadata for `id`. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub fn invalidate(&self, id: &TrackId) -> Result<bool> {
        let removed = self.metadata.delete(id)?;
        if removed {
            debug!("Invalidated metadata for {}", id);
        }
        Ok(removed)
    }

    /// Parse `raw` and resolve it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentifier`] before any network call when `raw`
    /// is malformed, otherwise as [`Resolver::resolve`].
    pub async fn resolve_raw(&self, raw: &str) -> Result<ResolvedStream> {
        let id = TrackId::parse(raw)?;
        self.resolve(&id).await
    }

    /// Resolve `id` to a ranked, playable stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllProvidersExhausted`] when every provider failed.
    pub async fn resolve(&self, id: &TrackId) -> Result<ResolvedStream> {
        match self.metadata.get(id) {
            Ok(Some(stream)) => {
                debug!("Metadata cache hit for {}", id);
                return Ok(stream);
            }
            Ok(None) => {}
            Err(e) => warn!("Metadata cache read failed for {}: {}", id, e),
        }

        let mut attempts = Vec::new();

        let sticky = if self.config.sticky_provider {
            self.sticky.get()
        } else {
            None
        };
        if let Some(name) = sticky.as_deref()
            && let Some((tier, provider)) = self.chain.find(name)
        {
            match self.attempt(provider, id, tier.timeout).await {
                Ok(stream) => return Ok(self.accept(id, name, stream)),
                Err(e) => {
                    debug!("Sticky provider {} failed for {}: {}", name, id, e);
                    attempts.push(AttemptFailure {
                        tier: STICKY_LABEL.to_string(),
                        provider: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        for tier in self.chain.tiers() {
            let providers: Vec<Arc<dyn Provider>> = tier
                .providers
                .iter()
                .filter(|p| sticky.as_deref() != Some(p.name()))
                .cloned()
                .collect();
            if providers.is_empty() {
                continue;
            }

            let outcome = match tier.strategy {
                TierStrategy::Race => self.race(tier, &providers, id).await,
                TierStrategy::Sequential => self.sequential(tier, &providers, id).await,
            };
            match outcome {
                Ok((name, stream)) => return Ok(self.accept(id, &name, stream)),
                Err(failures) => attempts.extend(failures),
            }
        }

        warn!(
            "All providers exhausted for {} after {} attempts",
            id,
            attempts.len()
        );
        Err(Error::AllProvidersExhausted {
            id: id.to_string(),
            attempts,
        })
    }

    async fn race(
        &self,
        tier: &ProviderTier,
        providers: &[Arc<dyn Provider>],
        id: &TrackId,
    ) -> TierOutcome {
        let mut pending: FuturesUnordered<_> = providers
            .iter()
            .map(|provider| async move {
                let result = self.attempt(provider, id, tier.timeout).await;
                (provider, result)
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((provider, result)) = pending.next().await {
            match result {
                // Returning drops `pending`, which abandons the losers.
                Ok(stream) => return Ok((provider.name().to_string(), stream)),
                Err(e) => {
                    debug!("[{}] {} failed for {}: {}", tier.label, provider.name(), id, e);
                    failures.push(failure(tier, provider.as_ref(), &e));
                }
            }
        }
        Err(failures)
    }

    async fn sequential(
        &self,
        tier: &ProviderTier,
        providers: &[Arc<dyn Provider>],
        id: &TrackId,
    ) -> TierOutcome {
        let mut failures = Vec::new();
        for provider in providers {
            match self.attempt(provider, id, tier.timeout).await {
                Ok(stream) => return Ok((provider.name().to_string(), stream)),
                Err(e) => {
                    debug!("[{}] {} failed for {}: {}", tier.label, provider.name(), id, e);
                    failures.push(failure(tier, provider.as_ref(), &e));
                }
            }
        }
        Err(failures)
    }

    async fn attempt(
        &self,
        provider: &Arc<dyn Provider>,
        id: &TrackId,
        timeout: Duration,
    ) -> std::result::Result<ResolvedStream, ProviderError> {
        let stream = tokio::time::timeout(timeout, provider.resolve(id, timeout))
            .await
            .map_err(|_| ProviderError::Timeout(timeout))??;

        let stream = ResolvedStream::from_formats(
            stream.formats,
            stream.title,
            stream.duration_sec,
            &self.policy,
        )
        .ok_or(ProviderError::NoPlayableFormats)?;

        // URLs inside the expiry margin are already unusable.
        if !stream.is_fresh() {
            return Err(ProviderError::Unplayable(format!(
                "stream URLs expire at {}",
                stream.expires_at
            )));
        }
        Ok(stream)
    }

    fn accept(&self, id: &TrackId, provider: &str, stream: ResolvedStream) -> ResolvedStream {
        if let Err(e) = self
            .metadata
            .put(id, &stream, self.config.max_metadata_ttl())
        {
            warn!("Failed to cache metadata for {}: {}", id, e);
        }
        self.sticky.set(provider);

        info!(
            "Resolved {} via {} ({} formats, best {} @ {} bps)",
            id,
            provider,
            stream.formats.len(),
            stream.best().map_or("?", |f| f.codec.as_str()),
            stream.best().map_or(0, |f| f.bitrate_bps),
        );
        stream
    }
}

fn failure(tier: &ProviderTier, provider: &dyn Provider, error: &ProviderError) -> AttemptFailure {
    AttemptFailure {
        tier: tier.label.clone(),
        provider: provider.name().to_string(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use crate::provider::MockProvider;

    fn id() -> TrackId {
        TrackId::parse("abc12345678").unwrap()
    }

    fn stream(url: &str, bitrate: u64) -> ResolvedStream {
        ResolvedStream {
            formats: vec![AudioFormat::from_mime(
                "audio/webm; codecs=\"opus\"",
                None,
                bitrate,
                Some(url.to_string()),
            )],
            expires_at: 0,
            title: None,
            duration_sec: None,
        }
    }

    fn mock(
        name: &'static str,
        result: std::result::Result<ResolvedStream, ProviderError>,
        times: usize,
    ) -> Arc<dyn Provider> {
        let mut provider = MockProvider::new();
        provider.expect_name().return_const(name.to_string());
        provider
            .expect_resolve()
            .times(times)
            .returning(move |_, _| result.clone());
        Arc::new(provider)
    }

    fn resolver(tiers: Vec<ProviderTier>) -> Resolver {
        Resolver::new(
            ProviderChain::new(tiers),
            Arc::new(MetadataCache::open_in_memory().unwrap()),
            Arc::new(StickyProvider::new()),
            ResolverConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_invalid_identifier_makes_no_calls() {
        let r = resolver(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(5))
                .with_provider(mock("a", Ok(stream("https://a.example/x", 1)), 0)),
        ]);
        let err = r.resolve_raw("not-an-id").await.unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn test_second_resolve_hits_cache() {
        let r = resolver(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(5))
                .with_provider(mock("a", Ok(stream("https://a.example/x", 1)), 1)),
        ]);
        let first = r.resolve(&id()).await.unwrap();
        let second = r.resolve(&id()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_falls_through_tiers_and_sets_sticky() {
        let r = resolver(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(5))
                .with_provider(mock("a", Err(ProviderError::HttpStatus(500)), 1))
                .with_provider(mock("b", Err(ProviderError::Transport("reset".into())), 1)),
            ProviderTier::new("secondary", TierStrategy::Sequential, Duration::from_secs(8))
                .with_provider(mock("c", Ok(stream("https://c.example/x", 1)), 1)),
        ]);
        r.resolve(&id()).await.unwrap();
        assert_eq!(r.sticky().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_success() {
        let r = resolver(vec![
            ProviderTier::new("secondary", TierStrategy::Sequential, Duration::from_secs(8))
                .with_provider(mock("v1", Err(ProviderError::NoPlayableFormats), 1))
                .with_provider(mock("v2", Ok(stream("https://v2.example/x", 1)), 1))
                .with_provider(mock("v3", Ok(stream("https://v3.example/x", 1)), 0)),
        ]);
        let resolved = r.resolve(&id()).await.unwrap();
        assert_eq!(
            resolved.best().unwrap().url.as_deref(),
            Some("https://v2.example/x")
        );
    }

    #[tokio::test]
    async fn test_unplayable_result_counts_as_failure() {
        let mut no_url = stream("https://a.example/x", 1);
        no_url.formats[0].url = None;
        let r = resolver(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(5))
                .with_provider(mock("a", Ok(no_url), 1)),
        ]);
        let err = r.resolve(&id()).await.unwrap_err();
        match err {
            Error::AllProvidersExhausted { attempts, .. } => {
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].reason, "no playable formats");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_exhaustion_is_not_cached() {
        let r = resolver(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(5))
                .with_provider(mock("a", Err(ProviderError::HttpStatus(429)), 2)),
        ]);
        assert!(r.resolve(&id()).await.is_err());
        assert!(r.resolve(&id()).await.is_err());
        assert!(r.sticky().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_resolution() {
        let r = resolver(vec![
            ProviderTier::new("fast", TierStrategy::Race, Duration::from_secs(5))
                .with_provider(mock("a", Ok(stream("https://a.example/x", 1)), 2)),
        ]);
        r.resolve(&id()).await.unwrap();
        assert!(r.invalidate(&id()).unwrap());
        r.resolve(&id()).await.unwrap();
    }

    #[test]
    fn test_config_validate_clamps() {
        let mut config = ResolverConfig {
            fast_timeout_secs: 0,
            extractor_timeout_secs: 10_000,
            preferred_codec: " OPUS ".to_string(),
            ..ResolverConfig::default()
        };
        config.validate();
        assert_eq!(config.fast_timeout_secs, 1);
        assert_eq!(config.extractor_timeout_secs, MAX_TIMEOUT_SECS);
        assert_eq!(config.preferred_codec, "opus");
    }

    #[test]
    fn test_sticky_slot() {
        let sticky = StickyProvider::new();
        assert!(sticky.get().is_none());
        sticky.set("piped:a");
        assert_eq!(sticky.get().as_deref(), Some("piped:a"));
        sticky.clear();
        assert!(sticky.get().is_none());
    }
}
