// src/client.rs

use crate::config::{Config, KeySourceConfig};
use crate::error::NilaOidcError;
use crate::model::{JsonWebKeySet, ProviderMetadata};
use crate::validator::{KeySet, KeyVerifier};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_KEY_SET_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const MIN_KEY_SET_TTL: Duration = Duration::from_secs(1);
const REFRESH_BACKOFF_MIN: Duration = Duration::from_secs(5);
const REFRESH_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Builds the HTTP client used for every request to the provider.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, NilaOidcError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(CONNECT_TIMEOUT))
        .build()
        .map_err(|e| NilaOidcError::InvalidConfiguration(format!("Failed to build HTTP client: {e}")))
}

/// Fetches and caches the provider's discovery document and signing keys.
///
/// Cheap to clone; all clones share the caches.
#[derive(Clone)]
pub struct ProviderClient {
    // The client is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    issuer: String,
    jwks_uri_override: Option<Url>,
    default_cache_ttl: Duration,
    min_refresh_interval: Duration,
    // issuer -> discovery document
    metadata_cache: Cache<String, Arc<ProviderMetadata>>,
    // jwks_uri -> key set, each entry living for its own TTL
    key_cache: Cache<Url, Arc<KeySet>>,
    refresh_lock: Mutex<()>,
}

/// Expires each key set after the TTL it was fetched with.
struct KeySetExpiry;

impl Expiry<Url, Arc<KeySet>> for KeySetExpiry {
    fn expire_after_create(&self, _key: &Url, value: &Arc<KeySet>, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl().min(MAX_KEY_SET_TTL))
    }
}

impl ProviderClient {
    /// Creates a client for the provider described by `config`.
    pub fn new(config: &Config) -> Result<Self, NilaOidcError> {
        Ok(Self::with_http_client(config, build_http_client(config.http_timeout)?))
    }

    /// Creates a client that sends its requests through `http_client`.
    pub fn with_http_client(config: &Config, http_client: reqwest::Client) -> Self {
        let (jwks_uri_override, default_cache_ttl, min_refresh_interval) = match &config.key_source {
            KeySourceConfig::Jwks {
                jwks_uri,
                cache_ttl,
                min_refresh_interval,
            } => (jwks_uri.clone(), *cache_ttl, *min_refresh_interval),
            KeySourceConfig::SharedSecret(_) => (None, Duration::from_secs(24 * 60 * 60), Duration::from_secs(10)),
        };

        let inner = Arc::new(Inner {
            http_client,
            issuer: config.issuer.clone(),
            jwks_uri_override,
            default_cache_ttl,
            min_refresh_interval,
            metadata_cache: Cache::builder()
                .max_capacity(16)
                .time_to_live(config.metadata_ttl)
                .build(),
            key_cache: Cache::builder().max_capacity(16).expire_after(KeySetExpiry).build(),
            refresh_lock: Mutex::new(()),
        });
        Self { inner }
    }

    pub fn issuer(&self) -> &str {
        &self.inner.issuer
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    /// Returns the cached discovery document, fetching it on a miss.
    ///
    /// Concurrent misses share a single request.
    pub async fn metadata(&self) -> Result<Arc<ProviderMetadata>, NilaOidcError> {
        let issuer = self.inner.issuer.clone();
        if let Some(metadata) = self.inner.metadata_cache.get(&issuer).await {
            debug!(%issuer, "Provider metadata cache hit");
            return Ok(metadata);
        }
        debug!(%issuer, "Provider metadata cache miss");
        self.inner
            .metadata_cache
            .try_get_with(issuer.clone(), async { self.fetch_metadata(&issuer).await.map(Arc::new) })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Fetches the discovery document of `issuer`, bypassing the cache.
    #[instrument(skip(self), err)]
    pub async fn fetch_metadata(&self, issuer: &str) -> Result<ProviderMetadata, NilaOidcError> {
        let discovery_url = format!("{}{DISCOVERY_PATH}", issuer.trim_end_matches('/'));
        let discovery_url =
            Url::parse(&discovery_url).map_err(|e| NilaOidcError::Discovery(format!("{discovery_url}: {e}")))?;

        debug!("Performing OIDC discovery at: {}", discovery_url);
        let response = self
            .inner
            .http_client
            .get(discovery_url.clone())
            .send()
            .await
            .map_err(|e| NilaOidcError::Discovery(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NilaOidcError::Discovery(format!("{discovery_url} returned HTTP {status}")));
        }
        let metadata: ProviderMetadata = response
            .json()
            .await
            .map_err(|e| NilaOidcError::Discovery(format!("invalid discovery document: {e}")))?;

        if metadata.issuer.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(NilaOidcError::Discovery(format!(
                "discovery document names issuer '{}', expected '{issuer}'",
                metadata.issuer
            )));
        }
        if !metadata.code_challenge_methods_supported.is_empty()
            && !metadata.code_challenge_methods_supported.iter().any(|m| m == "S256")
        {
            warn!(
                methods = ?metadata.code_challenge_methods_supported,
                "Provider does not advertise S256 PKCE; sending it anyway"
            );
        }

        info!(issuer = %metadata.issuer, jwks_uri = %metadata.jwks_uri, "Fetched provider metadata");
        Ok(metadata)
    }

    /// The JWKS location: the configured override, or the one from discovery.
    pub async fn jwks_uri(&self) -> Result<Url, NilaOidcError> {
        if let Some(uri) = &self.inner.jwks_uri_override {
            debug!("Using JWKS URI from config override: {}", uri);
            return Ok(uri.clone());
        }
        Ok(self.metadata().await?.jwks_uri.clone())
    }

    /// Returns the cached key set, fetching it on a miss.
    pub async fn key_set(&self) -> Result<Arc<KeySet>, NilaOidcError> {
        let jwks_uri = self.jwks_uri().await?;
        if let Some(keys) = self.inner.key_cache.get(&jwks_uri).await {
            debug!(%jwks_uri, "JWKS cache hit");
            return Ok(keys);
        }
        debug!(%jwks_uri, "JWKS cache miss. Fetching from provider.");
        self.inner
            .key_cache
            .try_get_with(jwks_uri.clone(), async { self.fetch_key_set(&jwks_uri).await.map(Arc::new) })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Replaces `stale` with a freshly fetched key set.
    ///
    /// Refreshes are serialized. If another task already replaced `stale`, or
    /// `stale` is younger than the minimum refresh interval, no request is sent.
    /// The age check uses the set itself, so it holds after its cache entry expired.
    pub async fn refresh_key_set(&self, stale: &Arc<KeySet>) -> Result<Arc<KeySet>, NilaOidcError> {
        let jwks_uri = self.jwks_uri().await?;
        let _guard = self.inner.refresh_lock.lock().await;

        let current = self.inner.key_cache.get(&jwks_uri).await;
        if let Some(current) = &current {
            if !Arc::ptr_eq(current, stale) {
                debug!("JWKS already refreshed by another task");
                return Ok(current.clone());
            }
        }
        if stale.age() < self.inner.min_refresh_interval {
            debug!(age = ?stale.age(), "JWKS fetched too recently; not refreshing");
            return Ok(current.unwrap_or_else(|| stale.clone()));
        }

        let fresh = Arc::new(self.fetch_key_set(&jwks_uri).await?);
        self.inner.key_cache.insert(jwks_uri, fresh.clone()).await;
        Ok(fresh)
    }

    /// Fetches and parses the JWKS at `jwks_uri`, bypassing the cache.
    /// The set's TTL comes from `Cache-Control: max-age`, else the configured default,
    /// and is never shorter than the minimum refresh interval.
    #[instrument(skip(self), err)]
    pub async fn fetch_key_set(&self, jwks_uri: &Url) -> Result<KeySet, NilaOidcError> {
        let response = self
            .inner
            .http_client
            .get(jwks_uri.clone())
            .send()
            .await
            .map_err(|e| NilaOidcError::KeyFetch(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NilaOidcError::KeyFetch(format!("{jwks_uri} returned HTTP {status}")));
        }

        let cache_ttl = parse_cache_control(response.headers())
            .unwrap_or(self.inner.default_cache_ttl)
            .max(self.key_set_ttl_floor());
        let jwks: JsonWebKeySet = response
            .json()
            .await
            .map_err(|e| NilaOidcError::KeyFetch(format!("invalid JWKS document: {e}")))?;

        let keys = KeySet::from_jwks(&jwks, cache_ttl);
        info!(
            "Successfully fetched {} keys ({} usable). Caching with TTL: {:?}",
            jwks.keys.len(),
            keys.len(),
            cache_ttl
        );
        Ok(keys)
    }

    /// Starts a background task that refreshes the key set before it expires.
    ///
    /// Refreshes happen at 80% of the key set's TTL, but never more often than the
    /// minimum refresh interval or once a second. Failures are retried with
    /// exponential backoff from 5 seconds up to 5 minutes. Abort the returned
    /// handle to stop the task.
    pub fn spawn_key_refresh(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            client.key_refresh_loop().await;
        })
    }

    async fn key_refresh_loop(&self) {
        let mut backoff = REFRESH_BACKOFF_MIN;
        loop {
            let delay = match self.reload_key_set().await {
                Ok(ttl) => {
                    backoff = REFRESH_BACKOFF_MIN;
                    ttl.mul_f64(0.8).max(self.key_set_ttl_floor())
                }
                Err(err) => {
                    let delay = backoff;
                    backoff = (backoff * 2).min(REFRESH_BACKOFF_MAX);
                    error!(error = %err, retry_in = ?delay, "Background JWKS refresh failed");
                    delay
                }
            };
            debug!(next_refresh_in = ?delay, "JWKS background refresh scheduled");
            tokio::time::sleep(delay).await;
        }
    }

    fn key_set_ttl_floor(&self) -> Duration {
        self.inner.min_refresh_interval.max(MIN_KEY_SET_TTL)
    }

    async fn reload_key_set(&self) -> Result<Duration, NilaOidcError> {
        let jwks_uri = self.jwks_uri().await?;
        let keys = Arc::new(self.fetch_key_set(&jwks_uri).await?);
        let ttl = keys.ttl();
        let _guard = self.inner.refresh_lock.lock().await;
        self.inner.key_cache.insert(jwks_uri, keys).await;
        Ok(ttl)
    }
}

#[async_trait]
impl KeyVerifier for ProviderClient {
    async fn current_keys(&self) -> Result<Arc<KeySet>, NilaOidcError> {
        self.key_set().await
    }

    async fn refresh_keys(&self, stale: &Arc<KeySet>) -> Result<Arc<KeySet>, NilaOidcError> {
        self.refresh_key_set(stale).await
    }
}

/// Parses the `Cache-Control` header to determine the TTL.
fn parse_cache_control(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::CACHE_CONTROL)?
        .to_str()
        .ok()?
        .split(',')
        .find_map(|part| {
            part.trim()
                .strip_prefix("max-age=")?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        })
}
