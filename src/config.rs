// src/config.rs

use crate::error::NilaOidcError;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Contains the validation settings for an OIDC ID Token.
///
/// This struct is used to configure the specific checks that will be performed
/// on the token's claims, such as allowed algorithms and clock skew tolerance.
#[derive(Clone, Debug)]
pub struct ValidationDetails {
    /// The signing algorithms that are permitted for the ID Token.
    /// Tokens signed with any other algorithm will be rejected.
    pub algorithms: Vec<Algorithm>,
    /// The tolerance for clock skew when checking that `iat` is not in the future.
    /// Defaults to 60 seconds. `exp` is checked without tolerance.
    pub leeway: Duration,
}

impl Default for ValidationDetails {
    fn default() -> Self {
        Self {
            algorithms: vec![Algorithm::RS256, Algorithm::ES256],
            leeway: Duration::from_secs(60),
        }
    }
}

/// Defines the source for ID token verification keys.
#[derive(Clone)]
pub enum KeySourceConfig {
    /// Keys are fetched from a JWKS endpoint.
    Jwks {
        /// Optional override for the JWKS endpoint URL. If `None`, the URL will be
        /// discovered from the issuer's `.well-known/openid-configuration` endpoint.
        jwks_uri: Option<Url>,
        /// The duration for which the fetched JWKS will be cached if no `Cache-Control` header is present.
        cache_ttl: Duration,
        /// A forced refresh (unknown `kid`) is skipped when the cached set is younger than this.
        min_refresh_interval: Duration,
    },
    /// A shared secret is used for symmetric key algorithms (e.g., HS256).
    SharedSecret(Vec<u8>),
}

/// The main configuration for the relying party.
///
/// This struct holds all necessary information to talk to the OIDC provider,
/// run the login flow and validate ID tokens. It should be constructed using the
/// `ConfigBuilder`.
#[derive(Clone)]
pub struct Config {
    /// The issuer identifier exactly as the provider publishes it. Used for
    /// discovery and as the expected `iss` claim.
    pub issuer: String,
    /// The client ID of the application, as registered with the OIDC provider.
    /// This is used to validate the `aud` claim of the ID Token.
    pub client_id: String,
    /// Client secret for confidential clients. Public (PKCE-only) clients leave it unset.
    pub client_secret: Option<String>,
    /// The callback URL registered with the provider.
    pub redirect_uri: Url,
    /// Requested scopes. Always contains `openid`.
    pub scopes: Vec<String>,
    /// The specific validation parameters to apply to the token.
    pub validation: ValidationDetails,
    /// The source for obtaining JWT validation keys.
    pub key_source: KeySourceConfig,
    /// Total timeout for every request sent to the provider.
    pub http_timeout: Duration,
    /// How long a fetched discovery document is reused.
    pub metadata_ttl: Duration,
    /// Lifetime of a pending login attempt.
    pub auth_request_ttl: Duration,
    /// Lifetime of a completed login session in the session store.
    pub session_ttl: Duration,
    /// Query the userinfo endpoint after login to fill missing profile claims.
    pub fetch_userinfo: bool,
}

impl Config {
    /// Loads a configuration from a YAML document (see [`FileConfig`]).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, NilaOidcError> {
        let file_config: FileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| NilaOidcError::InvalidConfiguration(format!("Failed to parse YAML config: {e}")))?;
        file_config.into_builder()?.build()
    }

    /// Loads a configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, NilaOidcError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            NilaOidcError::InvalidConfiguration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// The scope parameter value sent in the authorization request.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }
}

/// A builder for creating a `Config` instance.
///
/// This builder provides a fluent API to ensure that the configuration is
/// constructed correctly and with all required fields.
#[derive(Default)]
pub struct ConfigBuilder {
    issuer: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<Url>,
    scopes: Option<Vec<String>>,
    jwks_uri_option: Option<Url>,
    cache_ttl_option: Option<Duration>,
    min_refresh_interval_option: Option<Duration>,
    shared_secret_option: Option<Vec<u8>>,
    http_timeout: Option<Duration>,
    metadata_ttl: Option<Duration>,
    auth_request_ttl: Option<Duration>,
    session_ttl: Option<Duration>,
    fetch_userinfo: bool,
    algorithms_option: Option<Vec<Algorithm>>,
    validation: ValidationDetails,
}

impl ConfigBuilder {
    /// Creates a new `ConfigBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the issuer URL of the OIDC provider. This is a required field.
    ///
    /// The string is kept verbatim, since it must equal the `iss` claim byte for byte.
    ///
    /// # Arguments
    ///
    /// * `url` - The issuer URL, e.g., "https://accounts.google.com".
    pub fn issuer_url(mut self, url: &str) -> Result<Self, NilaOidcError> {
        let parsed = Url::parse(url).map_err(|e| NilaOidcError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "https" && !is_loopback(&parsed) {
            return Err(NilaOidcError::InvalidUrl(format!(
                "issuer must use https unless it is a loopback address: {url}"
            )));
        }
        self.issuer = Some(url.to_string());
        Ok(self)
    }

    /// Sets the client ID of the application. This is a required field.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets a client secret, turning this into a confidential client.
    pub fn client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    /// Sets the redirect URI the provider sends the browser back to. This is a required field.
    pub fn redirect_uri(mut self, url: &str) -> Result<Self, NilaOidcError> {
        let parsed = Url::parse(url).map_err(|e| NilaOidcError::InvalidUrl(e.to_string()))?;
        self.redirect_uri = Some(parsed);
        Ok(self)
    }

    /// Sets the requested scopes. `openid` is added if missing.
    /// Defaults to `openid profile email`.
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = Some(scopes.into_iter().map(Into::into).collect());
        self
    }

    /// Sets an explicit JWKS URI, bypassing OIDC discovery for keys. This is optional.
    pub fn jwks_uri(mut self, url: &str) -> Result<Self, NilaOidcError> {
        if self.shared_secret_option.is_some() {
            return Err(NilaOidcError::AmbiguousKeySource(
                "Cannot set JWKS URI when a shared secret is already configured.".to_string(),
            ));
        }
        let parsed_url = Url::parse(url).map_err(|e| NilaOidcError::InvalidUrl(e.to_string()))?;
        self.jwks_uri_option = Some(parsed_url);
        Ok(self)
    }

    /// Sets the fallback cache TTL for the JWKS. This is optional.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_option = Some(ttl);
        self
    }

    /// Sets the minimum age of a cached JWKS before an unknown `kid` may force a refetch.
    /// Defaults to 10 seconds.
    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval_option = Some(interval);
        self
    }

    /// Sets the allowed signing algorithms.
    /// Defaults to `[Algorithm::HS256]` with a shared secret, and to
    /// `[Algorithm::RS256, Algorithm::ES256]` otherwise.
    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms_option = Some(algorithms);
        self
    }

    /// Sets the clock skew tolerance. This is optional.
    /// Defaults to 60 seconds.
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway;
        self
    }

    /// Sets the shared secret for symmetric key algorithms (e.g., HS256).
    /// This is mutually exclusive with providing a JWKS URI.
    pub fn shared_secret(mut self, secret: Vec<u8>) -> Result<Self, NilaOidcError> {
        if self.jwks_uri_option.is_some() {
            return Err(NilaOidcError::AmbiguousKeySource(
                "Cannot set shared secret when a JWKS URI is already configured.".to_string(),
            ));
        }
        self.shared_secret_option = Some(secret);
        Ok(self)
    }

    /// Sets the timeout for requests to the provider. Defaults to 10 seconds.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Sets how long the discovery document is cached. Defaults to 24 hours.
    pub fn metadata_ttl(mut self, ttl: Duration) -> Self {
        self.metadata_ttl = Some(ttl);
        self
    }

    /// Sets how long a started login may wait for its callback. Defaults to 10 minutes.
    pub fn auth_request_ttl(mut self, ttl: Duration) -> Self {
        self.auth_request_ttl = Some(ttl);
        self
    }

    /// Sets how long a completed login is kept in the session store. Defaults to 8 hours.
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// Enables the userinfo lookup after a successful login.
    pub fn fetch_userinfo(mut self, enabled: bool) -> Self {
        self.fetch_userinfo = enabled;
        self
    }

    /// Consumes the builder and returns a `Config` object.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields (`issuer_url`, `client_id`, `redirect_uri`)
    /// are missing, if a duration is zero, or if no allowed algorithm can be
    /// verified with the configured key source.
    pub fn build(mut self) -> Result<Config, NilaOidcError> {
        let issuer = self
            .issuer
            .ok_or(NilaOidcError::MissingConfiguration("issuer_url".to_string()))?;
        let client_id = self
            .client_id
            .filter(|id| !id.is_empty())
            .ok_or(NilaOidcError::MissingConfiguration("client_id".to_string()))?;
        let redirect_uri = self
            .redirect_uri
            .ok_or(NilaOidcError::MissingConfiguration("redirect_uri".to_string()))?;

        let uses_shared_secret = self.shared_secret_option.is_some();
        self.validation.algorithms = match self.algorithms_option.take() {
            Some(algorithms) => algorithms,
            None if uses_shared_secret => vec![Algorithm::HS256],
            None => ValidationDetails::default().algorithms,
        };
        if self.validation.algorithms.is_empty() {
            return Err(NilaOidcError::InvalidConfiguration(
                "at least one signing algorithm must be allowed".to_string(),
            ));
        }
        // JWKS documents only carry asymmetric keys; a shared secret only verifies HMAC.
        if !self
            .validation
            .algorithms
            .iter()
            .any(|alg| is_hmac(*alg) == uses_shared_secret)
        {
            let source = if uses_shared_secret { "a shared secret" } else { "a JWKS key set" };
            return Err(NilaOidcError::InvalidConfiguration(format!(
                "none of the allowed algorithms {:?} can be verified with {source}",
                self.validation.algorithms
            )));
        }

        let mut scopes = self
            .scopes
            .unwrap_or_else(|| vec!["openid".into(), "profile".into(), "email".into()]);
        if !scopes.iter().any(|s| s == "openid") {
            scopes.insert(0, "openid".to_string());
        }

        let key_source = if let Some(secret) = self.shared_secret_option {
            if secret.is_empty() {
                return Err(NilaOidcError::InvalidConfiguration("shared secret is empty".to_string()));
            }
            KeySourceConfig::SharedSecret(secret)
        } else {
            // If no shared secret, JWKS is the source (either direct URI or via discovery)
            KeySourceConfig::Jwks {
                jwks_uri: self.jwks_uri_option,
                cache_ttl: self
                    .cache_ttl_option
                    .unwrap_or_else(|| Duration::from_secs(24 * 60 * 60)),
                min_refresh_interval: self
                    .min_refresh_interval_option
                    .unwrap_or(Duration::from_secs(10)),
            }
        };

        let http_timeout = self.http_timeout.unwrap_or(Duration::from_secs(10));
        let auth_request_ttl = self.auth_request_ttl.unwrap_or(Duration::from_secs(10 * 60));
        if http_timeout.is_zero() || auth_request_ttl.is_zero() {
            return Err(NilaOidcError::InvalidConfiguration(
                "http_timeout and auth_request_ttl must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            issuer,
            client_id,
            client_secret: self.client_secret,
            redirect_uri,
            scopes,
            validation: self.validation,
            key_source,
            http_timeout,
            metadata_ttl: self.metadata_ttl.unwrap_or(Duration::from_secs(24 * 60 * 60)),
            auth_request_ttl,
            session_ttl: self.session_ttl.unwrap_or(Duration::from_secs(8 * 60 * 60)),
            fetch_userinfo: self.fetch_userinfo,
        })
    }
}

fn is_hmac(alg: Algorithm) -> bool {
    matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("[::1]"))
}

/// The on-disk (YAML) shape of the configuration.
///
/// ```yaml
/// issuer_url: https://id.example.com
/// client_id: demo-client
/// redirect_uri: http://localhost:3000/callback
/// scopes: [openid, profile, email]
/// algorithms: [RS256, ES256]
/// leeway_seconds: 60
/// ```
#[derive(Debug, Deserialize)]
pub struct FileConfig {
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: Option<Vec<String>>,
    pub jwks_uri: Option<String>, // Optional direct JWKS URI
    pub shared_secret: Option<String>,
    pub algorithms: Option<Vec<String>>,
    pub leeway_seconds: Option<u64>,
    pub http_timeout_seconds: Option<u64>,
    pub jwks_cache_ttl_seconds: Option<u64>,
    pub metadata_ttl_seconds: Option<u64>,
    pub auth_request_ttl_seconds: Option<u64>,
    pub session_ttl_seconds: Option<u64>,
    #[serde(default)]
    pub fetch_userinfo: bool,
}

impl FileConfig {
    pub fn into_builder(self) -> Result<ConfigBuilder, NilaOidcError> {
        let mut builder = ConfigBuilder::new()
            .issuer_url(&self.issuer_url)?
            .client_id(self.client_id)
            .redirect_uri(&self.redirect_uri)?
            .fetch_userinfo(self.fetch_userinfo);

        if let Some(secret) = self.client_secret {
            builder = builder.client_secret(secret);
        }
        if let Some(scopes) = self.scopes {
            builder = builder.scopes(scopes);
        }
        if let Some(jwks_uri) = &self.jwks_uri {
            builder = builder.jwks_uri(jwks_uri)?;
        }
        if let Some(secret) = self.shared_secret {
            builder = builder.shared_secret(secret.into_bytes())?;
        }
        if let Some(algs) = &self.algorithms {
            let algorithms = algs
                .iter()
                .map(|s| {
                    Algorithm::from_str(s)
                        .map_err(|_| NilaOidcError::InvalidConfiguration(format!("Invalid algorithm string: {s}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            builder = builder.algorithms(algorithms);
        }
        if let Some(secs) = self.leeway_seconds {
            builder = builder.leeway(Duration::from_secs(secs));
        }
        if let Some(secs) = self.http_timeout_seconds {
            builder = builder.http_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.jwks_cache_ttl_seconds {
            builder = builder.cache_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.metadata_ttl_seconds {
            builder = builder.metadata_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.auth_request_ttl_seconds {
            builder = builder.auth_request_ttl(Duration::from_secs(secs));
        }
        if let Some(secs) = self.session_ttl_seconds {
            builder = builder.session_ttl(Duration::from_secs(secs));
        }
        Ok(builder)
    }
}
