// src/relying_party.rs

use crate::authorize::{self, AuthRequestState, AuthorizationRequest};
use crate::client::{build_http_client, ProviderClient};
use crate::config::{Config, KeySourceConfig};
use crate::error::{NilaOidcError, StateFailure};
use crate::exchange::{verify_state, TokenExchangeClient};
use crate::model::{CallbackParams, IdentityClaims};
use crate::session::{MemorySessionStore, SessionStore};
use crate::validator::{IdTokenVerifier, KeySet, KeyVerifier, StaticKeyVerifier};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// What is kept for a browser session after a successful login.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginSession {
    pub claims: IdentityClaims,
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds, when the token response carried `expires_in`.
    pub access_token_expires_at: Option<u64>,
    /// Unix seconds.
    pub logged_in_at: u64,
}

impl fmt::Debug for LoginSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginSession")
            .field("claims", &self.claims)
            .field("id_token", &"[REDACTED]")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("logged_in_at", &self.logged_in_at)
            .finish()
    }
}

/// The relying-party engine: runs the authorization code + PKCE login for
/// browser sessions identified by an opaque session id.
///
/// Create one per provider and share it; clones are cheap.
#[derive(Clone)]
pub struct RelyingParty {
    config: Arc<Config>,
    provider: ProviderClient,
    exchange: TokenExchangeClient,
    verifier: IdTokenVerifier,
    store: Arc<dyn SessionStore>,
}

impl RelyingParty {
    /// Creates an engine keeping its sessions in memory.
    pub fn new(config: Config) -> Result<Self, NilaOidcError> {
        Self::with_session_store(config, Arc::new(MemorySessionStore::default()))
    }

    /// Creates an engine keeping its sessions in `store`.
    pub fn with_session_store(config: Config, store: Arc<dyn SessionStore>) -> Result<Self, NilaOidcError> {
        let http_client = build_http_client(config.http_timeout)?;
        let provider = ProviderClient::with_http_client(&config, http_client.clone());
        let keys: Arc<dyn KeyVerifier> = match &config.key_source {
            KeySourceConfig::SharedSecret(secret) => Arc::new(StaticKeyVerifier::new(KeySet::shared_secret(secret))),
            KeySourceConfig::Jwks { .. } => Arc::new(provider.clone()),
        };
        let verifier = IdTokenVerifier::from_config(&config, keys);
        let exchange = TokenExchangeClient::new(http_client, config.client_id.clone(), config.client_secret.clone());

        Ok(Self {
            config: Arc::new(config),
            provider,
            exchange,
            verifier,
            store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The discovery and key client, e.g. to call [`ProviderClient::spawn_key_refresh`].
    pub fn provider(&self) -> &ProviderClient {
        &self.provider
    }

    /// A fresh random session id for callers without their own session layer.
    pub fn new_session_id() -> String {
        authorize::random_token(authorize::STATE_BYTES)
    }

    /// Starts a login for `session_id` and returns where to send the browser.
    ///
    /// A login already pending for the session is replaced.
    #[instrument(skip_all, err)]
    pub async fn begin_login(&self, session_id: &str) -> Result<AuthorizationRequest, NilaOidcError> {
        let metadata = self.provider.metadata().await?;
        let request = authorize::begin_login(&self.config, &metadata.authorization_endpoint, crate::unix_now());

        let value = serde_json::to_string(&request.state)
            .map_err(|e| NilaOidcError::SessionStore(format!("Failed to encode login attempt: {e}")))?;
        self.store
            .set(&auth_request_key(session_id), value, self.config.auth_request_ttl)
            .await?;

        info!(attempt_id = %request.state.attempt_id, "Login started");
        Ok(request)
    }

    /// Finishes the login of `session_id` with the parameters of the redirect back
    /// from the provider.
    ///
    /// The pending attempt is consumed before anything else happens, so a
    /// callback can succeed at most once. On failure nothing is stored.
    #[instrument(skip_all, err)]
    pub async fn complete_login(
        &self,
        session_id: &str,
        callback: &CallbackParams,
    ) -> Result<LoginSession, NilaOidcError> {
        let result = self.run_callback(session_id, callback).await;
        if let Err(err) = &result {
            if err.is_security_violation() {
                warn!(security_violation = true, error = %err, "Login callback rejected");
            } else {
                warn!(security_violation = false, class = ?err.class(), error = %err, "Login failed");
            }
        }
        result
    }

    async fn run_callback(&self, session_id: &str, callback: &CallbackParams) -> Result<LoginSession, NilaOidcError> {
        let raw = self
            .store
            .take(&auth_request_key(session_id))
            .await?
            .ok_or(NilaOidcError::StateMismatch(StateFailure::NoPendingRequest))?;
        let pending: AuthRequestState = serde_json::from_str(&raw)
            .map_err(|e| NilaOidcError::SessionStore(format!("Stored login attempt is unreadable: {e}")))?;

        let now = crate::unix_now();
        if pending.is_expired(now) {
            return Err(NilaOidcError::StateMismatch(StateFailure::Expired));
        }
        verify_state(callback.state.as_deref(), &pending.state)?;
        debug!(attempt_id = %pending.attempt_id, "Callback state verified");

        if let Some(error) = &callback.error {
            return Err(NilaOidcError::AuthorizationDenied {
                error: error.clone(),
                description: callback.error_description.clone(),
            });
        }
        let code = callback
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or_else(|| NilaOidcError::TokenExchange("callback carries no authorization code".to_string()))?;

        let metadata = self.provider.metadata().await?;
        let tokens = self
            .exchange
            .exchange_code(&metadata.token_endpoint, code, callback.state.as_deref(), &pending)
            .await?;
        let mut claims = self
            .verifier
            .verify_id_token(&tokens.id_token, &pending.nonce, &metadata.issuer, &self.config.client_id)
            .await?;

        if self.config.fetch_userinfo {
            match &metadata.userinfo_endpoint {
                Some(endpoint) => match self.exchange.fetch_userinfo(endpoint, &tokens.access_token).await {
                    Ok(userinfo) => claims.merge_userinfo(userinfo)?,
                    Err(err) => warn!(error = %err, "Userinfo unavailable; keeping ID token claims only"),
                },
                None => debug!("Provider advertises no userinfo endpoint"),
            }
        }

        let session = LoginSession {
            claims,
            id_token: tokens.id_token,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_token_expires_at: tokens.expires_in.map(|secs| now.saturating_add(secs)),
            logged_in_at: now,
        };
        let value = serde_json::to_string(&session)
            .map_err(|e| NilaOidcError::SessionStore(format!("Failed to encode login session: {e}")))?;
        self.store
            .set(&login_key(session_id), value, self.config.session_ttl)
            .await?;

        info!(
            attempt_id = %pending.attempt_id,
            sub = %session.claims.sub,
            "Login completed"
        );
        Ok(session)
    }

    /// The logged-in user of `session_id`, if any.
    pub async fn current_session(&self, session_id: &str) -> Result<Option<LoginSession>, NilaOidcError> {
        let Some(raw) = self.store.get(&login_key(session_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| NilaOidcError::SessionStore(format!("Stored login session is unreadable: {e}")))
    }

    /// Forgets everything stored for `session_id`.
    ///
    /// Returns the provider's logout URL when it advertises an
    /// `end_session_endpoint`; send the browser there to end the provider session too.
    #[instrument(skip_all, err)]
    pub async fn logout(
        &self,
        session_id: &str,
        post_logout_redirect_uri: Option<&Url>,
    ) -> Result<Option<Url>, NilaOidcError> {
        let session = match self.current_session(session_id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "Cannot read session during logout; logging out without id_token_hint");
                None
            }
        };
        self.store.delete(&login_key(session_id)).await?;
        self.store.delete(&auth_request_key(session_id)).await?;
        info!(had_session = session.is_some(), "Logged out");

        let metadata = match self.provider.metadata().await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(error = %err, "Cannot build provider logout URL");
                return Ok(None);
            }
        };
        let Some(endpoint) = &metadata.end_session_endpoint else {
            return Ok(None);
        };

        let mut url = endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some(session) = &session {
                query.append_pair("id_token_hint", &session.id_token);
            }
            if let Some(redirect) = post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", redirect.as_str());
            }
            query.append_pair("client_id", &self.config.client_id);
        }
        Ok(Some(url))
    }

    /// Evicts expired entries from the session store.
    pub async fn reap(&self) -> Result<(), NilaOidcError> {
        self.store.reap().await
    }
}

fn auth_request_key(session_id: &str) -> String {
    format!("auth_request:{session_id}")
}

fn login_key(session_id: &str) -> String {
    format!("login:{session_id}")
}
