//! Authorization request construction: PKCE (RFC 7636), `state` and `nonce`.
//!
//! Everything here is pure. The verifier, state and nonce are generated from the
//! thread-local CSPRNG and the redirect URL is built from the provider's
//! authorization endpoint; persisting the resulting [`AuthRequestState`] is the
//! caller's job (see [`crate::relying_party::RelyingParty::begin_login`]).

use crate::config::Config;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Random bytes behind a PKCE verifier. 32 bytes encode to 43 characters,
/// the RFC 7636 minimum length.
pub const PKCE_VERIFIER_BYTES: usize = 32;
/// Random bytes behind `state` and `nonce`.
pub const STATE_BYTES: usize = 24;

/// A PKCE code verifier. Redacted in `Debug` and `Display`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The S256 challenge derived from this verifier.
    pub fn challenge(&self) -> String {
        compute_challenge(&self.0)
    }
}

impl fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for PkceVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// `len` random bytes, URL-safe base64 without padding.
pub fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a cryptographically random PKCE code verifier.
pub fn generate_verifier() -> PkceVerifier {
    PkceVerifier(random_token(PKCE_VERIFIER_BYTES))
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Everything the callback needs to finish one login attempt.
///
/// Bound to the browser session that started the attempt and consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequestState {
    /// Correlation id for logs. Never sent to the provider.
    pub attempt_id: Uuid,
    pub state: String,
    pub nonce: String,
    pub pkce_verifier: PkceVerifier,
    pub code_challenge: String,
    pub redirect_uri: Url,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds.
    pub expires_at: u64,
}

impl AuthRequestState {
    /// Generates fresh verifier, state and nonce.
    pub fn generate(redirect_uri: Url, ttl: Duration, now: u64) -> Self {
        let pkce_verifier = generate_verifier();
        let code_challenge = pkce_verifier.challenge();
        Self {
            attempt_id: Uuid::new_v4(),
            state: random_token(STATE_BYTES),
            nonce: random_token(STATE_BYTES),
            pkce_verifier,
            code_challenge,
            redirect_uri,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_secs()),
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// The result of starting a login: where to send the browser, and what to remember.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: AuthRequestState,
}

/// Builds the full authorization URL with all required OIDC and PKCE parameters.
///
/// Query parameters already present on `authorization_endpoint` are preserved.
pub fn build_authorization_url(
    authorization_endpoint: &Url,
    client_id: &str,
    scope: &str,
    state: &AuthRequestState,
) -> Url {
    let mut url = authorization_endpoint.clone();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", state.redirect_uri.as_str())
        .append_pair("scope", scope)
        .append_pair("state", &state.state)
        .append_pair("nonce", &state.nonce)
        .append_pair("code_challenge", &state.code_challenge)
        .append_pair("code_challenge_method", "S256");
    url
}

/// Starts a login attempt: fresh PKCE pair, state and nonce, plus the redirect URL.
pub fn begin_login(config: &Config, authorization_endpoint: &Url, now: u64) -> AuthorizationRequest {
    let state = AuthRequestState::generate(config.redirect_uri.clone(), config.auth_request_ttl, now);
    let url = build_authorization_url(authorization_endpoint, &config.client_id, &config.scope_param(), &state);
    AuthorizationRequest { url, state }
}
