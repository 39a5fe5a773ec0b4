// src/validator/mod.rs

pub mod claims;
pub mod keys;

pub use claims::{ClaimValidator, StandardClaimValidator, ValidationContext};
pub use keys::{KeySet, KeyVerifier, StaticKeyVerifier, VerificationKey};

use crate::config::Config;
use crate::error::{NilaOidcError, SignatureFailure};
use crate::model::{IdentityClaims, UnverifiedClaims};
use jsonwebtoken::{Algorithm, Header};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Verifies ID tokens returned by the token endpoint.
///
/// The signature is checked before any claim is looked at. Key lookup and claim
/// checks are delegated to a [`KeyVerifier`] and a [`ClaimValidator`], so either
/// can be swapped (e.g. a static key set in tests).
#[derive(Clone)]
pub struct IdTokenVerifier {
    keys: Arc<dyn KeyVerifier>,
    claims: Arc<dyn ClaimValidator>,
    algorithms: Vec<Algorithm>,
}

impl IdTokenVerifier {
    pub fn new(keys: Arc<dyn KeyVerifier>, claims: Arc<dyn ClaimValidator>, algorithms: Vec<Algorithm>) -> Self {
        Self { keys, claims, algorithms }
    }

    /// Standard claim checks with the leeway and algorithm allowlist of `config`.
    pub fn from_config(config: &Config, keys: Arc<dyn KeyVerifier>) -> Self {
        Self::new(
            keys,
            Arc::new(StandardClaimValidator::new(config.validation.leeway)),
            config.validation.algorithms.clone(),
        )
    }

    /// Verifies `token` and returns its claims.
    ///
    /// # Arguments
    ///
    /// * `token` - The raw compact-serialized ID token.
    /// * `stored_nonce` - The nonce stored with the login attempt.
    /// * `expected_issuer` - The issuer from the provider metadata.
    /// * `expected_audience` - Our client ID.
    pub async fn verify_id_token(
        &self,
        token: &str,
        stored_nonce: &str,
        expected_issuer: &str,
        expected_audience: &str,
    ) -> Result<IdentityClaims, NilaOidcError> {
        self.verify_id_token_at(token, stored_nonce, expected_issuer, expected_audience, crate::unix_now())
            .await
    }

    /// [`Self::verify_id_token`] with an explicit clock (Unix seconds).
    #[instrument(skip(self, token, nonce), err)]
    pub async fn verify_id_token_at(
        &self,
        token: &str,
        nonce: &str,
        expected_issuer: &str,
        expected_audience: &str,
        now: u64,
    ) -> Result<IdentityClaims, NilaOidcError> {
        let mut segments = token.split('.');
        let (header_b64, payload_b64, signature_b64) =
            match (segments.next(), segments.next(), segments.next(), segments.next()) {
                (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => (h, p, s),
                _ => {
                    return Err(NilaOidcError::MalformedToken(
                        "expected three dot-separated segments".to_string(),
                    ))
                }
            };

        let header = parse_header(header_b64)?;
        if !self.algorithms.contains(&header.alg) {
            return Err(NilaOidcError::SignatureInvalid(SignatureFailure::UnsupportedAlgorithm(
                header.alg,
            )));
        }
        if signature_b64.is_empty() {
            return Err(NilaOidcError::MalformedToken("signature segment is empty".to_string()));
        }

        let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];
        self.keys
            .verify_signature(&header, signing_input, signature_b64)
            .await?;
        debug!(kid = ?header.kid, alg = ?header.alg, "ID token signature verified");

        let payload = base64_url::decode(payload_b64)
            .map_err(|e| NilaOidcError::MalformedToken(format!("payload is not base64url: {e}")))?;
        let claims: UnverifiedClaims = serde_json::from_slice(&payload)
            .map_err(|e| NilaOidcError::MalformedToken(format!("payload is not a JSON claim set: {e}")))?;

        let ctx = ValidationContext {
            expected_issuer,
            expected_audience,
            nonce,
            now,
        };
        self.claims.validate(&claims, &ctx)?;

        Ok(IdentityClaims::from_validated(claims)?)
    }
}

/// Decodes the JOSE header, refusing unsigned tokens before anything else.
fn parse_header(segment: &str) -> Result<Header, NilaOidcError> {
    let bytes = base64_url::decode(segment)
        .map_err(|e| NilaOidcError::MalformedToken(format!("header is not base64url: {e}")))?;
    let raw: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| NilaOidcError::MalformedToken(format!("header is not JSON: {e}")))?;

    let alg = raw
        .get("alg")
        .and_then(|alg| alg.as_str())
        .ok_or_else(|| NilaOidcError::MalformedToken("header has no 'alg'".to_string()))?;
    if alg.eq_ignore_ascii_case("none") {
        return Err(NilaOidcError::SignatureInvalid(SignatureFailure::Unsigned));
    }

    serde_json::from_value(raw)
        .map_err(|e| NilaOidcError::MalformedToken(format!("unsupported JOSE header: {e}")))
}
