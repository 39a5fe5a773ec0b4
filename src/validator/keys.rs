// src/validator/keys.rs

use crate::error::{NilaOidcError, SignatureFailure};
use crate::model::{JsonWebKey, JsonWebKeySet};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Header};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Elliptic curves accepted for EC keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
}

/// The kind of key material, which decides the algorithms a key may verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec(EcCurve),
    Ed25519,
    Hmac,
}

impl KeyFamily {
    fn supports(self, alg: Algorithm) -> bool {
        use Algorithm::*;
        match self {
            KeyFamily::Rsa => matches!(alg, RS256 | RS384 | RS512 | PS256 | PS384 | PS512),
            KeyFamily::Ec(EcCurve::P256) => alg == ES256,
            KeyFamily::Ec(EcCurve::P384) => alg == ES384,
            KeyFamily::Ed25519 => alg == EdDSA,
            KeyFamily::Hmac => matches!(alg, HS256 | HS384 | HS512),
        }
    }
}

/// A single public (or shared) key usable for signature checks.
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: Option<String>,
    pub family: KeyFamily,
    /// Algorithm pinned by the JWK's `alg` member, if any.
    pub alg: Option<Algorithm>,
    key: DecodingKey,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl VerificationKey {
    /// Converts a JWK into a verification key.
    ///
    /// Returns `Ok(None)` for keys that are not meant for signatures or whose type
    /// is not supported, and `Err` for keys that claim a supported type but carry
    /// unusable material.
    pub fn from_jwk(jwk: &JsonWebKey) -> Result<Option<Self>, String> {
        if let Some(purpose) = jwk.use_purpose.as_deref() {
            if purpose != "sig" {
                return Ok(None);
            }
        }
        let alg = match jwk.alg.as_deref() {
            Some(alg) => match Algorithm::from_str(alg) {
                Ok(alg) => Some(alg),
                // e.g. an encryption algorithm such as RSA-OAEP
                Err(_) => return Ok(None),
            },
            None => None,
        };

        let (family, key) = match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_deref().ok_or("RSA key missing 'n' component")?;
                let e = jwk.e.as_deref().ok_or("RSA key missing 'e' component")?;
                let key = DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())?;
                (KeyFamily::Rsa, key)
            }
            "EC" => {
                let curve = match jwk.crv.as_deref() {
                    Some("P-256") => EcCurve::P256,
                    Some("P-384") => EcCurve::P384,
                    _ => return Ok(None),
                };
                let x = jwk.x.as_deref().ok_or("EC key missing 'x' coordinate")?;
                let y = jwk.y.as_deref().ok_or("EC key missing 'y' coordinate")?;
                let key = DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())?;
                (KeyFamily::Ec(curve), key)
            }
            "OKP" => {
                if jwk.crv.as_deref() != Some("Ed25519") {
                    return Ok(None);
                }
                let x = jwk.x.as_deref().ok_or("OKP key missing 'x' component")?;
                let key = DecodingKey::from_ed_components(x).map_err(|e| e.to_string())?;
                (KeyFamily::Ed25519, key)
            }
            _ => return Ok(None),
        };

        if let Some(alg) = alg {
            if !family.supports(alg) {
                return Err(format!("key type {} cannot be used with {alg:?}", jwk.kty));
            }
        }

        Ok(Some(Self {
            kid: jwk.kid.clone(),
            family,
            alg,
            key,
        }))
    }

    /// A symmetric key for HS256/384/512 tokens (e.g. signed with the client secret).
    pub fn from_secret(kid: Option<String>, secret: &[u8]) -> Self {
        Self {
            kid,
            family: KeyFamily::Hmac,
            alg: None,
            key: DecodingKey::from_secret(secret),
        }
    }

    pub fn supports(&self, alg: Algorithm) -> bool {
        self.family.supports(alg) && self.alg.map_or(true, |pinned| pinned == alg)
    }

    /// Checks `signature` (base64url) over `signing_input` (`header.payload`).
    pub fn verify(&self, signing_input: &str, signature: &str, alg: Algorithm) -> Result<(), SignatureFailure> {
        if !self.supports(alg) {
            return Err(SignatureFailure::KeyAlgorithmMismatch {
                kid: self.kid.clone().unwrap_or_default(),
                alg,
            });
        }
        match jsonwebtoken::crypto::verify(signature, signing_input.as_bytes(), &self.key, alg) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(SignatureFailure::Mismatch),
        }
    }
}

/// Verification keys indexed by key identifier.
#[derive(Debug, Clone)]
pub struct KeySet {
    keys: HashMap<String, VerificationKey>,
    unnamed: Vec<VerificationKey>,
    fetched_at: Instant,
    ttl: Duration,
}

impl KeySet {
    pub fn new(keys: impl IntoIterator<Item = VerificationKey>, ttl: Duration) -> Self {
        let mut named = HashMap::new();
        let mut unnamed = Vec::new();
        for key in keys {
            match key.kid.clone() {
                Some(kid) => {
                    named.insert(kid, key);
                }
                None => unnamed.push(key),
            }
        }
        Self {
            keys: named,
            unnamed,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    /// Builds a key set from a JWKS document, skipping keys that cannot be used.
    pub fn from_jwks(jwks: &JsonWebKeySet, ttl: Duration) -> Self {
        let keys = jwks.keys.iter().filter_map(|jwk| match VerificationKey::from_jwk(jwk) {
            Ok(Some(key)) => Some(key),
            Ok(None) => {
                debug!(kid = ?jwk.kid, kty = %jwk.kty, "Skipping JWK not usable for signatures");
                None
            }
            Err(reason) => {
                warn!(kid = ?jwk.kid, kty = %jwk.kty, %reason, "Skipping malformed JWK");
                None
            }
        });
        Self::new(keys, ttl)
    }

    /// A key set holding one shared secret that matches any `kid`.
    pub fn shared_secret(secret: &[u8]) -> Self {
        Self::new([VerificationKey::from_secret(None, secret)], Duration::MAX)
    }

    pub fn len(&self) -> usize {
        self.keys.len() + self.unnamed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// Finds the key a token header points at.
    ///
    /// A header without `kid` resolves only when the set holds exactly one key.
    /// A lone shared secret also answers any `kid`. `Ok(None)` means "not here",
    /// which callers treat as a reason to refresh.
    pub fn resolve(&self, kid: Option<&str>) -> Result<Option<&VerificationKey>, SignatureFailure> {
        let single = if self.len() == 1 {
            self.keys.values().chain(self.unnamed.iter()).next()
        } else {
            None
        };
        match kid {
            Some(kid) => Ok(self
                .keys
                .get(kid)
                .or_else(|| single.filter(|key| key.family == KeyFamily::Hmac && key.kid.is_none()))),
            None if self.is_empty() => Ok(None),
            None => single.map(Some).ok_or(SignatureFailure::MissingKeyId),
        }
    }
}

/// The sign-key lookup and signature check capability used by the ID token verifier.
///
/// Implementors only provide access to the current key set and a way to replace
/// it; the provided [`KeyVerifier::verify_signature`] performs the lookup with a
/// single forced refresh on an unknown `kid`.
#[async_trait]
pub trait KeyVerifier: Send + Sync {
    /// The key set to verify against right now.
    async fn current_keys(&self) -> Result<Arc<KeySet>, NilaOidcError>;

    /// Replaces `stale` with a freshly fetched set. Implementations may return a
    /// newer set fetched by someone else instead of fetching again.
    async fn refresh_keys(&self, stale: &Arc<KeySet>) -> Result<Arc<KeySet>, NilaOidcError>;

    /// Verifies the signature of a compact JWS whose header has already been parsed.
    async fn verify_signature(
        &self,
        header: &Header,
        signing_input: &str,
        signature: &str,
    ) -> Result<(), NilaOidcError> {
        let kid = header.kid.as_deref();
        let keys = self.current_keys().await?;
        let key = match keys.resolve(kid).map_err(NilaOidcError::SignatureInvalid)? {
            Some(key) => key.clone(),
            None => {
                debug!(?kid, "Signing key not in cached key set; forcing one refresh");
                let refreshed = self.refresh_keys(&keys).await?;
                let resolved = refreshed.resolve(kid).map_err(NilaOidcError::SignatureInvalid)?;
                resolved.cloned().ok_or_else(|| {
                    NilaOidcError::SignatureInvalid(SignatureFailure::UnknownKey(
                        kid.unwrap_or("<none>").to_string(),
                    ))
                })?
            }
        };
        key.verify(signing_input, signature, header.alg)
            .map_err(NilaOidcError::SignatureInvalid)
    }
}

/// A fixed key set. Used for shared-secret configurations and for tests.
#[derive(Debug, Clone)]
pub struct StaticKeyVerifier {
    keys: Arc<KeySet>,
}

impl StaticKeyVerifier {
    pub fn new(keys: KeySet) -> Self {
        Self { keys: Arc::new(keys) }
    }
}

#[async_trait]
impl KeyVerifier for StaticKeyVerifier {
    async fn current_keys(&self) -> Result<Arc<KeySet>, NilaOidcError> {
        Ok(self.keys.clone())
    }

    async fn refresh_keys(&self, _stale: &Arc<KeySet>) -> Result<Arc<KeySet>, NilaOidcError> {
        Ok(self.keys.clone())
    }
}
