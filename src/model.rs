// src/model.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use tracing::debug;
use url::Url;

/// Represents the data structure of an OIDC provider's discovery document.
/// Found at the `.well-known/openid-configuration` endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
    #[serde(default = "default_signing_algs")]
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub userinfo_endpoint: Option<Url>,
    pub end_session_endpoint: Option<Url>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

fn default_signing_algs() -> Vec<String> {
    vec!["RS256".to_string()]
}

/// Represents a single JSON Web Key (JWK) as defined in RFC 7517.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKey {
    pub kid: Option<String>,
    pub kty: String,
    #[serde(rename = "use")]
    pub use_purpose: Option<String>,
    pub alg: Option<String>,
    // RSA
    pub n: Option<String>,
    pub e: Option<String>,
    // EC / OKP
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

/// Represents a JSON Web Key Set (JWKS), which is a collection of JWKs.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

/// The successful response of the token endpoint.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub id_token: String,
    pub token_type: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("id_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

/// The OAuth error body returned by the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
pub struct OAuthErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

/// The `aud` claim: either a single string or an array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == audience,
            Audience::Multiple(auds) => auds.iter().any(|aud| aud == audience),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Audience::Single(_) => 1,
            Audience::Multiple(auds) => auds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Audience::Single(aud) => write!(f, "{aud}"),
            Audience::Multiple(auds) => write!(f, "{}", auds.join(", ")),
        }
    }
}

/// ID token payload before validation. Every registered claim is optional here
/// so that a missing claim surfaces as a claim violation rather than a parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct UnverifiedClaims {
    pub iss: Option<String>,
    pub sub: Option<String>,
    pub aud: Option<Audience>,
    pub exp: Option<u64>,
    pub iat: Option<u64>,
    pub auth_time: Option<u64>,
    pub nonce: Option<String>,
    pub azp: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// The claims of a verified ID token.
///
/// Only [`crate::validator::IdTokenVerifier`] creates these from a token; a value
/// of this type in a [`crate::relying_party::LoginSession`] has passed every check.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IdentityClaims {
    pub sub: String,
    pub iss: String,
    pub aud: Audience,
    pub exp: u64,
    pub iat: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Every other claim of the token, untouched.
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// Claims held in named fields of [`IdentityClaims`]; never part of `additional`.
const TYPED_CLAIMS: &[&str] = &[
    "sub",
    "iss",
    "aud",
    "exp",
    "iat",
    "auth_time",
    "nonce",
    "azp",
    "name",
    "email",
    "email_verified",
    "preferred_username",
    "picture",
];

impl IdentityClaims {
    pub(crate) fn from_validated(claims: UnverifiedClaims) -> Result<Self, crate::error::ClaimViolation> {
        use crate::error::ClaimViolation::Missing;

        let mut additional = claims.additional;
        // A wrongly typed profile claim is dropped. Kept under its own name it
        // would shadow the typed field once the claims are stored and reloaded.
        let mut take_str = |name: &str| match additional.remove(name) {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                debug!(claim = name, value = %other, "Ignoring malformed profile claim");
                None
            }
            None => None,
        };
        let name = take_str("name");
        let email = take_str("email");
        let preferred_username = take_str("preferred_username");
        let picture = take_str("picture");
        let email_verified = match additional.remove("email_verified") {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::String(s)) if s == "true" || s == "false" => Some(s == "true"),
            Some(other) => {
                debug!(claim = "email_verified", value = %other, "Ignoring malformed profile claim");
                None
            }
            None => None,
        };

        Ok(Self {
            sub: claims.sub.ok_or(Missing("sub"))?,
            iss: claims.iss.ok_or(Missing("iss"))?,
            aud: claims.aud.ok_or(Missing("aud"))?,
            exp: claims.exp.ok_or(Missing("exp"))?,
            iat: claims.iat.ok_or(Missing("iat"))?,
            auth_time: claims.auth_time,
            nonce: claims.nonce,
            azp: claims.azp,
            name,
            email,
            email_verified,
            preferred_username,
            picture,
            additional,
        })
    }

    /// Fills profile claims the ID token did not carry from a userinfo response.
    /// Claims already present in the ID token are never overwritten.
    pub fn merge_userinfo(&mut self, userinfo: UserInfo) -> Result<(), crate::error::NilaOidcError> {
        if userinfo.sub != self.sub {
            return Err(crate::error::NilaOidcError::SubjectMismatch);
        }
        self.name = self.name.take().or(userinfo.name);
        self.email = self.email.take().or(userinfo.email);
        self.email_verified = self.email_verified.or(userinfo.email_verified);
        self.preferred_username = self.preferred_username.take().or(userinfo.preferred_username);
        self.picture = self.picture.take().or(userinfo.picture);
        for (claim, value) in userinfo.additional {
            if !TYPED_CLAIMS.contains(&claim.as_str()) {
                self.additional.entry(claim).or_insert(value);
            }
        }
        Ok(())
    }

    pub fn issued_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.iat as i64, 0)
    }

    pub fn expires_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(self.exp as i64, 0)
    }

    pub fn authenticated_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.auth_time.and_then(|t| chrono::DateTime::from_timestamp(t as i64, 0))
    }
}

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<bool>,
    pub preferred_username: Option<String>,
    pub picture: Option<String>,
    #[serde(flatten)]
    pub additional: Map<String, Value>,
}

/// Query parameters of the redirect back from the authorization endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parses the callback parameters from the full redirect URL.
    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs())
    }

    /// Parses a raw query string (without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        Self::from_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    fn from_pairs<'a>(pairs: impl Iterator<Item = (Cow<'a, str>, Cow<'a, str>)>) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            // First occurrence wins.
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }
}
