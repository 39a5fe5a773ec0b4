// src/error.rs

use jsonwebtoken::Algorithm;
use std::fmt;
use thiserror::Error;

/// The primary error type for the `nila-oidc-rp` library.
///
/// Every failure of a login attempt is terminal. Use [`NilaOidcError::class`]
/// to tell provider/network trouble apart from security violations.
#[derive(Debug, Clone, Error)]
pub enum NilaOidcError {
    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A required configuration field is missing.
    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The configuration for key sources is ambiguous (e.g., both JWKS and a shared secret were provided).
    #[error("Ambiguous key source configuration: {0}")]
    AmbiguousKeySource(String),

    /// The provider's discovery document could not be fetched or is incomplete.
    #[error("OIDC discovery failed: {0}")]
    Discovery(String),

    /// The provider's JSON Web Key Set could not be fetched or parsed.
    #[error("JWKS fetch failed: {0}")]
    KeyFetch(String),

    /// The token endpoint rejected the request or returned an unusable body.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The authorization server redirected back with an error instead of a code.
    #[error("Authorization denied by provider: {error} ({})", .description.as_deref().unwrap_or("no description"))]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    /// The userinfo endpoint could not be queried.
    #[error("Userinfo request failed: {0}")]
    UserInfo(String),

    /// The session store failed to read or write.
    #[error("Session store error: {0}")]
    SessionStore(String),

    /// The callback `state` does not belong to a live login attempt of this session.
    #[error("State mismatch: {0}")]
    StateMismatch(StateFailure),

    /// The ID token is not a well-formed compact JWS.
    #[error("Malformed ID token: {0}")]
    MalformedToken(String),

    /// The ID token signature could not be verified.
    #[error("Invalid ID token signature: {0}")]
    SignatureInvalid(SignatureFailure),

    /// A claim of a correctly signed ID token failed validation.
    #[error("ID token claim validation failed: {0}")]
    ClaimValidation(#[from] ClaimViolation),

    /// The userinfo response describes a different subject than the ID token.
    #[error("Userinfo subject does not match the ID token subject")]
    SubjectMismatch,
}

/// Coarse classification used for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The library was configured incorrectly.
    Configuration,
    /// Provider, network or user-side failure. Safe to let the user retry.
    Transient,
    /// Possible attack or tampering: CSRF, replay, forged or foreign tokens.
    SecurityViolation,
}

impl NilaOidcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            NilaOidcError::InvalidUrl(_)
            | NilaOidcError::MissingConfiguration(_)
            | NilaOidcError::InvalidConfiguration(_)
            | NilaOidcError::AmbiguousKeySource(_) => ErrorClass::Configuration,
            NilaOidcError::Discovery(_)
            | NilaOidcError::KeyFetch(_)
            | NilaOidcError::TokenExchange(_)
            | NilaOidcError::AuthorizationDenied { .. }
            | NilaOidcError::UserInfo(_)
            | NilaOidcError::SessionStore(_) => ErrorClass::Transient,
            NilaOidcError::StateMismatch(_)
            | NilaOidcError::MalformedToken(_)
            | NilaOidcError::SignatureInvalid(_)
            | NilaOidcError::ClaimValidation(_)
            | NilaOidcError::SubjectMismatch => ErrorClass::SecurityViolation,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        self.class() == ErrorClass::SecurityViolation
    }
}

/// Why a callback was not accepted as the continuation of a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateFailure {
    /// The session has no pending login attempt (never started, or already consumed).
    NoPendingRequest,
    /// The pending login attempt outlived its time window.
    Expired,
    /// The returned `state` differs from the stored one.
    Mismatch,
    /// The callback did not carry a `state` parameter.
    Missing,
}

impl fmt::Display for StateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateFailure::NoPendingRequest => write!(f, "no pending login attempt for this session"),
            StateFailure::Expired => write!(f, "the pending login attempt has expired"),
            StateFailure::Mismatch => write!(f, "returned state does not match the stored state"),
            StateFailure::Missing => write!(f, "callback carries no state parameter"),
        }
    }
}

/// Why an ID token signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureFailure {
    /// The token declares `alg: none`.
    Unsigned,
    /// The algorithm in the header is not in the allowed list.
    UnsupportedAlgorithm(Algorithm),
    /// The header has no `kid` and the key set holds more than one key.
    MissingKeyId,
    /// No key with this `kid`, even after refreshing the key set.
    UnknownKey(String),
    /// The resolved key cannot be used with the header's algorithm.
    KeyAlgorithmMismatch { kid: String, alg: Algorithm },
    /// The signature does not verify.
    Mismatch,
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureFailure::Unsigned => write!(f, "token is unsigned (alg: none)"),
            SignatureFailure::UnsupportedAlgorithm(alg) => write!(f, "algorithm {alg:?} is not allowed"),
            SignatureFailure::MissingKeyId => write!(f, "the JWT header is missing the 'kid' (Key ID) field"),
            SignatureFailure::UnknownKey(kid) => write!(f, "key not found for kid: {kid}"),
            SignatureFailure::KeyAlgorithmMismatch { kid, alg } => {
                write!(f, "key '{kid}' cannot verify {alg:?} signatures")
            }
            SignatureFailure::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

/// A specific claim check that failed. Each variant names the claim involved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimViolation {
    #[error("required claim '{0}' is missing")]
    Missing(&'static str),

    #[error("iss: expected '{expected}', found '{actual}'")]
    Issuer { expected: String, actual: String },

    #[error("aud: '{expected}' is not among the token audiences")]
    Audience { expected: String },

    #[error("azp: expected '{expected}', found {actual:?}")]
    AuthorizedParty {
        expected: String,
        actual: Option<String>,
    },

    #[error("exp: token expired at {exp} (now {now})")]
    Expired { exp: u64, now: u64 },

    #[error("iat: token issued in the future at {iat} (now {now})")]
    IssuedInFuture { iat: u64, now: u64 },

    #[error("nonce: the nonce in the token does not match the expected nonce")]
    NonceMismatch,
}

impl ClaimViolation {
    /// Name of the violated claim.
    pub fn claim(&self) -> &'static str {
        match self {
            ClaimViolation::Missing(claim) => claim,
            ClaimViolation::Issuer { .. } => "iss",
            ClaimViolation::Audience { .. } => "aud",
            ClaimViolation::AuthorizedParty { .. } => "azp",
            ClaimViolation::Expired { .. } => "exp",
            ClaimViolation::IssuedInFuture { .. } => "iat",
            ClaimViolation::NonceMismatch => "nonce",
        }
    }
}
