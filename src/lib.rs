// src/lib.rs

pub mod authorize;
pub mod client;
pub mod config;
pub mod error;
pub mod exchange;
pub mod model;
pub mod relying_party;
pub mod session;
pub mod validator;

use std::time::{SystemTime, UNIX_EPOCH};

/// The public prelude for the `nila-oidc-rp` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::authorize::{AuthRequestState, AuthorizationRequest};
    pub use crate::client::ProviderClient;
    pub use crate::config::{Config, ConfigBuilder};
    pub use crate::error::{ClaimViolation, ErrorClass, NilaOidcError, SignatureFailure, StateFailure};
    pub use crate::model::{CallbackParams, IdentityClaims, ProviderMetadata};
    pub use crate::relying_party::{LoginSession, RelyingParty};
    pub use crate::session::{MemorySessionStore, SessionStore};
    pub use crate::validator::IdTokenVerifier;
    pub use jsonwebtoken::Algorithm;
}

/// Current time in Unix seconds.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
