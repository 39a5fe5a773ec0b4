// src/validator/claims.rs

use crate::error::ClaimViolation;
use crate::model::UnverifiedClaims;
use std::time::Duration;
use subtle::ConstantTimeEq;

/// What a token must be checked against.
#[derive(Debug, Clone)]
pub struct ValidationContext<'a> {
    /// The `issuer` of the provider's discovery document.
    pub expected_issuer: &'a str,
    /// Our `client_id`.
    pub expected_audience: &'a str,
    /// The nonce stored with the login attempt.
    pub nonce: &'a str,
    /// Unix seconds.
    pub now: u64,
}

/// Checks the claims of a token whose signature has already been verified.
pub trait ClaimValidator: Send + Sync {
    fn validate(&self, claims: &UnverifiedClaims, ctx: &ValidationContext<'_>) -> Result<(), ClaimViolation>;
}

/// The OpenID Connect Core 3.1.3.7 checks.
///
/// `exp` is enforced strictly. `leeway` only tolerates an `iat` slightly in the
/// future, for providers whose clocks run ahead of ours.
#[derive(Debug, Clone)]
pub struct StandardClaimValidator {
    pub leeway: Duration,
}

impl StandardClaimValidator {
    pub fn new(leeway: Duration) -> Self {
        Self { leeway }
    }
}

impl ClaimValidator for StandardClaimValidator {
    fn validate(&self, claims: &UnverifiedClaims, ctx: &ValidationContext<'_>) -> Result<(), ClaimViolation> {
        let iss = claims.iss.as_deref().ok_or(ClaimViolation::Missing("iss"))?;
        if iss != ctx.expected_issuer {
            return Err(ClaimViolation::Issuer {
                expected: ctx.expected_issuer.to_string(),
                actual: iss.to_string(),
            });
        }

        if claims.sub.as_deref().map_or(true, str::is_empty) {
            return Err(ClaimViolation::Missing("sub"));
        }

        let aud = claims.aud.as_ref().ok_or(ClaimViolation::Missing("aud"))?;
        if !aud.contains(ctx.expected_audience) {
            return Err(ClaimViolation::Audience {
                expected: ctx.expected_audience.to_string(),
            });
        }
        let needs_azp = aud.len() > 1 || claims.azp.is_some();
        if needs_azp && claims.azp.as_deref() != Some(ctx.expected_audience) {
            return Err(ClaimViolation::AuthorizedParty {
                expected: ctx.expected_audience.to_string(),
                actual: claims.azp.clone(),
            });
        }

        let exp = claims.exp.ok_or(ClaimViolation::Missing("exp"))?;
        if exp <= ctx.now {
            return Err(ClaimViolation::Expired { exp, now: ctx.now });
        }

        let iat = claims.iat.ok_or(ClaimViolation::Missing("iat"))?;
        if iat > ctx.now.saturating_add(self.leeway.as_secs()) {
            return Err(ClaimViolation::IssuedInFuture { iat, now: ctx.now });
        }

        let nonce = claims.nonce.as_deref().ok_or(ClaimViolation::Missing("nonce"))?;
        if !bool::from(nonce.as_bytes().ct_eq(ctx.nonce.as_bytes())) {
            return Err(ClaimViolation::NonceMismatch);
        }

        Ok(())
    }
}
