// src/exchange.rs

use crate::authorize::AuthRequestState;
use crate::error::{NilaOidcError, StateFailure};
use crate::model::{OAuthErrorResponse, TokenResponse, UserInfo};
use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument};
use url::Url;

/// Compares the `state` returned on the callback with the stored one in constant time.
pub fn verify_state(returned: Option<&str>, stored: &str) -> Result<(), NilaOidcError> {
    let returned = returned.ok_or(NilaOidcError::StateMismatch(StateFailure::Missing))?;
    if bool::from(returned.as_bytes().ct_eq(stored.as_bytes())) {
        Ok(())
    } else {
        Err(NilaOidcError::StateMismatch(StateFailure::Mismatch))
    }
}

/// Redeems authorization codes at the token endpoint and queries userinfo.
#[derive(Clone)]
pub struct TokenExchangeClient {
    http_client: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
}

impl TokenExchangeClient {
    pub fn new(http_client: reqwest::Client, client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            http_client,
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Exchanges `code` for tokens.
    ///
    /// `returned_state` is checked against `stored` before anything is sent, so a
    /// forged callback never reaches the provider. The PKCE verifier and redirect
    /// URI come from `stored`.
    #[instrument(skip(self, code, returned_state, stored), fields(attempt_id = %stored.attempt_id), err)]
    pub async fn exchange_code(
        &self,
        token_endpoint: &Url,
        code: &str,
        returned_state: Option<&str>,
        stored: &AuthRequestState,
    ) -> Result<TokenResponse, NilaOidcError> {
        verify_state(returned_state, &stored.state)?;

        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", stored.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", stored.pkce_verifier.expose()),
        ];
        let mut request = self.http_client.post(token_endpoint.clone()).form(&form);
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(&self.client_id, Some(secret));
        }

        debug!(%token_endpoint, "Redeeming authorization code");
        let response = request
            .send()
            .await
            .map_err(|e| NilaOidcError::TokenExchange(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| NilaOidcError::TokenExchange(e.to_string()))?;

        if !status.is_success() {
            let detail = match serde_json::from_slice::<OAuthErrorResponse>(&body) {
                Ok(OAuthErrorResponse {
                    error,
                    error_description: Some(description),
                }) => format!("{error}: {description}"),
                Ok(OAuthErrorResponse { error, .. }) => error,
                Err(_) => "no OAuth error body".to_string(),
            };
            return Err(NilaOidcError::TokenExchange(format!("HTTP {status} ({detail})")));
        }

        let tokens: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| NilaOidcError::TokenExchange(format!("invalid token response: {e}")))?;
        if !tokens.token_type.eq_ignore_ascii_case("bearer") {
            return Err(NilaOidcError::TokenExchange(format!(
                "unsupported token_type '{}'",
                tokens.token_type
            )));
        }

        info!(expires_in = ?tokens.expires_in, has_refresh_token = tokens.refresh_token.is_some(), "Authorization code redeemed");
        Ok(tokens)
    }

    /// Queries the userinfo endpoint with the access token.
    #[instrument(skip(self, access_token), err)]
    pub async fn fetch_userinfo(&self, userinfo_endpoint: &Url, access_token: &str) -> Result<UserInfo, NilaOidcError> {
        let response = self
            .http_client
            .get(userinfo_endpoint.clone())
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| NilaOidcError::UserInfo(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NilaOidcError::UserInfo(format!("{userinfo_endpoint} returned HTTP {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| NilaOidcError::UserInfo(format!("invalid userinfo response: {e}")))
    }
}
