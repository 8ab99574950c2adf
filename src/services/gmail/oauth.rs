//! Stage 0 (§4.9): authorization URL issuance, one-time CSRF state, code
//! exchange, and token refresh. State store is in-memory — a restart simply
//! invalidates in-flight authorizations, which is acceptable since the user
//! can always restart the flow.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};

use crate::models::OAuthTokens;
use crate::utils::{ApiError, ApiResult};

const STATE_TTL: Duration = Duration::from_secs(600);
const GMAIL_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GMAIL_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// One-time, TTL-bound CSRF state tokens issued by `authorize_url` and
/// consumed by `exchange_code`.
#[derive(Clone, Default)]
pub struct StateStore {
    issued: Arc<DashMap<String, Instant>>,
}

impl StateStore {
    pub fn issue(&self, state: &str) {
        self.issued.insert(state.to_string(), Instant::now());
    }

    /// Consumes `state` if present and not expired. Always removes the
    /// entry so a state can never be replayed.
    pub fn consume(&self, state: &str) -> bool {
        match self.issued.remove(state) {
            Some((_, issued_at)) => issued_at.elapsed() <= STATE_TTL,
            None => false,
        }
    }
}

pub struct GmailOAuth {
    client: BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>,
    state_store: StateStore,
}

impl GmailOAuth {
    pub fn new(client_id: &str, client_secret: &str, redirect_uri: &str) -> ApiResult<Self> {
        let client = BasicClient::new(ClientId::new(client_id.to_string()))
            .set_client_secret(ClientSecret::new(client_secret.to_string()))
            .set_auth_uri(
                AuthUrl::new(GMAIL_AUTH_URL.to_string())
                    .map_err(|e| ApiError::internal_error(format!("invalid gmail auth url: {e}")))?,
            )
            .set_token_uri(
                TokenUrl::new(GMAIL_TOKEN_URL.to_string())
                    .map_err(|e| ApiError::internal_error(format!("invalid gmail token url: {e}")))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.to_string())
                    .map_err(|e| ApiError::validation_error(format!("invalid redirect uri: {e}")))?,
            );
        Ok(Self { client, state_store: StateStore::default() })
    }

    /// Issues a fresh 32-byte CSRF state (10-minute TTL, one-time use) and
    /// the authorization URL the user agent should be sent to.
    pub fn authorize_url(&self) -> (String, String) {
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(GMAIL_READONLY_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();
        let state = csrf_token.secret().clone();
        self.state_store.issue(&state);
        (auth_url.to_string(), state)
    }

    pub async fn exchange_code(&self, code: &str, state: &str) -> ApiResult<OAuthTokens> {
        if !self.state_store.consume(state) {
            return Err(ApiError::validation_error("oauth state missing, expired, or already used"));
        }

        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ApiError::internal_error(format!("http client build failed: {e}")))?;

        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&http_client)
            .await
            .map_err(|e| ApiError::internal_error(format!("oauth code exchange failed: {e}")))?;

        token_response_into_tokens(&token, None)
    }

    /// Refreshes the token set, preserving the existing refresh token when
    /// the provider omits a new one in its response (§4.9 Stage 0).
    pub async fn refresh(&self, current_refresh_token: &str) -> ApiResult<OAuthTokens> {
        let http_client = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ApiError::internal_error(format!("http client build failed: {e}")))?;

        let token = self
            .client
            .exchange_refresh_token(&oauth2::RefreshToken::new(current_refresh_token.to_string()))
            .request_async(&http_client)
            .await
            .map_err(|e| ApiError::internal_error(format!("oauth refresh failed: {e}")))?;

        token_response_into_tokens(&token, Some(current_refresh_token))
    }
}

fn token_response_into_tokens(
    token: &oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>,
    fallback_refresh: Option<&str>,
) -> ApiResult<OAuthTokens> {
    let expires_in = token.expires_in().unwrap_or(Duration::from_secs(3600));
    let expires_at = chrono::Utc::now() + chrono::Duration::from_std(expires_in).unwrap_or_default();
    let refresh_token = token
        .refresh_token()
        .map(|rt| rt.secret().clone())
        .or_else(|| fallback_refresh.map(|s| s.to_string()));

    Ok(OAuthTokens { access_token: token.access_token().secret().clone(), refresh_token, expires_at })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_single_use() {
        let store = StateStore::default();
        store.issue("abc");
        assert!(store.consume("abc"));
        assert!(!store.consume("abc"));
    }

    #[test]
    fn unknown_state_is_rejected() {
        let store = StateStore::default();
        assert!(!store.consume("never-issued"));
    }
}
