//! Standard OAuth 2.0 adapter built on the `oauth2` crate.
//!
//! [`OAuth2Adapter`] implements the authorization code grant (with PKCE when
//! the provider requires it) and the refresh token grant against the
//! endpoints in a [`ProviderConfig`]. Every token request is bounded by the
//! adapter's timeout.

use async_trait::async_trait;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse,
    TokenUrl,
    basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse},
    reqwest::async_http_client,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use super::{
    AdapterError, AuthorizationRequest, ClientCredentials, ProviderAdapter, ProviderConfig,
    ProviderTokens,
};
use crate::model::Platform;
use crate::secret::Secret;

/// How long a PKCE verifier waits for its authorization code.
const PKCE_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// Create an OAuth2 client for `config` and `client`.
pub(crate) fn create_oauth_client(
    config: &ProviderConfig,
    client: &ClientCredentials,
) -> Result<BasicClient, AdapterError> {
    let auth_url = AuthUrl::new(config.auth_url.clone()).map_err(|e| {
        AdapterError::Configuration {
            message: format!("invalid auth URL: {}", e),
        }
    })?;

    let token_url = TokenUrl::new(config.token_url.clone()).map_err(|e| {
        AdapterError::Configuration {
            message: format!("invalid token URL: {}", e),
        }
    })?;

    let redirect_url = RedirectUrl::new(client.redirect_uri.clone()).map_err(|e| {
        AdapterError::Configuration {
            message: format!("invalid redirect URL: {}", e),
        }
    })?;

    Ok(BasicClient::new(
        ClientId::new(client.client_id.clone()),
        client
            .client_secret
            .as_ref()
            .map(|s| ClientSecret::new(s.expose().to_string())),
        auth_url,
        Some(token_url),
    )
    .set_redirect_uri(redirect_url))
}

fn map_request_error<RE: std::error::Error>(
    err: RequestTokenError<RE, BasicErrorResponse>,
) -> AdapterError {
    match err {
        RequestTokenError::ServerResponse(response) => {
            let mut message = response.error().as_ref().to_string();
            if let Some(description) = response.error_description() {
                message = format!("{}: {}", message, description);
            }
            // Only grant and client errors mean the credential is dead.
            // Outages such as `temporarily_unavailable` arrive as extensions.
            match response.error() {
                BasicErrorResponseType::InvalidGrant
                | BasicErrorResponseType::InvalidClient
                | BasicErrorResponseType::UnauthorizedClient
                | BasicErrorResponseType::UnsupportedGrantType => {
                    AdapterError::Rejected { message }
                }
                _ => AdapterError::Transport { message },
            }
        }
        RequestTokenError::Request(e) => AdapterError::Transport {
            message: e.to_string(),
        },
        RequestTokenError::Parse(e, _) => AdapterError::Transport {
            message: format!("malformed token response: {}", e),
        },
        RequestTokenError::Other(message) => AdapterError::Transport { message },
    }
}

fn into_provider_tokens(response: BasicTokenResponse) -> Result<ProviderTokens, AdapterError> {
    let expires_in = response
        .expires_in()
        .map(chrono::Duration::from_std)
        .transpose()
        .map_err(|e| AdapterError::Transport {
            message: format!("invalid expiration duration: {}", e),
        })?;

    let scope = response.scopes().map(|scopes| {
        scopes
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    });

    Ok(ProviderTokens {
        access_token: Secret::new(response.access_token().secret().clone()),
        refresh_token: response
            .refresh_token()
            .map(|t| Secret::new(t.secret().clone())),
        expires_in,
        scope,
        provider_profile_id: None,
    })
}

/// Adapter for providers that follow RFC 6749.
pub struct OAuth2Adapter {
    config: ProviderConfig,
    timeout: Duration,
    pending_pkce: Mutex<HashMap<String, (Instant, PkceCodeVerifier)>>,
}

impl OAuth2Adapter {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            pending_pkce: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn bounded<T>(
        &self,
        request: impl Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, AdapterError> {
        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| AdapterError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
    }

    fn take_verifier(&self, state: Option<&str>) -> Result<PkceCodeVerifier, AdapterError> {
        let state = state.ok_or_else(|| AdapterError::Configuration {
            message: format!("{} requires the authorization state", self.config.name),
        })?;

        let mut pending = self.pending_pkce.lock();
        match pending.remove(state) {
            Some((issued, verifier)) if issued.elapsed() <= PKCE_STATE_TTL => Ok(verifier),
            _ => Err(AdapterError::Configuration {
                message: "unknown or expired authorization state".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for OAuth2Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Adapter")
            .field("platform", &self.config.platform)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl ProviderAdapter for OAuth2Adapter {
    fn platform(&self) -> Platform {
        self.config.platform.clone()
    }

    fn authorization_url(
        &self,
        client: &ClientCredentials,
    ) -> Result<AuthorizationRequest, AdapterError> {
        let oauth = create_oauth_client(&self.config, client)?;

        let mut request = oauth.authorize_url(CsrfToken::new_random);
        for scope in &self.config.default_scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        for (key, value) in &self.config.extra_auth_params {
            request = request.add_extra_param(key.clone(), value.clone());
        }

        let verifier = if self.config.supports_pkce {
            let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
            request = request.set_pkce_challenge(challenge);
            Some(verifier)
        } else {
            None
        };

        let (url, state) = request.url();
        let state = state.secret().clone();

        if let Some(verifier) = verifier {
            let mut pending = self.pending_pkce.lock();
            pending.retain(|_, (issued, _)| issued.elapsed() <= PKCE_STATE_TTL);
            pending.insert(state.clone(), (Instant::now(), verifier));
        }

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
        })
    }

    async fn exchange_code(
        &self,
        client: &ClientCredentials,
        code: &str,
        state: Option<&str>,
    ) -> Result<ProviderTokens, AdapterError> {
        let oauth = create_oauth_client(&self.config, client)?;
        let verifier = if self.config.supports_pkce {
            Some(self.take_verifier(state)?)
        } else {
            None
        };

        let mut request = oauth.exchange_code(AuthorizationCode::new(code.to_string()));
        if let Some(verifier) = verifier {
            request = request.set_pkce_verifier(verifier);
        }

        let response = self
            .bounded(async {
                request
                    .request_async(async_http_client)
                    .await
                    .map_err(map_request_error)
            })
            .await?;

        tracing::debug!("Exchanged authorization code for {}", self.config.platform);
        into_provider_tokens(response)
    }

    async fn refresh(
        &self,
        refresh_token: &Secret,
        client: &ClientCredentials,
    ) -> Result<ProviderTokens, AdapterError> {
        let oauth = create_oauth_client(&self.config, client)?;
        let refresh_token = RefreshToken::new(refresh_token.expose().to_string());

        let response = self
            .bounded(async {
                oauth
                    .exchange_refresh_token(&refresh_token)
                    .request_async(async_http_client)
                    .await
                    .map_err(map_request_error)
            })
            .await?;

        into_provider_tokens(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pkce: bool) -> ProviderConfig {
        ProviderConfig::new("test", "Test")
            .with_auth_url("https://example.com/auth")
            .with_token_url("https://example.com/token")
            .with_scopes(vec!["read".to_string(), "write".to_string()])
            .with_pkce(pkce)
            .with_auth_param("access_type", "offline")
    }

    fn client() -> ClientCredentials {
        ClientCredentials::new(
            "test-client-id",
            Some(Secret::new("test-secret")),
            "http://localhost:8080/callback",
        )
    }

    #[test]
    fn test_create_oauth_client_invalid_urls() {
        let config = ProviderConfig::new("test", "Test")
            .with_auth_url("not a valid url")
            .with_token_url("https://example.com/token");

        let result = create_oauth_client(&config, &client());
        assert!(matches!(result, Err(AdapterError::Configuration { .. })));
    }

    #[test]
    fn test_authorization_url_contains_parameters() {
        let adapter = OAuth2Adapter::new(config(false), Duration::from_secs(5));
        let request = adapter.authorization_url(&client()).unwrap();

        assert!(request.url.starts_with("https://example.com/auth?"));
        assert!(request.url.contains("client_id=test-client-id"));
        assert!(request.url.contains("scope=read+write"));
        assert!(request.url.contains("access_type=offline"));
        assert!(request.url.contains(&format!("state={}", request.state)));
        assert!(!request.url.contains("code_challenge"));
    }

    #[test]
    fn test_authorization_url_with_pkce_remembers_verifier() {
        let adapter = OAuth2Adapter::new(config(true), Duration::from_secs(5));
        let request = adapter.authorization_url(&client()).unwrap();

        assert!(request.url.contains("code_challenge="));
        assert!(adapter.take_verifier(Some(&request.state)).is_ok());
        // Single use.
        assert!(adapter.take_verifier(Some(&request.state)).is_err());
    }

    #[tokio::test]
    async fn test_pkce_exchange_requires_state() {
        let adapter = OAuth2Adapter::new(config(true), Duration::from_secs(5));
        let result = adapter.exchange_code(&client(), "code", None).await;
        assert!(matches!(result, Err(AdapterError::Configuration { .. })));
    }
}
