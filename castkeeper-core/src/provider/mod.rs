//! OAuth provider configuration and the per-platform adapter contract.
//!
//! This module provides:
//! - [`ProviderConfig`] - Endpoints and capabilities of an OAuth provider
//! - [`ProviderRegistry`] - Registry of provider configurations, pre-filled
//!   with the platforms episodes are published to
//! - [`ProviderAdapter`] - The capability set every platform implements
//!   (authorization URL, code exchange, refresh)
//! - [`AdapterRegistry`] - Maps each configured platform to its adapter and
//!   client credentials
//!
//! The refresher and the health-check scheduler only ever talk to
//! [`ProviderAdapter`]; platform identity is nothing more than a registry key.

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::model::Platform;
use crate::secret::Secret;

#[cfg(feature = "oauth")]
mod oauth;

#[cfg(feature = "oauth")]
pub use oauth::OAuth2Adapter;

/// Error returned by provider adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// The provider answered with an OAuth error (e.g. `invalid_grant`).
    #[error("provider rejected the request: {message}")]
    Rejected { message: String },

    /// Network failure or a response that could not be understood.
    #[error("provider request failed: {message}")]
    Transport { message: String },

    /// The provider did not answer within the adapter's timeout.
    #[error("provider did not respond within {seconds}s")]
    Timeout { seconds: u64 },

    /// The adapter's own configuration is unusable (bad URL, unknown state).
    #[error("invalid provider configuration: {message}")]
    Configuration { message: String },
}

/// OAuth client credentials for one platform.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<Secret>,
    pub redirect_uri: String,
}

impl ClientCredentials {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: Option<Secret>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            redirect_uri: redirect_uri.into(),
        }
    }
}

/// Tokens returned by a code exchange or a refresh.
#[derive(Debug, Clone)]
pub struct ProviderTokens {
    pub access_token: Secret,

    /// A rotated refresh token, if the provider issued one.
    pub refresh_token: Option<Secret>,

    /// Lifetime of the access token, if the provider reported it.
    pub expires_in: Option<Duration>,

    pub scope: Option<String>,
    pub provider_profile_id: Option<String>,
}

impl ProviderTokens {
    pub fn new(access_token: impl Into<Secret>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in: None,
            scope: None,
            provider_profile_id: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<Secret>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// An authorization URL and the CSRF state embedded in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// The OAuth capability set of one platform.
///
/// Implementations own their transport and must bound every network call
/// with a timeout; a timed-out call is reported as [`AdapterError::Timeout`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The platform this adapter speaks for.
    fn platform(&self) -> Platform;

    /// Build the URL the user visits to grant access.
    fn authorization_url(
        &self,
        client: &ClientCredentials,
    ) -> Result<AuthorizationRequest, AdapterError>;

    /// Exchange an authorization code for tokens.
    ///
    /// `state` is the value returned alongside the authorization URL; it is
    /// required by providers that use PKCE.
    async fn exchange_code(
        &self,
        client: &ClientCredentials,
        code: &str,
        state: Option<&str>,
    ) -> Result<ProviderTokens, AdapterError>;

    /// Mint a new access token from a refresh token.
    async fn refresh(
        &self,
        refresh_token: &Secret,
        client: &ClientCredentials,
    ) -> Result<ProviderTokens, AdapterError>;
}

/// Configuration for an OAuth provider.
///
/// # Example
///
/// ```
/// use castkeeper_core::provider::ProviderConfig;
/// use castkeeper_core::Platform;
///
/// let spotify = ProviderConfig::new(Platform::Spotify, "Spotify")
///     .with_auth_url("https://accounts.spotify.com/authorize")
///     .with_token_url("https://accounts.spotify.com/api/token")
///     .with_scopes(vec!["user-read-email".to_string()]);
/// assert_eq!(spotify.platform, Platform::Spotify);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub platform: Platform,

    /// Human-readable name (e.g., "YouTube").
    pub name: String,

    /// OAuth authorization endpoint URL.
    pub auth_url: String,

    /// OAuth token endpoint URL.
    pub token_url: String,

    /// Default OAuth scopes to request.
    pub default_scopes: Vec<String>,

    /// Whether the provider requires PKCE on the authorization code flow.
    pub supports_pkce: bool,

    /// Extra query parameters for the authorization URL.
    #[serde(default)]
    pub extra_auth_params: Vec<(String, String)>,
}

impl ProviderConfig {
    /// Create a new provider configuration.
    pub fn new(platform: impl Into<Platform>, name: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            name: name.into(),
            auth_url: String::new(),
            token_url: String::new(),
            default_scopes: Vec::new(),
            supports_pkce: false,
            extra_auth_params: Vec::new(),
        }
    }

    /// Set the authorization URL.
    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into();
        self
    }

    /// Set the token URL.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Set the default scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.default_scopes = scopes;
        self
    }

    /// Enable PKCE.
    pub fn with_pkce(mut self, enabled: bool) -> Self {
        self.supports_pkce = enabled;
        self
    }

    /// Add an extra authorization URL parameter.
    pub fn with_auth_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_auth_params.push((key.into(), value.into()));
        self
    }
}

fn scopes(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Registry of OAuth provider configurations.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Platform, ProviderConfig>,
}

impl ProviderRegistry {
    /// Create a new empty provider registry.
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Create a registry with every built-in platform pre-registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        // Google only issues refresh tokens for offline access with consent.
        registry.register(
            ProviderConfig::new(Platform::YouTube, "YouTube")
                .with_auth_url("https://accounts.google.com/o/oauth2/v2/auth")
                .with_token_url("https://oauth2.googleapis.com/token")
                .with_scopes(scopes(&[
                    "https://www.googleapis.com/auth/youtube.upload",
                    "https://www.googleapis.com/auth/youtube.readonly",
                ]))
                .with_auth_param("access_type", "offline")
                .with_auth_param("prompt", "consent"),
        );

        registry.register(
            ProviderConfig::new(Platform::Instagram, "Instagram")
                .with_auth_url("https://api.instagram.com/oauth/authorize")
                .with_token_url("https://api.instagram.com/oauth/access_token")
                .with_scopes(scopes(&["instagram_basic", "instagram_content_publish"])),
        );

        registry.register(
            ProviderConfig::new(Platform::TikTok, "TikTok")
                .with_auth_url("https://www.tiktok.com/v2/auth/authorize/")
                .with_token_url("https://open.tiktokapis.com/v2/oauth/token/")
                .with_scopes(scopes(&["user.info.basic", "video.upload"])),
        );

        registry.register(
            ProviderConfig::new(Platform::Spotify, "Spotify")
                .with_auth_url("https://accounts.spotify.com/authorize")
                .with_token_url("https://accounts.spotify.com/api/token")
                .with_scopes(scopes(&["user-read-private", "user-read-email"])),
        );

        registry.register(
            ProviderConfig::new(Platform::LinkedIn, "LinkedIn")
                .with_auth_url("https://www.linkedin.com/oauth/v2/authorization")
                .with_token_url("https://www.linkedin.com/oauth/v2/accessToken")
                .with_scopes(scopes(&["openid", "profile", "w_member_social"])),
        );

        registry.register(
            ProviderConfig::new(Platform::Twitter, "Twitter")
                .with_auth_url("https://twitter.com/i/oauth2/authorize")
                .with_token_url("https://api.twitter.com/2/oauth2/token")
                .with_scopes(scopes(&[
                    "tweet.read",
                    "tweet.write",
                    "users.read",
                    "offline.access",
                ]))
                .with_pkce(true),
        );

        registry
    }

    /// Register a provider configuration, replacing any existing one.
    pub fn register(&mut self, config: ProviderConfig) {
        self.providers.insert(config.platform.clone(), config);
    }

    /// Get a provider configuration by platform.
    pub fn get(&self, platform: &Platform) -> Option<&ProviderConfig> {
        self.providers.get(platform)
    }

    /// Check if a provider is registered.
    pub fn contains(&self, platform: &Platform) -> bool {
        self.providers.contains_key(platform)
    }

    /// Get the number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// An adapter together with the client credentials it is called with.
#[derive(Clone)]
pub struct RegisteredAdapter {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub client: ClientCredentials,
}

/// Maps each configured platform to its adapter.
///
/// Platforms without an entry are "not configured": their credentials can be
/// read but never refreshed.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, RegisteredAdapter>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build [`OAuth2Adapter`]s for every platform that has both a provider
    /// configuration and client credentials.
    #[cfg(feature = "oauth")]
    pub fn from_providers(
        providers: &ProviderRegistry,
        clients: HashMap<Platform, ClientCredentials>,
        timeout: std::time::Duration,
    ) -> Self {
        let mut registry = Self::new();
        for (platform, client) in clients {
            match providers.get(&platform) {
                Some(config) => {
                    registry.register(Arc::new(OAuth2Adapter::new(config.clone(), timeout)), client);
                }
                None => {
                    tracing::warn!(
                        "Client credentials configured for unknown platform {}, ignoring",
                        platform
                    );
                }
            }
        }
        registry
    }

    /// Register an adapter, replacing any existing one for its platform.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>, client: ClientCredentials) {
        self.adapters
            .insert(adapter.platform(), RegisteredAdapter { adapter, client });
    }

    pub fn get(&self, platform: &Platform) -> Option<&RegisteredAdapter> {
        self.adapters.get(platform)
    }

    pub fn contains(&self, platform: &Platform) -> bool {
        self.adapters.contains_key(platform)
    }

    /// Configured platforms, built-in platforms first in sweep order.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self.adapters.keys().cloned().collect();
        platforms.sort_by_key(|p| {
            let builtin = Platform::BUILTIN.iter().position(|b| b == p);
            (builtin.unwrap_or(usize::MAX), p.as_str().to_string())
        });
        platforms
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}
