//! JSON-RPC API handlers for the daemon.

use super::types::*;
use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use castkeeper_core::{
    AdapterRegistry, Cipher, FileCredentialStore, HealthCheckScheduler, LifecycleSettings,
    MemoryNotifier, Platform, ProviderRegistry, StoreUserDirectory, TokenCache, TokenError,
    TokenRefresher, UserId,
};
use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// State shared across RPC handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Token lifecycle operations
    pub refresher: TokenRefresher,
    /// Periodic and on-demand health checks
    pub scheduler: Arc<HealthCheckScheduler>,
    /// Notification history served by `list_notifications`
    pub notifier: Arc<MemoryNotifier>,
    pub settings: LifecycleSettings,
}

impl ApiState {
    /// Create API state around an existing refresher.
    ///
    /// The scheduler sweeps every user that has a stored credential.
    pub fn new(
        refresher: TokenRefresher,
        notifier: Arc<MemoryNotifier>,
        settings: LifecycleSettings,
    ) -> Self {
        let users = Arc::new(StoreUserDirectory::new(refresher.store().clone()));
        let scheduler = Arc::new(HealthCheckScheduler::new(
            refresher.clone(),
            users,
            notifier.clone(),
            settings.clone(),
        ));

        Self {
            refresher,
            scheduler,
            notifier,
            settings,
        }
    }

    /// Build the full daemon state from configuration.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let cipher = Cipher::new(config.encryption_key()?)
            .context("Failed to initialize token encryption")?;

        let store = FileCredentialStore::load_from_path(config.credentials_path())
            .with_context(|| format!("Failed to open credential store {:?}", config.credentials_path()))?;

        let settings = config.lifecycle.clone();
        let adapters = AdapterRegistry::from_providers(
            &ProviderRegistry::with_defaults(),
            config.client_credentials(),
            settings.provider_timeout(),
        );
        if adapters.is_empty() {
            warn!("No platform has an OAuth client configured; refreshes will fail");
        } else {
            info!(
                "Configured platforms: {}",
                adapters
                    .platforms()
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        let refresher = TokenRefresher::new(
            Arc::new(store),
            Arc::new(TokenCache::with_safety_buffer(settings.safety_buffer())),
            Arc::new(cipher),
            Arc::new(adapters),
        );
        let notifier = Arc::new(MemoryNotifier::with_capacity(config.notification_history));

        Ok(Self::new(refresher, notifier, settings))
    }
}

/// JSON-RPC API trait definition.
#[rpc(server)]
pub trait CastkeeperApi {
    /// Get a valid access token for a user's platform connection.
    ///
    /// Refreshes through the provider when the cached token is inside the
    /// safety buffer. Concurrent calls for the same pair share one refresh.
    #[method(name = "get_token")]
    async fn get_token(&self, user: String, platform: String) -> RpcResult<GetTokenResponse>;

    /// Load every stored credential of a user into the token cache.
    #[method(name = "init_user_tokens")]
    async fn init_user_tokens(&self, user: String) -> RpcResult<InitUserTokensResponse>;

    /// Build the provider URL a user visits to connect a platform.
    #[method(name = "authorization_url")]
    async fn authorization_url(&self, platform: String) -> RpcResult<AuthorizationUrlResponse>;

    /// Exchange the authorization code the provider redirected back with.
    #[method(name = "complete_connection")]
    async fn complete_connection(
        &self,
        user: String,
        platform: String,
        code: String,
        state: Option<String>,
    ) -> RpcResult<CompleteConnectionResponse>;

    /// Remove a user's credential for a platform.
    #[method(name = "disconnect")]
    async fn disconnect(&self, user: String, platform: String) -> RpcResult<DisconnectResponse>;

    /// Run a health-check sweep now, unless one is in progress.
    #[method(name = "run_health_check")]
    async fn run_health_check(&self) -> RpcResult<HealthCheckResponse>;

    /// Credentials expiring within the given number of days.
    #[method(name = "list_expiring")]
    async fn list_expiring(&self, within_days: i64) -> RpcResult<ListExpiringResponse>;

    /// Recent notifications for a user, newest first.
    #[method(name = "list_notifications")]
    async fn list_notifications(&self, user: String) -> RpcResult<ListNotificationsResponse>;
}

/// Implementation of the Castkeeper API.
pub struct CastkeeperApiImpl {
    state: ApiState,
}

impl CastkeeperApiImpl {
    /// Create a new API implementation with the given state.
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &ApiState {
        &self.state
    }
}

#[async_trait::async_trait]
impl CastkeeperApiServer for CastkeeperApiImpl {
    async fn get_token(&self, user: String, platform: String) -> RpcResult<GetTokenResponse> {
        debug!("RPC: get_token({}/{})", user, platform);
        let (user_id, platform) = (parse_user(&user)?, parse_platform(&platform)?);

        let token = self
            .state
            .refresher
            .ensure_fresh_token(&user_id, &platform)
            .await
            .map_err(token_error)?;

        Ok(GetTokenResponse {
            token: token.access_token.expose().to_string(),
            expires_at: token.expires_at.map(|dt| dt.to_rfc3339()),
            refreshed: token.refreshed,
        })
    }

    async fn init_user_tokens(&self, user: String) -> RpcResult<InitUserTokensResponse> {
        info!("RPC: init_user_tokens({})", user);
        let user_id = parse_user(&user)?;

        let report = self.state.refresher.init_user_tokens(&user_id).await;
        Ok(InitUserTokensResponse::new(user, report))
    }

    async fn authorization_url(&self, platform: String) -> RpcResult<AuthorizationUrlResponse> {
        info!("RPC: authorization_url({})", platform);
        let platform = parse_platform(&platform)?;

        let request = self
            .state
            .refresher
            .authorization_url(&platform)
            .map_err(token_error)?;

        Ok(AuthorizationUrlResponse {
            url: request.url,
            state: request.state,
        })
    }

    async fn complete_connection(
        &self,
        user: String,
        platform: String,
        code: String,
        state: Option<String>,
    ) -> RpcResult<CompleteConnectionResponse> {
        info!("RPC: complete_connection({}/{})", user, platform);
        let (user_id, platform) = (parse_user(&user)?, parse_platform(&platform)?);
        if code.trim().is_empty() {
            return Err(invalid_params("authorization code must not be empty"));
        }

        let token = self
            .state
            .refresher
            .complete_connection(&user_id, &platform, code.trim(), state.as_deref())
            .await
            .map_err(token_error)?;

        Ok(CompleteConnectionResponse {
            message: format!("{} connected for {}", platform.display_name(), user_id),
            expires_at: token.expires_at.map(|dt| dt.to_rfc3339()),
        })
    }

    async fn disconnect(&self, user: String, platform: String) -> RpcResult<DisconnectResponse> {
        info!("RPC: disconnect({}/{})", user, platform);
        let (user_id, platform) = (parse_user(&user)?, parse_platform(&platform)?);

        let removed = self
            .state
            .refresher
            .disconnect(&user_id, &platform)
            .await
            .map_err(token_error)?;

        let message = if removed {
            format!("{} disconnected for {}", platform.display_name(), user_id)
        } else {
            format!("{} was not connected for {}", platform.display_name(), user_id)
        };
        Ok(DisconnectResponse { message, removed })
    }

    async fn run_health_check(&self) -> RpcResult<HealthCheckResponse> {
        info!("RPC: run_health_check");
        let response = self.state.scheduler.run_now().await;

        Ok(HealthCheckResponse {
            success: response.success,
            message: response.message,
            report: response.report,
        })
    }

    async fn list_expiring(&self, within_days: i64) -> RpcResult<ListExpiringResponse> {
        debug!("RPC: list_expiring({} days)", within_days);
        if within_days < 0 {
            return Err(invalid_params("within_days must not be negative"));
        }

        let records = self
            .state
            .refresher
            .expiring_within(chrono::Duration::days(within_days))
            .await
            .map_err(token_error)?;

        Ok(ListExpiringResponse {
            credentials: records.iter().map(ExpiringCredential::from).collect(),
        })
    }

    async fn list_notifications(&self, user: String) -> RpcResult<ListNotificationsResponse> {
        debug!("RPC: list_notifications({})", user);
        let user_id = parse_user(&user)?;

        Ok(ListNotificationsResponse {
            notifications: self.state.notifier.list(&user_id),
        })
    }
}

fn parse_user(user: &str) -> RpcResult<UserId> {
    let user = user.trim();
    if user.is_empty() {
        return Err(invalid_params("user must not be empty"));
    }
    Ok(UserId::new(user))
}

fn parse_platform(platform: &str) -> RpcResult<Platform> {
    if platform.trim().is_empty() {
        return Err(invalid_params("platform must not be empty"));
    }
    Ok(Platform::new(platform))
}

pub(crate) fn invalid_params(message: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(ErrorCode::InvalidParams.code(), message.into(), None::<()>)
}

/// Map a lifecycle error onto a JSON-RPC error object.
///
/// Decryption failures never echo details back to the caller.
pub fn token_error(err: TokenError) -> ErrorObject<'static> {
    let retryable = serde_json::json!({
        "retryable": err.is_retryable(),
        "requires_user_action": err.requires_user_action(),
    });

    match &err {
        TokenError::CredentialNotFound { .. } => {
            ErrorObject::owned(CREDENTIAL_NOT_FOUND, err.to_string(), Some(retryable))
        }
        TokenError::ReauthorizationRequired { .. } => {
            ErrorObject::owned(REAUTHORIZATION_REQUIRED, err.to_string(), Some(retryable))
        }
        TokenError::RefreshFailed { .. } => {
            ErrorObject::owned(REFRESH_FAILED, err.to_string(), Some(retryable))
        }
        TokenError::ConnectionFailed { .. } => {
            ErrorObject::owned(CONNECTION_FAILED, err.to_string(), Some(retryable))
        }
        TokenError::ProviderNotConfigured { .. } => {
            ErrorObject::owned(PROVIDER_NOT_CONFIGURED, err.to_string(), None::<()>)
        }
        TokenError::Cipher(_) => ErrorObject::owned(
            CREDENTIAL_CORRUPT,
            "stored credential could not be decrypted; reconnect the platform",
            None::<()>,
        ),
        TokenError::Storage(_) | TokenError::Internal { .. } => internal_error(&err),
    }
}

fn internal_error<E: std::fmt::Display>(err: E) -> ErrorObject<'static> {
    ErrorObject::owned(
        ErrorCode::InternalError.code(),
        format!("{}", err),
        None::<()>,
    )
}
