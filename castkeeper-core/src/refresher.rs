//! Token refresh with per-credential single-flight.
//!
//! [`TokenRefresher`] is the only component that mutates token material. It
//! hands out access tokens that are valid for at least the cache's safety
//! buffer, refreshing them through the platform's [`ProviderAdapter`] when
//! needed.
//!
//! Concurrent refreshes of the same (user, platform) pair collapse into one
//! provider call: the first caller starts a refresh task and every other
//! caller awaits the same shared result. The task persists the new tokens
//! before it updates the cache, and only then leaves the in-flight map.
//!
//! Every write to a pair (refresh, connect, disconnect, status change) holds
//! that pair's write lock, so a refresh that started before a disconnect can
//! never store its result after the credential was removed.
//!
//! [`ProviderAdapter`]: crate::provider::ProviderAdapter

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

use crate::cache::TokenCache;
use crate::cipher::Cipher;
use crate::error::TokenError;
use crate::model::{Credential, CredentialKey, CredentialRecord, CredentialStatus, Platform, UserId};
use crate::provider::{AdapterRegistry, AuthorizationRequest, ProviderTokens, RegisteredAdapter};
use crate::secret::Secret;
use crate::store::{CredentialStore, ExpiringFilter};

/// Lifetime assumed when a provider does not report `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 3600;

/// An access token handed to callers.
#[derive(Debug, Clone)]
pub struct FreshToken {
    pub access_token: Secret,
    pub expires_at: Option<DateTime<Utc>>,

    /// Whether the provider was called to mint this token.
    pub refreshed: bool,

    /// Whether the provider issued a new refresh token along with it.
    pub refresh_token_rotated: bool,
}

impl FreshToken {
    fn stored(credential: &Credential) -> Self {
        Self {
            access_token: credential.access_token.clone(),
            expires_at: credential.expires_at,
            refreshed: false,
            refresh_token_rotated: false,
        }
    }
}

/// Outcome of [`TokenRefresher::init_user_tokens`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    pub loaded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshMode {
    /// Refresh only if the stored credential has expired.
    IfExpired,
    /// Refresh regardless of the remaining lifetime.
    Force,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<FreshToken, TokenError>>>;

struct Flight {
    mode: RefreshMode,
    future: SharedRefresh,
}

type InFlight = Arc<Mutex<HashMap<CredentialKey, Flight>>>;

type PairLocks = Arc<Mutex<HashMap<CredentialKey, Arc<tokio::sync::Mutex<()>>>>>;

/// Removes a flight from the map when its task ends, even on panic.
struct FlightGuard {
    in_flight: InFlight,
    key: CredentialKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Keeps access tokens fresh.
///
/// Cheap to clone; clones share the store, cache and in-flight map.
#[derive(Clone)]
pub struct TokenRefresher {
    store: Arc<dyn CredentialStore>,
    cache: Arc<TokenCache>,
    cipher: Arc<Cipher>,
    adapters: Arc<AdapterRegistry>,
    in_flight: InFlight,
    pair_locks: PairLocks,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cache: Arc<TokenCache>,
        cipher: Arc<Cipher>,
        adapters: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            store,
            cache,
            cipher,
            adapters,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            pair_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive write access to the pair.
    async fn lock_pair(&self, user_id: &UserId, platform: &Platform) -> OwnedMutexGuard<()> {
        let lock = self
            .pair_locks
            .lock()
            .entry(CredentialKey::new(user_id.clone(), platform.clone()))
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Return a usable access token for the pair, refreshing it if needed.
    ///
    /// Never returns a token the cache considers expired unless the stored
    /// credential itself is still valid. Failures are typed; see
    /// [`TokenError`].
    pub async fn ensure_fresh_token(
        &self,
        user_id: &UserId,
        platform: &Platform,
    ) -> Result<FreshToken, TokenError> {
        if let Some(entry) = self.cache.fresh_access_token(user_id, platform) {
            tracing::debug!("Cache hit for {}/{}", user_id, platform);
            return Ok(FreshToken {
                access_token: entry.access_token,
                expires_at: entry.expires_at,
                refreshed: false,
                refresh_token_rotated: false,
            });
        }

        self.single_flight(CredentialKey::new(user_id.clone(), platform.clone()), RefreshMode::IfExpired)
            .await
    }

    /// Refresh the pair's token now, whatever its remaining lifetime.
    ///
    /// Shares the single-flight path with [`Self::ensure_fresh_token`].
    pub async fn force_refresh(
        &self,
        user_id: &UserId,
        platform: &Platform,
    ) -> Result<FreshToken, TokenError> {
        self.single_flight(CredentialKey::new(user_id.clone(), platform.clone()), RefreshMode::Force)
            .await
    }

    async fn single_flight(
        &self,
        key: CredentialKey,
        mode: RefreshMode,
    ) -> Result<FreshToken, TokenError> {
        loop {
            let (flight_mode, future) = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(&key) {
                    Some(flight) => {
                        tracing::debug!("Joining in-flight refresh for {}", key);
                        (flight.mode, flight.future.clone())
                    }
                    None => {
                        let future = self.start_flight(key.clone(), mode);
                        in_flight.insert(
                            key.clone(),
                            Flight {
                                mode,
                                future: future.clone(),
                            },
                        );
                        (mode, future)
                    }
                }
            };

            let result = future.await;

            // A forced refresh that joined a flight which found the token
            // still valid has not refreshed anything yet.
            if mode == RefreshMode::Force
                && flight_mode == RefreshMode::IfExpired
                && matches!(&result, Ok(token) if !token.refreshed)
            {
                continue;
            }
            return result;
        }
    }

    fn start_flight(&self, key: CredentialKey, mode: RefreshMode) -> SharedRefresh {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = FlightGuard {
                in_flight: this.in_flight.clone(),
                key: key.clone(),
            };
            this.run_refresh(&key, mode).await
        });

        async move {
            handle.await.map_err(|e| TokenError::Internal {
                message: format!("refresh task failed: {}", e),
            })?
        }
        .boxed()
        .shared()
    }

    async fn load(&self, user_id: &UserId, platform: &Platform) -> Result<Credential, TokenError> {
        let record = self
            .store
            .get(user_id, platform)
            .await?
            .ok_or_else(|| TokenError::CredentialNotFound {
                user_id: user_id.clone(),
                platform: platform.clone(),
            })?;

        record.open(&self.cipher).map_err(|e| {
            tracing::error!("Stored credential {}/{} is unreadable: {}", user_id, platform, e);
            TokenError::from(e)
        })
    }

    fn registered(&self, platform: &Platform) -> Result<&RegisteredAdapter, TokenError> {
        self.adapters
            .get(platform)
            .ok_or_else(|| TokenError::ProviderNotConfigured {
                platform: platform.clone(),
            })
    }

    async fn run_refresh(&self, key: &CredentialKey, mode: RefreshMode) -> Result<FreshToken, TokenError> {
        let CredentialKey { user_id, platform } = key;
        let _write = self.lock_pair(user_id, platform).await;
        let credential = self.load(user_id, platform).await?;
        let now = Utc::now();

        if mode == RefreshMode::IfExpired && !credential.is_expired_at(now) {
            tracing::debug!("Reseeding cache for {} from store", key);
            self.cache.set_credential(&credential);
            return Ok(FreshToken::stored(&credential));
        }

        let refresh_token = match &credential.refresh_token {
            Some(token) if !token.is_empty() => token.clone(),
            _ => {
                return Err(TokenError::ReauthorizationRequired {
                    user_id: user_id.clone(),
                    platform: platform.clone(),
                    reason: "no refresh token stored".to_string(),
                });
            }
        };

        if credential.status != CredentialStatus::Active {
            return Err(TokenError::inactive(user_id, platform, credential.status));
        }

        let registered = self.registered(platform)?;
        let tokens = registered
            .adapter
            .refresh(&refresh_token, &registered.client)
            .await
            .map_err(|source| {
                tracing::warn!("Refresh of {} failed: {}", key, source);
                TokenError::RefreshFailed {
                    platform: platform.clone(),
                    source,
                }
            })?;

        let refresh_token_rotated = tokens.refresh_token.is_some();
        if !refresh_token_rotated {
            tracing::debug!("{} kept its refresh token; provider did not rotate it", key);
        }
        let renewed = apply_tokens(credential, tokens, now);

        // Store first, then cache.
        self.store.upsert(renewed.seal(&self.cipher)?).await?;
        self.cache.set_credential(&renewed);

        tracing::info!(
            "Refreshed {} token for {}, expires at {:?}",
            platform,
            user_id,
            renewed.expires_at
        );

        Ok(FreshToken {
            access_token: renewed.access_token,
            expires_at: renewed.expires_at,
            refreshed: true,
            refresh_token_rotated,
        })
    }

    /// Load every stored credential of `user_id` into the cache.
    ///
    /// A platform that fails to load is logged and counted; it never aborts
    /// the other platforms.
    pub async fn init_user_tokens(&self, user_id: &UserId) -> InitReport {
        let mut platforms: Vec<Platform> = Platform::BUILTIN.to_vec();
        for platform in self.adapters.platforms() {
            if !platforms.contains(&platform) {
                platforms.push(platform);
            }
        }

        let mut report = InitReport::default();
        for platform in platforms {
            match self.load(user_id, &platform).await {
                Ok(credential) => {
                    self.cache.set_credential(&credential);
                    report.loaded += 1;
                }
                Err(TokenError::CredentialNotFound { .. }) => {}
                Err(e) => {
                    tracing::warn!("Failed to load {} token for {}: {}", platform, user_id, e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "Warmed token cache for {}: {} loaded, {} failed",
            user_id,
            report.loaded,
            report.failed
        );
        report
    }

    /// Start connecting `platform`: the URL the user has to visit.
    pub fn authorization_url(&self, platform: &Platform) -> Result<AuthorizationRequest, TokenError> {
        let registered = self.registered(platform)?;
        registered
            .adapter
            .authorization_url(&registered.client)
            .map_err(|source| TokenError::ConnectionFailed {
                platform: platform.clone(),
                source,
            })
    }

    /// Finish connecting `platform` by exchanging the authorization code.
    ///
    /// Creates the credential, or replaces an existing one, as active.
    pub async fn complete_connection(
        &self,
        user_id: &UserId,
        platform: &Platform,
        code: &str,
        state: Option<&str>,
    ) -> Result<FreshToken, TokenError> {
        let registered = self.registered(platform)?;
        let now = Utc::now();
        let tokens = registered
            .adapter
            .exchange_code(&registered.client, code, state)
            .await
            .map_err(|source| {
                tracing::warn!("Code exchange for {}/{} failed: {}", user_id, platform, source);
                TokenError::ConnectionFailed {
                    platform: platform.clone(),
                    source,
                }
            })?;

        let refresh_token_rotated = tokens.refresh_token.is_some();
        let placeholder = Credential::new(user_id.clone(), platform.clone(), Secret::new(""));
        let credential = apply_tokens(placeholder, tokens, now);

        // A refresh that is still running finishes first and is overwritten.
        let _write = self.lock_pair(user_id, platform).await;
        self.store.upsert(credential.seal(&self.cipher)?).await?;
        self.cache.set_credential(&credential);

        tracing::info!("Connected {} for {}", platform, user_id);
        Ok(FreshToken {
            access_token: credential.access_token,
            expires_at: credential.expires_at,
            refreshed: true,
            refresh_token_rotated,
        })
    }

    /// Remove the pair's credential and evict it from the cache.
    ///
    /// Returns whether a credential was stored.
    pub async fn disconnect(&self, user_id: &UserId, platform: &Platform) -> Result<bool, TokenError> {
        let _write = self.lock_pair(user_id, platform).await;
        let existed = self.store.delete(user_id, platform).await?;
        self.cache.remove(user_id, platform);
        if existed {
            tracing::info!("Disconnected {} for {}", platform, user_id);
        }
        Ok(existed)
    }

    /// Set the stored status of a credential.
    ///
    /// Credentials that are no longer active are evicted from the cache.
    pub async fn mark_status(
        &self,
        user_id: &UserId,
        platform: &Platform,
        status: CredentialStatus,
    ) -> Result<(), TokenError> {
        let _write = self.lock_pair(user_id, platform).await;
        let mut record = self
            .store
            .get(user_id, platform)
            .await?
            .ok_or_else(|| TokenError::CredentialNotFound {
                user_id: user_id.clone(),
                platform: platform.clone(),
            })?;

        if record.status == status {
            return Ok(());
        }

        record.status = status;
        self.store.upsert(record).await?;
        if status != CredentialStatus::Active {
            self.cache.remove(user_id, platform);
        }
        tracing::info!("Marked {}/{} as {}", user_id, platform, status);
        Ok(())
    }

    /// Stored credentials expiring within `within`, soonest first.
    pub async fn expiring_within(&self, within: Duration) -> Result<Vec<CredentialRecord>, TokenError> {
        Ok(self
            .store
            .find_expiring_before(Utc::now() + within, ExpiringFilter::default())
            .await?)
    }
}

impl std::fmt::Debug for TokenRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRefresher")
            .field("cache", &self.cache)
            .field("adapters", &self.adapters)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

/// Apply a provider response to `credential`.
///
/// Fields the provider did not send keep their previous values, so a missing
/// refresh token in the response keeps the old one.
fn apply_tokens(credential: Credential, tokens: ProviderTokens, now: DateTime<Utc>) -> Credential {
    let lifetime = tokens
        .expires_in
        .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECONDS));

    Credential {
        user_id: credential.user_id,
        platform: credential.platform,
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token.or(credential.refresh_token),
        expires_at: Some(now + lifetime),
        scope: tokens.scope.or(credential.scope),
        provider_profile_id: tokens.provider_profile_id.or(credential.provider_profile_id),
        status: CredentialStatus::Active,
        last_refreshed_at: now,
    }
}
