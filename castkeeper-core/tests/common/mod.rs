//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use castkeeper_core::{
    AdapterError, AdapterRegistry, AuthorizationRequest, Cipher, ClientCredentials, Credential,
    CredentialStatus, MemoryCredentialStore, Platform, ProviderAdapter, ProviderTokens, Secret,
    TokenCache, TokenRefresher, UserId,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const TEST_KEY: &str = "integration-test-encryption-key";

/// What a [`ScriptedAdapter`] answers to `refresh`.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed { expires_in: Duration, rotate: bool },
    Reject(String),
    Fail(String),
}

/// Adapter fake with a scripted refresh outcome and a call counter.
pub struct ScriptedAdapter {
    platform: Platform,
    script: Mutex<Script>,
    delay: std::time::Duration,
    refresh_calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(platform: Platform, script: Script) -> Arc<Self> {
        Self::with_delay(platform, script, std::time::Duration::ZERO)
    }

    pub fn succeeding(platform: Platform) -> Arc<Self> {
        Self::new(
            platform,
            Script::Succeed {
                expires_in: Duration::hours(1),
                rotate: true,
            },
        )
    }

    pub fn with_delay(platform: Platform, script: Script, delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            platform,
            script: Mutex::new(script),
            delay,
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn platform(&self) -> Platform {
        self.platform.clone()
    }

    fn authorization_url(
        &self,
        client: &ClientCredentials,
    ) -> Result<AuthorizationRequest, AdapterError> {
        Ok(AuthorizationRequest {
            url: format!(
                "https://{}.example.com/auth?client_id={}",
                self.platform, client.client_id
            ),
            state: "scripted-state".to_string(),
        })
    }

    async fn exchange_code(
        &self,
        _client: &ClientCredentials,
        code: &str,
        _state: Option<&str>,
    ) -> Result<ProviderTokens, AdapterError> {
        if code == "bad-code" {
            return Err(AdapterError::Rejected {
                message: "invalid_grant".to_string(),
            });
        }
        Ok(ProviderTokens::new(format!("access-{}", code))
            .with_refresh_token("refresh-0")
            .with_expires_in(Duration::hours(1))
            .with_scope("publish"))
    }

    async fn refresh(
        &self,
        _refresh_token: &Secret,
        _client: &ClientCredentials,
    ) -> Result<ProviderTokens, AdapterError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let script = self.script.lock().clone();
        match script {
            Script::Succeed { expires_in, rotate } => {
                let tokens =
                    ProviderTokens::new(format!("access-{}", call)).with_expires_in(expires_in);
                Ok(if rotate {
                    tokens.with_refresh_token(format!("refresh-{}", call))
                } else {
                    tokens
                })
            }
            Script::Reject(message) => Err(AdapterError::Rejected { message }),
            Script::Fail(message) => Err(AdapterError::Transport { message }),
        }
    }
}

pub struct Fixture {
    pub refresher: TokenRefresher,
    pub store: Arc<MemoryCredentialStore>,
    pub cache: Arc<TokenCache>,
    pub cipher: Arc<Cipher>,
}

pub fn client() -> ClientCredentials {
    ClientCredentials::new(
        "test-client-id",
        Some(Secret::new("test-client-secret")),
        "https://app.example.com/oauth/callback",
    )
}

pub fn fixture(adapters: &[Arc<ScriptedAdapter>]) -> Fixture {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter.clone(), client());
    }

    let store = Arc::new(MemoryCredentialStore::new());
    let cache = Arc::new(TokenCache::new());
    let cipher = Arc::new(Cipher::new(TEST_KEY).unwrap());
    let refresher = TokenRefresher::new(
        store.clone(),
        cache.clone(),
        cipher.clone(),
        Arc::new(registry),
    );

    Fixture {
        refresher,
        store,
        cache,
        cipher,
    }
}

impl Fixture {
    /// Store an active credential for the pair.
    pub async fn seed(
        &self,
        user: &str,
        platform: Platform,
        expires_at: DateTime<Utc>,
        refresh_token: Option<&str>,
    ) -> Credential {
        let mut credential = Credential::new(user, platform, "access-0").with_expiry(expires_at);
        if let Some(token) = refresh_token {
            credential = credential.with_refresh_token(token);
        }
        self.put(&credential).await;
        credential
    }

    pub async fn put(&self, credential: &Credential) {
        use castkeeper_core::CredentialStore;

        self.store
            .upsert(credential.seal(&self.cipher).unwrap())
            .await
            .unwrap();
    }

    /// Read back and decrypt the stored credential.
    pub async fn stored(&self, user: &str, platform: &Platform) -> Option<Credential> {
        use castkeeper_core::CredentialStore;

        self.store
            .get(&UserId::new(user), platform)
            .await
            .unwrap()
            .map(|record| record.open(&self.cipher).unwrap())
    }

    pub async fn status(&self, user: &str, platform: &Platform) -> Option<CredentialStatus> {
        self.stored(user, platform).await.map(|c| c.status)
    }
}
