//! Test server fixtures shared by the daemon integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use castkeeper_core::{
    AdapterError, AdapterRegistry, AuthorizationRequest, Cipher, ClientCredentials, Credential,
    CredentialStore, LifecycleSettings, MemoryCredentialStore, MemoryNotifier, Platform,
    ProviderAdapter, ProviderTokens, Secret, TokenCache, TokenRefresher,
};
use castkeeper_daemon::api::{start_server, ApiState, ServerHandle};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, Duration};

/// Adapter that answers every call locally.
///
/// Codes exchange to `access-<code>`, refreshes mint `refreshed-<n>`.
pub struct StubAdapter {
    platform: Platform,
    refresh_calls: AtomicUsize,
}

impl StubAdapter {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            refresh_calls: AtomicUsize::new(0),
        })
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
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
            state: "stub-state".to_string(),
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
            .with_refresh_token(format!("refresh-{}", code))
            .with_expires_in(chrono::Duration::hours(1)))
    }

    async fn refresh(
        &self,
        _refresh_token: &Secret,
        _client: &ClientCredentials,
    ) -> Result<ProviderTokens, AdapterError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderTokens::new(format!("refreshed-{}", call))
            .with_expires_in(chrono::Duration::days(60)))
    }
}

pub struct TestServer {
    /// Keeps the socket directory alive.
    pub temp_dir: TempDir,
    pub socket_path: PathBuf,
    pub handle: ServerHandle,
    pub state: ApiState,
    pub store: Arc<MemoryCredentialStore>,
    pub cipher: Arc<Cipher>,
    pub adapter: Arc<StubAdapter>,
}

impl TestServer {
    /// Start a server with YouTube configured and nothing stored.
    pub async fn start() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let adapter = StubAdapter::new(Platform::YouTube);
        let mut registry = AdapterRegistry::new();
        registry.register(
            adapter.clone(),
            ClientCredentials::new(
                "yt-client",
                Some(Secret::new("yt-secret")),
                "https://app.example.com/oauth/youtube/callback",
            ),
        );

        let store = Arc::new(MemoryCredentialStore::new());
        let cipher = Arc::new(Cipher::new("daemon-test-encryption-key").unwrap());
        let refresher = TokenRefresher::new(
            store.clone(),
            Arc::new(TokenCache::new()),
            cipher.clone(),
            Arc::new(registry),
        );
        let state = ApiState::new(
            refresher,
            Arc::new(MemoryNotifier::new()),
            LifecycleSettings::default(),
        );

        let handle = start_server(&socket_path, state.clone()).await.unwrap();

        // Give the server time to start accepting connections
        sleep(Duration::from_millis(100)).await;

        Self {
            temp_dir,
            socket_path,
            handle,
            state,
            store,
            cipher,
            adapter,
        }
    }

    pub async fn seed(&self, credential: Credential) {
        self.store
            .upsert(credential.seal(&self.cipher).unwrap())
            .await
            .unwrap();
    }

    pub async fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path)
            .await
            .expect("Failed to connect to daemon")
    }
}

/// Detect whether the sandbox allows binding Unix sockets. Skip tests if not.
pub fn can_bind_unix_socket() -> bool {
    let Ok(dir) = TempDir::new() else {
        return false;
    };
    std::os::unix::net::UnixListener::bind(dir.path().join("check.sock")).is_ok()
}

/// Send one raw line and read the raw response line.
pub async fn send_raw(stream: &mut UnixStream, request: &str) -> Value {
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    stream.flush().await.unwrap();

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await.unwrap();
    serde_json::from_str(&response).unwrap()
}

/// Call `method` and return the full response object.
pub async fn call(stream: &mut UnixStream, method: &str, params: Value, id: u64) -> Value {
    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": id,
    });
    send_raw(stream, &request.to_string()).await
}

/// Call `method` and decode its result, failing the test on an RPC error.
pub async fn call_ok<T: for<'de> Deserialize<'de>>(
    stream: &mut UnixStream,
    method: &str,
    params: Value,
    id: u64,
) -> T {
    let response = call(stream, method, params, id).await;
    if let Some(error) = response.get("error") {
        panic!("{} returned an RPC error: {}", method, error);
    }
    serde_json::from_value(response["result"].clone()).unwrap()
}

/// Call `method` and return the error object, failing the test on success.
pub async fn call_err(stream: &mut UnixStream, method: &str, params: Value, id: u64) -> Value {
    let response = call(stream, method, params, id).await;
    response
        .get("error")
        .cloned()
        .unwrap_or_else(|| panic!("{} unexpectedly succeeded: {}", method, response))
}
