//! Daemon client for communicating with castkeeperd.
//!
//! Speaks newline-delimited JSON-RPC 2.0 over the daemon's Unix socket.

use anyhow::Result;
use castkeeper_core::{Notification, SweepReport};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Error code the daemon uses when the user has to reconnect a platform.
pub const REAUTHORIZATION_REQUIRED: i64 = -32002;
/// Error code for a pair with nothing stored.
pub const CREDENTIAL_NOT_FOUND: i64 = -32001;

/// An error object returned by the daemon.
#[derive(Debug, Clone, Error)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    fn from_value(error: &Value) -> Self {
        Self {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: error.get("data").cloned(),
        }
    }

    /// Whether the user has to go through the OAuth flow again.
    pub fn requires_user_action(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("requires_user_action"))
            .and_then(Value::as_bool)
            .unwrap_or(matches!(
                self.code,
                CREDENTIAL_NOT_FOUND | REAUTHORIZATION_REQUIRED
            ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTokenResponse {
    pub token: String,
    pub expires_at: Option<String>,
    #[serde(default)]
    pub refreshed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUserTokensResponse {
    pub user: String,
    pub loaded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationUrlResponse {
    pub url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteConnectionResponse {
    pub message: String,
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub message: String,
    pub removed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub success: bool,
    pub message: String,
    pub report: Option<SweepReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiringCredential {
    pub user: String,
    pub platform: String,
    pub expires_at: Option<String>,
    pub status: String,
    pub has_refresh_token: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListExpiringResponse {
    pub credentials: Vec<ExpiringCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNotificationsResponse {
    pub notifications: Vec<Notification>,
}

/// Client for communicating with the castkeeper daemon.
pub struct DaemonClient {
    stream: Option<BufReader<UnixStream>>,
    socket_path: PathBuf,
    next_id: u64,
}

impl DaemonClient {
    /// Attempt to connect to the daemon at the given socket path.
    ///
    /// A missing or refusing socket yields a disconnected client.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        debug!("Attempting to connect to daemon at {:?}", socket_path);

        let stream = if !socket_path.exists() {
            debug!("Socket does not exist at {:?}", socket_path);
            None
        } else {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    debug!("Successfully connected to daemon");
                    Some(BufReader::new(stream))
                }
                Err(e) => {
                    warn!("Failed to connect to daemon: {}", e);
                    None
                }
            }
        };

        Ok(Self {
            stream,
            socket_path: socket_path.to_path_buf(),
            next_id: 1,
        })
    }

    /// Connect to daemon using default socket path.
    pub async fn connect_default() -> Result<Self> {
        Self::connect(&default_socket_path()).await
    }

    /// Check if the client is connected to the daemon.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a JSON-RPC request and receive a response.
    ///
    /// Error objects from the daemon come back as [`RpcError`].
    async fn send_request<T: for<'de> Deserialize<'de>>(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let socket_path = self.socket_path.clone();
        let stream = self.stream.as_mut().ok_or_else(|| {
            anyhow::anyhow!("castkeeperd is not running (no socket at {:?})", socket_path)
        })?;

        let id = self.next_id;
        self.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let request_str = serde_json::to_string(&request)?;
        debug!("Sending request: {} (id {})", method, id);

        let writer = stream.get_mut();
        writer.write_all(request_str.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        let mut response_str = String::new();
        if stream.read_line(&mut response_str).await? == 0 {
            anyhow::bail!("castkeeperd closed the connection");
        }

        let response: Value = serde_json::from_str(&response_str)?;

        if let Some(error) = response.get("error") {
            return Err(RpcError::from_value(error).into());
        }

        let result = response
            .get("result")
            .ok_or_else(|| anyhow::anyhow!("No result in response"))?;

        Ok(serde_json::from_value(result.clone())?)
    }

    /// Get a valid access token for a user's platform connection.
    pub async fn get_token(&mut self, user: &str, platform: &str) -> Result<GetTokenResponse> {
        self.send_request("get_token", json!([user, platform])).await
    }

    /// Load a user's stored credentials into the daemon's cache.
    pub async fn init_user_tokens(&mut self, user: &str) -> Result<InitUserTokensResponse> {
        self.send_request("init_user_tokens", json!([user])).await
    }

    pub async fn authorization_url(&mut self, platform: &str) -> Result<AuthorizationUrlResponse> {
        self.send_request("authorization_url", json!([platform])).await
    }

    pub async fn complete_connection(
        &mut self,
        user: &str,
        platform: &str,
        code: &str,
        state: Option<&str>,
    ) -> Result<CompleteConnectionResponse> {
        self.send_request("complete_connection", json!([user, platform, code, state]))
            .await
    }

    pub async fn disconnect(&mut self, user: &str, platform: &str) -> Result<DisconnectResponse> {
        self.send_request("disconnect", json!([user, platform])).await
    }

    /// Trigger a health-check sweep and wait for its report.
    pub async fn run_health_check(&mut self) -> Result<HealthCheckResponse> {
        self.send_request("run_health_check", json!([])).await
    }

    pub async fn list_expiring(&mut self, within_days: i64) -> Result<ListExpiringResponse> {
        self.send_request("list_expiring", json!([within_days])).await
    }

    pub async fn list_notifications(&mut self, user: &str) -> Result<ListNotificationsResponse> {
        self.send_request("list_notifications", json!([user])).await
    }
}

/// Get the default socket path for the daemon.
pub fn default_socket_path() -> PathBuf {
    ProjectDirs::from("com", "castkeeper", "castkeeper")
        .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).join("castkeeper.sock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/castkeeper.sock"))
}
