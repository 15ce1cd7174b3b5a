//! JSON-RPC server implementation with Unix socket support.
//!
//! Requests and responses are newline-delimited JSON-RPC 2.0 objects.
//! Parameters may be passed by position or by name.

use super::handlers::{invalid_params, ApiState, CastkeeperApiImpl, CastkeeperApiServer};
use anyhow::{Context, Result};
use jsonrpsee::types::{ErrorCode, ErrorObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running RPC server
pub struct ServerHandle {
    shutdown: Arc<Mutex<Option<tokio::sync::mpsc::Sender<()>>>>,
    join_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Start the JSON-RPC server on a Unix socket.
///
/// An existing socket file at `socket_path` is replaced.
pub async fn start_server(socket_path: &Path, state: ApiState) -> Result<ServerHandle> {
    if socket_path.exists() {
        warn!("Removing existing socket at {:?}", socket_path);
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove existing socket at {:?}", socket_path))?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    info!("Starting JSON-RPC server on {:?}", socket_path);

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;
    restrict_socket_permissions(socket_path)?;

    let api = Arc::new(CastkeeperApiImpl::new(state));

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let server_task: JoinHandle<()> = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    debug!("Server shutdown signal received");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let api = api.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, api).await {
                                    warn!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    });

    info!("JSON-RPC server started and listening");

    Ok(ServerHandle {
        shutdown: Arc::new(Mutex::new(Some(tx))),
        join_handle: Arc::new(Mutex::new(Some(server_task))),
    })
}

/// Tokens are served over this socket, so only the owner may connect.
#[cfg(unix)]
fn restrict_socket_permissions(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to set permissions on {:?}", socket_path))
}

#[cfg(not(unix))]
fn restrict_socket_permissions(_socket_path: &Path) -> Result<()> {
    Ok(())
}

/// Handle a single connection
async fn handle_connection(mut stream: UnixStream, api: Arc<CastkeeperApiImpl>) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;

        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => process_request(request, &api).await,
            Err(e) => error_response(
                Value::Null,
                ErrorObject::owned(
                    ErrorCode::ParseError.code(),
                    format!("Parse error: {}", e),
                    None::<()>,
                ),
            ),
        };

        writer.write_all(response.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Process a JSON-RPC request
async fn process_request(request: Value, api: &CastkeeperApiImpl) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return error_response(
            id,
            ErrorObject::owned(
                ErrorCode::InvalidRequest.code(),
                "Invalid Request: missing method",
                None::<()>,
            ),
        );
    };

    debug!("Received request: {} (id {})", method, id);
    let params = request.get("params").cloned().unwrap_or(Value::Array(vec![]));

    match dispatch(method, &params, api).await {
        Ok(value) => serde_json::json!({
            "jsonrpc": "2.0",
            "result": value,
            "id": id
        }),
        Err(error) => error_response(id, error),
    }
}

async fn dispatch(
    method: &str,
    params: &Value,
    api: &CastkeeperApiImpl,
) -> Result<Value, ErrorObject<'static>> {
    match method {
        "get_token" => to_result(
            api.get_token(param(params, 0, "user")?, param(params, 1, "platform")?)
                .await,
        ),
        "init_user_tokens" => to_result(api.init_user_tokens(param(params, 0, "user")?).await),
        "authorization_url" => {
            to_result(api.authorization_url(param(params, 0, "platform")?).await)
        }
        "complete_connection" => to_result(
            api.complete_connection(
                param(params, 0, "user")?,
                param(params, 1, "platform")?,
                param(params, 2, "code")?,
                param(params, 3, "state")?,
            )
            .await,
        ),
        "disconnect" => to_result(
            api.disconnect(param(params, 0, "user")?, param(params, 1, "platform")?)
                .await,
        ),
        "run_health_check" => to_result(api.run_health_check().await),
        "list_expiring" => to_result(api.list_expiring(param(params, 0, "within_days")?).await),
        "list_notifications" => {
            to_result(api.list_notifications(param(params, 0, "user")?).await)
        }
        _ => Err(ErrorObject::owned(
            ErrorCode::MethodNotFound.code(),
            "Method not found",
            None::<()>,
        )),
    }
}

/// Read a parameter by position from an array or by name from an object.
///
/// A missing parameter is read as `null`, so optional parameters may be left out.
fn param<T: DeserializeOwned>(
    params: &Value,
    index: usize,
    name: &str,
) -> Result<T, ErrorObject<'static>> {
    let value = match params {
        Value::Array(items) => items.get(index).cloned(),
        Value::Object(fields) => fields.get(name).cloned(),
        Value::Null => None,
        _ => return Err(invalid_params("params must be an array or an object")),
    };

    serde_json::from_value(value.unwrap_or(Value::Null))
        .map_err(|e| invalid_params(format!("Invalid params: {}: {}", name, e)))
}

fn to_result<T: Serialize>(
    result: Result<T, ErrorObject<'static>>,
) -> Result<Value, ErrorObject<'static>> {
    let value = result?;
    serde_json::to_value(value).map_err(|e| {
        ErrorObject::owned(
            ErrorCode::InternalError.code(),
            format!("Failed to encode response: {}", e),
            None::<()>,
        )
    })
}

fn error_response(id: Value, error: ErrorObject<'static>) -> Value {
    let mut body = serde_json::json!({
        "code": error.code(),
        "message": error.message(),
    });
    if let Some(data) = error
        .data()
        .and_then(|raw| serde_json::from_str::<Value>(raw.get()).ok())
    {
        body["data"] = data;
    }

    serde_json::json!({
        "jsonrpc": "2.0",
        "error": body,
        "id": id
    })
}

impl ServerHandle {
    /// Stop the server and wait for the accept loop to finish.
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.join_handle.lock().await.take() {
            handle.await?;
        }

        Ok(())
    }

    /// Whether `stop` has completed.
    pub async fn is_stopped(&self) -> bool {
        self.join_handle.lock().await.is_none()
    }
}
