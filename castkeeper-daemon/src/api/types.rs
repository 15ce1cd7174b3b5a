//! API request/response types for the daemon JSON-RPC interface.

use castkeeper_core::{CredentialRecord, InitReport, Notification, SweepReport};
use serde::{Deserialize, Serialize};

/// No credential is stored for the user/platform pair.
pub const CREDENTIAL_NOT_FOUND: i32 = -32001;
/// The user has to reconnect the platform.
pub const REAUTHORIZATION_REQUIRED: i32 = -32002;
/// The provider refused the refresh or could not be reached.
pub const REFRESH_FAILED: i32 = -32003;
/// The authorization code exchange failed.
pub const CONNECTION_FAILED: i32 = -32004;
/// No OAuth client is configured for the platform.
pub const PROVIDER_NOT_CONFIGURED: i32 = -32005;
/// Stored credential data could not be decrypted.
pub const CREDENTIAL_CORRUPT: i32 = -32010;

/// Response containing a fresh access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTokenResponse {
    /// The access token value
    pub token: String,
    /// Optional expiration timestamp (ISO 8601)
    pub expires_at: Option<String>,
    /// Whether the provider was called to mint this token
    pub refreshed: bool,
}

/// Response after warming a user's tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitUserTokensResponse {
    pub user: String,
    pub loaded: usize,
    pub failed: usize,
}

impl InitUserTokensResponse {
    pub fn new(user: impl Into<String>, report: InitReport) -> Self {
        Self {
            user: user.into(),
            loaded: report.loaded,
            failed: report.failed,
        }
    }
}

/// Where to send the user to connect a platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationUrlResponse {
    pub url: String,
    /// Opaque value the provider echoes back to the redirect URI
    pub state: String,
}

/// Response after exchanging an authorization code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteConnectionResponse {
    /// Confirmation message
    pub message: String,
    /// Expiration of the new access token (ISO 8601)
    pub expires_at: Option<String>,
}

/// Response after disconnecting a platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub message: String,
    /// Whether a credential was stored before
    pub removed: bool,
}

/// Outcome of a manually triggered health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub success: bool,
    pub message: String,
    pub report: Option<SweepReport>,
}

/// A stored credential close to expiry. Token material is never included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiringCredential {
    pub user: String,
    pub platform: String,
    /// Expiration timestamp (ISO 8601); missing when the provider never sent one
    pub expires_at: Option<String>,
    pub status: String,
    pub has_refresh_token: bool,
}

impl From<&CredentialRecord> for ExpiringCredential {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            user: record.user_id.to_string(),
            platform: record.platform.to_string(),
            expires_at: record.expires_at.map(|dt| dt.to_rfc3339()),
            status: record.status.as_str().to_string(),
            has_refresh_token: record.has_refresh_token(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListExpiringResponse {
    pub credentials: Vec<ExpiringCredential>,
}

/// Recent notifications for a user, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNotificationsResponse {
    pub notifications: Vec<Notification>,
}
