//! Domain model types for castkeeper.
//!
//! This module defines the core types used throughout castkeeper:
//! - [`UserId`] - Identifier for a user of the platform
//! - [`Platform`] - A third-party platform a user can connect (YouTube, Spotify, ...)
//! - [`CredentialKey`] - The (user, platform) pair a credential belongs to
//! - [`Credential`] - Plaintext OAuth credential, only ever held in memory
//! - [`CredentialRecord`] - Persisted form of a credential with encrypted tokens
//! - [`CredentialStatus`] - Lifecycle status of a stored credential

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cipher::{Cipher, CipherError};
use crate::secret::Secret;

/// Identifier for a user.
///
/// # Examples
///
/// ```
/// use castkeeper_core::UserId;
///
/// let user = UserId::new("user-42");
/// assert_eq!(user.as_str(), "user-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a new user ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the user ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// A platform a user can connect through OAuth.
///
/// The built-in platforms are the ones episodes are published to. Additional
/// platforms can be represented with [`Platform::Custom`]; identifiers are
/// normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Platform {
    YouTube,
    Instagram,
    TikTok,
    Spotify,
    LinkedIn,
    Twitter,
    /// Any other platform, identified by its lowercase name.
    Custom(String),
}

impl Platform {
    /// All built-in platforms, in sweep order.
    pub const BUILTIN: [Platform; 6] = [
        Platform::YouTube,
        Platform::Instagram,
        Platform::TikTok,
        Platform::Spotify,
        Platform::LinkedIn,
        Platform::Twitter,
    ];

    /// Parse a platform identifier. Unknown identifiers become [`Platform::Custom`].
    pub fn new(id: impl AsRef<str>) -> Self {
        let id = id.as_ref().trim().to_lowercase();
        match id.as_str() {
            "youtube" => Self::YouTube,
            "instagram" => Self::Instagram,
            "tiktok" => Self::TikTok,
            "spotify" => Self::Spotify,
            "linkedin" => Self::LinkedIn,
            "twitter" | "x" => Self::Twitter,
            _ => Self::Custom(id),
        }
    }

    /// Get the platform identifier used in storage and configuration.
    pub fn as_str(&self) -> &str {
        match self {
            Self::YouTube => "youtube",
            Self::Instagram => "instagram",
            Self::TikTok => "tiktok",
            Self::Spotify => "spotify",
            Self::LinkedIn => "linkedin",
            Self::Twitter => "twitter",
            Self::Custom(s) => s,
        }
    }

    /// Human-readable name for user-facing messages.
    pub fn display_name(&self) -> &str {
        match self {
            Self::YouTube => "YouTube",
            Self::Instagram => "Instagram",
            Self::TikTok => "TikTok",
            Self::Spotify => "Spotify",
            Self::LinkedIn => "LinkedIn",
            Self::Twitter => "Twitter",
            Self::Custom(s) => s,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for Platform {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Platform {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Platform> for String {
    fn from(p: Platform) -> Self {
        p.as_str().to_string()
    }
}

/// The (user, platform) pair that identifies exactly one credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialKey {
    pub user_id: UserId,
    pub platform: Platform,
}

impl CredentialKey {
    pub fn new(user_id: impl Into<UserId>, platform: impl Into<Platform>) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
        }
    }
}

impl fmt::Display for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.platform)
    }
}

/// Lifecycle status of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Usable; refreshes are attempted when it nears expiry.
    Active,
    /// The provider rejected the refresh token; the user must reconnect.
    Invalid,
    /// Access was revoked at the provider.
    Revoked,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invalid => "invalid",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decrypted OAuth credential for one (user, platform) pair.
///
/// Token fields are plaintext and must never be written anywhere except
/// through [`Credential::seal`].
#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: UserId,
    pub platform: Platform,
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,

    /// When the access token expires (None if the provider did not say).
    pub expires_at: Option<DateTime<Utc>>,

    /// Space-separated scopes granted by the provider.
    pub scope: Option<String>,

    /// The user's account ID at the provider, when known.
    pub provider_profile_id: Option<String>,

    pub status: CredentialStatus,
    pub last_refreshed_at: DateTime<Utc>,
}

impl Credential {
    /// Create a new active credential refreshed "now".
    pub fn new(
        user_id: impl Into<UserId>,
        platform: impl Into<Platform>,
        access_token: impl Into<Secret>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            platform: platform.into(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scope: None,
            provider_profile_id: None,
            status: CredentialStatus::Active,
            last_refreshed_at: Utc::now(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<Secret>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_status(mut self, status: CredentialStatus) -> Self {
        self.status = status;
        self
    }

    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.user_id.clone(), self.platform.clone())
    }

    /// Whether the access token has expired at `now`.
    ///
    /// A credential with no known expiry is treated as expired so that it
    /// gets refreshed rather than trusted indefinitely.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(true)
    }

    /// Whether a non-empty refresh token is held.
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_ref()
            .map(|t| !t.is_empty())
            .unwrap_or(false)
    }

    /// Encrypt the token fields for persistence.
    pub fn seal(&self, cipher: &Cipher) -> Result<CredentialRecord, CipherError> {
        let access_token_cipher = cipher.encrypt(self.access_token.expose())?;
        let refresh_token_cipher = match &self.refresh_token {
            Some(token) => Some(cipher.encrypt(token.expose())?),
            None => None,
        };

        Ok(CredentialRecord {
            user_id: self.user_id.clone(),
            platform: self.platform.clone(),
            access_token_cipher,
            refresh_token_cipher,
            expires_at: self.expires_at,
            scope: self.scope.clone(),
            provider_profile_id: self.provider_profile_id.clone(),
            status: self.status,
            last_refreshed_at: self.last_refreshed_at,
        })
    }
}

/// Persisted form of a [`Credential`]; token fields hold `iv:cipher` text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub user_id: UserId,
    pub platform: Platform,
    pub access_token_cipher: String,
    pub refresh_token_cipher: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    #[serde(default)]
    pub provider_profile_id: Option<String>,
    pub status: CredentialStatus,
    pub last_refreshed_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn key(&self) -> CredentialKey {
        CredentialKey::new(self.user_id.clone(), self.platform.clone())
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token_cipher
            .as_ref()
            .map(|c| !c.is_empty())
            .unwrap_or(false)
    }

    /// Decrypt the token fields.
    pub fn open(&self, cipher: &Cipher) -> Result<Credential, CipherError> {
        let access_token = Secret::new(cipher.decrypt(&self.access_token_cipher)?);
        let refresh_token = match &self.refresh_token_cipher {
            Some(c) if !c.is_empty() => Some(Secret::new(cipher.decrypt(c)?)),
            _ => None,
        };

        Ok(Credential {
            user_id: self.user_id.clone(),
            platform: self.platform.clone(),
            access_token,
            refresh_token,
            expires_at: self.expires_at,
            scope: self.scope.clone(),
            provider_profile_id: self.provider_profile_id.clone(),
            status: self.status,
            last_refreshed_at: self.last_refreshed_at,
        })
    }
}
