//! Error types for castkeeper.
//!
//! Each layer has its own error enum ([`CipherError`], [`StoreError`],
//! [`AdapterError`]). [`TokenError`] is what the token lifecycle operations
//! return; [`CastkeeperError`] wraps everything for composition roots.

use thiserror::Error;

use crate::cipher::CipherError;
use crate::model::{CredentialStatus, Platform, UserId};
use crate::provider::AdapterError;
use crate::store::StoreError;

/// Error type for token lifecycle operations.
///
/// Cloneable so a single in-flight refresh can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    /// Nothing is stored for the pair; the user has to connect the platform.
    #[error("no credential stored for {user_id}/{platform}")]
    CredentialNotFound { user_id: UserId, platform: Platform },

    /// The stored credential cannot be renewed without a new OAuth flow.
    #[error("{user_id} must reconnect {platform}: {reason}")]
    ReauthorizationRequired {
        user_id: UserId,
        platform: Platform,
        reason: String,
    },

    /// The provider rejected the refresh or could not be reached.
    #[error("refreshing {platform} token failed: {source}")]
    RefreshFailed {
        platform: Platform,
        #[source]
        source: AdapterError,
    },

    /// The authorization code exchange or authorization URL failed.
    #[error("connecting {platform} failed: {source}")]
    ConnectionFailed {
        platform: Platform,
        #[source]
        source: AdapterError,
    },

    /// Stored token data could not be decrypted.
    #[error("credential data is corrupt: {0}")]
    Cipher(#[from] CipherError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// No adapter or client credentials are configured for the platform.
    #[error("platform not configured: {platform}")]
    ProviderNotConfigured { platform: Platform },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl TokenError {
    /// Whether retrying the same call later can succeed without user action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RefreshFailed { source, .. } => !matches!(source, AdapterError::Rejected { .. }),
            Self::Storage(_) | Self::Internal { .. } => true,
            _ => false,
        }
    }

    /// Whether the user has to go through the OAuth flow (again).
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Self::CredentialNotFound { .. }
                | Self::ReauthorizationRequired { .. }
                | Self::RefreshFailed {
                    source: AdapterError::Rejected { .. },
                    ..
                }
        )
    }

    pub(crate) fn inactive(user_id: &UserId, platform: &Platform, status: CredentialStatus) -> Self {
        Self::ReauthorizationRequired {
            user_id: user_id.clone(),
            platform: platform.clone(),
            reason: format!("credential is {}", status),
        }
    }
}

/// Top-level error type encompassing all castkeeper errors.
#[derive(Debug, Error)]
pub enum CastkeeperError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}
