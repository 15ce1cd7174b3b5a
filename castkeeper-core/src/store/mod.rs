//! Durable credential storage.
//!
//! This module provides:
//! - [`CredentialStore`] - Trait for credential persistence backends
//! - [`MemoryCredentialStore`] - In-memory implementation for testing
//! - [`FileCredentialStore`] - JSON document on disk
//!
//! Stores only ever see [`CredentialRecord`]s, whose token fields are already
//! encrypted. There is at most one record per (user, platform) pair.
//!
//! # Example
//!
//! ```rust,ignore
//! use castkeeper_core::store::{CredentialStore, MemoryCredentialStore};
//!
//! let store = MemoryCredentialStore::new();
//! store.upsert(record).await?;
//! let found = store.get(&user, &Platform::Spotify).await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{CredentialRecord, Platform, UserId};

mod file;
mod memory;

pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

/// Error type for credential store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The storage backend encountered an error.
    #[error("backend error: {message}")]
    BackendError { message: String },

    /// Serialization or deserialization failed.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// I/O error reading or writing the store.
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Filter applied by [`CredentialStore::find_expiring_before`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiringFilter {
    /// Only return records that hold a refresh token.
    pub require_refresh_token: bool,
    /// Only return records whose status is `active`.
    pub active_only: bool,
}

impl ExpiringFilter {
    /// Records that can be renewed unattended: active and holding a refresh token.
    pub fn refreshable() -> Self {
        Self {
            require_refresh_token: true,
            active_only: true,
        }
    }

    pub fn matches(&self, record: &CredentialRecord) -> bool {
        (!self.require_refresh_token || record.has_refresh_token())
            && (!self.active_only || record.status == crate::model::CredentialStatus::Active)
    }
}

/// Abstraction over credential persistence backends.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Retrieve the credential for a (user, platform) pair.
    ///
    /// Returns `Ok(None)` if the user never connected the platform.
    async fn get(
        &self,
        user_id: &UserId,
        platform: &Platform,
    ) -> Result<Option<CredentialRecord>, StoreError>;

    /// Create or replace the record for `record.user_id`/`record.platform`.
    ///
    /// The write is atomic: readers see either the old or the new record.
    async fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError>;

    /// Delete the record for a (user, platform) pair.
    ///
    /// Returns whether a record existed.
    async fn delete(&self, user_id: &UserId, platform: &Platform) -> Result<bool, StoreError>;

    /// Records whose access token expires before `cutoff`, soonest first.
    ///
    /// Records with no known expiry are always included.
    async fn find_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        filter: ExpiringFilter,
    ) -> Result<Vec<CredentialRecord>, StoreError>;

    /// Every user that has at least one stored credential.
    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError>;
}

/// Shared selection logic for in-process backends.
pub(crate) fn select_expiring<'a>(
    records: impl Iterator<Item = &'a CredentialRecord>,
    cutoff: DateTime<Utc>,
    filter: ExpiringFilter,
) -> Vec<CredentialRecord> {
    let mut expiring: Vec<CredentialRecord> = records
        .filter(|r| r.expires_at.map(|exp| exp < cutoff).unwrap_or(true))
        .filter(|r| filter.matches(r))
        .cloned()
        .collect();

    // `None` sorts first: unknown expiry is the most urgent.
    expiring.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
    expiring
}
