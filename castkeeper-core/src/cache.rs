//! Process-wide cache of decrypted tokens.
//!
//! The cache is never authoritative: every entry can be rebuilt from the
//! [`CredentialStore`](crate::store::CredentialStore), so losing it only costs
//! store reads. Entries decay lazily through [`TokenCache::is_expired`]; there
//! is no sweeper task.
//!
//! Entries hold plaintext secrets. The cache is never serialized and its
//! `Debug` output only reports the entry count.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::{Credential, CredentialKey, Platform, UserId};
use crate::secret::Secret;

/// Tokens are treated as expired this many minutes before their real expiry,
/// so a token never runs out while an outbound request is in flight.
pub const SAFETY_BUFFER_MINUTES: i64 = 5;

/// Token material handed to [`TokenCache::set`].
#[derive(Debug, Clone)]
pub struct TokenData {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl From<&Credential> for TokenData {
    fn from(credential: &Credential) -> Self {
        Self {
            access_token: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            expires_at: credential.expires_at,
            scope: credential.scope.clone(),
        }
    }
}

/// A cached view of a credential's plaintext fields.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub cached_at: DateTime<Utc>,
}

/// In-memory, time-bounded view of the freshest token per (user, platform).
pub struct TokenCache {
    entries: RwLock<HashMap<CredentialKey, CacheEntry>>,
    safety_buffer: Duration,
}

impl TokenCache {
    /// Create an empty cache with the default 5 minute safety buffer.
    pub fn new() -> Self {
        Self::with_safety_buffer(Duration::minutes(SAFETY_BUFFER_MINUTES))
    }

    pub fn with_safety_buffer(safety_buffer: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            safety_buffer,
        }
    }

    pub fn safety_buffer(&self) -> Duration {
        self.safety_buffer
    }

    /// Store tokens for a (user, platform) pair, replacing any existing entry.
    pub fn set(&self, user_id: &UserId, platform: &Platform, tokens: TokenData) {
        let entry = CacheEntry {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            scope: tokens.scope,
            cached_at: Utc::now(),
        };
        self.entries
            .write()
            .insert(CredentialKey::new(user_id.clone(), platform.clone()), entry);
    }

    /// Cache the plaintext fields of `credential`.
    pub fn set_credential(&self, credential: &Credential) {
        self.set(
            &credential.user_id,
            &credential.platform,
            TokenData::from(credential),
        );
    }

    pub fn get(&self, user_id: &UserId, platform: &Platform) -> Option<CacheEntry> {
        self.entries
            .read()
            .get(&CredentialKey::new(user_id.clone(), platform.clone()))
            .cloned()
    }

    /// Whether the cached token must not be used.
    ///
    /// True if there is no entry, the entry has no expiry, or
    /// `now >= expires_at - safety_buffer`.
    pub fn is_expired(&self, user_id: &UserId, platform: &Platform) -> bool {
        self.is_expired_at(user_id, platform, Utc::now())
    }

    pub fn is_expired_at(&self, user_id: &UserId, platform: &Platform, now: DateTime<Utc>) -> bool {
        let entries = self.entries.read();
        let Some(entry) = entries.get(&CredentialKey::new(user_id.clone(), platform.clone())) else {
            return true;
        };

        match entry.expires_at {
            Some(expires_at) => now >= expires_at - self.safety_buffer,
            None => true,
        }
    }

    /// The cached access token if it is still usable.
    pub fn fresh_access_token(&self, user_id: &UserId, platform: &Platform) -> Option<CacheEntry> {
        if self.is_expired(user_id, platform) {
            return None;
        }
        self.get(user_id, platform)
    }

    /// Evict one entry. Returns whether it existed.
    pub fn remove(&self, user_id: &UserId, platform: &Platform) -> bool {
        self.entries
            .write()
            .remove(&CredentialKey::new(user_id.clone(), platform.clone()))
            .is_some()
    }

    /// Evict every entry, or only the given user's entries.
    ///
    /// Returns the number of entries evicted.
    pub fn clear(&self, user_id: Option<&UserId>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        match user_id {
            Some(user) => entries.retain(|key, _| &key.user_id != user),
            None => entries.clear(),
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("entries", &self.len())
            .field("safety_buffer", &self.safety_buffer)
            .finish()
    }
}
