//! In-memory credential storage implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use super::{CredentialStore, ExpiringFilter, StoreError, select_expiring};
use crate::model::{CredentialKey, CredentialRecord, Platform, UserId};

/// In-memory credential store for testing and development.
///
/// This store is not persistent; data is lost when the process exits.
///
/// # Thread Safety
///
/// This implementation uses interior mutability via `RwLock` and is
/// safe to share across threads.
pub struct MemoryCredentialStore {
    data: RwLock<HashMap<CredentialKey, CredentialRecord>>,
}

impl MemoryCredentialStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Create a memory store with initial records.
    pub fn with_records(records: impl IntoIterator<Item = CredentialRecord>) -> Self {
        let data = records.into_iter().map(|r| (r.key(), r)).collect();
        Self {
            data: RwLock::new(data),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("records", &self.len())
            .finish()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::BackendError {
        message: format!("lock poisoned: {}", e),
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(
        &self,
        user_id: &UserId,
        platform: &Platform,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let key = CredentialKey::new(user_id.clone(), platform.clone());
        Ok(data.get(&key).cloned())
    }

    async fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(record.key(), record);
        Ok(())
    }

    async fn delete(&self, user_id: &UserId, platform: &Platform) -> Result<bool, StoreError> {
        let mut data = self.data.write().map_err(poisoned)?;
        let key = CredentialKey::new(user_id.clone(), platform.clone());
        Ok(data.remove(&key).is_some())
    }

    async fn find_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        filter: ExpiringFilter,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(select_expiring(data.values(), cutoff, filter))
    }

    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        let data = self.data.read().map_err(poisoned)?;
        let users: BTreeSet<UserId> = data.keys().map(|k| k.user_id.clone()).collect();
        Ok(users.into_iter().collect())
    }
}
