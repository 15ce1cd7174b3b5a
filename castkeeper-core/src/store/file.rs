//! Disk-backed credential storage.
//!
//! Records are kept in a single versioned JSON document. Every mutation
//! rewrites the document through a temporary file and an atomic rename, so a
//! crash mid-write leaves the previous state intact. Token fields are already
//! encrypted by the time they reach this store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use super::{CredentialStore, ExpiringFilter, StoreError, select_expiring};
use crate::model::{CredentialRecord, Platform, UserId};

/// Internal storage format for credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialFile {
    /// Version of the store format (for future migrations).
    version: u32,

    /// All stored credentials.
    credentials: Vec<CredentialRecord>,
}

impl Default for CredentialFile {
    fn default() -> Self {
        Self {
            version: 1,
            credentials: Vec::new(),
        }
    }
}

impl CredentialFile {
    fn position(&self, user_id: &UserId, platform: &Platform) -> Option<usize> {
        self.credentials
            .iter()
            .position(|r| &r.user_id == user_id && &r.platform == platform)
    }
}

/// JSON-file credential store.
///
/// # Thread Safety
///
/// Writers hold the lock across the disk write, so concurrent upserts are
/// applied one at a time and the file always matches the in-memory view.
/// The write itself runs on the blocking thread pool.
pub struct FileCredentialStore {
    path: PathBuf,
    data: RwLock<CredentialFile>,
}

impl FileCredentialStore {
    /// Load the store from `path`.
    ///
    /// Creates parent directories if they don't exist. A missing file is an
    /// empty store; it is created on the first write.
    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            let file: CredentialFile = serde_json::from_str(&contents)?;
            if file.version != 1 {
                return Err(StoreError::BackendError {
                    message: format!("unsupported credential file version {}", file.version),
                });
            }
            file
        } else {
            CredentialFile::default()
        };

        tracing::debug!(
            "Loaded {} credential(s) from {:?}",
            data.credentials.len(),
            path
        );

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Get the path to the store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `mutate` to a copy of the data, persist it, then publish it.
    async fn update<T>(
        &self,
        mutate: impl FnOnce(&mut CredentialFile) -> T,
    ) -> Result<T, StoreError> {
        let mut data = self.data.write().await;
        let mut next = data.clone();
        let out = mutate(&mut next);

        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || persist(&path, &next).map(|()| next))
            .await
            .map_err(|e| StoreError::BackendError {
                message: format!("credential file write failed: {}", e),
            })??;

        *data = next;
        Ok(out)
    }
}

/// Write `data` to `path` atomically.
fn persist(path: &Path, data: &CredentialFile) -> Result<(), StoreError> {
    let contents = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

impl std::fmt::Debug for FileCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCredentialStore")
            .field("path", &self.path)
            .finish()
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(
        &self,
        user_id: &UserId,
        platform: &Platform,
    ) -> Result<Option<CredentialRecord>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .position(user_id, platform)
            .map(|i| data.credentials[i].clone()))
    }

    async fn upsert(&self, record: CredentialRecord) -> Result<(), StoreError> {
        self.update(|data| match data.position(&record.user_id, &record.platform) {
            Some(i) => data.credentials[i] = record,
            None => data.credentials.push(record),
        })
        .await
    }

    async fn delete(&self, user_id: &UserId, platform: &Platform) -> Result<bool, StoreError> {
        if self.get(user_id, platform).await?.is_none() {
            return Ok(false);
        }

        self.update(|data| match data.position(user_id, platform) {
            Some(i) => {
                data.credentials.remove(i);
                true
            }
            None => false,
        })
        .await
    }

    async fn find_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
        filter: ExpiringFilter,
    ) -> Result<Vec<CredentialRecord>, StoreError> {
        let data = self.data.read().await;
        Ok(select_expiring(data.credentials.iter(), cutoff, filter))
    }

    async fn user_ids(&self) -> Result<Vec<UserId>, StoreError> {
        let data = self.data.read().await;
        let users: BTreeSet<UserId> = data.credentials.iter().map(|r| r.user_id.clone()).collect();
        Ok(users.into_iter().collect())
    }
}
