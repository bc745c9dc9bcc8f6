//! Vault state persistence
//!
//! Stores are versioned. A commit names the version it was validated
//! against and fails with [`StoreError::VersionConflict`] if another writer
//! got there first, so callers always re-validate against fresh state.

use super::{VaultId, VaultState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vault {0} not found")]
    NotFound(VaultId),

    #[error("vault {0} already exists")]
    AlreadyExists(VaultId),

    #[error("vault {vault_id} is at version {actual}, commit expected {expected}")]
    VersionConflict {
        vault_id: VaultId,
        expected: u64,
        actual: u64,
    },

    #[error("invalid vault id: {0}")]
    InvalidId(String),

    #[error("stored state for vault {vault_id} is unreadable: {source}")]
    Corrupt {
        vault_id: VaultId,
        #[source]
        source: serde_json::Error,
    },

    #[error("store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A vault state together with its store metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecord {
    pub vault_id: VaultId,
    /// Incremented on every commit, starting at 1
    pub version: u64,
    pub state: VaultState,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait VaultStore: Send + Sync {
    async fn load(&self, vault_id: &VaultId) -> Result<Option<VaultRecord>, StoreError>;

    /// Insert a new vault at version 1
    async fn create(&self, vault_id: &VaultId, state: VaultState)
        -> Result<VaultRecord, StoreError>;

    /// Replace the state if the stored version still equals `expected_version`
    async fn commit(
        &self,
        vault_id: &VaultId,
        expected_version: u64,
        state: VaultState,
    ) -> Result<VaultRecord, StoreError>;
}

fn check_id(vault_id: &VaultId) -> Result<(), StoreError> {
    if vault_id.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidId(vault_id.to_string()))
    }
}

fn next_record(
    current: &VaultRecord,
    expected_version: u64,
    state: VaultState,
) -> Result<VaultRecord, StoreError> {
    if current.version != expected_version {
        return Err(StoreError::VersionConflict {
            vault_id: current.vault_id.clone(),
            expected: expected_version,
            actual: current.version,
        });
    }
    Ok(VaultRecord {
        vault_id: current.vault_id.clone(),
        version: current.version + 1,
        state,
        updated_at: Utc::now(),
    })
}

/// In-process store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryVaultStore {
    records: RwLock<HashMap<VaultId, VaultRecord>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for MemoryVaultStore {
    async fn load(&self, vault_id: &VaultId) -> Result<Option<VaultRecord>, StoreError> {
        Ok(self.records.read().await.get(vault_id).cloned())
    }

    async fn create(
        &self,
        vault_id: &VaultId,
        state: VaultState,
    ) -> Result<VaultRecord, StoreError> {
        check_id(vault_id)?;
        let mut records = self.records.write().await;
        if records.contains_key(vault_id) {
            return Err(StoreError::AlreadyExists(vault_id.clone()));
        }
        let record = VaultRecord {
            vault_id: vault_id.clone(),
            version: 1,
            state,
            updated_at: Utc::now(),
        };
        records.insert(vault_id.clone(), record.clone());
        Ok(record)
    }

    async fn commit(
        &self,
        vault_id: &VaultId,
        expected_version: u64,
        state: VaultState,
    ) -> Result<VaultRecord, StoreError> {
        let mut records = self.records.write().await;
        let current = records
            .get(vault_id)
            .ok_or_else(|| StoreError::NotFound(vault_id.clone()))?;
        let record = next_record(current, expected_version, state)?;
        records.insert(vault_id.clone(), record.clone());
        Ok(record)
    }
}

/// One pretty-printed JSON file per vault under a directory
#[derive(Debug)]
pub struct FileVaultStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileVaultStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, vault_id: &VaultId) -> PathBuf {
        self.dir.join(format!("{}.json", vault_id))
    }

    async fn read(&self, vault_id: &VaultId) -> Result<Option<VaultRecord>, StoreError> {
        check_id(vault_id)?;
        let path = self.path_for(vault_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                vault_id: vault_id.clone(),
                source,
            })
    }

    /// Write through a temp file and rename so readers never see a torn record
    async fn write(&self, record: &VaultRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.vault_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record).map_err(|source| {
            StoreError::Corrupt {
                vault_id: record.vault_id.clone(),
                source,
            }
        })?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(
            vault_id = %record.vault_id,
            version = record.version,
            path = %path.display(),
            "Vault record written"
        );
        Ok(())
    }
}

#[async_trait]
impl VaultStore for FileVaultStore {
    async fn load(&self, vault_id: &VaultId) -> Result<Option<VaultRecord>, StoreError> {
        self.read(vault_id).await
    }

    async fn create(
        &self,
        vault_id: &VaultId,
        state: VaultState,
    ) -> Result<VaultRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        if self.read(vault_id).await?.is_some() {
            return Err(StoreError::AlreadyExists(vault_id.clone()));
        }
        let record = VaultRecord {
            vault_id: vault_id.clone(),
            version: 1,
            state,
            updated_at: Utc::now(),
        };
        self.write(&record).await?;
        Ok(record)
    }

    async fn commit(
        &self,
        vault_id: &VaultId,
        expected_version: u64,
        state: VaultState,
    ) -> Result<VaultRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .read(vault_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(vault_id.clone()))?;
        let record = next_record(&current, expected_version, state)?;
        self.write(&record).await?;
        Ok(record)
    }
}
