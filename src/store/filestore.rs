use super::KeyTables;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sigcore::prekeys::{PreKeyId, SignedPreKeyId};
use sigcore::store::error::{Result, StoreError};
use sigcore::store::{KeyBackend, WriteBatch};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

const SNAPSHOT_FILE: &str = "keys.bin";
const SNAPSHOT_TMP_FILE: &str = "keys.bin.tmp";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    /// Hex SHA-256 of `tables`.
    checksum: String,
    tables: Vec<u8>,
}

/// Durable backend keeping the whole key set in one snapshot file. Every
/// commit writes a complete new snapshot to a temp file, syncs it and renames
/// it over the old one, so a crash mid-commit leaves the previous snapshot.
pub struct FileStore {
    base_path: PathBuf,
    tables: RwLock<KeyTables>,
}

impl FileStore {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;

        // A leftover temp file is an interrupted commit; it was never visible.
        let tmp = base_path.join(SNAPSHOT_TMP_FILE);
        if fs::try_exists(&tmp).await? {
            warn!(target: "KeyStore", "Discarding interrupted snapshot write at {}", tmp.display());
            fs::remove_file(&tmp).await?;
        }

        let tables = Self::read_snapshot(&base_path.join(SNAPSHOT_FILE))
            .await?
            .unwrap_or_default();
        debug!(
            target: "KeyStore",
            "Opened key file store at {} ({} pre-keys, {} signed)",
            base_path.display(),
            tables.pre_keys.len(),
            tables.signed_pre_keys.len()
        );

        Ok(Self {
            base_path,
            tables: RwLock::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    async fn read_snapshot(path: &Path) -> Result<Option<KeyTables>> {
        let data = match fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let (snapshot, _): (Snapshot, usize) =
            bincode::serde::decode_from_slice(&data, bincode::config::standard())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::Database(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if hex::encode(Sha256::digest(&snapshot.tables)) != snapshot.checksum {
            return Err(StoreError::Database("snapshot checksum mismatch".into()));
        }

        let (tables, _): (KeyTables, usize) =
            bincode::serde::decode_from_slice(&snapshot.tables, bincode::config::standard())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(tables))
    }

    fn encode_snapshot(tables: &KeyTables) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(tables, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            checksum: hex::encode(Sha256::digest(&payload)),
            tables: payload,
        };
        bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    async fn write_snapshot(&self, data: &[u8]) -> Result<()> {
        let tmp = self.base_path.join(SNAPSHOT_TMP_FILE);
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, self.base_path.join(SNAPSHOT_FILE)).await?;
        sync_dir(&self.base_path).await
    }
}

// The rename is only durable once the directory entry is.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl KeyBackend for FileStore {
    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        for op in batch.ops() {
            staged.apply(op);
        }

        let data = Self::encode_snapshot(&staged)?;
        self.write_snapshot(&data).await?;
        *tables = staged;
        Ok(())
    }

    async fn load_pre_key(&self, id: PreKeyId) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().await.pre_keys.get(&id).cloned())
    }

    async fn pre_key_ids(&self) -> Result<Vec<PreKeyId>> {
        Ok(self.tables.read().await.pre_key_ids())
    }

    async fn load_signed_pre_key(&self, id: SignedPreKeyId) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().await.signed_pre_keys.get(&id).cloned())
    }

    async fn load_signed_pre_keys(&self) -> Result<Vec<(SignedPreKeyId, Vec<u8>)>> {
        Ok(self.tables.read().await.signed_pre_keys())
    }

    async fn load_meta(&self, key: &str) -> Result<Option<u32>> {
        Ok(self.tables.read().await.meta.get(key).copied())
    }
}
