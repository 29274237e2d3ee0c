use super::KeyTables;
use async_trait::async_trait;
use sigcore::prekeys::{PreKeyId, SignedPreKeyId};
use sigcore::store::error::Result;
use sigcore::store::{KeyBackend, WriteBatch};
use tokio::sync::RwLock;

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

/// A volatile backend. Commits are staged on a copy and swapped in under the
/// write lock, so readers never observe half a batch.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: RwLock<KeyTables>,
    #[cfg(test)]
    fail_after: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail after applying `ops` operations of its
    /// batch.
    #[cfg(test)]
    pub fn fail_next_commit_after(&self, ops: usize) {
        self.fail_after.store(ops + 1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyBackend for InMemoryBackend {
    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();

        #[cfg(test)]
        let fail_after = self.fail_after.swap(0, Ordering::SeqCst).checked_sub(1);

        for (_applied, op) in batch.ops().iter().enumerate() {
            #[cfg(test)]
            if fail_after == Some(_applied) {
                return Err(sigcore::store::StoreError::Database(
                    "injected commit failure".into(),
                ));
            }
            staged.apply(op);
        }

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
