use crate::config::KeyStoreConfig;
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rand::Rng;
use sigcore::curve::{IdentityKeyPair, KeyPair};
use sigcore::prekeys::{
    IdRange, KeyRecord, LAST_RESORT_KEY_ID, MAX_PRE_KEY_ID, PreKeyId, SignedKeyRecord,
    SignedPreKeyId, allocate_ids, next_signed_pre_key_id,
};
use sigcore::store::error::KeyResult;
use sigcore::store::traits::{CURRENT_SIGNED_PRE_KEY_ID, NEXT_PRE_KEY_ID, NEXT_SIGNED_PRE_KEY_ID};
use sigcore::store::{KeyBackend, PreKeyStore, SignedPreKeyStore, WriteBatch};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Issues and persists pre-keys, signed pre-keys and the last-resort key.
///
/// The backend is shared but only ever written through this type. Every
/// read-modify-write sequence (id allocation, last-resort creation, signed id
/// allocation) runs under `write_lock`, so concurrent callers cannot be handed
/// the same id or create two last-resort keys.
pub struct KeyMaterialStore {
    backend: Arc<dyn KeyBackend>,
    config: KeyStoreConfig,
    write_lock: Mutex<()>,
}

impl KeyMaterialStore {
    pub fn new(backend: Arc<dyn KeyBackend>) -> Self {
        Self::with_config(backend, KeyStoreConfig::default())
    }

    pub fn with_config(backend: Arc<dyn KeyBackend>, config: KeyStoreConfig) -> Self {
        Self {
            backend,
            config,
            write_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KeyBackend> {
        &self.backend
    }

    fn id_range(&self) -> IdRange {
        self.config.id_range
    }

    fn initial_pre_key_id(&self) -> PreKeyId {
        let range = self.id_range();
        match self.config.initial_pre_key_id {
            Some(id) if range.contains(id) => id,
            _ => rand::rng().random_range(range.start()..range.end()),
        }
    }

    /// Allocates `count` fresh records. Ids continue from the last issued id,
    /// wrap at the end of the range and skip ids still held by stored records.
    /// The advanced counter is persisted before the records are returned; the
    /// records themselves are not stored until [`Self::store_key_records`].
    pub async fn generate_key_records(&self, count: usize) -> KeyResult<Vec<KeyRecord>> {
        let _guard = self.write_lock.lock().await;

        let next = match self.backend.load_meta(NEXT_PRE_KEY_ID).await? {
            Some(next) => next,
            None => self.initial_pre_key_id(),
        };
        let taken: HashSet<PreKeyId> = self.backend.pre_key_ids().await?.into_iter().collect();
        let allocation = allocate_ids(self.id_range(), next, count, &taken)?;

        let records = generate_records(&allocation.ids);

        let mut batch = WriteBatch::new();
        batch.put_meta(NEXT_PRE_KEY_ID, allocation.next);
        self.backend.commit(batch).await?;

        debug!(
            target: "KeyStore",
            "Generated {} pre-keys starting at {:?}, next id {}",
            records.len(),
            allocation.ids.first(),
            allocation.next
        );
        Ok(records)
    }

    /// Persists the whole batch in one commit: all records become readable or
    /// none do.
    pub async fn store_key_records(&self, records: &[KeyRecord]) -> KeyResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for record in records {
            batch.put_pre_key(record);
        }
        self.backend.commit(batch).await?;
        debug!(target: "KeyStore", "Stored {} pre-keys", records.len());
        Ok(())
    }

    pub async fn load_key_record(&self, id: PreKeyId) -> KeyResult<Option<KeyRecord>> {
        match self.backend.load_pre_key(id).await? {
            Some(bytes) => Ok(Some(KeyRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn contains_key_record(&self, id: PreKeyId) -> KeyResult<bool> {
        Ok(self.backend.load_pre_key(id).await?.is_some())
    }

    /// No-op for ids that are not stored.
    pub async fn remove_key_record(&self, id: PreKeyId) -> KeyResult<()> {
        let mut batch = WriteBatch::new();
        batch.remove_pre_key(id);
        self.backend.commit(batch).await?;
        debug!(target: "KeyStore", "Removed pre-key {id}");
        Ok(())
    }

    /// Returns the stored last-resort key, creating it on first use. Repeated
    /// and concurrent calls all observe the same record.
    pub async fn get_or_generate_last_resort_key(&self) -> KeyResult<KeyRecord> {
        let _guard = self.write_lock.lock().await;

        if let Some(existing) = self.load_key_record(LAST_RESORT_KEY_ID).await? {
            return Ok(existing);
        }

        let record = generate_records(&[LAST_RESORT_KEY_ID]).remove(0);
        let mut batch = WriteBatch::new();
        batch.put_pre_key(&record);
        self.backend.commit(batch).await?;
        info!(target: "KeyStore", "Generated last-resort key");
        Ok(record)
    }

    /// Creates a signed pre-key under the next signed id. The counter is
    /// persisted; the record is not.
    pub async fn generate_signed_key_record(
        &self,
        identity: &IdentityKeyPair,
    ) -> KeyResult<SignedKeyRecord> {
        let _guard = self.write_lock.lock().await;

        let id = match self.backend.load_meta(NEXT_SIGNED_PRE_KEY_ID).await? {
            Some(id) => id,
            None => random_signed_pre_key_id(),
        };
        let record = {
            let mut rng = rand::rng();
            SignedKeyRecord::generate(id, identity, Utc::now(), &mut rng)
        };

        let mut batch = WriteBatch::new();
        batch.put_meta(NEXT_SIGNED_PRE_KEY_ID, next_signed_pre_key_id(id));
        self.backend.commit(batch).await?;

        debug!(target: "KeyStore", "Generated signed pre-key {id}");
        Ok(record)
    }

    pub async fn store_signed_key_record(&self, record: &SignedKeyRecord) -> KeyResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_signed_pre_key(record);
        self.backend.commit(batch).await?;
        Ok(())
    }

    pub async fn load_signed_key_record(
        &self,
        id: SignedPreKeyId,
    ) -> KeyResult<Option<SignedKeyRecord>> {
        match self.backend.load_signed_pre_key(id).await? {
            Some(bytes) => Ok(Some(SignedKeyRecord::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All stored signed pre-keys, ordered by id.
    pub async fn load_signed_key_records(&self) -> KeyResult<Vec<SignedKeyRecord>> {
        self.backend
            .load_signed_pre_keys()
            .await?
            .iter()
            .map(|(_, bytes)| SignedKeyRecord::deserialize(bytes).map_err(Into::into))
            .collect()
    }

    pub async fn remove_signed_key_record(&self, id: SignedPreKeyId) -> KeyResult<()> {
        let mut batch = WriteBatch::new();
        batch.remove_signed_pre_key(id);
        self.backend.commit(batch).await?;
        Ok(())
    }

    /// Id of the signed pre-key most recently accepted by the service.
    pub async fn current_signed_key_id(&self) -> KeyResult<Option<SignedPreKeyId>> {
        Ok(self.backend.load_meta(CURRENT_SIGNED_PRE_KEY_ID).await?)
    }

    pub async fn set_current_signed_key_id(&self, id: SignedPreKeyId) -> KeyResult<()> {
        let mut batch = WriteBatch::new();
        batch.put_meta(CURRENT_SIGNED_PRE_KEY_ID, id);
        self.backend.commit(batch).await?;
        info!(target: "KeyStore", "Signed pre-key {id} is now current");
        Ok(())
    }
}

fn random_signed_pre_key_id() -> SignedPreKeyId {
    rand::rng().random_range(1..=MAX_PRE_KEY_ID)
}

fn generate_records(ids: &[PreKeyId]) -> Vec<KeyRecord> {
    let mut rng = rand::rng();
    ids.iter()
        .map(|id| KeyRecord::new(*id, KeyPair::generate(&mut rng)))
        .collect()
}

#[async_trait]
impl PreKeyStore for KeyMaterialStore {
    async fn load_pre_key(&self, id: PreKeyId) -> KeyResult<Option<KeyRecord>> {
        self.load_key_record(id).await
    }

    async fn contains_pre_key(&self, id: PreKeyId) -> KeyResult<bool> {
        self.contains_key_record(id).await
    }

    async fn remove_pre_key(&self, id: PreKeyId) -> KeyResult<()> {
        self.remove_key_record(id).await
    }
}

#[async_trait]
impl SignedPreKeyStore for KeyMaterialStore {
    async fn load_signed_pre_key(&self, id: SignedPreKeyId) -> KeyResult<Option<SignedKeyRecord>> {
        self.load_signed_key_record(id).await
    }

    async fn load_signed_pre_keys(&self) -> KeyResult<Vec<SignedKeyRecord>> {
        self.load_signed_key_records().await
    }

    async fn store_signed_pre_key(&self, record: &SignedKeyRecord) -> KeyResult<()> {
        self.store_signed_key_record(record).await
    }

    async fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> KeyResult<bool> {
        Ok(self.backend.load_signed_pre_key(id).await?.is_some())
    }

    async fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> KeyResult<()> {
        self.remove_signed_key_record(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackend;
    use sigcore::store::KeyStoreError;

    fn store_starting_at(start: PreKeyId) -> (Arc<InMemoryBackend>, KeyMaterialStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = KeyMaterialStore::with_config(
            backend.clone(),
            KeyStoreConfig {
                initial_pre_key_id: Some(start),
                ..Default::default()
            },
        );
        (backend, store)
    }

    fn ids(records: &[KeyRecord]) -> Vec<PreKeyId> {
        records.iter().map(KeyRecord::id).collect()
    }

    #[tokio::test]
    async fn freed_ids_are_not_reused() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_, store) = store_starting_at(0);

        let first = store.generate_key_records(10).await.unwrap();
        assert_eq!(ids(&first), (0..10).collect::<Vec<_>>());
        store.store_key_records(&first).await.unwrap();

        store.remove_key_record(5).await.unwrap();
        assert!(!store.contains_key_record(5).await.unwrap());

        let next = store.generate_key_records(1).await.unwrap();
        assert_eq!(ids(&next), vec![10]);
    }

    #[tokio::test]
    async fn ids_stay_distinct_across_calls() {
        let (_, store) = store_starting_at(100);
        let mut seen = HashSet::new();
        for _ in 0..5 {
            // Not storing in between must still not repeat ids.
            for record in store.generate_key_records(20).await.unwrap() {
                assert!(seen.insert(record.id()), "duplicate id {}", record.id());
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    async fn wraparound_skips_live_records() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = KeyMaterialStore::with_config(
            backend,
            KeyStoreConfig {
                id_range: IdRange::new(0, 8),
                initial_pre_key_id: Some(6),
            },
        );

        let live = store.generate_key_records(2).await.unwrap();
        assert_eq!(ids(&live), vec![6, 7]);
        store.store_key_records(&live).await.unwrap();

        let wrapped = store.generate_key_records(3).await.unwrap();
        assert_eq!(ids(&wrapped), vec![0, 1, 2]);
        store.store_key_records(&wrapped).await.unwrap();

        let rest = store.generate_key_records(3).await.unwrap();
        assert_eq!(ids(&rest), vec![3, 4, 5]);
        store.store_key_records(&rest).await.unwrap();

        match store.generate_key_records(1).await {
            Err(KeyStoreError::ExhaustedIdSpace {
                requested: 1,
                available: 0,
            }) => {}
            other => panic!("expected exhaustion, got {other:?}"),
        }

        // Consuming one frees exactly that id.
        store.remove_key_record(1).await.unwrap();
        assert_eq!(ids(&store.generate_key_records(1).await.unwrap()), vec![1]);
    }

    #[tokio::test]
    async fn last_resort_key_is_generated_once() {
        let (_, store) = store_starting_at(0);
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_or_generate_last_resort_key().await })
            })
            .collect();

        let mut records = Vec::new();
        for handle in handles {
            records.push(handle.await.unwrap().unwrap());
        }
        let again = store.get_or_generate_last_resort_key().await.unwrap();

        assert!(records.iter().all(|r| *r == again));
        assert_eq!(again.id(), LAST_RESORT_KEY_ID);
    }

    #[tokio::test]
    async fn last_resort_id_never_handed_to_batches() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = KeyMaterialStore::with_config(
            backend,
            KeyStoreConfig {
                initial_pre_key_id: Some(MAX_PRE_KEY_ID - 2),
                ..Default::default()
            },
        );
        store.get_or_generate_last_resort_key().await.unwrap();
        let batch = store.generate_key_records(4).await.unwrap();
        assert_eq!(ids(&batch), vec![MAX_PRE_KEY_ID - 2, MAX_PRE_KEY_ID - 1, 0, 1]);
    }

    #[tokio::test]
    async fn failed_batch_store_leaves_nothing_visible() {
        let (backend, store) = store_starting_at(0);
        let records = store.generate_key_records(10).await.unwrap();

        backend.fail_next_commit_after(4);
        let err = store.store_key_records(&records).await.unwrap_err();
        assert!(matches!(err, KeyStoreError::StoreUnavailable(_)));

        for record in &records {
            assert!(store.load_key_record(record.id()).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn signed_keys_rotate_and_verify() {
        let (_, store) = store_starting_at(0);
        let identity = IdentityKeyPair::generate(&mut rand::rng());

        let first = store.generate_signed_key_record(&identity).await.unwrap();
        let second = store.generate_signed_key_record(&identity).await.unwrap();
        assert_eq!(second.id(), next_signed_pre_key_id(first.id()));
        assert!(first.verify(identity.public_key()));

        store.store_signed_key_record(&first).await.unwrap();
        store.store_signed_key_record(&second).await.unwrap();
        store.set_current_signed_key_id(second.id()).await.unwrap();

        assert_eq!(store.current_signed_key_id().await.unwrap(), Some(second.id()));
        assert_eq!(store.load_signed_key_records().await.unwrap().len(), 2);
        assert_eq!(
            store.load_signed_key_record(first.id()).await.unwrap(),
            Some(first.clone())
        );

        store.remove_signed_key_record(first.id()).await.unwrap();
        assert!(!store.contains_signed_pre_key(first.id()).await.unwrap());
    }
}
