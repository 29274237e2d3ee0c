use crate::prekeys::{KeyRecord, PreKeyId, SignedKeyRecord, SignedPreKeyId};
use crate::store::error::{KeyResult, Result};
use async_trait::async_trait;

/// Counter persisted alongside the records it allocates ids for.
pub const NEXT_PRE_KEY_ID: &str = "next_pre_key_id";
pub const NEXT_SIGNED_PRE_KEY_ID: &str = "next_signed_pre_key_id";
pub const CURRENT_SIGNED_PRE_KEY_ID: &str = "current_signed_pre_key_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    PutPreKey { id: PreKeyId, record: Vec<u8> },
    RemovePreKey(PreKeyId),
    PutSignedPreKey { id: SignedPreKeyId, record: Vec<u8> },
    RemoveSignedPreKey(SignedPreKeyId),
    PutMeta { key: String, value: u32 },
}

/// An ordered set of writes that a backend applies as one unit: after a
/// commit either every op is durably visible or none is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_pre_key(&mut self, record: &KeyRecord) -> &mut Self {
        self.ops.push(WriteOp::PutPreKey {
            id: record.id(),
            record: record.serialize(),
        });
        self
    }

    pub fn remove_pre_key(&mut self, id: PreKeyId) -> &mut Self {
        self.ops.push(WriteOp::RemovePreKey(id));
        self
    }

    pub fn put_signed_pre_key(&mut self, record: &SignedKeyRecord) -> &mut Self {
        self.ops.push(WriteOp::PutSignedPreKey {
            id: record.id(),
            record: record.serialize(),
        });
        self
    }

    pub fn remove_signed_pre_key(&mut self, id: SignedPreKeyId) -> &mut Self {
        self.ops.push(WriteOp::RemoveSignedPreKey(id));
        self
    }

    pub fn put_meta(&mut self, key: &str, value: u32) -> &mut Self {
        self.ops.push(WriteOp::PutMeta {
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Durable storage consumed by the key material store. Records travel as
/// opaque serialized bytes keyed by id.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Applies the whole batch atomically and durably.
    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    async fn load_pre_key(&self, id: PreKeyId) -> Result<Option<Vec<u8>>>;
    async fn pre_key_ids(&self) -> Result<Vec<PreKeyId>>;

    async fn load_signed_pre_key(&self, id: SignedPreKeyId) -> Result<Option<Vec<u8>>>;
    async fn load_signed_pre_keys(&self) -> Result<Vec<(SignedPreKeyId, Vec<u8>)>>;

    async fn load_meta(&self, key: &str) -> Result<Option<u32>>;
}

/// Protocol-facing access to one-time pre-keys during session setup.
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    async fn load_pre_key(&self, id: PreKeyId) -> KeyResult<Option<KeyRecord>>;
    async fn contains_pre_key(&self, id: PreKeyId) -> KeyResult<bool>;
    /// Deletes a consumed record; absent ids are a no-op.
    async fn remove_pre_key(&self, id: PreKeyId) -> KeyResult<()>;
}

#[async_trait]
pub trait SignedPreKeyStore: Send + Sync {
    async fn load_signed_pre_key(&self, id: SignedPreKeyId) -> KeyResult<Option<SignedKeyRecord>>;
    async fn load_signed_pre_keys(&self) -> KeyResult<Vec<SignedKeyRecord>>;
    async fn store_signed_pre_key(&self, record: &SignedKeyRecord) -> KeyResult<()>;
    async fn contains_signed_pre_key(&self, id: SignedPreKeyId) -> KeyResult<bool>;
    async fn remove_signed_pre_key(&self, id: SignedPreKeyId) -> KeyResult<()>;
}
