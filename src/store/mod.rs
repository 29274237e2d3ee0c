pub mod filestore;
pub mod key_material;
pub mod memory;

pub use filestore::FileStore;
pub use key_material::KeyMaterialStore;
pub use memory::InMemoryBackend;
pub use sigcore::store::{
    KeyBackend, KeyStoreError, PreKeyStore, SignedPreKeyStore, StoreError, WriteBatch, WriteOp,
};

use serde::{Deserialize, Serialize};
use sigcore::prekeys::{PreKeyId, SignedPreKeyId};
use std::collections::HashMap;

/// Full backend contents. Backends stage a batch on a copy and swap it in
/// only once the batch is durable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct KeyTables {
    pub pre_keys: HashMap<PreKeyId, Vec<u8>>,
    pub signed_pre_keys: HashMap<SignedPreKeyId, Vec<u8>>,
    pub meta: HashMap<String, u32>,
}

impl KeyTables {
    pub fn apply(&mut self, op: &WriteOp) {
        match op {
            WriteOp::PutPreKey { id, record } => {
                self.pre_keys.insert(*id, record.clone());
            }
            WriteOp::RemovePreKey(id) => {
                self.pre_keys.remove(id);
            }
            WriteOp::PutSignedPreKey { id, record } => {
                self.signed_pre_keys.insert(*id, record.clone());
            }
            WriteOp::RemoveSignedPreKey(id) => {
                self.signed_pre_keys.remove(id);
            }
            WriteOp::PutMeta { key, value } => {
                self.meta.insert(key.clone(), *value);
            }
        }
    }

    pub fn pre_key_ids(&self) -> Vec<PreKeyId> {
        let mut ids: Vec<_> = self.pre_keys.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn signed_pre_keys(&self) -> Vec<(SignedPreKeyId, Vec<u8>)> {
        let mut out: Vec<_> = self
            .signed_pre_keys
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}
