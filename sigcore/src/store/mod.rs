pub mod error;
pub mod traits;

pub use error::{KeyStoreError, StoreError};
pub use traits::{KeyBackend, PreKeyStore, SignedPreKeyStore, WriteBatch, WriteOp};
