use crate::prekeys::{IdSpaceExhausted, RecordError};
use thiserror::Error;

/// Failures raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("Database backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Database operation error: {0}")]
    Database(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the key material store. None of them are retried at
/// this layer.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("pre-key id space exhausted: requested {requested}, only {available} free")]
    ExhaustedIdSpace { requested: usize, available: usize },

    #[error("key store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("stored key record is invalid: {0}")]
    InvalidRecord(#[from] RecordError),
}

impl From<IdSpaceExhausted> for KeyStoreError {
    fn from(e: IdSpaceExhausted) -> Self {
        KeyStoreError::ExhaustedIdSpace {
            requested: e.requested,
            available: e.found,
        }
    }
}

pub type KeyResult<T> = std::result::Result<T, KeyStoreError>;
