//! Async driver for a Signal-style service connection: the persistent socket
//! with request correlation and lifecycle handling, durable pre-key storage,
//! and pre-key publication on top of both.

pub use sigcore::{builders, curve, frame, request};

pub mod config;
pub mod keepalive;
pub mod prekeys;
pub mod socket;
pub mod store;
pub mod transport;
pub mod websocket;

pub use config::{KeyStoreConfig, SocketConfig};
pub use prekeys::{PreKeyPublisher, PublishError, PublishedKeys};
pub use sigcore::prekeys::{
    IdRange, KeyRecord, LAST_RESORT_KEY_ID, MAX_PRE_KEY_ID, PRE_KEY_BATCH_SIZE,
    PRE_KEY_MINIMUM_COUNT, PreKeyId, SignedKeyRecord, SignedPreKeyId,
};
pub use sigcore::request::{ServerRequest, SocketRequest, SocketResponse};
pub use socket::{
    AppLifecycle, ConnectionState, InboundRequestHandler, ObserverId, RequestError,
    SocketManager, SocketStateObserver,
};
pub use store::{FileStore, InMemoryBackend, KeyMaterialStore};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use websocket::WebSocketTransportFactory;
