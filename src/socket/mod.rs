pub mod error;
pub mod manager;
pub mod observer;

pub use error::RequestError;
pub use manager::SocketManager;
pub use observer::{InboundRequestHandler, ObserverId, SocketStateObserver};
pub use sigcore::socket::{AppLifecycle, ConnectionState};
