pub mod correlator;
pub mod state;

pub use correlator::{PendingRequest, RequestCorrelator};
pub use state::{AppLifecycle, ConnectionMachine, ConnectionState, LifecycleAction, OpenAction};
