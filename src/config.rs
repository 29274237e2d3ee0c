use sigcore::prekeys::{IdRange, PreKeyId};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Applied to requests that do not carry their own timeout.
    pub request_timeout: Duration,
    /// Minimum time the connection is held open while the app is backgrounded.
    pub background_keep_open: Duration,
    pub timeout_sweep_interval: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            background_keep_open: Duration::from_secs(25),
            timeout_sweep_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct KeyStoreConfig {
    pub id_range: IdRange,
    /// First id handed out by a fresh store. A random id in `id_range` when
    /// unset.
    pub initial_pre_key_id: Option<PreKeyId>,
}
