use crate::socket::{RequestError, SocketManager};
use log::{debug, info, warn};
use sigcore::builders::keepalive_request;
use std::sync::Arc;

impl SocketManager {
    /// Sends a single heartbeat. Returns the failure, if any.
    async fn send_keepalive(&self) -> Result<(), RequestError> {
        debug!(target: "Socket/Keepalive", "Sending keepalive");
        let request = keepalive_request().with_timeout(self.config().request_timeout);
        self.send_request(request).await.map(|_| ())
    }

    /// Heartbeat for one connection epoch. Spawned when the epoch opens and
    /// aborted with it; a heartbeat that goes unanswered closes the epoch.
    pub(crate) async fn keepalive_loop(self: Arc<Self>, epoch: u64) {
        let mut error_count = 0u32;

        loop {
            tokio::time::sleep(self.config().heartbeat_interval).await;
            if !self.is_current_epoch(epoch) {
                debug!(target: "Socket/Keepalive", "Epoch {epoch} no longer open, exiting keepalive loop.");
                return;
            }

            match self.send_keepalive().await {
                Ok(()) => {
                    if error_count > 0 {
                        info!(target: "Socket/Keepalive", "Keepalive restored.");
                    }
                    error_count = 0;
                }
                Err(RequestError::Timeout) => {
                    warn!(target: "Socket/Keepalive", "Keepalive unanswered, closing socket.");
                    self.handle_closed(epoch, "keepalive timed out");
                    return;
                }
                Err(RequestError::NotConnected | RequestError::ConnectionClosed) => {
                    debug!(target: "Socket/Keepalive", "Connection gone, exiting keepalive loop.");
                    return;
                }
                Err(e) => {
                    // The server answered, so the link itself is alive.
                    error_count += 1;
                    warn!(target: "Socket/Keepalive", "Keepalive rejected: {e} (error count: {error_count})");
                }
            }
        }
    }
}
