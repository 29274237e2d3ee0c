use async_trait::async_trait;
use sigcore::request::ServerRequest;
use sigcore::socket::ConnectionState;

/// Notified on every connection state transition. Registrations hold a strong
/// reference until unregistered or the manager shuts down.
pub trait SocketStateObserver: Send + Sync {
    fn on_state_changed(&self, state: ConnectionState);
}

impl<F> SocketStateObserver for F
where
    F: Fn(ConnectionState) + Send + Sync,
{
    fn on_state_changed(&self, state: ConnectionState) {
        self(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub(crate) u64);

/// Answers requests the server pushes down the socket. The returned status is
/// sent back under the request's id.
#[async_trait]
pub trait InboundRequestHandler: Send + Sync {
    async fn handle_request(&self, request: ServerRequest) -> u16;
}

pub(crate) fn status_message(status: u16) -> &'static str {
    match status {
        200..=299 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Error",
    }
}
