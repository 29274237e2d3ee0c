use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("server responded with status {status}")]
    ServerError {
        status: u16,
        message: Option<String>,
        body: Option<Bytes>,
    },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RequestError {
    /// Status code carried by the failure; zero when no response was received.
    pub fn status(&self) -> u16 {
        match self {
            RequestError::ServerError { status, .. } => *status,
            _ => 0,
        }
    }

    /// Transient failures that a fresh request may succeed on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RequestError::NotConnected | RequestError::Timeout | RequestError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_retryable() {
        assert!(RequestError::NotConnected.is_retryable());
        assert!(RequestError::Timeout.is_retryable());
        assert!(RequestError::ConnectionClosed.is_retryable());

        let rejected = RequestError::ServerError {
            status: 409,
            message: Some("Conflict".into()),
            body: None,
        };
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.status(), 409);
        assert_eq!(RequestError::Timeout.status(), 0);

        let encode = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(!RequestError::from(encode).is_retryable());
    }
}
