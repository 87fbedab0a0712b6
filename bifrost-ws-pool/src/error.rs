use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("websocket handshake to `{endpoint}` timed out after {elapsed_ms}ms")]
    HandshakeTimeout { endpoint: String, elapsed_ms: u64 },
    #[error("dial to `{endpoint}` failed: {message}")]
    DialFailed { endpoint: String, message: String },
    #[error("pool is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection limit of {limit} reached")]
    ConnectionLimit { limit: usize },
}
