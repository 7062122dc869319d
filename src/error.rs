use thiserror::Error;

use crate::protocol::HandlerError;

/// Errors that can occur during RPC operations.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Request timed out waiting for a response.
    #[error("request timed out")]
    Timeout,

    /// Broker connection or channel could not be established, or was lost
    /// while requests were in flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed envelope or incompatible queue redeclaration.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server-side handler reported a failure; carried back to the
    /// caller inside the response envelope.
    #[error("handler error: {0}")]
    Handler(HandlerError),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;
