use crate::protocol::CorrelationId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Request envelope published to the work queue.
///
/// `id` doubles as the AMQP `correlation_id` property so servers can echo
/// it back without parsing the body.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestEnvelope<T> {
    pub id: CorrelationId,
    pub payload: T,
}

/// Response envelope published to the caller's reply queue.
///
/// Exactly one of `result` / `error` is present. The absent slot is omitted
/// from the serialized form entirely.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HandlerError>,
}

impl<T> ResponseEnvelope<T> {
    /// Build a success envelope.
    pub fn success(result: T) -> Self {
        // ---
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// Build a failure envelope.
    pub fn failure(error: HandlerError) -> Self {
        // ---
        Self {
            result: None,
            error: Some(error),
        }
    }

    /// Collapse the envelope into the caller-visible outcome.
    ///
    /// An envelope carrying neither slot (or both) is malformed and maps to
    /// [`RpcError::Protocol`](crate::RpcError::Protocol).
    pub fn into_outcome(self) -> crate::Result<T> {
        // ---
        match (self.result, self.error) {
            (Some(result), None) => Ok(result),
            (None, Some(error)) => Err(crate::RpcError::Handler(error)),
            _ => Err(crate::RpcError::Protocol(
                "response envelope must carry exactly one of result/error".into(),
            )),
        }
    }
}

/// Transmissible representation of a server-side handler failure.
///
/// This is both the value a handler returns to signal failure and the wire
/// shape of the response envelope's `error` slot. Extra fields on the wire
/// are tolerated; `name` and `message` are the minimum contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    /// Error kind, e.g. `"RangeError"`.
    pub name: String,
    /// Human-readable failure description.
    pub message: String,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}
