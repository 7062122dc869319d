use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{HandlerError, RequestEnvelope};

/// Result of one handler invocation, ready for the response envelope's
/// `result`/`error` slots.
pub(super) type HandlerOutcome = std::result::Result<Value, HandlerError>;

/// Type-erased async handler function.
///
/// Takes the raw request body (full request envelope) and produces the
/// outcome value. All failure modes, including a body that does not parse,
/// come back as `HandlerError` so the dispatcher's envelope construction is
/// a plain mapping.
///
/// Wrapped in Arc for cheap cloning into the consume loop.
pub(super) type BoxedHandler =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = HandlerOutcome> + Send>> + Send + Sync>;

/// Wrap a typed handler function into a type-erased handler.
pub(super) fn wrap_handler<F, Fut, TReq, TResp>(handler: F) -> BoxedHandler
where
    F: Fn(TReq) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = std::result::Result<TResp, HandlerError>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |body: Bytes| {
        let handler = handler.clone();

        Box::pin(async move {
            // ---
            // A parse failure is a handler-level error, not a transport
            // failure: the message still gets a response and an ack, so it
            // cannot poison the queue.
            let envelope: RequestEnvelope<TReq> = serde_json::from_slice(&body).map_err(|e| {
                HandlerError::new("ProtocolError", format!("malformed request envelope: {e}"))
            })?;

            let response = handler(envelope.payload).await?;

            serde_json::to_value(response)
                .map_err(|e| HandlerError::new("SerializationError", e.to_string()))
        }) as Pin<Box<dyn Future<Output = HandlerOutcome> + Send>>
    })
}
