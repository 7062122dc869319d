//! Wire protocol types.
//!
//! Envelopes are JSON-serialized message bodies; correlation and reply
//! routing metadata travel in the AMQP message properties, not in the body.

mod correlation;
mod message;

pub use correlation::CorrelationId;
pub use message::{HandlerError, RequestEnvelope, ResponseEnvelope, CONTENT_TYPE_JSON};
