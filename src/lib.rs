//! Synchronous-style RPC over AMQP work queues.
//!
//! This library provides a simple, ergonomic request/response API on top of
//! an asynchronous message broker. Clients publish request envelopes onto a
//! shared work queue and await the matching response on a private reply
//! queue; servers consume the work queue one message at a time, run a
//! handler, and publish the result back. Correlation ID generation,
//! response matching, timeout handling, and conversion of handler failures
//! into transmissible errors are all handled here.
//!
//! Durability, delivery guarantees, clustering, and authentication are
//! properties of the broker and are assumed, not reproduced.

// Import all sub modules once...
mod client;
mod error;
mod protocol;
mod queue;
mod server;
mod session;

// Re-export main types
pub use client::{CallOptions, RpcClient};
pub use server::{RpcServer, ServerEvent};

pub use error::{Result, RpcError};
pub use session::{Session, SessionRegistry};

pub use queue::{declare_queue, delete_queue, DeleteOptions, QueueHandle, QueueOptions};

// --- public re-exports
pub use protocol::{
    //
    CorrelationId,
    HandlerError,
    RequestEnvelope,
    ResponseEnvelope,
    CONTENT_TYPE_JSON,
};

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Mutex poisoning indicates that another task panicked while holding the
/// lock. The state protected here (pending-request maps, session lists,
/// taken-once event receivers) carries no invariants spanning multiple
/// fields; the worst outcome is a dropped or unmatched response. This also
/// avoids propagating non-`Send` poison errors across async boundaries.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
