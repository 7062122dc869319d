//! Queue provisioning and lifecycle.
//!
//! Declares work and reply queues with RPC-appropriate options and exposes
//! deletion for test and deployment cleanup. Queue durability, routing, and
//! storage are the broker's concern; this module only asserts what the RPC
//! layer needs.

use lapin::options::{QueueDeclareOptions, QueueDeleteOptions};
use lapin::types::FieldTable;

use crate::{Result, RpcError, Session};

/// Options recognized when declaring a queue.
///
/// Everything else (auto-delete, passive, arguments) is fixed by the RPC
/// usage pattern: reply queues are `exclusive` and vanish with their owning
/// session; work queues are shared and non-durable.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// Restrict the queue to the declaring connection and delete it when
    /// that connection closes. Used for reply queues.
    pub exclusive: bool,
    /// Persist the queue definition across broker restarts. RPC queues
    /// normally leave this off.
    pub durable: bool,
}

impl QueueOptions {
    /// Options for a per-client reply queue.
    pub fn reply() -> Self {
        // ---
        Self {
            exclusive: true,
            durable: false,
        }
    }

    /// Options for a shared work queue.
    pub fn work() -> Self {
        Self::default()
    }
}

/// Result of a successful queue declaration.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    name: String,
    message_count: u32,
    consumer_count: u32,
}

impl QueueHandle {
    /// Effective queue name. For an empty-name declaration this is the
    /// broker-generated unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages sitting in the queue at declaration time.
    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    /// Consumers attached at declaration time.
    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }
}

/// Declare (assert) a queue on the session's channel.
///
/// Declaring with an empty `name` requests a broker-generated unique name,
/// which is how reply queues are created. Redeclaring an existing queue with
/// compatible options is a no-op.
///
/// # Errors
///
/// Returns `RpcError::Protocol` if the broker refuses the declaration, which
/// includes redeclaring an existing queue with incompatible options.
pub async fn declare_queue(session: &Session, name: &str, options: QueueOptions) -> Result<QueueHandle> {
    // ---
    let declare_opts = QueueDeclareOptions {
        passive: false,
        durable: options.durable,
        exclusive: options.exclusive,
        auto_delete: false,
        nowait: false,
    };

    let queue = session
        .channel()
        .queue_declare(name, declare_opts, FieldTable::default())
        .await
        .map_err(|e| RpcError::Protocol(format!("queue declare {name:?} failed: {e}")))?;

    tracing::debug!("declared queue {}", queue.name().as_str());

    Ok(QueueHandle {
        name: queue.name().as_str().to_string(),
        message_count: queue.message_count(),
        consumer_count: queue.consumer_count(),
    })
}

/// Options recognized when deleting a queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Refuse deletion if the queue has consumers.
    pub if_unused: bool,
    /// Refuse deletion if the queue holds messages.
    pub if_empty: bool,
}

/// Delete a named queue, opening a short-lived session to do so.
///
/// Returns the number of messages the broker discarded. Not part of the
/// request hot path; intended for test and deployment cleanup.
///
/// # Errors
///
/// - `RpcError::Connection` if the session cannot be opened.
/// - `RpcError::Protocol` if the broker refuses the deletion.
pub async fn delete_queue(addr: &str, name: &str, options: DeleteOptions) -> Result<u32> {
    // ---
    let session = Session::open(addr).await?;

    let deleted = session
        .channel()
        .queue_delete(
            name,
            QueueDeleteOptions {
                if_unused: options.if_unused,
                if_empty: options.if_empty,
                nowait: false,
            },
        )
        .await
        .map_err(|e| RpcError::Protocol(format!("queue delete {name:?} failed: {e}")));

    session.close().await?;

    let count = deleted?;
    tracing::debug!("deleted queue {name} ({count} messages discarded)");
    Ok(count)
}
