//! RPC client implementation.
//!
//! This module contains the core [`RpcClient`] type which publishes request
//! envelopes onto a shared work queue and multiplexes many concurrent
//! requests over one private reply queue.
//!
//! # Architecture
//!
//! Construction declares an exclusive, broker-named reply queue and starts a
//! background receive loop consuming it. Each request registers a oneshot
//! channel in the pending map keyed by correlation ID, then publishes with
//! `reply_to` pointing at the reply queue. When a response arrives, the
//! receive loop removes the matching entry and delivers the outcome to the
//! waiting call.
//!
//! # Concurrency
//!
//! Multiple requests can be in flight simultaneously; responses may arrive
//! in any order and are matched purely by correlation ID. The pending map is
//! protected by a mutex but lock contention is minimal since operations are
//! just HashMap insert/remove. The publish, consume, and timeout paths race
//! for each entry, and whichever removes it first owns the outcome.

mod pending;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_lite::stream::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use crate::protocol::{CorrelationId, RequestEnvelope, ResponseEnvelope, CONTENT_TYPE_JSON};
use crate::queue::{declare_queue, QueueOptions};
use crate::{lock_ignore_poison, Result, RpcError, Session};

use pending::{Outcome, PendingRequests};

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Maximum time to wait for the response. `None` waits indefinitely
    /// (until the server replies or the connection is lost).
    pub timeout: Option<Duration>,

    /// Caller-supplied correlation ID. Generated when absent. Supplying an
    /// ID that is already in flight on this client is a precondition
    /// violation and fails the call with `RpcError::Protocol`.
    pub correlation_id: Option<CorrelationId>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed); clones share the session, the
/// reply queue, and the pending map.
///
/// # Example
///
/// ```no_run
/// # use amqp_rpc::RpcClient;
/// # async fn example() -> amqp_rpc::Result<()> {
/// let client = RpcClient::connect("localhost", "fib").await?;
/// let result: u64 = client.call(&40u64).await?;
/// assert_eq!(result, 102334155);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    session: Session,
    work_queue: String,
    reply_queue: String,
    pending: Arc<Mutex<PendingRequests>>,

    /// Reply receive loop handle. Kept so the task isn't immediately
    /// dropped; it exits on its own when the session closes.
    _rx_task: JoinHandle<()>,
}

impl RpcClient {
    // ---

    /// Connect to the broker at `addr` and target the named work queue.
    ///
    /// Opens a dedicated session; use [`with_session`](Self::with_session)
    /// to share one managed by a `SessionRegistry`.
    ///
    /// # Errors
    ///
    /// - `RpcError::Connection` if the session cannot be established.
    /// - `RpcError::Protocol` if either queue declaration is refused.
    pub async fn connect(addr: &str, work_queue: &str) -> Result<Self> {
        // ---
        let session = Session::open(addr).await?;
        Self::with_session(session, work_queue).await
    }

    /// Create a client over an existing session.
    ///
    /// Declares the work queue idempotently (so requests never land on a
    /// nonexistent queue), declares an exclusive broker-named reply queue,
    /// and starts consuming it before returning.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Protocol` if a queue declaration is refused, or
    /// `RpcError::Connection` if the reply consumer cannot be started.
    pub async fn with_session(session: Session, work_queue: &str) -> Result<Self> {
        // ---
        declare_queue(&session, work_queue, QueueOptions::work()).await?;

        // Empty name requests a broker-generated unique queue, owned by this
        // session and deleted with it.
        let reply = declare_queue(&session, "", QueueOptions::reply()).await?;
        let reply_queue = reply.name().to_string();

        let consumer = session
            .channel()
            .basic_consume(
                &reply_queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Connection(format!("reply consume failed: {e}")))?;

        let pending: Arc<Mutex<PendingRequests>> = Arc::new(Mutex::new(PendingRequests::new()));
        let rx_task = spawn_reply_task(consumer, Arc::clone(&pending), reply_queue.clone());

        tracing::debug!("client ready, replies on {reply_queue}");

        Ok(Self {
            inner: Arc::new(Inner {
                session,
                work_queue: work_queue.to_string(),
                reply_queue,
                pending,
                _rx_task: rx_task,
            }),
        })
    }

    /// Send a request and await the matching response.
    ///
    /// Waits indefinitely; use [`call_with_options`](Self::call_with_options)
    /// to set a timeout or supply a correlation ID.
    ///
    /// # Errors
    ///
    /// - `RpcError::Serialization` - request or response (de)serialization fails
    /// - `RpcError::Connection` - publish fails or the reply channel is lost
    /// - `RpcError::Handler` - the server's handler reported a failure
    pub async fn call<TReq, TResp>(&self, request: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        self.call_with_options(request, CallOptions::default()).await
    }

    /// Send a request with explicit per-call options.
    ///
    /// The call resolves exactly once: with the server's result, a handler
    /// error, `RpcError::Timeout` if the window elapses first, or
    /// `RpcError::Connection` on transport failure. A response that arrives
    /// after resolution is dropped by the receive loop.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus `RpcError::Timeout` when
    /// `options.timeout` elapses and `RpcError::Protocol` when a supplied
    /// correlation ID is already in flight.
    pub async fn call_with_options<TReq, TResp>(
        &self,
        request: &TReq,
        options: CallOptions,
    ) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let id = options
            .correlation_id
            .unwrap_or_else(CorrelationId::generate);

        // Serialize before registering so a bad payload leaves no entry behind.
        let envelope = RequestEnvelope {
            id: id.clone(),
            payload: request,
        };
        let body = serde_json::to_vec(&envelope)?;

        let mut rx = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.register(id.clone())?
        };

        tracing::debug!("sending request {id}");

        let properties = BasicProperties::default()
            .with_correlation_id(id.to_string().into())
            .with_reply_to(self.inner.reply_queue.clone().into())
            .with_content_type(CONTENT_TYPE_JSON.to_string().into());

        let published = self
            .inner
            .session
            .channel()
            .basic_publish(
                "", // default exchange: routing key is the queue name
                &self.inner.work_queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await;

        if let Err(e) = published {
            lock_ignore_poison(&self.inner.pending).remove(&id);
            return Err(RpcError::Connection(format!("publish failed: {e}")));
        }

        let outcome = match options.timeout {
            Some(window) => match time::timeout(window, &mut rx).await {
                Ok(received) => received.map_err(|_| closed_error())?,
                Err(_) => resolve_timeout(&self.inner.pending, &id, &mut rx)?,
            },
            None => rx.await.map_err(|_| closed_error())?,
        };

        let value = outcome?;
        Ok(serde_json::from_value(value)?)
    }

    /// Name of this client's private reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Name of the work queue this client targets.
    pub fn work_queue(&self) -> &str {
        &self.inner.work_queue
    }

    /// Close the underlying session. Idempotent.
    ///
    /// The broker deletes the exclusive reply queue with the session; any
    /// still-pending requests resolve with `RpcError::Connection`.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.session.close().await
    }
}

fn closed_error() -> RpcError {
    RpcError::Connection("reply channel closed before a response arrived".into())
}

/// Resolve the timer-vs-delivery race after the timeout window elapsed.
///
/// Entry presence decides: if the entry is still registered the timeout
/// wins and removes it; if the receive loop already took the entry, the
/// response it delivered (under the same lock) is the outcome.
fn resolve_timeout(
    pending: &Mutex<PendingRequests>,
    id: &CorrelationId,
    rx: &mut oneshot::Receiver<Outcome>,
) -> Result<Outcome> {
    // ---
    {
        let mut pending = lock_ignore_poison(pending);
        if pending.remove(id) {
            tracing::debug!("request {id} timed out");
            return Err(RpcError::Timeout);
        }
    }

    // The entry is gone, so its outcome was already sent.
    match rx.try_recv() {
        Ok(outcome) => Ok(outcome),
        Err(_) => Err(RpcError::Timeout),
    }
}

/// Match one reply-queue delivery to its pending entry.
///
/// Returns false when no entry is live for the ID; late and duplicate
/// deliveries are not errors and are simply dropped.
fn dispatch_reply(pending: &Mutex<PendingRequests>, id: &CorrelationId, body: &[u8]) -> bool {
    // ---
    let outcome: Outcome = match serde_json::from_slice::<ResponseEnvelope<serde_json::Value>>(body)
    {
        Ok(envelope) => envelope.into_outcome(),
        Err(e) => Err(RpcError::Protocol(format!(
            "malformed response envelope: {e}"
        ))),
    };

    lock_ignore_poison(pending).complete(id, outcome)
}

/// Spawn the reply receive loop.
///
/// Every delivery is acknowledged, matched or not. When the consumer stream
/// ends (session closed or connection lost), all in-flight requests are
/// failed so no caller hangs.
fn spawn_reply_task(
    mut consumer: lapin::Consumer,
    pending: Arc<Mutex<PendingRequests>>,
    reply_queue: String,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        while let Some(next) = consumer.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::warn!("reply consumer error on {reply_queue}: {e}");
                    break;
                }
            };

            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                tracing::warn!("failed to ack reply: {e}");
            }

            let correlation_id = match delivery.properties.correlation_id() {
                Some(id) => CorrelationId::from(id.as_str()),
                None => {
                    tracing::warn!("reply without correlation id dropped");
                    continue;
                }
            };

            if !dispatch_reply(&pending, &correlation_id, &delivery.data) {
                tracing::debug!("late or duplicate reply {correlation_id} dropped");
            }
        }

        tracing::debug!("reply consumer for {reply_queue} stopped");
        lock_ignore_poison(&pending).fail_all("connection lost while awaiting response");
    })
}
