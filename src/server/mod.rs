//! RPC server implementation.
//!
//! [`RpcServer`] consumes a shared work queue under a prefetch limit of one,
//! invokes the user handler per request, and publishes a response envelope
//! to the requester's reply queue.
//!
//! # Delivery semantics
//!
//! The inbound message is acknowledged only after its response has been
//! handed to the broker for publishing. A dispatcher that dies between
//! receipt and response therefore leaves the message unacked and the broker
//! redelivers it: at-least-once, server side.
//!
//! The prefetch limit of one is the sole backpressure mechanism. The broker
//! withholds the next message until the current one is acked, which forces
//! strictly sequential handler execution per server instance and bounds
//! in-flight work.

mod handler;

use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_lite::stream::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{HandlerError, ResponseEnvelope, CONTENT_TYPE_JSON};
use crate::queue::{declare_queue, QueueOptions};
use crate::{lock_ignore_poison, Result, RpcError, Session};

use handler::{wrap_handler, BoxedHandler, HandlerOutcome};

/// Lifecycle events forwarded from the underlying session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The consumer failed; the broker connection is gone.
    ConnectionLost(String),
    /// Consumption ended normally (session closed).
    Closed,
}

/// Running RPC server instance.
///
/// Returned by [`RpcServer::start`] once the work queue is declared and the
/// consumer is live, so a successful return *is* the readiness signal.
///
/// # Example
///
/// ```no_run
/// # use amqp_rpc::{HandlerError, RpcServer};
/// # async fn example() -> amqp_rpc::Result<()> {
/// let server = RpcServer::start("localhost", "fib", |n: u64| async move {
///     Ok::<u64, HandlerError>(fib(n))
/// })
/// .await?;
/// // ... serve until shutdown ...
/// server.close().await?;
/// # Ok(())
/// # }
/// # fn fib(n: u64) -> u64 { n }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    session: Session,
    work_queue: String,

    /// Taken once by `events()`; the handle stays clonable while the
    /// receiver remains single-consumer.
    events: Mutex<Option<mpsc::Receiver<ServerEvent>>>,

    _consume_task: JoinHandle<()>,
}

impl RpcServer {
    // ---

    /// Open a session, declare the work queue, and begin serving requests
    /// with `handler`.
    ///
    /// The handler signals failure by returning a [`HandlerError`], which is
    /// transmitted back to the caller inside the response envelope; it can
    /// never crash the dispatcher.
    ///
    /// # Errors
    ///
    /// - `RpcError::Connection` if the session or consumer cannot be established.
    /// - `RpcError::Protocol` if the work queue declaration is refused.
    pub async fn start<F, Fut, TReq, TResp>(
        addr: &str,
        work_queue: &str,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(TReq) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = std::result::Result<TResp, HandlerError>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        // ---
        let session = Session::open(addr).await?;
        Self::with_session(session, work_queue, handler).await
    }

    /// Start a server over an existing session.
    pub async fn with_session<F, Fut, TReq, TResp>(
        session: Session,
        work_queue: &str,
        handler: F,
    ) -> Result<Self>
    where
        F: Fn(TReq) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = std::result::Result<TResp, HandlerError>> + Send + 'static,
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
    {
        // ---
        declare_queue(&session, work_queue, QueueOptions::work()).await?;

        // One unacked message at a time: sequential processing, bounded work.
        session
            .channel()
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| RpcError::Connection(format!("prefetch setup failed: {e}")))?;

        let consumer = session
            .channel()
            .basic_consume(
                work_queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Connection(format!("work queue consume failed: {e}")))?;

        let (event_tx, event_rx) = mpsc::channel(8);
        let consume_task = spawn_dispatch_task(
            consumer,
            session.clone(),
            work_queue.to_string(),
            wrap_handler(handler),
            event_tx,
        );

        tracing::info!("server awaiting requests on {work_queue}");

        Ok(Self {
            inner: Arc::new(ServerInner {
                session,
                work_queue: work_queue.to_string(),
                events: Mutex::new(Some(event_rx)),
                _consume_task: consume_task,
            }),
        })
    }

    /// Take the lifecycle event stream.
    ///
    /// Returns `None` after the first call; there is a single consumer.
    pub fn events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        // ---
        lock_ignore_poison(&self.inner.events).take()
    }

    /// Name of the work queue this server consumes.
    pub fn work_queue(&self) -> &str {
        &self.inner.work_queue
    }

    /// Close the session, which stops consumption. Idempotent.
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.session.close().await
    }
}

/// Spawn the consume/dispatch loop.
///
/// Prefetch 1 means at most one delivery is in flight, so the loop handles
/// each message inline rather than spawning per request.
fn spawn_dispatch_task(
    mut consumer: lapin::Consumer,
    session: Session,
    work_queue: String,
    handler: BoxedHandler,
    events: mpsc::Sender<ServerEvent>,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        while let Some(next) = consumer.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!("consumer error on {work_queue}: {e}");
                    let _ = events.send(ServerEvent::ConnectionLost(e.to_string())).await;
                    return;
                }
            };

            let correlation_id = delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|id| id.as_str().to_string());

            let reply_to = match delivery.properties.reply_to() {
                Some(addr) => addr.as_str().to_string(),
                None => {
                    // No addressable recipient; answer nobody, ack anyway so
                    // the message cannot wedge the queue.
                    tracing::warn!("request without reply_to dropped");
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::warn!("failed to ack unanswerable request: {e}");
                    }
                    continue;
                }
            };

            tracing::debug!(
                "request received {}",
                correlation_id.as_deref().unwrap_or("<no id>")
            );

            let outcome = handler(Bytes::from(delivery.data.clone())).await;
            let envelope = build_response(outcome);

            let body = match serde_json::to_vec(&envelope) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!("response envelope serialization failed: {e}");
                    continue; // unacked: redelivered once the channel recovers
                }
            };

            let mut properties =
                BasicProperties::default().with_content_type(CONTENT_TYPE_JSON.to_string().into());
            if let Some(ref id) = correlation_id {
                properties = properties.with_correlation_id(id.clone().into());
            }

            let published = session
                .channel()
                .basic_publish(
                    "",
                    &reply_to,
                    BasicPublishOptions::default(),
                    &body,
                    properties,
                )
                .await;

            match published {
                Ok(_) => {
                    // Ack strictly after the response is handed to the
                    // broker; dying before this point redelivers the request.
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        tracing::warn!("failed to ack request: {e}");
                    }
                }
                Err(e) => {
                    tracing::error!("response publish to {reply_to} failed: {e}");
                }
            }
        }

        tracing::debug!("dispatch loop for {work_queue} stopped");
        let _ = events.send(ServerEvent::Closed).await;
    })
}

/// Map a handler outcome onto the response envelope: success fills `result`,
/// failure fills `error`, never both.
fn build_response(outcome: HandlerOutcome) -> ResponseEnvelope<serde_json::Value> {
    // ---
    match outcome {
        Ok(result) => ResponseEnvelope::success(result),
        Err(error) => ResponseEnvelope::failure(error),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_response_success() {
        // ---
        let envelope = build_response(Ok(json!(102334155u64)));
        assert_eq!(envelope.result, Some(json!(102334155u64)));
        assert!(envelope.error.is_none());
    }

    #[test]
    fn test_build_response_failure() {
        // ---
        let envelope = build_response(Err(HandlerError::new("RangeError", "n too large")));
        assert!(envelope.result.is_none());
        assert_eq!(
            envelope.error,
            Some(HandlerError::new("RangeError", "n too large"))
        );
    }
}
