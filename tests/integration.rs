//! End-to-end tests against a live broker.
//!
//! These run against a real RabbitMQ instance and are ignored by default:
//!
//! ```text
//! BROKER_ADDR=localhost cargo test -- --ignored
//! ```

use std::time::{Duration, Instant};

use amqp_rpc::{
    //
    delete_queue,
    CallOptions,
    CorrelationId,
    DeleteOptions,
    HandlerError,
    RpcClient,
    RpcError,
    RpcServer,
    ServerEvent,
    SessionRegistry,
};

fn broker_addr() -> String {
    // ---
    std::env::var("BROKER_ADDR").unwrap_or_else(|_| "localhost".to_string())
}

/// Unique work queue per test so parallel runs never share state.
fn test_queue(prefix: &str) -> String {
    // ---
    format!("{prefix}-{}", CorrelationId::generate())
}

fn fib(n: u64) -> u64 {
    // ---
    // u128 accumulators: the loop walks one value past fib(n), which for
    // n = 93 would already overflow u64.
    let (mut a, mut b) = (0u128, 1u128);
    for _ in 0..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a as u64
}

async fn fib_server(queue: &str) -> amqp_rpc::Result<RpcServer> {
    // ---
    RpcServer::start(&broker_addr(), queue, |n: u64| async move {
        if n > 93 {
            return Err(HandlerError::new("RangeError", format!("fib({n}) overflows u64")));
        }
        Ok(fib(n))
    })
    .await
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_one_client_one_server() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("fib");
    let server = fib_server(&queue).await?;
    let client = RpcClient::connect(&broker_addr(), &queue).await?;

    let result: u64 = client.call(&40u64).await?;
    assert_eq!(result, 102334155);

    client.close().await?;
    server.close().await?;
    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_concurrent_requests_correlate() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("fib");
    let server = fib_server(&queue).await?;
    let client = RpcClient::connect(&broker_addr(), &queue).await?;

    let requests: [u64; 5] = [30, 35, 40, 47, 53];
    let expected: [u64; 5] = [832040, 9227465, 102334155, 2971215073, 53316291173];

    let mut handles = Vec::new();
    for n in requests {
        // ---
        let c = client.clone();
        handles.push(tokio::spawn(async move { c.call::<u64, u64>(&n).await }));
    }

    // Each response must match its own request regardless of the order the
    // server finished them in.
    for (task, want) in handles.into_iter().zip(expected) {
        let got = task.await.expect("request task panicked")?;
        assert_eq!(got, want);
    }

    client.close().await?;
    server.close().await?;
    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_handler_failure_reaches_caller() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("fib");
    let server = fib_server(&queue).await?;
    let client = RpcClient::connect(&broker_addr(), &queue).await?;

    match client.call::<u64, u64>(&100u64).await {
        Err(RpcError::Handler(err)) => {
            assert_eq!(err.name, "RangeError");
            assert!(err.message.contains("100"));
        }
        other => panic!("expected handler error, got {other:?}"),
    }

    // The dispatcher survives a failing handler.
    let result: u64 = client.call(&10u64).await?;
    assert_eq!(result, 55);

    client.close().await?;
    server.close().await?;
    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_timeout_fires_once_and_not_early() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("fib-slow");
    let server = RpcServer::start(&broker_addr(), &queue, |n: u64| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok::<u64, HandlerError>(n)
    })
    .await?;
    let client = RpcClient::connect(&broker_addr(), &queue).await?;

    let window = Duration::from_millis(200);
    let started = Instant::now();
    let outcome = client
        .call_with_options::<u64, u64>(&1u64, CallOptions::default().with_timeout(window))
        .await;

    assert!(matches!(outcome, Err(RpcError::Timeout)));
    assert!(started.elapsed() >= window);

    client.close().await?;
    server.close().await?;
    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_delete_queue_is_idempotent() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("cleanup");

    // Declare through a short-lived client, then tear down.
    let client = RpcClient::connect(&broker_addr(), &queue).await?;
    client.close().await?;

    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;

    // Deleting again either no-ops or fails cleanly per broker semantics.
    let second = delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await;
    assert!(matches!(second, Ok(0) | Err(RpcError::Protocol(_))));

    // Client-side state is untouched: a fresh round trip still works.
    let server = fib_server(&queue).await?;
    let client = RpcClient::connect(&broker_addr(), &queue).await?;
    let result: u64 = client.call(&20u64).await?;
    assert_eq!(result, 6765);

    client.close().await?;
    server.close().await?;
    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_invalid_credentials_surface_connection_error() {
    // ---
    let host = broker_addr();
    let addr = format!("amqp://nosuchuser:wrongpass@{host}:5672/%2f");

    match RpcClient::connect(&addr, "fib").await {
        Err(RpcError::Connection(_)) => {}
        other => panic!("expected connection error, got {:?}", other.map(|_| "client")),
    }
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_registry_shutdown_fails_in_flight_requests() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("fib");
    let registry = SessionRegistry::new();

    let server = fib_server(&queue).await?;
    let session = registry.open(&broker_addr()).await?;
    let client = RpcClient::with_session(session, &queue).await?;

    let result: u64 = client.call(&30u64).await?;
    assert_eq!(result, 832040);

    registry.close_all().await?;

    // The session is gone; a further call reports a connection error rather
    // than hanging.
    let outcome = client
        .call_with_options::<u64, u64>(
            &30u64,
            CallOptions::default().with_timeout(Duration::from_secs(2)),
        )
        .await;
    assert!(matches!(
        outcome,
        Err(RpcError::Connection(_)) | Err(RpcError::Timeout)
    ));

    server.close().await?;
    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a running RabbitMQ broker (set BROKER_ADDR, default localhost)"]
async fn test_server_emits_closed_event() -> amqp_rpc::Result<()> {
    // ---
    let queue = test_queue("fib");
    let server = fib_server(&queue).await?;

    let mut events = server.events().expect("first take of the event stream");
    server.close().await?;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no lifecycle event after close");
    assert!(matches!(
        event,
        Some(ServerEvent::Closed) | Some(ServerEvent::ConnectionLost(_))
    ));

    // Single-consumer stream: a second take yields nothing.
    assert!(server.events().is_none());

    delete_queue(&broker_addr(), &queue, DeleteOptions::default()).await?;
    Ok(())
}
