//! Fibonacci RPC server demo.
//!
//! Serves `fib(n)` requests from the `fib` work queue.
//!
//! Run with: cargo run --example fib_server
//!
//! Requires: a RabbitMQ broker (set BROKER_ADDR, default localhost).

use amqp_rpc::{HandlerError, RpcServer, ServerEvent};

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

#[tokio::main]
async fn main() -> amqp_rpc::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::var("BROKER_ADDR").unwrap_or_else(|_| "localhost".to_string());

    let server = RpcServer::start(&addr, "fib", |n: u64| async move {
        if n > 93 {
            return Err(HandlerError::new(
                "RangeError",
                format!("fib({n}) overflows u64"),
            ));
        }
        Ok(fib(n))
    })
    .await?;

    println!("fib server awaiting requests (Ctrl+C to stop)");

    let mut events = server.events().expect("event stream already taken");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("shutting down...");
        }
        event = events.recv() => {
            if let Some(ServerEvent::ConnectionLost(reason)) = event {
                eprintln!("broker connection lost: {reason}");
            }
        }
    }

    server.close().await?;
    Ok(())
}
