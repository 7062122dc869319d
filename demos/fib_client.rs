//! Fibonacci RPC client demo.
//!
//! Sends a batch of concurrent requests to the `fib` work queue and prints
//! the correlated results.
//!
//! Run with: cargo run --example fib_client [-- n1 n2 ...]
//!
//! Requires: a RabbitMQ broker (set BROKER_ADDR, default localhost) and a
//! running fib_server.

use std::time::Duration;

use amqp_rpc::{CallOptions, RpcClient};

#[tokio::main]
async fn main() -> amqp_rpc::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::var("BROKER_ADDR").unwrap_or_else(|_| "localhost".to_string());

    let requests: Vec<u64> = {
        let args: Vec<u64> = std::env::args()
            .skip(1)
            .filter_map(|a| a.parse().ok())
            .collect();
        if args.is_empty() {
            vec![30, 35, 40, 47, 53]
        } else {
            args
        }
    };

    let client = RpcClient::connect(&addr, "fib").await?;

    let mut handles = Vec::new();
    for n in requests {
        // ---
        let c = client.clone();
        handles.push(tokio::spawn(async move {
            let result = c
                .call_with_options::<u64, u64>(
                    &n,
                    CallOptions::default().with_timeout(Duration::from_secs(10)),
                )
                .await;
            (n, result)
        }));
    }

    for task in handles {
        let (n, result) = task.await.expect("request task panicked");
        match result {
            Ok(value) => println!("fib({n}) = {value}"),
            Err(e) => eprintln!("fib({n}) failed: {e}"),
        }
    }

    client.close().await?;
    Ok(())
}
