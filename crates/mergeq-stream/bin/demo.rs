//! Demonstration of mergeq and mergeq-stream.
//!
//! Run with: `cargo run -p mergeq-stream --features demo --bin demo`
//! Set `RUST_LOG=mergeq=debug` to watch the group lifecycle.

use mergeq::{Bridge, Continueable, FallibleSource, IterSource, Subscription, UpstreamError};
use mergeq_stream::{BridgeParallelExt, BridgeStreamExt, ParallelConfig, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== mergeq Demo ===\n");

    demo_blocking_merge()?;
    demo_async_merge().await?;
    demo_bounded_take().await?;
    demo_upstream_failure().await?;
    demo_parallel_view().await?;

    println!("\n=== All demos completed successfully! ===");
    Ok(())
}

/// Demo 1: three producers, one blocking consumer
fn demo_blocking_merge() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Demo 1: Blocking Merge ---");

    let bridge = Bridge::<String>::builder().max_concurrency(2).build();
    for name in ["P1", "P2", "P3"] {
        bridge.attach(IterSource::new((0..3).map(move |i| format!("{}-{}", name, i))));
    }
    bridge.close_group();

    let received: Vec<String> = bridge.sequence()?.collect::<Result<_, _>>()?;
    println!("  Received {} items: {:?}", received.len(), received);
    println!(
        "  Peak links: {} (ceiling 2)",
        bridge.counter().peak_links()
    );
    println!("  ✓ Blocking merge complete\n");
    Ok(())
}

/// Demo 2: the same merge as an async stream
async fn demo_async_merge() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Demo 2: Async Stream ---");

    let bridge = Bridge::<u64>::new();
    let mut stream = Box::pin(bridge.stream()?);
    bridge.attach(IterSource::new(0..5u64));
    bridge.attach(IterSource::new(100..105u64));
    bridge.close_group();

    while let Some(item) = stream.next().await {
        println!("  Received: {}", item?);
    }
    println!("  ✓ Async stream complete\n");
    Ok(())
}

/// Demo 3: a limit closes an endless producer's stream
async fn demo_bounded_take() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Demo 3: Bounded Take ---");

    let policy = Arc::new(Subscription::new());
    let bridge = Bridge::<u64>::builder().policy(policy.clone()).build();
    let stream = bridge.stream()?;
    policy.register_limit(5);
    bridge.attach(IterSource::new(0u64..));

    let received: Vec<u64> = stream.map(|item| item.unwrap_or_default()).collect().await;
    println!("  Took {:?} from an endless producer", received);
    println!("  Policy closed: {}", policy.closed());
    println!("  ✓ Bounded take complete\n");
    Ok(())
}

/// Demo 4: one producer fails, the group still ends cleanly
async fn demo_upstream_failure() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Demo 4: Upstream Failure ---");

    let bridge = Bridge::<u64>::builder()
        .error_handler(|error| println!("  Handler saw: {}", error))
        .build();
    let stream = bridge.stream()?;
    bridge.attach(FallibleSource::new(vec![
        Ok(1),
        Ok(2),
        Err(UpstreamError::msg("sensor offline")),
    ]));
    bridge.attach(IterSource::new(vec![10u64, 20]));
    bridge.close_group();

    let results: Vec<_> = stream.collect().await;
    for result in &results {
        match result {
            Ok(item) => println!("  Item: {}", item),
            Err(error) => println!("  Failure: {}", error),
        }
    }
    println!("  ✓ Upstream failure complete\n");
    Ok(())
}

/// Demo 5: per-element async work with bounded fan-out
async fn demo_parallel_view() -> Result<(), Box<dyn std::error::Error>> {
    println!("--- Demo 5: Parallel View ---");

    let bridge = Bridge::<u64>::new();
    let view = bridge.parallel(ParallelConfig::default().with_max_in_flight(3))?;
    for p in 0..4u64 {
        bridge.attach(IterSource::new(p * 10..p * 10 + 5));
    }
    bridge.close_group();

    let report = view
        .for_each(|item| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if item == 13 {
                Err(format!("item {} rejected", item))
            } else {
                Ok(())
            }
        })
        .await;

    println!(
        "  Processed: {}, failed: {}, panicked: {}",
        report.processed, report.failed, report.panicked
    );
    println!("  ✓ Parallel view complete");
    Ok(())
}
