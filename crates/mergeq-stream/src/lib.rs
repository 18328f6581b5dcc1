//! Async views over mergeq merge groups
//!
//! This crate provides a [`futures_core::Stream`] view over a mergeq [`Queue`] and
//! a task-parallel view that runs an async continuation per element.
//!
//! # Features
//!
//! - **Waker-driven**: the queue wakes the stream on push and close, with a
//!   poll interval as a safety net
//! - **Same contract as the blocking sequence**: demand per element, bound
//!   policy after every element, residual replay at close
//! - **Bounded fan-out**: `ParallelView` caps in-flight tasks with a semaphore
//!
//! # Example
//!
//! ```ignore
//! use mergeq::{Bridge, IterSource};
//! use mergeq_stream::{BridgeStreamExt, StreamExt};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bridge = Bridge::<u64>::new();
//!     let mut stream = Box::pin(bridge.stream().unwrap());
//!     bridge.attach(IterSource::new(0..10));
//!     bridge.close_group();
//!
//!     while let Some(item) = stream.next().await {
//!         println!("Received: {}", item.unwrap());
//!     }
//! }
//! ```
//!
//! [`Queue`]: mergeq::Queue

mod config;
mod error;
mod parallel;
mod stream;

pub use config::{ParallelConfig, StreamConfig};
pub use error::ParallelError;
pub use parallel::{BridgeParallelExt, ParallelReport, ParallelView};
pub use stream::{BridgeStreamExt, QueueStream};

// Re-export useful stream combinators
pub use tokio_stream::StreamExt;
