//! Push-to-pull merge bridge
//!
//! `mergeq` merges any number of independent push-based producers into one
//! ordered, pull-based consumer sequence.
//!
//! # Features
//!
//! - **Lock-free buffer**: producers push into a segmented queue and never block
//! - **Admission control**: at most `max_concurrency` producers linked at once
//! - **Demand-driven**: every pull grants one more element to each live producer
//! - **Drain before close**: buffered elements always reach the consumer
//!   before the closed-signal
//! - **Bound policies**: take/drop/time limits close every queue of a stream
//!
//! # Example
//!
//! ```ignore
//! use mergeq::{Bridge, IterSource};
//!
//! let bridge = Bridge::<u32>::builder().max_concurrency(2).build();
//! bridge.attach(IterSource::new(vec![1, 2, 3]));
//! bridge.attach(IterSource::new(vec![4, 5, 6]));
//! bridge.close_group();
//!
//! for item in bridge.sequence()? {
//!     println!("{}", item?);
//! }
//! ```

mod bridge;
mod config;
mod continueable;
mod counter;
mod error;
mod invariants;
mod queue;
mod seq;
mod source;

pub use bridge::{Bridge, BridgeBuilder, BridgeState, ErrorHandler, View, ViewKind};
pub use config::{BridgeConfig, QueueConfig};
pub use continueable::{AlwaysContinue, Continueable, Subscription};
pub use counter::{Counter, LinkId};
pub use error::{ClosedSignal, MergeError, ProtocolError, PullError, UpstreamError};
pub use queue::{Continuation, Queue, QueueHandle, QueueId, QueueState};
pub use seq::QueueSeq;
pub use source::{DemandLink, FallibleSource, IterSource, Link, Source, Subscriber};
