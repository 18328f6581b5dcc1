//! Configuration for queues and merge groups.

use std::time::Duration;

/// Configuration for [`Queue`](crate::Queue) pull behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Default timeout for [`Queue::pull`](crate::Queue::pull).
    ///
    /// `None` blocks until an element arrives or the queue closes.
    ///
    /// Default: `None`
    pub pull_timeout: Option<Duration>,

    /// Spin briefly before parking an empty pull.
    ///
    /// Helps when producers push in tight bursts; wastes cycles when they
    /// are slow.
    ///
    /// Default: `true`
    pub spin_before_park: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pull_timeout: None,
            spin_before_park: true,
        }
    }
}

impl QueueConfig {
    /// Parks immediately on an empty queue.
    pub fn low_cpu() -> Self {
        Self {
            pull_timeout: None,
            spin_before_park: false,
        }
    }

    /// Sets the default pull timeout.
    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = Some(timeout);
        self
    }

    /// Sets whether pulls spin before parking.
    pub fn with_spin_before_park(mut self, spin: bool) -> Self {
        self.spin_before_park = spin;
        self
    }
}

/// Configuration for a merge group built by [`BridgeBuilder`](crate::BridgeBuilder).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Maximum number of simultaneously linked producers.
    ///
    /// Default: unbounded (`usize::MAX`)
    pub max_concurrency: usize,

    /// Configuration for the queue the builder creates.
    ///
    /// Ignored when an existing queue is supplied.
    pub queue: QueueConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: usize::MAX,
            queue: QueueConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Admits at most `max_concurrency` producers at a time.
    ///
    /// A ceiling of zero would never admit anything, so it is raised to one.
    pub fn bounded(max_concurrency: usize) -> Self {
        Self::default().with_max_concurrency(max_concurrency)
    }

    /// Sets the admission ceiling.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the queue configuration.
    pub fn with_queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}
