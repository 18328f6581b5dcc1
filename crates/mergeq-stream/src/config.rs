//! Configuration for async views.

use std::time::Duration;

/// Configuration for [`QueueStream`](crate::QueueStream).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// Poll interval for the hybrid wake-up strategy.
    ///
    /// The queue wakes the stream on every push and on close; this interval
    /// is a safety net that re-polls the queue even without a wake-up.
    ///
    /// Default: 10ms
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl StreamConfig {
    /// Creates a low-latency configuration with a shorter poll interval.
    pub fn low_latency() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Configuration for [`ParallelView`](crate::ParallelView).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Maximum element tasks running at once.
    ///
    /// Default: 16
    pub max_in_flight: usize,

    /// Stream configuration for the underlying queue view.
    pub stream: StreamConfig,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            stream: StreamConfig::default(),
        }
    }
}

impl ParallelConfig {
    /// Runs one element task at a time, in arrival order.
    pub fn sequential() -> Self {
        Self::default().with_max_in_flight(1)
    }

    /// Sets the in-flight ceiling. Zero is raised to one.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Sets the stream configuration.
    pub fn with_stream_config(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}
