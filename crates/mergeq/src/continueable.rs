//! Bound policies deciding when a consumer's queues should close early.
//!
//! Take/drop-style operators register their bounds on a [`Continueable`];
//! the pull side reports every delivered element back to it. Once a bound is
//! exhausted every queue backing the logical stream is closed, not only the
//! one the bound was registered against.

use crate::queue::QueueHandle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Policy consulted after every pulled element.
pub trait Continueable: Send + Sync {
    /// Tracks a queue backing this logical stream.
    ///
    /// Bounds registered afterwards apply to the most recently added queue.
    fn add_queue(&self, queue: Arc<dyn QueueHandle>);

    /// Lets `skip` more elements through before a limit counts.
    fn register_skip(&self, skip: u64);

    /// Closes the stream after `limit` elements. Successive limits accumulate.
    fn register_limit(&self, limit: u64);

    /// Closes the stream once `limit` has elapsed. The tightest limit wins.
    fn register_time_limit(&self, limit: Duration);

    /// Registered time limit; `None` means no deadline.
    fn time_limit(&self) -> Option<Duration>;

    /// Counts one delivered element on `queue` and closes the stream if a
    /// bound is exhausted.
    fn close_queue_if_finished(&self, queue: &dyn QueueHandle);

    /// Same decision as [`close_queue_if_finished`](Self::close_queue_if_finished)
    /// without counting an element.
    fn close_queue_if_finished_stateless(&self, queue: &dyn QueueHandle);

    /// Closes every tracked queue.
    fn close_all(&self);

    /// Closes `queue` first, then every other tracked queue.
    fn close_all_from(&self, queue: &dyn QueueHandle);

    /// Returns `true` once this policy has closed its queues.
    fn closed(&self) -> bool;
}

/// Policy for unbounded streams: never closes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysContinue;

impl Continueable for AlwaysContinue {
    fn add_queue(&self, _queue: Arc<dyn QueueHandle>) {}

    fn register_skip(&self, _skip: u64) {}

    fn register_limit(&self, _limit: u64) {}

    fn register_time_limit(&self, _limit: Duration) {}

    fn time_limit(&self) -> Option<Duration> {
        None
    }

    fn close_queue_if_finished(&self, _queue: &dyn QueueHandle) {}

    fn close_queue_if_finished_stateless(&self, _queue: &dyn QueueHandle) {}

    fn close_all(&self) {}

    fn close_all_from(&self, _queue: &dyn QueueHandle) {}

    fn closed(&self) -> bool {
        false
    }
}

const UNLIMITED: u64 = u64::MAX - 1;
const NO_TIME_LIMIT: u64 = u64::MAX;

struct Tracked {
    queue: Arc<dyn QueueHandle>,
    limit: AtomicU64,
    unlimited: AtomicBool,
    count: AtomicU64,
}

/// Bounded policy honoring limit, skip and time-limit registrations.
///
/// Queues are kept in the order they were added, upstream first. The
/// effective limit of a queue is the smallest limit among it and every queue
/// added after it, since a downstream bound caps what upstream needs to
/// deliver.
pub struct Subscription {
    queues: RwLock<Vec<Tracked>>,
    closed: AtomicBool,
    time_limit_nanos: AtomicU64,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queues", &self.queues.read().len())
            .field("closed", &self.closed())
            .field("time_limit", &self.time_limit())
            .finish()
    }
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
            time_limit_nanos: AtomicU64::new(NO_TIME_LIMIT),
        }
    }

    /// Number of elements counted against `queue` so far.
    pub fn count(&self, queue: &dyn QueueHandle) -> Option<u64> {
        let queues = self.queues.read();
        let idx = position(&queues, queue)?;
        Some(queues[idx].count.load(Ordering::Acquire))
    }

    /// Effective limit for `queue`; `None` if untracked or unlimited.
    pub fn effective_limit(&self, queue: &dyn QueueHandle) -> Option<u64> {
        let queues = self.queues.read();
        let idx = position(&queues, queue)?;
        let limit = effective_limit(&queues, idx);
        (limit < UNLIMITED).then_some(limit)
    }

    fn evaluate(&self, queues: &[Tracked], idx: usize, count_element: bool) {
        let tracked = &queues[idx];
        let count = if count_element {
            tracked.count.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            tracked.count.load(Ordering::Acquire)
        };
        let limit = effective_limit(queues, idx);
        if count >= limit {
            tracing::debug!(queue = %tracked.queue.id(), count, limit, "bound satisfied");
            self.close_from(queues, idx);
        }
    }

    fn close_from(&self, queues: &[Tracked], idx: usize) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        queues[idx].queue.close_and_clear();
        for (i, tracked) in queues.iter().enumerate() {
            if i != idx {
                tracked.queue.close_and_clear();
            }
        }
    }
}

fn position(queues: &[Tracked], queue: &dyn QueueHandle) -> Option<usize> {
    let id = queue.id();
    queues.iter().position(|tracked| tracked.queue.id() == id)
}

fn effective_limit(queues: &[Tracked], idx: usize) -> u64 {
    queues[idx..]
        .iter()
        .map(|tracked| tracked.limit.load(Ordering::Acquire))
        .min()
        .unwrap_or(UNLIMITED)
}

fn saturating_add(value: &AtomicU64, delta: u64) {
    // fetch_update only fails if the closure returns None, which it never does
    let _ = value.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_add(delta).min(UNLIMITED))
    });
}

impl Continueable for Subscription {
    fn add_queue(&self, queue: Arc<dyn QueueHandle>) {
        let mut queues = self.queues.write();
        if position(&queues, &*queue).is_some() {
            return;
        }
        queues.push(Tracked {
            queue,
            limit: AtomicU64::new(UNLIMITED),
            unlimited: AtomicBool::new(true),
            count: AtomicU64::new(0),
        });
    }

    fn register_skip(&self, skip: u64) {
        let queues = self.queues.read();
        if let Some(current) = queues.last() {
            saturating_add(&current.limit, skip);
        }
    }

    fn register_limit(&self, limit: u64) {
        let queues = self.queues.read();
        let Some(current) = queues.last() else {
            return;
        };
        if current.unlimited.swap(false, Ordering::AcqRel) {
            current.limit.store(0, Ordering::Release);
        }
        saturating_add(&current.limit, limit);

        for idx in 0..queues.len() {
            self.evaluate(&queues, idx, false);
        }
    }

    fn register_time_limit(&self, limit: Duration) {
        let nanos = u64::try_from(limit.as_nanos()).unwrap_or(NO_TIME_LIMIT - 1);
        self.time_limit_nanos.fetch_min(nanos, Ordering::AcqRel);
    }

    fn time_limit(&self) -> Option<Duration> {
        match self.time_limit_nanos.load(Ordering::Acquire) {
            NO_TIME_LIMIT => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    fn close_queue_if_finished(&self, queue: &dyn QueueHandle) {
        let queues = self.queues.read();
        if let Some(idx) = position(&queues, queue) {
            self.evaluate(&queues, idx, true);
        }
    }

    fn close_queue_if_finished_stateless(&self, queue: &dyn QueueHandle) {
        let queues = self.queues.read();
        if let Some(idx) = position(&queues, queue) {
            self.evaluate(&queues, idx, false);
        }
    }

    fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        for tracked in self.queues.read().iter() {
            tracked.queue.close_and_clear();
        }
    }

    fn close_all_from(&self, queue: &dyn QueueHandle) {
        self.closed.store(true, Ordering::Release);
        queue.close_and_clear();
        let id = queue.id();
        for tracked in self.queues.read().iter() {
            if tracked.queue.id() != id {
                tracked.queue.close_and_clear();
            }
        }
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Queue, QueueState};

    fn tracked_queue(policy: &Subscription) -> Queue<u32> {
        let q = Queue::new();
        policy.add_queue(q.handle());
        q
    }

    #[test]
    fn test_always_continue_never_closes() {
        let policy = AlwaysContinue;
        let q = Queue::<u32>::new();
        policy.add_queue(q.handle());
        policy.register_limit(0);
        policy.register_time_limit(Duration::from_millis(1));
        for _ in 0..1000 {
            policy.close_queue_if_finished(&q);
            policy.close_queue_if_finished_stateless(&q);
        }
        assert!(!policy.closed());
        assert!(q.is_open());
        assert_eq!(policy.time_limit(), None);
    }

    #[test]
    fn test_limit_closes_on_exact_count() {
        let policy = Subscription::new();
        let q = tracked_queue(&policy);
        for i in 0..5 {
            q.push(i);
        }
        policy.register_limit(2);

        policy.close_queue_if_finished(&q);
        assert!(q.is_open());
        assert!(!policy.closed());

        policy.close_queue_if_finished(&q);
        assert!(!q.is_open());
        assert!(policy.closed());
        assert_eq!(q.size(), 0, "bounded close discards buffered data");
    }

    #[test]
    fn test_stateless_does_not_count() {
        let policy = Subscription::new();
        let q = tracked_queue(&policy);
        policy.register_limit(1);
        for _ in 0..10 {
            policy.close_queue_if_finished_stateless(&q);
        }
        assert!(q.is_open());
        assert_eq!(policy.count(&q), Some(0));
    }

    #[test]
    fn test_zero_limit_closes_immediately() {
        let policy = Subscription::new();
        let q = tracked_queue(&policy);
        policy.register_limit(0);
        assert!(policy.closed());
        assert_eq!(q.state(), QueueState::Draining);
    }

    #[test]
    fn test_skip_raises_limit() {
        let policy = Subscription::new();
        let q = tracked_queue(&policy);
        policy.register_limit(1);
        policy.register_skip(2);
        assert_eq!(policy.effective_limit(&q), Some(3));

        policy.close_queue_if_finished(&q);
        policy.close_queue_if_finished(&q);
        assert!(q.is_open());
        policy.close_queue_if_finished(&q);
        assert!(!q.is_open());
    }

    #[test]
    fn test_limits_accumulate() {
        let policy = Subscription::new();
        let q = tracked_queue(&policy);
        assert_eq!(policy.effective_limit(&q), None);
        policy.register_limit(2);
        policy.register_limit(3);
        assert_eq!(policy.effective_limit(&q), Some(5));
    }

    #[test]
    fn test_downstream_limit_caps_upstream_and_closes_all() {
        let policy = Subscription::new();
        let upstream = tracked_queue(&policy);
        let downstream = tracked_queue(&policy);
        policy.register_limit(1);

        assert_eq!(policy.effective_limit(&upstream), Some(1));
        policy.close_queue_if_finished(&upstream);
        assert!(!upstream.is_open());
        assert!(!downstream.is_open());
    }

    #[test]
    fn test_untracked_queue_is_ignored() {
        let policy = Subscription::new();
        let _tracked = tracked_queue(&policy);
        policy.register_limit(1);
        let stranger = Queue::<u32>::new();
        policy.close_queue_if_finished(&stranger);
        assert!(stranger.is_open());
        assert!(!policy.closed());
    }

    #[test]
    fn test_time_limit_keeps_tightest() {
        let policy = Subscription::new();
        assert_eq!(policy.time_limit(), None);
        policy.register_time_limit(Duration::from_secs(5));
        policy.register_time_limit(Duration::from_secs(1));
        policy.register_time_limit(Duration::from_secs(3));
        assert_eq!(policy.time_limit(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_close_all_from_closes_everything() {
        let policy = Subscription::new();
        let a = tracked_queue(&policy);
        let b = tracked_queue(&policy);
        a.push(1);
        policy.close_all_from(&b);
        assert!(policy.closed());
        assert!(!a.is_open());
        assert!(!b.is_open());
        assert_eq!(a.size(), 0);
    }
}
