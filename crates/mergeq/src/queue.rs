//! Concurrency-safe merge buffer with drain-before-close semantics.
//!
//! ```text
//!   producers ──push──▶ [SegQueue<Slot<T>>] ──pull──▶ consumer
//!                       ├── push never blocks (unbounded, lock-free)
//!                       ├── pull parks while open and empty
//!                       ├── close(): Open → Draining, buffered data stays
//!                       └── drained and not open: continuations fire once → Closed
//! ```
//!
//! Parking uses a `parking_lot` mutex/condvar pair that producers only touch
//! when a consumer is actually asleep (`sleepers > 0`). The `sleepers` count
//! and the buffer are read across `SeqCst` fences on both sides, so either the
//! producer sees the sleeper or the sleeper sees the element.

use crate::config::QueueConfig;
use crate::continueable::Continueable;
use crate::error::{ClosedSignal, PullError, UpstreamError};
use crate::invariants::debug_assert_forward_transition;
use crate::seq::QueueSeq;
use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

const OPEN: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

/// Deferred action run once a queue is closed and drained.
///
/// `Continue(())` hands control to the next registered continuation;
/// `Break(signal)` ends the chain with that closed-signal.
pub type Continuation<T> = Box<dyn FnOnce(&Queue<T>) -> ControlFlow<ClosedSignal<T>> + Send>;

type Hook = Box<dyn Fn() + Send + Sync>;

pub(crate) enum Slot<T> {
    Item(T),
    Failure(UpstreamError),
}

/// Lifecycle of a [`Queue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting data; pulls park when empty.
    Open,
    /// Closed; buffered data is still being delivered.
    Draining,
    /// Closed and drained; the continuation chain has fired.
    Closed,
}

/// Identity of a queue, stable for as long as any handle to it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(usize);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q#{:x}", self.0)
    }
}

/// Element-type-erased view of a queue, used by bound policies that track
/// several queues of different element types.
pub trait QueueHandle: Send + Sync {
    /// Identity of the underlying queue.
    fn id(&self) -> QueueId;

    /// Returns `true` while the queue accepts data.
    fn is_open(&self) -> bool;

    /// Closes the queue, keeping buffered data. Returns `true` on the first call.
    fn close(&self) -> bool;

    /// Closes the queue and discards buffered data. Returns the discarded count.
    fn close_and_clear(&self) -> usize;
}

struct Shared<T> {
    buffer: SegQueue<Slot<T>>,
    len: CachePadded<AtomicUsize>,
    state: AtomicU8,
    sleepers: AtomicUsize,
    park: Mutex<()>,
    available: Condvar,
    continuations: Mutex<Vec<Continuation<T>>>,
    fired: AtomicBool,
    waker: Mutex<Option<Waker>>,
    waker_armed: AtomicBool,
    demand: OnceLock<Hook>,
    on_close: OnceLock<Hook>,
    config: QueueConfig,
}

/// Multi-producer, single-consumer merge queue.
///
/// `Queue` is a cheap handle; clones refer to the same buffer.
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("size", &self.size())
            .finish()
    }
}

impl<T> Queue<T> {
    /// Creates an open queue with the default configuration.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Creates an open queue with the given configuration.
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: SegQueue::new(),
                len: CachePadded::new(AtomicUsize::new(0)),
                state: AtomicU8::new(OPEN),
                sleepers: AtomicUsize::new(0),
                park: Mutex::new(()),
                available: Condvar::new(),
                continuations: Mutex::new(Vec::new()),
                fired: AtomicBool::new(false),
                waker: Mutex::new(None),
                waker_armed: AtomicBool::new(false),
                demand: OnceLock::new(),
                on_close: OnceLock::new(),
                config,
            }),
        }
    }

    /// Identity of this queue.
    #[inline]
    pub fn id(&self) -> QueueId {
        QueueId(Arc::as_ptr(&self.shared).cast::<()>() as usize)
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        match self.shared.state.load(Ordering::Acquire) {
            OPEN => QueueState::Open,
            DRAINING => QueueState::Draining,
            _ => QueueState::Closed,
        }
    }

    /// Returns `true` while the queue accepts data.
    #[inline]
    pub fn is_open(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == OPEN
    }

    /// Best-effort count of buffered entries.
    #[inline]
    pub fn size(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    /// Buffers an element. Never blocks.
    ///
    /// Elements pushed after [`close`](Self::close) are still buffered; they
    /// are delivered while draining or recovered as residual data by the
    /// terminal continuation.
    pub fn push(&self, item: T) {
        self.enqueue(Slot::Item(item));
    }

    /// Buffers an upstream failure so the consumer's pull fails with it at
    /// this position in the stream.
    pub fn push_failure(&self, error: UpstreamError) {
        self.enqueue(Slot::Failure(error));
    }

    fn enqueue(&self, slot: Slot<T>) {
        // Count first so a concurrent pop can never drive `len` below zero.
        self.shared.len.fetch_add(1, Ordering::AcqRel);
        self.shared.buffer.push(slot);
        self.wake(false);
    }

    fn pop(&self) -> Option<Slot<T>> {
        let slot = self.shared.buffer.pop()?;
        self.shared.len.fetch_sub(1, Ordering::AcqRel);
        Some(slot)
    }

    fn wake(&self, all: bool) {
        fence(Ordering::SeqCst);
        if self.shared.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.shared.park.lock();
            if all {
                self.shared.available.notify_all();
            } else {
                self.shared.available.notify_one();
            }
        }
        if self.shared.waker_armed.swap(false, Ordering::SeqCst) {
            if let Some(waker) = self.shared.waker.lock().take() {
                waker.wake();
            }
        }
    }

    /// Installs the action run at the start of every pull.
    ///
    /// Returns `false` if a hook is already installed.
    pub fn set_demand_hook<F>(&self, hook: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.demand.set(Box::new(hook)).is_ok()
    }

    /// Runs the demand hook, if any.
    ///
    /// Blocking pulls call this themselves; async consumers using
    /// [`poll_pull`](Self::poll_pull) call it once per element they start
    /// waiting for.
    pub fn signal_demand(&self) {
        if let Some(hook) = self.shared.demand.get() {
            hook();
        }
    }

    /// Installs the action run by the call that closes the queue.
    ///
    /// Returns `false` if a hook is already installed.
    pub fn set_close_hook<F>(&self, hook: F) -> bool
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.on_close.set(Box::new(hook)).is_ok()
    }

    /// Registers an action to run once the queue is closed and drained.
    ///
    /// Continuations chain in registration order.
    pub fn add_continuation<F>(&self, continuation: F)
    where
        F: FnOnce(&Queue<T>) -> ControlFlow<ClosedSignal<T>> + Send + 'static,
    {
        if self.shared.fired.load(Ordering::Acquire) {
            tracing::trace!(queue = %self.id(), "continuation added after the chain fired; it will not run");
        }
        self.shared.continuations.lock().push(Box::new(continuation));
    }

    /// Closes the queue. Buffered data remains deliverable.
    ///
    /// Idempotent; returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let first = self
            .shared
            .state
            .compare_exchange(OPEN, DRAINING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            tracing::debug!(queue = %self.id(), buffered = self.size(), "queue closing");
            self.wake(true);
            if let Some(hook) = self.shared.on_close.get() {
                hook();
            }
        }
        first
    }

    /// Closes the queue and discards everything buffered.
    pub fn close_and_clear(&self) -> usize {
        self.close();
        let mut discarded = 0;
        while self.pop().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(queue = %self.id(), discarded, "queue cleared");
        }
        discarded
    }

    /// Removes every buffered element without blocking.
    ///
    /// Failures found along the way are logged and dropped. Continuations use
    /// this to recover data that raced with the close.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::with_capacity(self.size());
        while let Some(slot) = self.pop() {
            match slot {
                Slot::Item(item) => items.push(item),
                Slot::Failure(error) => {
                    tracing::warn!(queue = %self.id(), %error, "dropping upstream failure found while draining");
                }
            }
        }
        items
    }

    /// Next ready entry, or the closed-signal, without blocking.
    fn take_ready(&self) -> Option<Result<T, PullError<T>>> {
        // State is read before popping: anything pushed before the close is
        // visible once the non-open state is.
        let open = self.shared.state.load(Ordering::Acquire) == OPEN;
        match self.pop() {
            Some(Slot::Item(item)) => Some(Ok(item)),
            Some(Slot::Failure(error)) => Some(Err(PullError::Upstream(error))),
            None if open => None,
            None => Some(Err(PullError::Closed(self.finish()))),
        }
    }

    fn finish(&self) -> ClosedSignal<T> {
        let previous = self.shared.state.swap(CLOSED, Ordering::AcqRel);
        debug_assert_forward_transition!(previous, CLOSED);

        if self.shared.fired.swap(true, Ordering::AcqRel) {
            return ClosedSignal::new();
        }
        let chain = std::mem::take(&mut *self.shared.continuations.lock());
        tracing::debug!(queue = %self.id(), continuations = chain.len(), "queue drained");
        for continuation in chain {
            if let ControlFlow::Break(signal) = continuation(self) {
                return signal;
            }
        }
        ClosedSignal::new()
    }

    /// Pulls the next element, blocking while the queue is open and empty.
    ///
    /// Uses the configured pull timeout, if any. Once the queue is closed and
    /// drained this returns [`PullError::Closed`] instead of blocking.
    pub fn pull(&self) -> Result<T, PullError<T>> {
        self.pull_within(self.shared.config.pull_timeout)
    }

    /// Pulls the next element, waiting at most `timeout`.
    pub fn pull_timeout(&self, timeout: Duration) -> Result<T, PullError<T>> {
        self.pull_within(Some(timeout))
    }

    /// Pulls without blocking. `Ok(None)` means open and empty.
    pub fn try_pull(&self) -> Result<Option<T>, PullError<T>> {
        self.signal_demand();
        match self.take_ready() {
            Some(Ok(item)) => Ok(Some(item)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }

    fn pull_within(&self, timeout: Option<Duration>) -> Result<T, PullError<T>> {
        self.signal_demand();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        if self.shared.config.spin_before_park {
            let backoff = Backoff::new();
            while !backoff.is_completed() {
                if let Some(result) = self.take_ready() {
                    return result;
                }
                backoff.snooze();
            }
        }

        loop {
            if let Some(result) = self.take_ready() {
                return result;
            }
            if !self.park(deadline) {
                return self
                    .take_ready()
                    .unwrap_or(Err(PullError::Timeout(timeout.unwrap_or_default())));
            }
        }
    }

    /// Parks until woken. Returns `false` once `deadline` has passed.
    fn park(&self, deadline: Option<Instant>) -> bool {
        let shared = &*self.shared;
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return false;
        }

        let mut guard = shared.park.lock();
        shared.sleepers.fetch_add(1, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        let mut in_time = true;
        if shared.buffer.is_empty() && shared.state.load(Ordering::SeqCst) == OPEN {
            in_time = match deadline {
                Some(deadline) => !shared.available.wait_until(&mut guard, deadline).timed_out(),
                None => {
                    shared.available.wait(&mut guard);
                    true
                }
            };
        }

        shared.sleepers.fetch_sub(1, Ordering::SeqCst);
        in_time
    }

    /// Waker-based pull for async consumers.
    ///
    /// Does not run the demand hook; see [`signal_demand`](Self::signal_demand).
    pub fn poll_pull(&self, cx: &mut Context<'_>) -> Poll<Result<T, PullError<T>>> {
        if let Some(result) = self.take_ready() {
            return Poll::Ready(result);
        }

        *self.shared.waker.lock() = Some(cx.waker().clone());
        self.shared.waker_armed.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        // Re-check: a push between the first check and arming the waker
        // would otherwise be missed.
        match self.take_ready() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<T: Send + 'static> Queue<T> {
    /// Type-erased handle for bound policies.
    pub fn handle(&self) -> Arc<dyn QueueHandle> {
        Arc::new(self.clone())
    }

    /// Lazy, non-restartable sequence over this queue.
    ///
    /// The queue is registered with `policy`, which is consulted after every
    /// element and may close the queue early.
    pub fn sequence(&self, policy: Arc<dyn Continueable>) -> QueueSeq<T> {
        policy.add_queue(self.handle());
        QueueSeq::new(self.clone(), policy)
    }
}

impl<T: Send + 'static> QueueHandle for Queue<T> {
    fn id(&self) -> QueueId {
        Queue::id(self)
    }

    fn is_open(&self) -> bool {
        Queue::is_open(self)
    }

    fn close(&self) -> bool {
        Queue::close(self)
    }

    fn close_and_clear(&self) -> usize {
        Queue::close_and_clear(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_push_pull_fifo() {
        let q = Queue::new();
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.size(), 10);
        for i in 0..10 {
            assert_eq!(q.pull().unwrap(), i);
        }
        assert_eq!(q.size(), 0);
        assert_eq!(q.try_pull().unwrap(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let q = Queue::<u32>::new();
        assert!(q.close());
        assert!(!q.close());
        assert_eq!(q.state(), QueueState::Draining);
    }

    #[test]
    fn test_drain_before_close() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        q.close();

        assert_eq!(q.pull().unwrap(), 1);
        assert_eq!(q.pull().unwrap(), 2);
        assert!(q.pull().unwrap_err().is_closed());
        assert_eq!(q.state(), QueueState::Closed);
    }

    #[test]
    fn test_continuation_fires_once() {
        let q = Queue::<u32>::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        q.add_continuation(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Break(ClosedSignal::with_residual(vec![7]))
        });
        q.close();

        match q.pull() {
            Err(PullError::Closed(signal)) => assert_eq!(signal.residual(), &[7]),
            other => panic!("expected closed-signal, got {:?}", other),
        }
        match q.pull() {
            Err(PullError::Closed(signal)) => assert!(!signal.has_residual()),
            other => panic!("expected closed-signal, got {:?}", other),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_continuation_chain_order() {
        let q = Queue::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        q.add_continuation(move |_| {
            o.lock().push("first");
            ControlFlow::Continue(())
        });
        let o = Arc::clone(&order);
        q.add_continuation(move |_| {
            o.lock().push("second");
            ControlFlow::Break(ClosedSignal::new())
        });
        let o = Arc::clone(&order);
        q.add_continuation(move |_| {
            o.lock().push("third");
            ControlFlow::Continue(())
        });

        q.close();
        assert!(q.pull().unwrap_err().is_closed());
        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_pull_timeout() {
        let q = Queue::<u32>::with_config(QueueConfig::low_cpu());
        let err = q.pull_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, PullError::Timeout(_)));
        assert!(err.is_recoverable());
        assert!(q.is_open());
    }

    #[test]
    fn test_close_and_clear_discards() {
        let q = Queue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.close_and_clear(), 3);
        assert!(q.pull().unwrap_err().is_closed());
    }

    #[test]
    fn test_failure_surfaces_in_order() {
        let q = Queue::new();
        q.push(1);
        q.push_failure(UpstreamError::msg("boom"));
        q.push(2);

        assert_eq!(q.pull().unwrap(), 1);
        assert!(matches!(q.pull(), Err(PullError::Upstream(_))));
        assert_eq!(q.pull().unwrap(), 2);
    }

    #[test]
    fn test_blocked_pull_woken_by_push() {
        let q = Queue::with_config(QueueConfig::low_cpu());
        let producer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(42u64);
        });
        assert_eq!(q.pull().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_blocked_pull_woken_by_close() {
        let q = Queue::<u64>::with_config(QueueConfig::low_cpu());
        let closer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });
        assert!(q.pull().unwrap_err().is_closed());
        handle.join().unwrap();
    }

    #[test]
    fn test_demand_hook_runs_per_pull() {
        let q = Queue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        assert!(q.set_demand_hook(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!q.set_demand_hook(|| {}));

        q.push(1);
        q.push(2);
        q.pull().unwrap();
        q.pull().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_hook_runs_once() {
        let q = Queue::<u8>::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        assert!(q.set_close_hook(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        q.push(1);
        assert_eq!(q.close_and_clear(), 1);
        q.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_identity() {
        let q = Queue::<u8>::new();
        let h1 = q.handle();
        let h2 = q.clone().handle();
        assert_eq!(h1.id(), h2.id());
        assert_ne!(h1.id(), Queue::<u8>::new().id());

        assert!(h1.close());
        assert!(!q.is_open());
    }
}
