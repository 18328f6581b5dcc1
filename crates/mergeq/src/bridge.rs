//! Push-source adapter feeding a merge group's queue.
//!
//! ```text
//!   source A ──on_*──▶ Bridge ─┐
//!   source B ──on_*──▶ Bridge ─┼──push──▶ Queue ──pull──▶ consumer
//!   source C ──on_*──▶ Bridge ─┘            │
//!                        │                  └─ every pull: request(1) on each live link
//!                        └── Counter (active, links, completable, added)
//! ```
//!
//! One `Bridge` serves one upstream link. Bridges of the same group share
//! the queue, the counter, the bound policy and the error handler; create
//! them with [`Bridge::sibling`] or [`Bridge::attach`].
//!
//! The queue closes once the owner called [`Bridge::close_group`] and every
//! active producer has terminated, whichever happens last.

use crate::config::{BridgeConfig, QueueConfig};
use crate::continueable::{AlwaysContinue, Continueable};
use crate::counter::{Counter, LinkId};
use crate::error::{ClosedSignal, MergeError, ProtocolError, UpstreamError};
use crate::invariants::debug_assert_forward_transition;
use crate::queue::Queue;
use crate::seq::QueueSeq;
use crate::source::{Link, Source, Subscriber};
use parking_lot::Mutex;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

const UNLINKED: u8 = 0;
const ACTIVE: u8 = 1;
const TERMINAL: u8 = 2;

const NO_VIEW: u8 = 0;

/// Callback receiving every upstream failure of a group.
pub type ErrorHandler = Arc<dyn Fn(&UpstreamError) + Send + Sync>;

type QueueFactory<T> = Box<dyn FnOnce(QueueConfig) -> Queue<T>>;

/// Link lifecycle of one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Waiting for `on_link`.
    Unlinked,
    /// Linked and accepting elements.
    Active,
    /// Completed, failed, or rejected.
    Terminal,
}

/// The kind of consumer view built over a group's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ViewKind {
    /// Blocking pull sequence.
    Sequence = 1,
    /// Async stream or task-parallel view.
    Stream = 2,
}

impl ViewKind {
    fn from_raw(raw: u8) -> Self {
        if raw == Self::Sequence as u8 {
            Self::Sequence
        } else {
            Self::Stream
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequence => f.write_str("sequence"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

/// The single consumer-side view of a merge group.
///
/// Holds the queue and the policy it was registered with. Blocking
/// consumers turn it into a [`QueueSeq`]; async adapters take the parts.
pub struct View<T> {
    kind: ViewKind,
    queue: Queue<T>,
    policy: Arc<dyn Continueable>,
}

impl<T> View<T> {
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }

    pub fn policy(&self) -> &Arc<dyn Continueable> {
        &self.policy
    }

    /// Splits the view into its queue and bound policy.
    pub fn into_parts(self) -> (Queue<T>, Arc<dyn Continueable>) {
        (self.queue, self.policy)
    }
}

impl<T: Send + 'static> View<T> {
    /// Blocking sequence over the view's queue.
    pub fn into_sequence(self) -> QueueSeq<T> {
        QueueSeq::new(self.queue, self.policy)
    }
}

impl<T> fmt::Debug for View<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("kind", &self.kind)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

struct Group<T> {
    queue: Queue<T>,
    counter: Arc<Counter>,
    policy: Arc<dyn Continueable>,
    error_handler: Option<ErrorHandler>,
    config: BridgeConfig,
    view: AtomicU8,
}

impl<T: Send + 'static> Group<T> {
    fn view_claimed(&self) -> bool {
        self.view.load(Ordering::Acquire) != NO_VIEW
    }

    /// Closes the queue behind a terminal continuation. Runs at most once.
    fn close_terminal(&self) {
        if !self.counter.latch_closed() {
            return;
        }
        tracing::debug!(
            queue = %self.queue.id(),
            added = self.counter.added(),
            buffered = self.queue.size(),
            "merge group closing"
        );
        self.queue.add_continuation(|queue: &Queue<T>| {
            // Anything found here raced with the close; hand it back.
            ControlFlow::Break(ClosedSignal::with_residual(queue.drain()))
        });
        self.queue.close();
    }
}

struct LinkSlot {
    link: Arc<dyn Link>,
    id: Option<LinkId>,
}

/// Adapter from one push-source link to a group's shared queue.
pub struct Bridge<T> {
    group: Arc<Group<T>>,
    state: AtomicU8,
    slot: Mutex<Option<LinkSlot>>,
    reserved: AtomicBool,
}

impl<T: Send + 'static> Bridge<T> {
    /// Bridge over a fresh queue with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> BridgeBuilder<T> {
        BridgeBuilder::new()
    }

    /// A new bridge in the same merge group.
    pub fn sibling(&self) -> Self {
        Self::in_group(Arc::clone(&self.group))
    }

    fn in_group(group: Arc<Group<T>>) -> Self {
        Self {
            group,
            state: AtomicU8::new(UNLINKED),
            slot: Mutex::new(None),
            reserved: AtomicBool::new(false),
        }
    }

    /// Subscribes a new group member to `source`.
    ///
    /// The member is counted as active before the source is started, so a
    /// concurrent completion can never close the group ahead of it.
    pub fn attach<S>(&self, source: S) -> Arc<Self>
    where
        S: Source<T>,
    {
        let member = Arc::new(self.sibling());
        member.reserved.store(true, Ordering::SeqCst);
        let active = self.group.counter.reserve();
        tracing::trace!(active, "producer attached");
        source.subscribe(Arc::clone(&member) as Arc<dyn Subscriber<T>>);
        member
    }

    pub fn queue(&self) -> &Queue<T> {
        &self.group.queue
    }

    pub fn counter(&self) -> &Arc<Counter> {
        &self.group.counter
    }

    pub fn policy(&self) -> &Arc<dyn Continueable> {
        &self.group.policy
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.group.config
    }

    pub fn state(&self) -> BridgeState {
        match self.state.load(Ordering::Acquire) {
            UNLINKED => BridgeState::Unlinked,
            ACTIVE => BridgeState::Active,
            _ => BridgeState::Terminal,
        }
    }

    /// Marks the group closeable.
    ///
    /// Closes the queue now if no producer is active, otherwise when the last
    /// active producer terminates. Buffered data is never discarded.
    /// Idempotent.
    pub fn close_group(&self) {
        let counter = &self.group.counter;
        counter.mark_completable();
        let active = counter.active();
        tracing::debug!(active, "close requested for merge group");
        if active == 0 {
            self.group.close_terminal();
        }
    }

    /// Builds the group's single consumer view.
    ///
    /// The first request wins; later ones fail with
    /// [`MergeError::ViewClaimed`].
    pub fn materialize(&self, kind: ViewKind) -> Result<View<T>, MergeError> {
        self.group
            .view
            .compare_exchange(NO_VIEW, kind as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|claimed| MergeError::ViewClaimed(ViewKind::from_raw(claimed)))?;

        let queue = self.group.queue.clone();
        self.group.policy.add_queue(queue.handle());
        tracing::debug!(queue = %queue.id(), %kind, "view materialized");
        Ok(View {
            kind,
            queue,
            policy: Arc::clone(&self.group.policy),
        })
    }

    /// Builds the group's view as a blocking sequence.
    pub fn sequence(&self) -> Result<QueueSeq<T>, MergeError> {
        self.materialize(ViewKind::Sequence).map(View::into_sequence)
    }

    /// The link this bridge was handed, if any.
    pub fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.slot.lock().as_ref().map(|slot| Arc::clone(&slot.link))
    }

    fn reject(&self, link: &dyn Link, error: ProtocolError) -> ProtocolError {
        tracing::warn!(%error, queue = %self.group.queue.id(), "link rejected");
        link.cancel();
        error
    }

    /// Ends this bridge's participation in the group. Runs once.
    fn terminate(&self) {
        let previous = self.state.swap(TERMINAL, Ordering::AcqRel);
        if previous == TERMINAL {
            return;
        }
        debug_assert_forward_transition!(previous, TERMINAL);

        let id = self.slot.lock().as_mut().and_then(|slot| slot.id.take());
        if let Some(id) = id {
            self.group.counter.unregister(id);
        }
        self.release();
    }

    /// Gives back this bridge's share of `active`, closing the group if it
    /// was the last producer of a completable group.
    fn release(&self) {
        if !self.reserved.swap(false, Ordering::SeqCst) {
            return;
        }
        let remaining = self.group.counter.release();
        tracing::trace!(remaining, "producer terminated");
        if remaining == 0 && self.group.counter.is_completable() {
            self.group.close_terminal();
        }
    }
}

impl<T: Send + 'static> Default for Bridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Subscriber<T> for Bridge<T> {
    fn on_link(&self, link: Arc<dyn Link>) -> Result<(), ProtocolError> {
        if self.state.load(Ordering::Acquire) == TERMINAL {
            return Err(self.reject(link.as_ref(), ProtocolError::AlreadyTerminated));
        }
        if self.group.counter.is_closed() || !self.group.queue.is_open() {
            self.state.store(TERMINAL, Ordering::Release);
            self.release();
            return Err(self.reject(link.as_ref(), ProtocolError::GroupClosed));
        }

        let existing = {
            let mut slot = self.slot.lock();
            if let Some(existing) = slot.as_ref() {
                Some(Arc::clone(&existing.link))
            } else {
                // Claimed before admission so a racing duplicate sees it.
                *slot = Some(LinkSlot {
                    link: Arc::clone(&link),
                    id: None,
                });
                None
            }
        };
        if let Some(existing) = existing {
            existing.cancel();
            self.terminate();
            return Err(self.reject(link.as_ref(), ProtocolError::DuplicateLink));
        }

        if !self.reserved.swap(true, Ordering::SeqCst) {
            self.group.counter.reserve();
        }
        let id = self
            .group
            .counter
            .admit(Arc::clone(&link), self.group.config.max_concurrency);

        if let Some(current) = self.slot.lock().as_mut() {
            current.id = Some(id);
        }
        if self
            .state
            .compare_exchange(UNLINKED, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Terminated while waiting for admission.
            self.group.counter.unregister(id);
            self.release();
            return Err(self.reject(link.as_ref(), ProtocolError::AlreadyTerminated));
        }

        link.request_one();
        Ok(())
    }

    fn on_element(&self, item: T) -> Result<(), ProtocolError> {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => {}
            state => {
                let error = if state == UNLINKED {
                    ProtocolError::ElementWithoutLink
                } else {
                    ProtocolError::AlreadyTerminated
                };
                tracing::warn!(%error, queue = %self.group.queue.id(), "element rejected");
                if let Some(link) = self.current_link() {
                    link.cancel();
                }
                self.terminate();
                return Err(error);
            }
        }

        let queue = &self.group.queue;
        if !queue.is_open() {
            // Closed by the consumer side (e.g. a satisfied bound).
            tracing::trace!(queue = %queue.id(), "queue closed by consumer; cancelling link");
            if let Some(link) = self.current_link() {
                link.cancel();
            }
            self.terminate();
            return Ok(());
        }

        queue.push(item);
        self.group.counter.record_added();
        Ok(())
    }

    fn on_error(&self, error: UpstreamError) {
        if self.state.load(Ordering::Acquire) == TERMINAL {
            tracing::warn!(%error, "upstream failure after a terminal signal");
            return;
        }

        let mut delivered = false;
        if let Some(handler) = &self.group.error_handler {
            handler(&error);
            delivered = true;
        }
        if self.group.view_claimed() {
            self.group.queue.push_failure(error.clone());
            delivered = true;
        }
        if !delivered {
            tracing::warn!(%error, "unhandled upstream failure");
        }
        self.terminate();
    }

    fn on_complete(&self) {
        if self.state.load(Ordering::Acquire) == TERMINAL {
            if self.group.queue.is_open() {
                tracing::warn!(error = %ProtocolError::AlreadyTerminated, "duplicate completion ignored");
            } else {
                // Sources end with a completion after the consumer side closed.
                tracing::trace!("completion after close ignored");
            }
            return;
        }
        self.terminate();
    }
}

impl<T> fmt::Debug for Bridge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("queue", &self.group.queue)
            .field("counter", &self.group.counter)
            .finish_non_exhaustive()
    }
}

/// Builder for the first bridge of a merge group.
pub struct BridgeBuilder<T> {
    queue: Option<Queue<T>>,
    factory: Option<QueueFactory<T>>,
    policy: Arc<dyn Continueable>,
    error_handler: Option<ErrorHandler>,
    config: BridgeConfig,
}

impl<T: Send + 'static> BridgeBuilder<T> {
    pub fn new() -> Self {
        Self {
            queue: None,
            factory: None,
            policy: Arc::new(AlwaysContinue),
            error_handler: None,
            config: BridgeConfig::default(),
        }
    }

    /// Uses an existing queue. Takes precedence over a factory.
    pub fn queue(mut self, queue: Queue<T>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Builds the queue from the bridge's queue configuration.
    pub fn queue_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(QueueConfig) -> Queue<T> + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config = self.config.with_max_concurrency(max);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn Continueable>) -> Self {
        self.policy = policy;
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&UpstreamError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Bridge<T> {
        let config = self.config;
        let queue = match (self.queue, self.factory) {
            (Some(queue), _) => queue,
            (None, Some(factory)) => factory(config.queue),
            (None, None) => Queue::with_config(config.queue),
        };

        let counter = Arc::new(Counter::new());
        let demand = Arc::clone(&counter);
        if !queue.set_demand_hook(move || demand.request_all(1)) {
            tracing::debug!(queue = %queue.id(), "queue already drives demand for another group");
        }
        // A bound or time limit closes the queue from the consumer side;
        // producers parked on demand must hear about it.
        let links = Arc::clone(&counter);
        queue.set_close_hook(move || {
            let cancelled = links.cancel_all();
            if cancelled > 0 {
                tracing::debug!(cancelled, "queue closed; cancelling live links");
            }
        });

        Bridge::in_group(Arc::new(Group {
            queue,
            counter,
            policy: self.policy,
            error_handler: self.error_handler,
            config,
            view: AtomicU8::new(NO_VIEW),
        }))
    }
}

impl<T: Send + 'static> Default for BridgeBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continueable::Subscription;
    use crate::error::PullError;
    use std::sync::atomic::{AtomicU64, AtomicUsize};

    #[derive(Default)]
    struct TestLink {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Link for TestLink {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn linked(bridge: &Bridge<u32>) -> Arc<TestLink> {
        let link = Arc::new(TestLink::default());
        bridge.on_link(link.clone()).unwrap();
        link
    }

    #[test]
    fn test_link_requests_one() {
        let bridge = Bridge::<u32>::new();
        let link = linked(&bridge);
        assert_eq!(bridge.state(), BridgeState::Active);
        assert_eq!(link.requested.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.counter().active(), 1);
        assert_eq!(bridge.counter().link_count(), 1);
    }

    #[test]
    fn test_duplicate_link_cancels_both() {
        let bridge = Bridge::<u32>::new();
        let first = linked(&bridge);
        let second = Arc::new(TestLink::default());

        let err = bridge.on_link(second.clone()).unwrap_err();
        assert_eq!(err, ProtocolError::DuplicateLink);
        assert!(first.cancelled.load(Ordering::SeqCst));
        assert!(second.cancelled.load(Ordering::SeqCst));
        assert_eq!(bridge.counter().active(), 0);
        assert_eq!(bridge.counter().link_count(), 0);
    }

    #[test]
    fn test_element_without_link() {
        let bridge = Bridge::<u32>::new();
        assert_eq!(bridge.on_element(1), Err(ProtocolError::ElementWithoutLink));
        assert_eq!(bridge.queue().size(), 0);
    }

    #[test]
    fn test_element_after_complete() {
        let bridge = Bridge::<u32>::new();
        let link = linked(&bridge);
        bridge.on_complete();
        assert_eq!(bridge.on_element(1), Err(ProtocolError::AlreadyTerminated));
        assert!(link.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_close_group_twice() {
        let bridge = Bridge::<u32>::new();
        bridge.close_group();
        bridge.close_group();

        let mut seq = bridge.sequence().unwrap();
        assert!(seq.next().is_none());
        assert!(bridge.counter().is_closed());
    }

    #[test]
    fn test_close_waits_for_active_producer() {
        let bridge = Bridge::<u32>::new();
        linked(&bridge);
        for i in 0..5 {
            bridge.on_element(i).unwrap();
        }
        bridge.close_group();
        assert!(bridge.queue().is_open());

        bridge.on_complete();
        assert!(!bridge.queue().is_open());
        let items: Vec<u32> = bridge.sequence().unwrap().map(Result::unwrap).collect();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
        assert_eq!(bridge.counter().added(), 5);
    }

    #[test]
    fn test_group_closed_rejects_link() {
        let bridge = Bridge::<u32>::new();
        bridge.close_group();
        let late = bridge.sibling();
        let link = Arc::new(TestLink::default());
        assert_eq!(late.on_link(link.clone()), Err(ProtocolError::GroupClosed));
        assert!(link.cancelled.load(Ordering::SeqCst));
        assert_eq!(late.state(), BridgeState::Terminal);
    }

    #[test]
    fn test_view_claimed_once() {
        let bridge = Bridge::<u32>::new();
        let _view = bridge.materialize(ViewKind::Stream).unwrap();
        match bridge.sequence() {
            Err(MergeError::ViewClaimed(kind)) => assert_eq!(kind, ViewKind::Stream),
            other => panic!("expected ViewClaimed, got {:?}", other.map(|_| ())),
        }
        let sibling = bridge.sibling();
        assert!(sibling.materialize(ViewKind::Sequence).is_err());
    }

    #[test]
    fn test_error_reaches_handler_and_view() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let bridge = Bridge::<u32>::builder()
            .error_handler(move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        let view = bridge.materialize(ViewKind::Sequence).unwrap();

        linked(&bridge);
        bridge.on_element(1).unwrap();
        bridge.on_error(UpstreamError::msg("disk on fire"));
        bridge.close_group();

        let queue = view.queue().clone();
        assert_eq!(queue.pull().unwrap(), 1);
        assert!(matches!(queue.pull(), Err(PullError::Upstream(_))));
        assert!(queue.pull().unwrap_err().is_closed());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pull_grants_demand() {
        let bridge = Bridge::<u32>::new();
        let link = linked(&bridge);
        bridge.on_element(7).unwrap();
        bridge.queue().pull().unwrap();
        assert_eq!(link.requested.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_bound_close_cancels_producer() {
        let policy = Arc::new(Subscription::new());
        let bridge = Bridge::<u32>::builder().policy(policy.clone()).build();
        let mut seq = bridge.sequence().unwrap();
        policy.register_limit(1);

        let link = linked(&bridge);
        bridge.on_element(1).unwrap();
        assert_eq!(seq.next().unwrap().unwrap(), 1);
        assert!(seq.next().is_none());

        bridge.on_element(2).unwrap();
        assert!(link.cancelled.load(Ordering::SeqCst));
        assert_eq!(bridge.state(), BridgeState::Terminal);
        assert_eq!(bridge.counter().active(), 0);
    }

    #[test]
    fn test_bound_close_cancels_parked_producer() {
        let policy = Arc::new(Subscription::new());
        let bridge = Bridge::<u32>::builder().policy(policy.clone()).build();
        let mut seq = bridge.sequence().unwrap();
        policy.register_limit(1);

        let link = linked(&bridge);
        bridge.on_element(1).unwrap();
        assert_eq!(seq.next().unwrap().unwrap(), 1);
        assert!(seq.next().is_none());

        // No further element arrives; the close alone reaches the link.
        assert!(link.cancelled.load(Ordering::SeqCst));
        bridge.on_complete();
        assert_eq!(bridge.counter().active(), 0);
        assert_eq!(bridge.counter().link_count(), 0);

        bridge.close_group();
        assert!(bridge.counter().is_closed());
    }

    #[test]
    fn test_time_limit_cancels_links() {
        let policy = Arc::new(Subscription::new());
        let bridge = Bridge::<u32>::builder().policy(policy.clone()).build();
        let seq = bridge.sequence().unwrap();
        policy.register_time_limit(std::time::Duration::from_millis(30));
        let link = linked(&bridge);

        assert_eq!(seq.count(), 0);
        assert!(link.cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_terminal_continuation_replays_residual() {
        let queue = Queue::<u32>::new();
        // Stands in for a producer racing the close: runs just before the
        // group's terminal continuation.
        queue.add_continuation(|queue: &Queue<u32>| {
            queue.push(42);
            ControlFlow::Continue(())
        });
        let bridge = Bridge::<u32>::builder().queue(queue).build();

        bridge.close_group();
        assert_eq!(bridge.counter().active(), 0);
        assert!(!bridge.queue().is_open());
        bridge.queue().push(7);

        let items: Vec<u32> = bridge.sequence().unwrap().map(Result::unwrap).collect();
        assert_eq!(items, vec![7, 42]);
    }

    #[test]
    fn test_current_link() {
        let bridge = Bridge::<u32>::new();
        assert!(bridge.current_link().is_none());
        linked(&bridge);
        assert!(bridge.current_link().is_some());
    }

    #[test]
    fn test_custom_queue_factory() {
        let bridge = Bridge::<u32>::builder()
            .config(BridgeConfig::bounded(2).with_queue_config(QueueConfig::low_cpu()))
            .queue_factory(Queue::with_config)
            .build();
        assert!(!bridge.queue().config().spin_before_park);
        assert_eq!(bridge.config().max_concurrency, 2);
    }
}
