//! Shared state for one merge group.

use crate::invariants::{debug_assert_release_matched, debug_assert_within_ceiling};
use crate::source::Link;
use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Identifier of a link admitted into a [`Counter`].
pub type LinkId = u64;

struct Registry {
    links: Vec<(LinkId, Arc<dyn Link>)>,
    next_id: LinkId,
    peak: usize,
}

impl Registry {
    fn insert(&mut self, link: Arc<dyn Link>) -> LinkId {
        let id = self.next_id;
        self.next_id += 1;
        self.links.push((id, link));
        self.peak = self.peak.max(self.links.len());
        id
    }
}

/// Aggregate state jointly owned by every bridge in a merge group.
///
/// Hot counters are atomics. The link registry has its own short-lived lock,
/// held across a call into a link only for the non-blocking `request`, plus
/// a condvar that admission waiters park on.
pub struct Counter {
    active: CachePadded<AtomicUsize>,
    added: CachePadded<AtomicU64>,
    completable: AtomicBool,
    closed: AtomicBool,
    registry: Mutex<Registry>,
    released: Condvar,
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("active", &self.active())
            .field("links", &self.link_count())
            .field("completable", &self.is_completable())
            .field("closed", &self.is_closed())
            .field("added", &self.added())
            .finish()
    }
}

impl Counter {
    pub fn new() -> Self {
        Self {
            active: CachePadded::new(AtomicUsize::new(0)),
            added: CachePadded::new(AtomicU64::new(0)),
            completable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            registry: Mutex::new(Registry {
                links: Vec::new(),
                next_id: 0,
                peak: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Producers counted as active (reserved or linked, not yet terminated).
    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Elements delivered into the group's queue.
    #[inline]
    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    /// Returns `true` once the owner has asked the group to close.
    #[inline]
    pub fn is_completable(&self) -> bool {
        self.completable.load(Ordering::SeqCst)
    }

    /// Returns `true` once the group's queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Links currently registered.
    pub fn link_count(&self) -> usize {
        self.registry.lock().links.len()
    }

    /// Most links ever registered at the same time.
    pub fn peak_links(&self) -> usize {
        self.registry.lock().peak
    }

    /// Counts a producer as active. Returns the new active count.
    pub(crate) fn reserve(&self) -> usize {
        self.active.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Counts a producer as terminated. Returns the remaining active count.
    pub(crate) fn release(&self) -> usize {
        match self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| active.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(previous) => {
                debug_assert_release_matched!(previous);
                0
            }
        }
    }

    #[inline]
    pub(crate) fn record_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_completable(&self) {
        self.completable.store(true, Ordering::SeqCst);
    }

    /// Latches the closed flag. Returns `true` only for the first caller.
    pub(crate) fn latch_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Registers `link` once fewer than `ceiling` links are live.
    ///
    /// Spins briefly, then parks until a link is released.
    pub(crate) fn admit(&self, link: Arc<dyn Link>, ceiling: usize) -> LinkId {
        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if let Some(mut registry) = self.registry.try_lock() {
                if registry.links.len() < ceiling {
                    return Self::register(&mut registry, link, ceiling);
                }
            }
            backoff.snooze();
        }

        let mut registry = self.registry.lock();
        if registry.links.len() >= ceiling {
            tracing::trace!(ceiling, "admission waiting for a free slot");
            while registry.links.len() >= ceiling {
                self.released.wait(&mut registry);
            }
        }
        Self::register(&mut registry, link, ceiling)
    }

    fn register(registry: &mut Registry, link: Arc<dyn Link>, ceiling: usize) -> LinkId {
        let id = registry.insert(link);
        debug_assert_within_ceiling!(registry.links.len(), ceiling);
        tracing::trace!(link = id, live = registry.links.len(), "link admitted");
        id
    }

    /// Removes a link and wakes admission waiters.
    pub(crate) fn unregister(&self, id: LinkId) -> Option<Arc<dyn Link>> {
        let removed = {
            let mut registry = self.registry.lock();
            let pos = registry.links.iter().position(|(link_id, _)| *link_id == id)?;
            Some(registry.links.swap_remove(pos).1)
        };
        self.released.notify_all();
        removed
    }

    /// Grants `n` more elements of demand to every live link.
    ///
    /// Runs on every pull, under the registry lock; `Link::request` must not
    /// block.
    pub fn request_all(&self, n: u64) {
        let registry = self.registry.lock();
        for (_, link) in &registry.links {
            link.request(n);
        }
    }

    /// Cancels every live link. Returns how many were cancelled.
    ///
    /// Links stay registered until their bridges terminate.
    pub fn cancel_all(&self) -> usize {
        let links: Vec<Arc<dyn Link>> = self
            .registry
            .lock()
            .links
            .iter()
            .map(|(_, link)| Arc::clone(link))
            .collect();
        for link in &links {
            link.cancel();
        }
        links.len()
    }
}
