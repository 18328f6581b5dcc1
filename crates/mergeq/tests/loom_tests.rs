//! Loom-based concurrency tests for the merge-group close protocol.
//!
//! Run with: `cargo test -p mergeq --features loom --test loom_tests --release`
//!
//! The group closes when the owner has marked it completable and no producer
//! is active. Both sides update their own flag and then read the other's, so
//! at least one of them observes the closing condition; a latch keeps the
//! close to exactly one.

#![cfg(feature = "loom")]

use loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use loom::sync::Arc;
use loom::thread;

/// Close protocol of one merge group, stripped of the queue and registry.
struct LoomGroup {
    active: AtomicUsize,
    completable: AtomicBool,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl LoomGroup {
    fn with_active(active: usize) -> Self {
        Self {
            active: AtomicUsize::new(active),
            completable: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        }
    }

    fn close_terminal(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Producer side: terminate one link.
    fn complete(&self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && self.completable.load(Ordering::SeqCst) {
            self.close_terminal();
        }
    }

    /// Owner side: mark the group closeable.
    fn close_group(&self) {
        self.completable.store(true, Ordering::SeqCst);
        if self.active.load(Ordering::SeqCst) == 0 {
            self.close_terminal();
        }
    }
}

/// One producer completing while the owner closes: exactly one close.
#[test]
fn loom_complete_races_close_group() {
    loom::model(|| {
        let group = Arc::new(LoomGroup::with_active(1));

        let producer = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.complete())
        };
        group.close_group();
        producer.join().unwrap();

        assert_eq!(group.closes.load(Ordering::SeqCst), 1);
    });
}

/// Two producers completing concurrently with the owner: exactly one close,
/// and never before both producers are done.
#[test]
fn loom_two_producers_and_owner() {
    loom::model(|| {
        let group = Arc::new(LoomGroup::with_active(2));

        let producers: Vec<_> = (0..2)
            .map(|_| {
                let group = Arc::clone(&group);
                thread::spawn(move || group.complete())
            })
            .collect();

        group.close_group();
        let closed_early = group.closes.load(Ordering::SeqCst) == 1
            && group.active.load(Ordering::SeqCst) > 0;
        assert!(!closed_early, "group closed with producers still active");

        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(group.closes.load(Ordering::SeqCst), 1);
    });
}

/// Closing twice is the same as closing once.
#[test]
fn loom_close_group_twice() {
    loom::model(|| {
        let group = Arc::new(LoomGroup::with_active(0));

        let other = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.close_group())
        };
        group.close_group();
        other.join().unwrap();

        assert_eq!(group.closes.load(Ordering::SeqCst), 1);
    });
}
