//! The push-source contract and a reference source.
//!
//! A source must:
//! - call [`Subscriber::on_link`] exactly once, before any element
//! - deliver an element only against outstanding demand
//! - deliver at most one terminal signal (`on_error` XOR `on_complete`)
//! - deliver nothing after a terminal signal

use crate::error::{ProtocolError, UpstreamError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Handle for one live upstream link.
pub trait Link: Send + Sync {
    /// Grants `n` more elements of demand. Must not block.
    fn request(&self, n: u64);

    /// Grants one more element of demand.
    fn request_one(&self) {
        self.request(1);
    }

    /// Asks the source to stop. Signals already in flight may still arrive.
    ///
    /// A cancelled source still ends with `on_complete` so the subscriber
    /// can release its share of the group.
    fn cancel(&self);
}

/// Receiving side of the push-source contract.
///
/// Each method may be called from a different thread than the previous
/// one, but calls for a single link never overlap.
pub trait Subscriber<T>: Send + Sync {
    fn on_link(&self, link: Arc<dyn Link>) -> Result<(), ProtocolError>;

    fn on_element(&self, item: T) -> Result<(), ProtocolError>;

    fn on_error(&self, error: UpstreamError);

    fn on_complete(&self);
}

/// A push-based producer.
pub trait Source<T> {
    /// Starts delivering signals to `subscriber`.
    ///
    /// Must not block the caller until the stream ends; sources that do
    /// blocking work run it on their own thread.
    fn subscribe(self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Demand accounting for sources that run on their own thread.
#[derive(Debug, Default)]
pub struct DemandLink {
    demand: Mutex<u64>,
    granted: Condvar,
    cancelled: AtomicBool,
}

impl DemandLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until one unit of demand is available and takes it.
    ///
    /// Returns `false` if the link was cancelled.
    pub fn acquire(&self) -> bool {
        let mut demand = self.demand.lock();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return false;
            }
            if *demand > 0 {
                *demand -= 1;
                return true;
            }
            self.granted.wait(&mut demand);
        }
    }

    /// Returns `true` once the link was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Link for DemandLink {
    fn request(&self, n: u64) {
        let mut demand = self.demand.lock();
        *demand = demand.saturating_add(n);
        self.granted.notify_one();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let _demand = self.demand.lock();
        self.granted.notify_all();
    }
}

/// Source that drives an iterator on a dedicated thread.
///
/// See [`FallibleSource`] for iterators that can fail.
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I> Source<I::Item> for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn subscribe(self, subscriber: Arc<dyn Subscriber<I::Item>>) {
        spawn_driver(self.iter.map(Ok), subscriber);
    }
}

/// Source over `Result` items, driven on a dedicated thread.
///
/// The first `Err` is delivered via `on_error` and ends the source.
pub struct FallibleSource<I> {
    iter: I,
}

impl<I> FallibleSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I, T> Source<T> for FallibleSource<I>
where
    I: Iterator<Item = Result<T, UpstreamError>> + Send + 'static,
    T: Send + 'static,
{
    fn subscribe(self, subscriber: Arc<dyn Subscriber<T>>) {
        spawn_driver(self.iter, subscriber);
    }
}

fn spawn_driver<I, T>(iter: I, subscriber: Arc<dyn Subscriber<T>>)
where
    I: Iterator<Item = Result<T, UpstreamError>> + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(move || drive(iter, subscriber.as_ref()));
}

fn drive<I, T>(iter: I, subscriber: &dyn Subscriber<T>)
where
    I: Iterator<Item = Result<T, UpstreamError>>,
{
    let link = Arc::new(DemandLink::new());
    if let Err(error) = subscriber.on_link(Arc::clone(&link) as Arc<dyn Link>) {
        tracing::debug!(%error, "source link rejected");
        return;
    }

    for item in iter {
        if !link.acquire() {
            tracing::trace!("source cancelled");
            break;
        }
        match item {
            Ok(item) => {
                if subscriber.on_element(item).is_err() {
                    return;
                }
            }
            Err(error) => {
                subscriber.on_error(error);
                return;
            }
        }
    }
    subscriber.on_complete();
}
