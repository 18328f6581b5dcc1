//! Pull-based sequence over a queue.

use crate::continueable::Continueable;
use crate::error::{ClosedSignal, MergeError, PullError};
use crate::queue::Queue;
use std::iter::FusedIterator;
use std::sync::Arc;
use std::time::Instant;

/// Lazy, non-restartable iterator over a [`Queue`].
///
/// Each `next()` blocks until an element arrives or the queue is closed
/// and drained. Upstream failures come through as `Err` items; the
/// closed-signal ends the iteration. Residual elements carried by the
/// closed-signal are replayed before the end.
///
/// After every element the bound policy is consulted and may close the
/// queue. A policy time limit, measured from when the sequence was built,
/// closes all of the policy's queues once it elapses.
pub struct QueueSeq<T> {
    queue: Queue<T>,
    policy: Arc<dyn Continueable>,
    started: Instant,
    residual: std::vec::IntoIter<T>,
    done: bool,
}

impl<T: Send + 'static> QueueSeq<T> {
    pub(crate) fn new(queue: Queue<T>, policy: Arc<dyn Continueable>) -> Self {
        Self {
            queue,
            policy,
            started: Instant::now(),
            residual: Vec::new().into_iter(),
            done: false,
        }
    }

    /// The queue this sequence drains.
    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }

    /// The bound policy consulted after each element.
    pub fn policy(&self) -> &Arc<dyn Continueable> {
        &self.policy
    }

    fn pull(&mut self) -> Result<T, PullError<T>> {
        let Some(limit) = self.policy.time_limit() else {
            return self.queue.pull();
        };
        let remaining = limit.saturating_sub(self.started.elapsed());
        if remaining.is_zero() {
            self.expire();
            return Err(PullError::Closed(ClosedSignal::new()));
        }
        match self.queue.config().pull_timeout {
            Some(timeout) if timeout < remaining => self.queue.pull_timeout(timeout),
            _ => self.queue.pull_timeout(remaining),
        }
    }

    fn expire(&mut self) {
        tracing::debug!(queue = %self.queue.id(), "time limit elapsed");
        self.policy.close_all();
        // The policy may not track this queue (e.g. it was built elsewhere).
        self.queue.close_and_clear();
        self.done = true;
    }

    fn deadline_passed(&self) -> bool {
        self.policy
            .time_limit()
            .is_some_and(|limit| self.started.elapsed() >= limit)
    }
}

impl<T: Send + 'static> Iterator for QueueSeq<T> {
    type Item = Result<T, MergeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.residual.next() {
            return Some(Ok(item));
        }
        if self.done {
            return None;
        }

        match self.pull() {
            Ok(item) => {
                self.policy.close_queue_if_finished(&self.queue);
                // A satisfied bound ends the sequence even if producers
                // raced more elements in after the clear.
                self.done = self.policy.closed();
                Some(Ok(item))
            }
            Err(PullError::Upstream(error)) => Some(Err(MergeError::Upstream(error))),
            Err(PullError::Timeout(_)) if self.deadline_passed() => {
                self.expire();
                None
            }
            Err(PullError::Timeout(timeout)) => Some(Err(MergeError::Timeout(timeout))),
            Err(PullError::Closed(signal)) => {
                self.done = true;
                if signal.has_residual() {
                    tracing::debug!(
                        queue = %self.queue.id(),
                        residual = signal.residual().len(),
                        "replaying residual elements"
                    );
                }
                self.residual = signal.into_residual().into_iter();
                self.residual.next().map(Ok)
            }
        }
    }
}

impl<T: Send + 'static> FusedIterator for QueueSeq<T> {}
