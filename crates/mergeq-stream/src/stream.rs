//! Async stream over a merge queue.

use crate::config::StreamConfig;
use futures_core::Stream;
use mergeq::{Bridge, Continueable, MergeError, PullError, Queue, View, ViewKind};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{interval, sleep_until, Instant, Interval, Sleep};

pin_project! {
    /// Async counterpart of [`QueueSeq`](mergeq::QueueSeq).
    ///
    /// Implements `futures::Stream` over a [`Queue`]. Items arrive in
    /// per-producer FIFO order; upstream failures come through as `Err`
    /// items and the stream ends once the queue is closed and drained.
    ///
    /// # Demand
    ///
    /// The queue's demand hook runs once per element the stream starts
    /// waiting for, so a merge group sees the same demand as with a blocking
    /// sequence.
    ///
    /// # Bounds
    ///
    /// The bound policy is consulted after every element. A policy time
    /// limit, measured from construction, ends the stream and closes every
    /// queue the policy tracks. Limits registered after construction are
    /// picked up on the next poll.
    ///
    /// Must be created inside a tokio runtime.
    pub struct QueueStream<T> {
        queue: Queue<T>,
        policy: Arc<dyn Continueable>,
        #[pin]
        poll_timer: Interval,
        started: Instant,
        armed_limit: Option<Duration>,
        #[pin]
        deadline: Option<Sleep>,
        residual: std::vec::IntoIter<T>,
        demand_signaled: bool,
        done: bool,
    }
}

impl<T: Send + 'static> QueueStream<T> {
    /// Stream over `queue`, registering it with `policy`.
    pub fn new(queue: Queue<T>, policy: Arc<dyn Continueable>) -> Self {
        Self::with_config(queue, policy, StreamConfig::default())
    }

    pub fn with_config(queue: Queue<T>, policy: Arc<dyn Continueable>, config: StreamConfig) -> Self {
        policy.add_queue(queue.handle());
        let started = Instant::now();
        let armed_limit = policy.time_limit();
        let deadline = armed_limit.map(|limit| sleep_until(started + limit));
        Self {
            queue,
            policy,
            poll_timer: interval(config.poll_interval),
            started,
            armed_limit,
            deadline,
            residual: Vec::new().into_iter(),
            demand_signaled: false,
            done: false,
        }
    }

    /// Stream over a materialized view.
    pub fn from_view(view: View<T>, config: StreamConfig) -> Self {
        let (queue, policy) = view.into_parts();
        Self::with_config(queue, policy, config)
    }

    /// The queue this stream drains.
    pub fn queue(&self) -> &Queue<T> {
        &self.queue
    }

    /// Returns `true` once the stream has ended.
    pub fn is_terminated(&self) -> bool {
        self.done && self.residual.as_slice().is_empty()
    }
}

impl<T: Send + 'static> Stream for QueueStream<T> {
    type Item = Result<T, MergeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if let Some(item) = this.residual.next() {
            return Poll::Ready(Some(Ok(item)));
        }
        if *this.done {
            return Poll::Ready(None);
        }

        let limit = this.policy.time_limit();
        if limit != *this.armed_limit {
            *this.armed_limit = limit;
            let started = *this.started;
            this.deadline.set(limit.map(|limit| sleep_until(started + limit)));
        }
        if let Some(deadline) = this.deadline.as_mut().as_pin_mut() {
            if deadline.poll(cx).is_ready() {
                tracing::debug!(queue = %this.queue.id(), "time limit elapsed");
                this.policy.close_all();
                this.queue.close_and_clear();
                *this.done = true;
                return Poll::Ready(None);
            }
        }

        if !*this.demand_signaled {
            this.queue.signal_demand();
            *this.demand_signaled = true;
        }

        match this.queue.poll_pull(cx) {
            Poll::Ready(Ok(item)) => {
                *this.demand_signaled = false;
                this.policy.close_queue_if_finished(&*this.queue);
                *this.done = this.policy.closed();
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Err(PullError::Upstream(error))) => {
                *this.demand_signaled = false;
                Poll::Ready(Some(Err(MergeError::Upstream(error))))
            }
            Poll::Ready(Err(PullError::Timeout(timeout))) => {
                Poll::Ready(Some(Err(MergeError::Timeout(timeout))))
            }
            Poll::Ready(Err(PullError::Closed(signal))) => {
                *this.done = true;
                if signal.has_residual() {
                    tracing::debug!(
                        queue = %this.queue.id(),
                        residual = signal.residual().len(),
                        "replaying residual elements"
                    );
                }
                *this.residual = signal.into_residual().into_iter();
                Poll::Ready(this.residual.next().map(Ok))
            }
            Poll::Pending => {
                // Safety net: re-poll on every tick even without a wake-up.
                if this.poll_timer.as_mut().poll_tick(cx).is_ready() {
                    cx.waker().wake_by_ref();
                }
                Poll::Pending
            }
        }
    }
}

/// Async views over a [`Bridge`]'s merge group.
pub trait BridgeStreamExt<T> {
    /// Materializes the group's view as an async stream.
    fn stream(&self) -> Result<QueueStream<T>, MergeError>;

    /// Same as [`stream`](Self::stream) with an explicit configuration.
    fn stream_with_config(&self, config: StreamConfig) -> Result<QueueStream<T>, MergeError>;
}

impl<T: Send + 'static> BridgeStreamExt<T> for Bridge<T> {
    fn stream(&self) -> Result<QueueStream<T>, MergeError> {
        self.stream_with_config(StreamConfig::default())
    }

    fn stream_with_config(&self, config: StreamConfig) -> Result<QueueStream<T>, MergeError> {
        let view = self.materialize(ViewKind::Stream)?;
        Ok(QueueStream::from_view(view, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use mergeq::{AlwaysContinue, Subscription};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_drains_then_ends() {
        let queue = Queue::new();
        queue.push(1u32);
        queue.push(2);
        queue.close();

        let items: Vec<u32> = QueueStream::new(queue, Arc::new(AlwaysContinue))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_stream_woken_by_push() {
        let queue = Queue::<u32>::new();
        let producer = queue.clone();
        let mut stream = Box::pin(QueueStream::new(queue, Arc::new(AlwaysContinue)));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(5);
            producer.close();
        });

        assert_eq!(stream.next().await.unwrap().unwrap(), 5);
        assert!(stream.next().await.is_none());
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn test_stream_limit() {
        let queue = Queue::new();
        for i in 0..10u32 {
            queue.push(i);
        }
        let policy = Arc::new(Subscription::new());
        let stream = QueueStream::new(queue, policy.clone());
        policy.register_limit(4);

        let items: Vec<u32> = stream.map(Result::unwrap).collect().await;
        assert_eq!(items, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_time_limit() {
        let policy = Arc::new(Subscription::new());
        policy.register_time_limit(Duration::from_millis(30));
        let stream = QueueStream::new(Queue::<u32>::new(), policy.clone());

        let items: Vec<_> = stream.collect().await;
        assert!(items.is_empty());
        assert!(policy.closed());
    }

    #[tokio::test]
    async fn test_stream_time_limit_registered_late() {
        let policy = Arc::new(Subscription::new());
        let mut stream = Box::pin(QueueStream::new(Queue::<u32>::new(), policy.clone()));
        policy.register_time_limit(Duration::from_millis(30));

        let next = tokio::time::timeout(Duration::from_millis(500), stream.next())
            .await
            .expect("late time limit was ignored");
        assert!(next.is_none());
        assert!(policy.closed());
    }
}
