//! Task-parallel view: one tokio task per pulled element.

use crate::config::ParallelConfig;
use crate::error::ParallelError;
use crate::stream::QueueStream;
use futures_util::StreamExt;
use mergeq::{Bridge, MergeError, ViewKind};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

/// Outcome of [`ParallelView::for_each`].
#[derive(Debug, Default)]
pub struct ParallelReport {
    /// Element tasks that finished with `Ok`.
    pub processed: u64,
    /// Element tasks that returned an error.
    pub failed: u64,
    /// Element tasks that panicked or were cancelled.
    pub panicked: u64,
    /// Errors yielded by the merged stream itself.
    pub upstream_failures: u64,
    /// Every failure, in the order it was observed.
    pub errors: Vec<ParallelError>,
}

impl ParallelReport {
    /// Returns `true` if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, result: Result<Result<(), String>, JoinError>) {
        match result {
            Ok(Ok(())) => self.processed += 1,
            Ok(Err(error)) => {
                tracing::warn!(%error, "element task failed");
                self.failed += 1;
                self.errors.push(ParallelError::Task(error));
            }
            Err(error) => {
                tracing::warn!(%error, "element task aborted");
                self.panicked += 1;
                self.errors.push(ParallelError::Aborted(error.to_string()));
            }
        }
    }

    fn record_upstream(&mut self, error: MergeError) {
        tracing::debug!(%error, "merged stream yielded a failure");
        self.upstream_failures += 1;
        self.errors.push(ParallelError::Merge(error));
    }
}

/// Runs an async continuation for every element of a merged stream, each
/// on its own tokio task.
///
/// At most `max_in_flight` tasks run at once; pulling pauses while the
/// ceiling is reached, so demand toward producers follows task completion.
pub struct ParallelView<T> {
    stream: QueueStream<T>,
    config: ParallelConfig,
}

impl<T: Send + 'static> ParallelView<T> {
    pub fn new(stream: QueueStream<T>, config: ParallelConfig) -> Self {
        Self { stream, config }
    }

    /// Materializes `bridge`'s group as a task-parallel view.
    pub fn from_bridge(bridge: &Bridge<T>, config: ParallelConfig) -> Result<Self, MergeError> {
        let view = bridge.materialize(ViewKind::Stream)?;
        Ok(Self::new(QueueStream::from_view(view, config.stream), config))
    }

    /// Drives the stream to its end, spawning `f(item)` for every element,
    /// and waits for every spawned task.
    pub async fn for_each<F, Fut, E>(self, f: F) -> ParallelReport
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let mut report = ParallelReport::default();
        let semaphore = Arc::new(Semaphore::new(self.config.max_in_flight));
        let mut tasks: JoinSet<Result<(), String>> = JoinSet::new();
        let mut stream = std::pin::pin!(self.stream);

        loop {
            tokio::select! {
                // Reap finished tasks without waiting on them
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    report.record(result);
                }

                next = stream.next() => match next {
                    Some(Ok(item)) => {
                        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                            break;
                        };
                        let fut = f(item);
                        tasks.spawn(async move {
                            let result = fut.await.map_err(|error| error.to_string());
                            drop(permit);
                            result
                        });
                    }
                    Some(Err(error)) => report.record_upstream(error),
                    None => break,
                },
            }
        }

        while let Some(result) = tasks.join_next().await {
            report.record(result);
        }
        tracing::debug!(
            processed = report.processed,
            failed = report.failed,
            panicked = report.panicked,
            "parallel view finished"
        );
        report
    }
}

/// Task-parallel views over a [`Bridge`]'s merge group.
pub trait BridgeParallelExt<T> {
    /// Materializes the group's view as a task-parallel view.
    fn parallel(&self, config: ParallelConfig) -> Result<ParallelView<T>, MergeError>;
}

impl<T: Send + 'static> BridgeParallelExt<T> for Bridge<T> {
    fn parallel(&self, config: ParallelConfig) -> Result<ParallelView<T>, MergeError> {
        ParallelView::from_bridge(self, config)
    }
}
