//! Error types for mergeq-stream operations.

use mergeq::MergeError;
use thiserror::Error;

/// Failures collected while running a [`ParallelView`](crate::ParallelView).
#[derive(Debug, Error)]
pub enum ParallelError {
    /// The merged stream yielded an error in place of an element.
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// An element task returned an error.
    #[error("element task failed: {0}")]
    Task(String),

    /// An element task panicked or was cancelled.
    #[error("element task aborted: {0}")]
    Aborted(String),
}

impl ParallelError {
    /// Returns `true` if the failure came from an element task rather than
    /// the merged stream.
    #[inline]
    pub fn is_task_failure(&self) -> bool {
        matches!(self, Self::Task(_) | Self::Aborted(_))
    }
}
