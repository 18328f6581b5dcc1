//! Error types for mergeq operations.

use crate::bridge::ViewKind;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A failure reported by an upstream producer.
///
/// Cheap to clone: the same failure is handed to the registered error
/// handler and to the materialized view.
#[derive(Clone)]
pub struct UpstreamError(Arc<dyn StdError + Send + Sync + 'static>);

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

impl UpstreamError {
    /// Wraps a concrete error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Builds an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Returns the wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Returns `true` if both values wrap the same failure.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Box<dyn StdError + Send + Sync + 'static>> for UpstreamError {
    fn from(error: Box<dyn StdError + Send + Sync + 'static>) -> Self {
        Self(Arc::from(error))
    }
}

impl fmt::Debug for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UpstreamError").field(&self.0).finish()
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl StdError for UpstreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

/// Violations of the push-source contract.
///
/// These are fatal for the offending link: the bridge cancels it (and any
/// link it already held) before returning the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// `on_link` called on a bridge that already holds a link.
    #[error("bridge already holds a link")]
    DuplicateLink,

    /// An element arrived before `on_link` was accepted.
    #[error("element delivered without an active link")]
    ElementWithoutLink,

    /// A signal arrived after `on_complete` or `on_error`.
    #[error("signal delivered after a terminal signal")]
    AlreadyTerminated,

    /// The merge group was closed before this link was admitted.
    #[error("merge group is closed to new links")]
    GroupClosed,
}

/// Terminal condition raised once a queue is closed and drained.
///
/// `residual` holds elements recovered while the terminal continuation ran,
/// i.e. data that raced with the close. It is usually empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSignal<T> {
    residual: Vec<T>,
}

impl<T> ClosedSignal<T> {
    /// A closed-signal with no residual data.
    pub fn new() -> Self {
        Self {
            residual: Vec::new(),
        }
    }

    /// A closed-signal carrying elements recovered at close time.
    pub fn with_residual(residual: Vec<T>) -> Self {
        Self { residual }
    }

    /// Residual elements, in queue order.
    pub fn residual(&self) -> &[T] {
        &self.residual
    }

    /// Returns `true` if elements were recovered at close time.
    pub fn has_residual(&self) -> bool {
        !self.residual.is_empty()
    }

    /// Consumes the signal, returning the residual elements.
    pub fn into_residual(self) -> Vec<T> {
        self.residual
    }
}

impl<T> Default for ClosedSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a failed [`Queue::pull`](crate::Queue::pull).
#[derive(Debug)]
pub enum PullError<T> {
    /// The queue is closed and drained.
    Closed(ClosedSignal<T>),
    /// Nothing arrived before the pull timeout.
    Timeout(Duration),
    /// A producer failure was dequeued in place of an element.
    Upstream(UpstreamError),
}

impl<T> PullError<T> {
    /// Returns `true` for the closed-signal.
    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Returns `true` if pulling again may yield an element.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Upstream(_))
    }
}

impl<T> fmt::Display for PullError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(signal) if signal.has_residual() => write!(
                f,
                "queue is closed ({} residual elements)",
                signal.residual().len()
            ),
            Self::Closed(_) => f.write_str("queue is closed"),
            Self::Timeout(timeout) => write!(f, "no element arrived within {:?}", timeout),
            Self::Upstream(error) => write!(f, "upstream failure: {}", error),
        }
    }
}

impl<T: fmt::Debug> StdError for PullError<T> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Upstream(error) => Some(error),
            _ => None,
        }
    }
}

/// Errors surfaced to consumers of a merged sequence.
#[derive(Debug, Clone, Error)]
pub enum MergeError {
    /// A producer reported a failure.
    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamError),

    /// The queue's pull timeout elapsed with no element.
    #[error("no element arrived within {0:?}")]
    Timeout(Duration),

    /// The bridge already handed out its single consumer view.
    #[error("view already materialized as {0}")]
    ViewClaimed(ViewKind),
}

impl MergeError {
    /// Returns `true` if the sequence may still produce elements.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Timeout(_))
    }

    /// Returns `true` if retrying the same call can never succeed.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ViewClaimed(_))
    }
}
