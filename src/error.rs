// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the sender chain.

use std::fmt;
use std::time::Duration;

/// A boxed, type-erased cause carried alongside an error classification.
///
/// Kept `Send + Sync` so errors can cross worker-task boundaries freely,
/// the same constraint the teacher's engine errors place on themselves.
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by a stage's `send`, classified so the retry sender can
/// decide whether to retry, and so the queue sender can decide whether to
/// put a request back.
#[derive(thiserror::Error, Debug)]
pub enum SendError {
    /// The request will never succeed (bad payload, auth rejected). Never
    /// retried; the request's finished-callback fires with a drop.
    #[error("permanent error: {0}")]
    Permanent(Cause),

    /// The remote signaled back-off; the next retry sleep must be at least
    /// `retry_after`.
    #[error("throttled, retry after {retry_after:?}: {cause}")]
    Throttle {
        /// Minimum delay before the next attempt.
        retry_after: Duration,
        /// The underlying cause reported by the transport.
        cause: Cause,
    },

    /// Retried until `max_elapsed`. The default classification for
    /// untagged errors.
    #[error("retryable error: {0}")]
    Retryable(Cause),

    /// The request's scope ended (producer cancellation or a deadline
    /// fired). Not retried; not counted as a failure.
    #[error("cancelled")]
    Cancelled,

    /// Produce-time rejection because the queue is at capacity. Counted as
    /// a drop.
    #[error("queue is full")]
    QueueFull,

    /// The sender is shutting down or has shut down; produce was rejected.
    #[error("sender is closed")]
    Closed,
}

impl SendError {
    /// Wraps an arbitrary error as [`SendError::Retryable`], the default
    /// classification for causes that do not otherwise tag themselves.
    pub fn retryable<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SendError::Retryable(Box::new(cause))
    }

    /// Wraps an arbitrary error as [`SendError::Permanent`].
    pub fn permanent<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        SendError::Permanent(Box::new(cause))
    }

    /// True if this error should never be retried by the retry sender.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, SendError::Permanent(_))
    }

    /// True if this error represents scope cancellation rather than a
    /// transport failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SendError::Cancelled)
    }

    /// The minimum delay the retry sender must honor before its next
    /// attempt, if this error carries one.
    #[must_use]
    pub fn throttle_delay(&self) -> Option<Duration> {
        match self {
            SendError::Throttle { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// A simple string-backed cause, for call sites that don't have (or need)
/// a richer error type to box.
#[derive(Debug)]
pub struct Message(pub String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message(s.to_owned())
    }
}

/// Fatal conditions detected at construction time (`SenderChainBuilder::build`).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `SenderChainBuilder::build` was called without a transport
    /// attached via `with_transport`.
    #[error("no transport configured")]
    MissingTransport,

    /// A queue setting makes the stage unable to ever drain (for example,
    /// zero consumer workers while the queue is enabled).
    #[error("invalid queue capacity: {reason}")]
    InvalidQueueCapacity {
        /// Human-readable explanation.
        reason: String,
    },

    /// Retry is enabled but one or more intervals are non-positive.
    #[error("invalid retry parameters: {reason}")]
    InvalidRetryParameters {
        /// Human-readable explanation.
        reason: String,
    },

    /// `storage_id` named a backend the host does not provide a factory
    /// for.
    #[error("unknown storage id `{storage_id}`")]
    UnknownStorageId {
        /// The unresolved storage id.
        storage_id: String,
    },
}
