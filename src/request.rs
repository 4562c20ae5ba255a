// SPDX-License-Identifier: Apache-2.0

//! The unit of work flowing through the sender chain.

use crate::queue::DropReason;
use crate::scope::Scope;

/// The outcome reported to a request's finished-callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    /// The request was handed off to the transport and the transport
    /// reported success.
    Delivered,
    /// The request was dropped before or during delivery.
    Dropped(DropReason),
    /// The request was still in flight when shutdown drained it without a
    /// delivery attempt completing.
    ShutdownDropped,
}

/// Byte-encoding contract required of payloads stored by the persistent
/// queue. The round trip must reproduce the payload exactly; the request's
/// scope is not part of the encoding and is recreated fresh on restart.
pub trait Marshal: Sized {
    /// The error type produced by a failed decode.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Encodes this payload to a stable byte form.
    fn marshal(&self) -> Vec<u8>;

    /// Decodes a payload previously produced by [`Marshal::marshal`].
    fn unmarshal(bytes: &[u8]) -> Result<Self, Self::Error>;
}

type FinishedCallback = Box<dyn FnOnce(FinishOutcome) + Send>;

/// A single outbound batch of telemetry plus the metadata the chain needs
/// to move, retry, and eventually retire it.
///
/// `item_count` is fixed at construction and never changes. The
/// finished-callback, if present, fires exactly once — whichever stage
/// retires the request (successful delivery, a permanent drop, or a
/// shutdown drain) takes it out of its `Option` and calls it, so a second
/// call site can never observe it still there.
pub struct Request<T> {
    payload: T,
    scope: Scope,
    item_count: usize,
    on_finished: Option<FinishedCallback>,
}

impl<T> Request<T> {
    /// Creates a new request. Panics if `item_count` is zero — the spec
    /// requires `item_count >= 1`.
    #[must_use]
    pub fn new(payload: T, scope: Scope, item_count: usize) -> Self {
        assert!(item_count >= 1, "request item_count must be >= 1");
        Self {
            payload,
            scope,
            item_count,
            on_finished: None,
        }
    }

    /// Attaches a finished-callback invoked exactly once when this request
    /// leaves the pipeline.
    #[must_use]
    pub fn with_finished_callback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FinishOutcome) + Send + 'static,
    {
        self.on_finished = Some(Box::new(f));
        self
    }

    /// The request's payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes the request, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// The request's cancellation/deadline scope.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The number of telemetry items this request carries, for queue
    /// accounting and drop metrics.
    #[must_use]
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    /// Finalizes the request with the given outcome, invoking the
    /// finished-callback if one is attached. A no-op if already finished
    /// or if no callback was attached.
    pub fn finish(&mut self, outcome: FinishOutcome) {
        if let Some(cb) = self.on_finished.take() {
            cb(outcome);
        }
    }

    /// Replaces the payload, keeping scope, item count, and the pending
    /// finished-callback. Used by the persistent queue when re-hydrating a
    /// request from storage with a freshly decoded payload.
    pub(crate) fn with_payload(self, payload: T) -> Self {
        Self { payload, ..self }
    }

    /// Discards this request without invoking its finished-callback. Used
    /// by the persistent queue when a record is pushed back for replay
    /// after a restart: the storage record survives, but the in-process
    /// producer that submitted it will never be notified, since a replayed
    /// request after restart carries no callback of its own either.
    pub(crate) fn abandon(mut self) {
        self.on_finished = None;
    }

    /// Runs `before` ahead of whatever finished-callback is already
    /// attached, still firing exactly once. Used by the persistent queue
    /// to delete a request's storage record before handing the outcome
    /// to the producer's own callback.
    pub(crate) fn chain_finished<F>(mut self, before: F) -> Self
    where
        F: FnOnce(&FinishOutcome) + Send + 'static,
    {
        let existing = self.on_finished.take();
        self.on_finished = Some(Box::new(move |outcome| {
            before(&outcome);
            if let Some(cb) = existing {
                cb(outcome);
            }
        }));
        self
    }
}

impl<T: Marshal> Request<T> {
    /// Encodes this request's payload for persistence. The scope is not
    /// encoded; on restart a fresh root [`Scope`] is attached instead.
    #[must_use]
    pub fn marshal_payload(&self) -> Vec<u8> {
        self.payload.marshal()
    }
}

impl<T> Drop for Request<T> {
    fn drop(&mut self) {
        // Defend invariant 3 of §8: a request must not silently vanish
        // without its finished-callback firing. If a stage forgot to call
        // `finish`, treat it as a shutdown drop rather than losing the
        // notification entirely.
        if let Some(cb) = self.on_finished.take() {
            cb(FinishOutcome::ShutdownDropped);
        }
    }
}
