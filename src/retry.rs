// SPDX-License-Identifier: Apache-2.0

//! The retry stage: jittered exponential backoff around a single
//! downstream [`Attempt`].

use crate::config::RetryConfig;
use crate::error::SendError;
use crate::queue::DropReason;
use crate::request::{FinishOutcome, Request};
use crate::sender::{Attempt, Host, Lifecycle, Sender};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A put-back hook, supplied by the queue stage and invoked by the retry
/// stage when it gives up on a request (permanent error, disabled retry, or
/// `max_elapsed` exhaustion).
///
/// Design Note 2: rather than the retry sender reaching into the queue's
/// internals, the queue hands it this one function at wiring time. The
/// in-memory queue never fills the slot, so the hook is a no-op there and
/// the retry sender falls back to finishing the request itself; the
/// persistent queue fills it once its storage backend is resolved at
/// `start`, so exhausted requests are handed back for replay instead of
/// being dropped.
pub(crate) type PutBackFn<T> = Arc<dyn Fn(Request<T>) + Send + Sync>;

/// Deferred slot for a [`PutBackFn`], set at most once.
///
/// A plain `Option` set at construction would work for the in-memory queue,
/// but the persistent queue's backend is only resolved inside `start` (see
/// `chain.rs`), after the retry stage already exists — so the hook itself
/// must be fillable after the fact.
pub(crate) struct PutBackSlot<T>(OnceCell<PutBackFn<T>>);

impl<T> PutBackSlot<T> {
    /// Creates an empty slot.
    pub(crate) fn new() -> Self {
        Self(OnceCell::new())
    }

    /// Fills the slot. A second call is ignored: only one queue ever wires
    /// itself to a given retry stage.
    pub(crate) fn set(&self, f: PutBackFn<T>) {
        let _ = self.0.set(f);
    }

    /// Hands `request` to the hook if one is registered, returning `None`
    /// (ownership moved to the queue). Returns `Some(request)` unchanged if
    /// no hook is registered, so the caller remains responsible for
    /// finishing it.
    pub(crate) fn try_give_back(&self, request: Request<T>) -> Option<Request<T>> {
        match self.0.get() {
            Some(f) => {
                f(request);
                None
            }
            None => Some(request),
        }
    }
}

/// Wraps a downstream [`Attempt`] with jittered exponential backoff.
///
/// When `enabled` is `false` the stage becomes a single-attempt
/// pass-through that still classifies and logs the outcome, matching the
/// spec's "retry disabled" behavior of a best-effort, non-retried send.
pub struct RetrySender<T> {
    next: Arc<dyn Attempt<T>>,
    config: RetryConfig,
    put_back: Arc<PutBackSlot<T>>,
    shutdown: CancellationToken,
}

impl<T> RetrySender<T> {
    /// Creates a retry stage wrapping `next` per `config`. `put_back` is the
    /// handshake the queue stage uses to reclaim an exhausted request for
    /// persistence; pass an empty [`PutBackSlot`] when there is none.
    /// `shutdown` is the chain-wide scope cancelled by
    /// [`crate::SenderChain::shutdown`]; it preempts an in-flight backoff
    /// sleep so a worker never outlives the chain's own shutdown (see §4.1 /
    /// §5), distinct from `request.scope()`, which only ever reflects the
    /// producer's own cancellation of that one request.
    #[must_use]
    pub fn new(
        next: Arc<dyn Attempt<T>>,
        config: RetryConfig,
        put_back: Arc<PutBackSlot<T>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { next, config, put_back, shutdown }
    }

    fn next_delay(&self, previous: Duration) -> Duration {
        let scaled = previous.mul_f64(self.config.multiplier);
        let capped = scaled.min(self.config.max_interval);
        let r = self.config.randomization_factor;
        if r <= 0.0 {
            return capped;
        }
        let jitter = rand::random::<f64>() * 2.0 * r - r;
        let factor = (1.0 + jitter).max(0.0);
        capped.mul_f64(factor)
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Sender<T> for RetrySender<T> {
    async fn send(&self, mut request: Request<T>) -> Result<(), SendError> {
        let start = Instant::now();
        let mut delay = self.config.initial_interval;

        loop {
            if request.scope().is_cancelled() || request.scope().is_expired() {
                request.finish(FinishOutcome::Dropped(DropReason::ScopeExpired));
                return Err(SendError::Cancelled);
            }

            let attempt_result = self.next.attempt(request.scope(), request.payload()).await;

            let error = match attempt_result {
                Ok(()) => {
                    request.finish(FinishOutcome::Delivered);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !self.config.enabled || error.is_permanent() {
                warn!(error = %error, "delivery failed, not retrying");
                if let Some(mut request) = self.put_back.try_give_back(request) {
                    request.finish(FinishOutcome::Dropped(DropReason::Permanent));
                }
                return Err(error);
            }

            // The cutoff must be checked before sleeping: a request whose
            // backoff would only complete after the budget is exhausted
            // must fail now rather than sleep first and discover it late.
            // A throttle hint only ever extends the wait past the backoff
            // already in progress, never shortens it.
            let wait = error.throttle_delay().map_or(delay, |t| t.max(delay));
            if start.elapsed() + wait >= self.config.max_elapsed {
                warn!(error = %error, "retry budget exhausted");
                if let Some(mut request) = self.put_back.try_give_back(request) {
                    request.finish(FinishOutcome::Dropped(DropReason::RetriesExhausted));
                }
                return Err(error);
            }

            debug!(error = %error, delay = ?wait, "retrying after delay");
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = request.scope().cancelled() => {
                    request.finish(FinishOutcome::Dropped(DropReason::ScopeExpired));
                    return Err(SendError::Cancelled);
                }
                () = self.shutdown.cancelled() => {
                    debug!("shutdown preempted an in-flight backoff sleep");
                    if let Some(mut request) = self.put_back.try_give_back(request) {
                        request.finish(FinishOutcome::ShutdownDropped);
                    }
                    return Err(SendError::Cancelled);
                }
            }

            delay = self.next_delay(delay);
        }
    }

    async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        self.next.start(host).await
    }

    async fn shutdown(&self) -> Result<(), SendError> {
        self.next.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::Scope;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyAttempt {
        failures_before_success: usize,
        calls: AtomicUsize,
        permanent_after: Option<usize>,
    }

    #[async_trait]
    impl Lifecycle for FlakyAttempt {}

    #[async_trait]
    impl Attempt<u32> for FlakyAttempt {
        async fn attempt(&self, _scope: &Scope, _payload: &u32) -> Result<(), SendError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cutoff) = self.permanent_after {
                if call >= cutoff {
                    return Err(SendError::permanent(crate::error::Message::from("nope")));
                }
            }
            if call < self.failures_before_success {
                Err(SendError::retryable(crate::error::Message::from("not yet")))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let attempt = Arc::new(FlakyAttempt {
            failures_before_success: 2,
            calls: AtomicUsize::new(0),
            permanent_after: None,
        });
        let sender = RetrySender::new(
            attempt.clone(),
            RetryConfig {
                enabled: true,
                initial_interval: Duration::from_millis(10),
                max_interval: Duration::from_millis(100),
                max_elapsed: Duration::from_secs(60),
                randomization_factor: 0.0,
                multiplier: 2.0,
            },
            Arc::new(PutBackSlot::new()),
            CancellationToken::new(),
        );

        let outcome = Arc::new(Mutex::new(None));
        let outcome2 = Arc::clone(&outcome);
        let request = Request::new(1u32, Scope::new(), 1)
            .with_finished_callback(move |o| *outcome2.lock().expect("lock") = Some(o));

        sender.send(request).await.expect("eventually succeeds");
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*outcome.lock().expect("lock"), Some(FinishOutcome::Delivered));
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let attempt = Arc::new(FlakyAttempt {
            failures_before_success: 10,
            calls: AtomicUsize::new(0),
            permanent_after: Some(0),
        });
        let sender = RetrySender::new(
            attempt.clone(),
            RetryConfig {
                enabled: true,
                ..RetryConfig::default()
            },
            Arc::new(PutBackSlot::new()),
            CancellationToken::new(),
        );

        let request = Request::new(1u32, Scope::new(), 1);
        let result = sender.send(request).await;
        assert!(matches!(result, Err(SendError::Permanent(_))));
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retry_budget() {
        let attempt = Arc::new(FlakyAttempt {
            failures_before_success: usize::MAX,
            calls: AtomicUsize::new(0),
            permanent_after: None,
        });
        let sender = RetrySender::new(
            attempt.clone(),
            RetryConfig {
                enabled: true,
                initial_interval: Duration::from_secs(10),
                max_interval: Duration::from_secs(10),
                max_elapsed: Duration::from_secs(15),
                randomization_factor: 0.0,
                multiplier: 1.0,
            },
            Arc::new(PutBackSlot::new()),
            CancellationToken::new(),
        );

        let request = Request::new(1u32, Scope::new(), 1);
        let result = sender.send(request).await;
        assert!(matches!(result, Err(SendError::Retryable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_hands_request_to_put_back_hook_instead_of_finishing_it() {
        let attempt = Arc::new(FlakyAttempt {
            failures_before_success: usize::MAX,
            calls: AtomicUsize::new(0),
            permanent_after: None,
        });
        let put_back = Arc::new(PutBackSlot::new());
        let recovered: Arc<Mutex<Option<Request<u32>>>> = Arc::new(Mutex::new(None));
        let recovered2 = Arc::clone(&recovered);
        put_back.set(Arc::new(move |req| {
            *recovered2.lock().expect("lock") = Some(req);
        }));

        let sender = RetrySender::new(
            attempt,
            RetryConfig {
                enabled: true,
                initial_interval: Duration::from_secs(10),
                max_interval: Duration::from_secs(10),
                max_elapsed: Duration::from_secs(15),
                randomization_factor: 0.0,
                multiplier: 1.0,
            },
            put_back,
            CancellationToken::new(),
        );

        let finished = Arc::new(Mutex::new(None));
        let finished2 = Arc::clone(&finished);
        let request = Request::new(1u32, Scope::new(), 1)
            .with_finished_callback(move |o| *finished2.lock().expect("lock") = Some(o));

        let result = sender.send(request).await;
        assert!(matches!(result, Err(SendError::Retryable(_))));
        // The hook took ownership; the retry sender never called finish
        // itself, so the producer's callback has not fired yet.
        assert_eq!(*finished.lock().expect("lock"), None);
        assert!(recovered.lock().expect("lock").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_preempts_an_in_flight_backoff_sleep() {
        let attempt = Arc::new(FlakyAttempt {
            failures_before_success: usize::MAX,
            calls: AtomicUsize::new(0),
            permanent_after: None,
        });
        let shutdown = CancellationToken::new();
        let sender = RetrySender::new(
            attempt.clone(),
            RetryConfig {
                enabled: true,
                initial_interval: Duration::from_secs(600),
                max_interval: Duration::from_secs(600),
                max_elapsed: Duration::from_secs(3600),
                randomization_factor: 0.0,
                multiplier: 1.0,
            },
            Arc::new(PutBackSlot::new()),
            shutdown.clone(),
        );

        // Cancelled up front: with the clock paused, a `tokio::time::sleep`
        // this long never resolves on its own, so the test only completes
        // if the shutdown branch of the `select!` wins.
        shutdown.cancel();

        let finished = Arc::new(Mutex::new(None));
        let finished2 = Arc::clone(&finished);
        let request = Request::new(1u32, Scope::new(), 1)
            .with_finished_callback(move |o| *finished2.lock().expect("lock") = Some(o));

        let result = sender.send(request).await;
        assert!(matches!(result, Err(SendError::Cancelled)));
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*finished.lock().expect("lock"), Some(FinishOutcome::ShutdownDropped));
    }
}
