// SPDX-License-Identifier: Apache-2.0

//! The timeout stage: bounds a single delivery attempt.

use crate::config::TimeoutConfig;
use crate::error::SendError;
use crate::scope::Scope;
use crate::sender::{Attempt, Consume, Host, Lifecycle};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a transport, bounding each attempt to a fixed per-attempt
/// deadline. A zero-duration timeout disables enforcement entirely and
/// this stage becomes a pure pass-through.
pub struct TimeoutSender<T> {
    transport: Arc<dyn Consume<T>>,
    timeout: Duration,
}

impl<T> TimeoutSender<T> {
    /// Creates a timeout stage wrapping `transport` per `config`.
    #[must_use]
    pub fn new(transport: Arc<dyn Consume<T>>, config: TimeoutConfig) -> Self {
        Self {
            transport,
            timeout: config.timeout,
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Lifecycle for TimeoutSender<T> {
    async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        self.transport.start(host).await
    }

    async fn shutdown(&self) -> Result<(), SendError> {
        self.transport.shutdown().await
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Attempt<T> for TimeoutSender<T> {
    async fn attempt(&self, scope: &Scope, payload: &T) -> Result<(), SendError> {
        if self.timeout.is_zero() {
            return self.transport.consume(scope, payload).await;
        }

        let deadline_scope = scope.child_with_deadline(tokio::time::Instant::now() + self.timeout);
        match tokio::time::timeout(self.timeout, self.transport.consume(&deadline_scope, payload)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(SendError::retryable(TimeoutElapsed(self.timeout))),
        }
    }
}

#[derive(Debug)]
struct TimeoutElapsed(Duration);

impl std::fmt::Display for TimeoutElapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delivery attempt exceeded {:?}", self.0)
    }
}

impl std::error::Error for TimeoutElapsed {}
