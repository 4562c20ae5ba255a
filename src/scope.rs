// SPDX-License-Identifier: Apache-2.0

//! Cancellation/deadline scope threaded through `send` calls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation/deadline context bound to a request.
///
/// A `Scope` is the cancellation root for a request: producer-side
/// cancellation propagates into a retry sleep and the transport call;
/// shutdown cancels a chain-wide scope that preempts retry sleeps but lets
/// in-flight transport calls finish until the transport's own shutdown
/// cancels them (see §5 of the spec).
///
/// Scopes are only ever narrowed (a tighter deadline, a child cancellation
/// token), never widened, as a request moves downstream.
#[derive(Clone)]
pub struct Scope {
    token: CancellationToken,
    deadline: Option<Instant>,
    fields: Arc<HashMap<String, String>>,
}

impl Scope {
    /// Creates a new root scope with no deadline and no cancellation in
    /// effect.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            fields: Arc::new(HashMap::new()),
        }
    }

    /// Creates a root scope carrying the given correlation fields (trace
    /// id, request id, and similar out-of-band metadata).
    #[must_use]
    pub fn with_fields(fields: HashMap<String, String>) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            fields: Arc::new(fields),
        }
    }

    /// Returns a correlation field previously attached to this scope or an
    /// ancestor.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Derives a child scope whose cancellation is linked to this one and
    /// whose deadline is the earlier of this scope's deadline and `at`.
    ///
    /// This is the only way a scope's deadline changes: it can only get
    /// tighter moving downstream, never looser.
    #[must_use]
    pub fn child_with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= at => Some(existing),
            _ => Some(at),
        };
        Self {
            token: self.token.child_token(),
            deadline,
            fields: Arc::clone(&self.fields),
        }
    }

    /// Derives a child scope with the same deadline but its own
    /// cancellation token, linked to this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            fields: Arc::clone(&self.fields),
        }
    }

    /// The absolute deadline in effect for this scope, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True if this scope (or an ancestor) has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True if this scope's deadline, if any, has already passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Cancels this scope and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once this scope is cancelled or its deadline passes,
    /// whichever comes first. Used by the retry sender to interrupt a
    /// backoff sleep and by the queue to bound worker drain time.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_narrows_deadline() {
        let root = Scope::new();
        let near = Instant::now() + std::time::Duration::from_secs(1);
        let far = Instant::now() + std::time::Duration::from_secs(10);

        let child = root.child_with_deadline(far);
        assert_eq!(child.deadline(), Some(far));

        let grandchild = child.child_with_deadline(near);
        assert_eq!(grandchild.deadline(), Some(near));

        // A later deadline than the existing one must not widen the scope.
        let widened_attempt = grandchild.child_with_deadline(far);
        assert_eq!(widened_attempt.deadline(), Some(near));
    }

    #[test]
    fn cancel_propagates_to_children() {
        let root = Scope::new();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_on_expired_deadline() {
        let root = Scope::new();
        let scope = root.child_with_deadline(Instant::now() + std::time::Duration::from_millis(10));
        scope.cancelled().await;
        assert!(scope.is_expired());
    }
}
