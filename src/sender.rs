// SPDX-License-Identifier: Apache-2.0

//! The uniform stage contract (`send`/`start`/`shutdown`) and the
//! transport-facing and host-facing traits the chain is built around.

use crate::error::{ConfigError, SendError};
use crate::request::Request;
use crate::scope::Scope;
use crate::storage::{Storage, StorageFactory};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A stage in the sender chain.
///
/// Implementations must be safe for concurrent callers of `send`. `start`
/// and `shutdown` are idempotent and `shutdown` must be safe to call after
/// a failed `start`.
#[async_trait]
pub trait Sender<T>: Send + Sync {
    /// Submits `request` to this stage. Queue-like stages are
    /// fire-and-forget from the caller's perspective (accept or reject);
    /// all other stages propagate the downstream result.
    async fn send(&self, request: Request<T>) -> Result<(), SendError>;

    /// Starts this stage and everything beneath it in the chain. Called
    /// bottom-up: the transport exporter starts before the queue's workers
    /// begin dequeuing (see §4.1).
    async fn start(&self, host: &dyn Host) -> Result<(), SendError>;

    /// Shuts this stage down. Errors are accumulated rather than
    /// short-circuited by the chain (see [`crate::chain::SenderChain::shutdown`]).
    async fn shutdown(&self) -> Result<(), SendError>;
}

/// Lifecycle hooks for a transport that has nothing else to contribute
/// beyond [`Consume`]. Kept separate from `Consume` so a transport used
/// only in tests need not implement hooks it doesn't need.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Starts the transport. The default implementation is a no-op.
    async fn start(&self, _host: &dyn Host) -> Result<(), SendError> {
        Ok(())
    }

    /// Shuts the transport down. The default implementation is a no-op.
    async fn shutdown(&self) -> Result<(), SendError> {
        Ok(())
    }
}

/// The transport-facing contract: the "next consumer" plugged in beyond
/// the timeout stage.
///
/// `payload` is borrowed rather than consumed: a failed attempt leaves it
/// intact for the retry stage to present again, with no `Clone` bound
/// required on the payload type.
#[async_trait]
pub trait Consume<T>: Lifecycle {
    /// Delivers `payload` to the remote backend under `scope`. Errors may
    /// be tagged [`SendError::Permanent`] or [`SendError::Throttle`];
    /// anything else is treated as [`SendError::Retryable`].
    async fn consume(&self, scope: &Scope, payload: &T) -> Result<(), SendError>;
}

/// The borrowing counterpart of [`Sender`] used between the retry stage
/// and everything beneath it.
///
/// Retrying a request means presenting the same payload to the transport
/// more than once. Since [`Sender::send`] takes a [`Request<T>`] by value,
/// reusing it across attempts would need `T: Clone`; borrowing instead
/// means the retry stage keeps owning the request across attempts and no
/// `Clone` bound is needed on payload types.
#[async_trait]
pub(crate) trait Attempt<T>: Lifecycle {
    /// Makes one delivery attempt, bounded by whatever deadline `scope`
    /// carries.
    async fn attempt(&self, scope: &Scope, payload: &T) -> Result<(), SendError>;
}

/// Capability object handed to every stage's `start`, through which a
/// stage resolves a named storage backend from a host-provided factory
/// map rather than a process-wide registry (see Design Note 3).
pub trait Host: Send + Sync {
    /// Resolves a storage backend by id, or `None` if the host has no
    /// factory registered for it.
    fn storage(&self, storage_id: &str) -> Option<Arc<dyn Storage>>;

    /// The bound on how long the chain's shutdown may take waiting for the
    /// transport, used to size the queue's worker-drain timeout.
    fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}

/// A straightforward [`Host`] backed by a fixed map of storage factories,
/// suitable for both production wiring and tests.
pub struct StaticHost {
    factories: HashMap<String, StorageFactory>,
    shutdown_timeout: Duration,
}

impl StaticHost {
    /// Creates a host with no storage factories registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    /// Registers a storage factory under `storage_id`.
    #[must_use]
    pub fn with_storage(mut self, storage_id: impl Into<String>, factory: StorageFactory) -> Self {
        let _ = self.factories.insert(storage_id.into(), factory);
        self
    }

    /// Overrides the shutdown timeout bound advertised to stages.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for StaticHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for StaticHost {
    fn storage(&self, storage_id: &str) -> Option<Arc<dyn Storage>> {
        self.factories.get(storage_id).and_then(|f| f(storage_id).ok())
    }

    fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

/// Resolves a storage backend from a [`Host`], surfacing an unknown id as
/// a [`ConfigError`].
pub(crate) fn resolve_storage(
    host: &dyn Host,
    storage_id: &str,
) -> Result<Arc<dyn Storage>, ConfigError> {
    host.storage(storage_id)
        .ok_or_else(|| ConfigError::UnknownStorageId {
            storage_id: storage_id.to_owned(),
        })
}
