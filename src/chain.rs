// SPDX-License-Identifier: Apache-2.0

//! Assembles the four stages into one fixed, immutable pipeline and
//! exposes it as a single [`Sender`].

use crate::config::{
    CapabilitiesConfig, ObservabilityConfig, Options, QueueConfig, RetryConfig, TimeoutConfig,
};
use crate::error::{ConfigError, Message, SendError};
use crate::observability::{MetricsSnapshot, ObservabilitySender};
use crate::queue::MemoryQueueSender;
use crate::request::{Marshal, Request};
use crate::retry::{PutBackSlot, RetrySender};
use crate::sender::{resolve_storage, Attempt, Consume, Host, Sender};
use crate::storage::Storage;
use crate::timeout::TimeoutSender;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Builds a [`SenderChain`] from a transport and a set of stage options.
///
/// The chain's link order — queue, then observability, then retry, then
/// timeout, then transport — is fixed and cannot be reordered or
/// selectively skipped through this type; only each stage's presence
/// (enabled/disabled) and parameters are configurable. Storage for a
/// persistent queue is resolved lazily, the first time
/// [`SenderChain::start`] runs, not here — `build` only validates that
/// the configuration is internally consistent.
pub struct SenderChainBuilder<T> {
    transport: Option<Arc<dyn Consume<T>>>,
    options: Options,
}

impl<T> SenderChainBuilder<T>
where
    T: Marshal + Send + Sync + 'static,
{
    /// Creates a builder with every stage at its default configuration
    /// and no transport attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            transport: None,
            options: Options::default(),
        }
    }

    /// Attaches the transport the chain ultimately delivers to.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Consume<T>>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the full option set in one call.
    #[must_use]
    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Overrides the timeout stage's configuration.
    #[must_use]
    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Overrides the retry stage's configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = retry;
        self
    }

    /// Overrides the queue stage's configuration.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.options.queue = queue;
        self
    }

    /// Overrides the observability stage's identity labels.
    #[must_use]
    pub fn with_observability(mut self, observability: ObservabilityConfig) -> Self {
        self.options.observability = observability;
        self
    }

    /// Overrides the capabilities advertised to the producer.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: CapabilitiesConfig) -> Self {
        self.options.capabilities = capabilities;
        self
    }

    /// Validates the configuration and assembles the chain.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTransport`] if no transport was
    /// attached, [`ConfigError::InvalidRetryParameters`] if the retry
    /// stage is enabled with non-positive intervals or an out-of-range
    /// multiplier or jitter factor, and
    /// [`ConfigError::InvalidQueueCapacity`] if the queue stage is enabled
    /// with zero consumer workers (a configuration that can never drain).
    pub fn build(self) -> Result<SenderChain<T>, ConfigError> {
        let transport = self.transport.ok_or(ConfigError::MissingTransport)?;
        validate_retry(&self.options.retry)?;
        validate_queue(&self.options.queue)?;

        // The put-back slot lets the retry stage hand an exhausted request
        // back to the queue for persistence (Design Note 2) without either
        // stage reaching into the other's internals. It starts empty; the
        // persistent queue variant fills it once its storage backend is
        // resolved in `start` (the in-memory variant never fills it, so the
        // retry stage finishes exhausted requests itself, matching §4.5).
        let put_back: Arc<PutBackSlot<T>> = Arc::new(PutBackSlot::new());

        // Cancelled by `SenderChain::shutdown` to preempt a worker parked in
        // the retry stage's backoff sleep (§4.1(a) / §5), distinct from a
        // request's own scope: this token is never cancelled by anything
        // short of the chain itself shutting down.
        let shutdown = CancellationToken::new();

        let timeout: Arc<dyn Attempt<T>> =
            Arc::new(TimeoutSender::new(transport, self.options.timeout));
        let retry: Arc<dyn Sender<T>> = Arc::new(RetrySender::new(
            timeout,
            self.options.retry,
            Arc::clone(&put_back),
            shutdown.clone(),
        ));
        let observability = Arc::new(ObservabilitySender::new(retry, self.options.observability));

        let queue: Option<Arc<QueueStage<T>>> = if self.options.queue.enabled {
            Some(match self.options.queue.storage_id.clone() {
                Some(storage_id) => Arc::new(QueueStage::persistent(
                    Arc::clone(&observability) as Arc<dyn Sender<T>>,
                    self.options.queue.clone(),
                    storage_id,
                    put_back,
                )),
                None => Arc::new(QueueStage::memory(
                    Arc::clone(&observability) as Arc<dyn Sender<T>>,
                    self.options.queue.clone(),
                )),
            })
        } else {
            None
        };

        let top: Arc<dyn Sender<T>> = match &queue {
            Some(queue) => Arc::clone(queue) as Arc<dyn Sender<T>>,
            None => Arc::clone(&observability) as Arc<dyn Sender<T>>,
        };

        Ok(SenderChain {
            top,
            observability,
            queue,
            shutdown,
            capabilities: self.options.capabilities,
        })
    }
}

impl<T> Default for SenderChainBuilder<T>
where
    T: Marshal + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn validate_retry(config: &RetryConfig) -> Result<(), ConfigError> {
    if !config.enabled {
        return Ok(());
    }
    let reason = if config.initial_interval.is_zero() {
        Some("initial_interval must be greater than zero")
    } else if config.max_interval.is_zero() {
        Some("max_interval must be greater than zero")
    } else if config.max_elapsed.is_zero() {
        Some("max_elapsed must be greater than zero")
    } else if config.multiplier < 1.0 {
        Some("multiplier must be at least 1.0")
    } else if !(0.0..=1.0).contains(&config.randomization_factor) {
        Some("randomization_factor must be between 0.0 and 1.0")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ConfigError::InvalidRetryParameters {
            reason: reason.to_owned(),
        }),
        None => Ok(()),
    }
}

fn validate_queue(config: &QueueConfig) -> Result<(), ConfigError> {
    if config.enabled && config.num_consumers == 0 {
        return Err(ConfigError::InvalidQueueCapacity {
            reason: "num_consumers must be at least 1 when the queue stage is enabled".to_owned(),
        });
    }
    Ok(())
}

/// The top of the chain when the queue stage is enabled: either the
/// in-memory buffer, or a persistent buffer whose storage backend is
/// resolved from the [`Host`] the first time [`Sender::start`] runs.
enum QueueStage<T> {
    Memory(MemoryQueueSender<T>),
    Persistent {
        next: Arc<dyn Sender<T>>,
        config: QueueConfig,
        storage_id: String,
        put_back: Arc<PutBackSlot<T>>,
        inner: OnceCell<Arc<crate::queue::PersistentQueueSender<T>>>,
    },
}

impl<T> QueueStage<T>
where
    T: Marshal + Send + Sync + 'static,
{
    fn memory(next: Arc<dyn Sender<T>>, config: QueueConfig) -> Self {
        Self::Memory(MemoryQueueSender::new(next, config))
    }

    fn persistent(
        next: Arc<dyn Sender<T>>,
        config: QueueConfig,
        storage_id: String,
        put_back: Arc<PutBackSlot<T>>,
    ) -> Self {
        Self::Persistent {
            next,
            config,
            storage_id,
            put_back,
            inner: OnceCell::new(),
        }
    }

    /// The number of requests currently buffered. Zero for a persistent
    /// queue whose storage has not yet been resolved by `start`.
    fn queue_len(&self) -> u64 {
        match self {
            Self::Memory(queue) => queue.len() as u64,
            Self::Persistent { inner, .. } => {
                inner.get().map_or(0, |queue| queue.len() as u64)
            }
        }
    }

    /// The configured buffer capacity, known from configuration alone so
    /// it is available even before a persistent queue's `start` runs.
    fn queue_capacity(&self) -> u64 {
        match self {
            Self::Memory(queue) => queue.capacity() as u64,
            Self::Persistent { config, .. } => config.queue_size as u64,
        }
    }

    /// Total requests rejected with [`SendError::QueueFull`] since
    /// construction.
    fn queue_enqueue_failed(&self) -> u64 {
        match self {
            Self::Memory(queue) => queue.enqueue_failed(),
            Self::Persistent { inner, .. } => inner.get().map_or(0, |queue| queue.enqueue_failed()),
        }
    }
}

#[async_trait]
impl<T> Sender<T> for QueueStage<T>
where
    T: Marshal + Send + Sync + 'static,
{
    async fn send(&self, request: Request<T>) -> Result<(), SendError> {
        match self {
            Self::Memory(queue) => queue.send(request).await,
            Self::Persistent { inner, .. } => match inner.get() {
                Some(queue) => queue.send(request).await,
                None => Err(SendError::Closed),
            },
        }
    }

    async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        match self {
            Self::Memory(queue) => queue.start(host).await,
            Self::Persistent {
                next,
                config,
                storage_id,
                put_back,
                inner,
            } => {
                let storage: Arc<dyn Storage> =
                    resolve_storage(host, storage_id).map_err(SendError::permanent)?;
                let queue = Arc::new(crate::queue::PersistentQueueSender::new(
                    Arc::clone(next),
                    config.clone(),
                    storage,
                    storage_id.clone(),
                ));
                queue.start(host).await?;

                // Fill the retry stage's put-back slot now that this
                // queue's storage is resolved: an exhausted request is
                // handed to `put_back` rather than finished in place, so
                // it survives for replay on the next `start`.
                let for_put_back = Arc::clone(&queue);
                put_back.set(Arc::new(move |request| {
                    let queue = Arc::clone(&for_put_back);
                    tokio::spawn(async move { queue.put_back(request).await });
                }));

                inner
                    .set(queue)
                    .map_err(|_| SendError::permanent(Message::from("queue already started")))?;
                Ok(())
            }
        }
    }

    async fn shutdown(&self) -> Result<(), SendError> {
        match self {
            Self::Memory(queue) => queue.shutdown().await,
            Self::Persistent { inner, .. } => match inner.get() {
                Some(queue) => queue.shutdown().await,
                None => Ok(()),
            },
        }
    }
}

/// The assembled, immutable sender chain: queue, observability, retry,
/// and timeout wrapped around a transport.
///
/// Construct one through [`SenderChainBuilder`]. `start` must be called
/// once before `send`; `shutdown` drains buffered work and stops every
/// stage, in the reverse of the order `start` brought them up (see §4.1
/// / §5).
pub struct SenderChain<T> {
    top: Arc<dyn Sender<T>>,
    observability: Arc<ObservabilitySender<T>>,
    queue: Option<Arc<QueueStage<T>>>,
    shutdown: CancellationToken,
    capabilities: CapabilitiesConfig,
}

impl<T> SenderChain<T>
where
    T: Marshal + Send + Sync + 'static,
{
    /// Submits a request to the chain.
    pub async fn send(&self, request: Request<T>) -> Result<(), SendError> {
        self.top.send(request).await
    }

    /// Starts every stage, bottom-up: the transport first, then timeout,
    /// retry, observability, and finally the queue's worker pool (so a
    /// worker never dequeues into a transport that isn't ready yet).
    pub async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        self.top.start(host).await
    }

    /// Shuts every stage down and drains buffered work. Requests still
    /// queued at shutdown are dropped and reported to their
    /// finished-callback as [`crate::FinishOutcome::ShutdownDropped`],
    /// unless buffered in a persistent queue, where they remain on disk
    /// for replay on the next `start`.
    ///
    /// Cancels the chain-wide shutdown scope first, so a worker parked in
    /// the retry stage's backoff sleep is woken and pushed back (or
    /// finished as a shutdown drop) before the queue's own drain timeout
    /// runs out, rather than sleeping out its full backoff as an orphaned
    /// task that would otherwise call the transport after this method has
    /// already returned.
    pub async fn shutdown(&self) -> Result<(), SendError> {
        self.shutdown.cancel();
        self.top.shutdown().await
    }

    /// A snapshot of the delivered/failed item counters, plus the queue
    /// stage's current size, capacity, and rejection count when a queue
    /// stage is enabled.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.observability.snapshot();
        if let Some(queue) = &self.queue {
            snapshot.enqueue_failed_items = queue.queue_enqueue_failed();
            snapshot.queue_size = queue.queue_len();
            snapshot.queue_capacity = queue.queue_capacity();
        }
        snapshot
    }

    /// The capabilities this chain advertises to its producer.
    #[must_use]
    pub fn capabilities(&self) -> CapabilitiesConfig {
        self.capabilities
    }
}
