// SPDX-License-Identifier: Apache-2.0

//! The persistent queue: the same bounded-buffer-plus-workers shape as
//! [`super::MemoryQueueSender`], backed by a host-supplied [`Storage`]
//! extent so buffered work survives a process restart.

use crate::config::QueueConfig;
use crate::error::SendError;
use crate::queue::DropReason;
use crate::request::{FinishOutcome, Marshal, Request};
use crate::scope::Scope;
use crate::sender::{resolve_storage, Host, Sender};
use crate::storage::{Storage, StorageId};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct Live<T> {
    queue: VecDeque<Request<T>>,
    /// Workers currently blocked on an empty live buffer with no replay
    /// records left, awaiting `notify`. Mutated only while holding the
    /// live lock, so the `C = 0` admission check in `send` can claim a
    /// waiting worker's slot atomically with its decision to admit.
    waiting_workers: usize,
}

struct Shared<T> {
    replay: Mutex<VecDeque<StorageId>>,
    live: Mutex<Live<T>>,
    notify: Notify,
    capacity: usize,
    buffered: AtomicUsize,
    enqueue_failed: AtomicU64,
    closed: AtomicBool,
    next_seq: AtomicU64,
    storage: Arc<dyn Storage>,
}

/// A capacity-bounded queue whose entries are durably written to a
/// [`Storage`] backend before being acknowledged, and replayed from it at
/// startup before any newly submitted request is drained.
///
/// Only the payload is persisted (via [`Marshal`]); a replayed request is
/// given a fresh root [`Scope`] and carries no finished-callback, since
/// the producer that submitted it is gone by the time of a restart.
pub struct PersistentQueueSender<T> {
    shared: Arc<Shared<T>>,
    next: Arc<dyn Sender<T>>,
    storage_id: String,
    num_consumers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: std::sync::Mutex<Duration>,
}

impl<T> PersistentQueueSender<T>
where
    T: Marshal + Send + Sync + 'static,
{
    /// Creates a persistent queue stage wrapping `next`, storing through
    /// the backend named `storage_id` in `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::ConfigError`] if `config.storage_id` names no
    /// backend the host provides, or is absent entirely.
    pub fn new(
        next: Arc<dyn Sender<T>>,
        config: QueueConfig,
        storage: Arc<dyn Storage>,
        storage_id: String,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                replay: Mutex::new(VecDeque::new()),
                live: Mutex::new(Live {
                    queue: VecDeque::new(),
                    waiting_workers: 0,
                }),
                notify: Notify::new(),
                capacity: config.queue_size,
                buffered: AtomicUsize::new(0),
                enqueue_failed: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                storage,
            }),
            next,
            storage_id,
            num_consumers: config.num_consumers.max(1),
            workers: Mutex::new(Vec::new()),
            shutdown_timeout: std::sync::Mutex::new(Duration::from_secs(30)),
        }
    }

    /// Resolves `storage_id` from `host` and constructs a stage wrapping
    /// `next` per `config`.
    pub fn from_host(
        next: Arc<dyn Sender<T>>,
        config: QueueConfig,
        host: &dyn Host,
        storage_id: String,
    ) -> Result<Self, crate::error::ConfigError> {
        let storage = resolve_storage(host, &storage_id)?;
        Ok(Self::new(next, config, storage, storage_id))
    }

    /// Reclaims a request the retry stage gave up on, per the put-back
    /// handshake (Design Note 2): pushed to the front of the live buffer so
    /// it is redelivered ahead of newer submissions, without rewriting its
    /// already-durable storage record.
    ///
    /// If this queue has already begun shutting down there is no worker
    /// left to redeliver to; the request is abandoned without invoking its
    /// finished-callback; since its storage record was never deleted, it
    /// survives for replay the next time this queue starts.
    pub(crate) async fn put_back(&self, request: Request<T>) {
        if self.shared.closed.load(Ordering::Acquire) {
            request.abandon();
            return;
        }
        let _ = self.shared.buffered.fetch_add(1, Ordering::AcqRel);
        self.shared.live.lock().await.queue.push_front(request);
        self.shared.notify.notify_one();
    }

    /// The number of requests currently buffered (replay plus live),
    /// read without synchronization with concurrent `send`/dequeue calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.buffered.load(Ordering::Relaxed)
    }

    /// The configured buffer capacity (`0` means direct hand-off only).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Total requests rejected with [`SendError::QueueFull`] since
    /// construction.
    #[must_use]
    pub fn enqueue_failed(&self) -> u64 {
        self.shared.enqueue_failed.load(Ordering::Relaxed)
    }

    async fn dequeue_one(shared: &Arc<Shared<T>>) -> Option<Request<T>> {
        loop {
            {
                let mut replay = shared.replay.lock().await;
                if let Some(id) = replay.pop_front() {
                    drop(replay);
                    match shared.storage.get(id).await {
                        Ok(Some(bytes)) => match T::unmarshal(&bytes) {
                            Ok(payload) => {
                                let _ = shared.buffered.fetch_sub(1, Ordering::AcqRel);
                                let storage = Arc::clone(&shared.storage);
                                let request = Request::new(payload, Scope::new(), 1)
                                    .chain_finished(move |_outcome| {
                                        let storage = Arc::clone(&storage);
                                        tokio::spawn(async move {
                                            let _ = storage.delete(id).await;
                                        });
                                    });
                                return Some(request);
                            }
                            Err(error) => {
                                error!(%error, storage_id = id, "failed to decode replayed payload, dropping record");
                                let _ = shared.storage.delete(id).await;
                                continue;
                            }
                        },
                        Ok(None) => continue,
                        Err(error) => {
                            error!(%error, storage_id = id, "failed to read replayed record, skipping");
                            continue;
                        }
                    }
                }
            }

            let mut live = shared.live.lock().await;
            if let Some(request) = live.queue.pop_front() {
                let _ = shared.buffered.fetch_sub(1, Ordering::AcqRel);
                return Some(request);
            }
            if shared.closed.load(Ordering::Acquire) {
                return None;
            }
            live.waiting_workers += 1;
            let notified = shared.notify.notified();
            drop(live);
            notified.await;
            let mut live = shared.live.lock().await;
            if live.queue.is_empty() {
                // Nobody claimed this worker's slot while it slept (e.g. a
                // shutdown notification); undo the count. A claimed slot
                // was already decremented by the `send` that admitted
                // straight into it.
                live.waiting_workers = live.waiting_workers.saturating_sub(1);
            }
        }
    }

    async fn worker_loop(shared: Arc<Shared<T>>, next: Arc<dyn Sender<T>>) {
        loop {
            let request = Self::dequeue_one(&shared).await;
            let Some(request) = request else { return };
            if let Err(error) = next.send(request).await {
                if !matches!(error, SendError::Cancelled) {
                    debug!(%error, "downstream chain reported an error for a dequeued request");
                }
            }
        }
    }
}

#[async_trait]
impl<T> Sender<T> for PersistentQueueSender<T>
where
    T: Marshal + Send + Sync + 'static,
{
    async fn send(&self, mut request: Request<T>) -> Result<(), SendError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }

        if self.shared.capacity != 0 && self.shared.buffered.load(Ordering::Acquire) >= self.shared.capacity {
            let _ = self.shared.enqueue_failed.fetch_add(1, Ordering::Relaxed);
            request.finish(FinishOutcome::Dropped(DropReason::QueueFull));
            return Err(SendError::QueueFull);
        }
        if self.shared.capacity == 0 {
            // Claim a waiting worker's slot atomically with the admission
            // decision, under the same lock the worker's own wait/wake
            // path uses, so a second concurrent `send` can never also see
            // room for the one idle worker.
            let mut live = self.shared.live.lock().await;
            if live.waiting_workers == 0 {
                drop(live);
                let _ = self.shared.enqueue_failed.fetch_add(1, Ordering::Relaxed);
                request.finish(FinishOutcome::Dropped(DropReason::QueueFull));
                return Err(SendError::QueueFull);
            }
            live.waiting_workers -= 1;
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::AcqRel);
        let bytes = request.marshal_payload();
        if let Err(error) = self.shared.storage.set(seq, bytes).await {
            if self.shared.capacity == 0 {
                // The claimed slot was never handed off; give it back so
                // the worker it was reserved for is still admittable.
                self.shared.live.lock().await.waiting_workers += 1;
            }
            request.finish(FinishOutcome::Dropped(DropReason::QueueFull));
            return Err(SendError::retryable(error));
        }

        let storage = Arc::clone(&self.shared.storage);
        let request = request.chain_finished(move |_outcome| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let _ = storage.delete(seq).await;
            });
        });

        let _ = self.shared.buffered.fetch_add(1, Ordering::AcqRel);
        self.shared.live.lock().await.queue.push_back(request);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        self.next.start(host).await?;

        *self.shutdown_timeout.lock().expect("shutdown_timeout lock") = host.shutdown_timeout();

        let mut ids = self
            .shared
            .storage
            .list()
            .await
            .map_err(SendError::retryable)?;
        ids.sort_unstable();
        let replay_count = ids.len();
        self.shared.buffered.fetch_add(replay_count, Ordering::AcqRel);
        *self.shared.replay.lock().await = ids.into_iter().collect();
        if replay_count > 0 {
            warn!(count = replay_count, storage_id = %self.storage_id, "replaying buffered requests from storage");
        }

        let mut workers = self.workers.lock().await;
        for _ in 0..self.num_consumers {
            let shared = Arc::clone(&self.shared);
            let next = Arc::clone(&self.next);
            workers.push(tokio::spawn(Self::worker_loop(shared, next)));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SendError> {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();

        let timeout = *self.shutdown_timeout.lock().expect("shutdown_timeout lock");
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("persistent queue worker did not finish draining within the shutdown timeout");
            }
        }

        // Requests still in the live buffer are dropped (and thus reported
        // as shutdown drops) but remain durably stored for replay on the
        // next start.
        self.shared.live.lock().await.queue.clear();

        self.next.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[derive(Debug)]
    struct PlainError(String);
    impl std::fmt::Display for PlainError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for PlainError {}

    impl Marshal for u32 {
        type Error = PlainError;

        fn marshal(&self) -> Vec<u8> {
            self.to_be_bytes().to_vec()
        }

        fn unmarshal(bytes: &[u8]) -> Result<Self, Self::Error> {
            let array: [u8; 4] = bytes
                .try_into()
                .map_err(|_| PlainError("bad length".to_owned()))?;
            Ok(u32::from_be_bytes(array))
        }
    }

    struct CountingSender {
        seen: std::sync::Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Sender<u32> for CountingSender {
        async fn send(&self, mut request: Request<u32>) -> Result<(), SendError> {
            self.seen.lock().expect("lock").push(*request.payload());
            request.finish(FinishOutcome::Delivered);
            Ok(())
        }

        async fn start(&self, _host: &dyn Host) -> Result<(), SendError> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), SendError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn replays_before_draining_live_submissions() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        storage.set(0, 100u32.to_be_bytes().to_vec()).await.expect("seed");
        storage.set(1, 200u32.to_be_bytes().to_vec()).await.expect("seed");

        let next = Arc::new(CountingSender {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let queue = PersistentQueueSender::new(
            next.clone(),
            QueueConfig {
                enabled: true,
                num_consumers: 1,
                queue_size: 10,
                storage_id: Some("disk".to_owned()),
            },
            storage,
            "disk".to_owned(),
        );

        let host = crate::sender::StaticHost::new();
        queue.start(&host).await.expect("start");
        queue
            .send(Request::new(300u32, Scope::new(), 1))
            .await
            .expect("accepted");

        for _ in 0..200 {
            if next.seen.lock().expect("lock").len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let seen = next.seen.lock().expect("lock").clone();
        assert_eq!(&seen[..2], &[100, 200]);
        assert_eq!(seen[2], 300);

        queue.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn put_back_redelivers_without_rewriting_storage() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let next = Arc::new(CountingSender {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let queue = PersistentQueueSender::new(
            next.clone(),
            QueueConfig {
                enabled: true,
                num_consumers: 1,
                queue_size: 10,
                storage_id: Some("disk".to_owned()),
            },
            Arc::clone(&storage),
            "disk".to_owned(),
        );
        let host = crate::sender::StaticHost::new();
        queue.start(&host).await.expect("start");

        queue
            .send(Request::new(7u32, Scope::new(), 1))
            .await
            .expect("accepted");
        assert_eq!(storage.list().await.expect("list"), vec![0]);

        // Simulate the retry stage giving up on a dequeued request: put it
        // back rather than letting it finish, and confirm the storage
        // record it arrived with is untouched.
        let recovered = Request::new(7u32, Scope::new(), 1);
        queue.put_back(recovered).await;
        assert_eq!(storage.list().await.expect("list"), vec![0]);

        for _ in 0..200 {
            if !next.seen.lock().expect("lock").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*next.seen.lock().expect("lock"), vec![7]);

        queue.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn put_back_after_shutdown_abandons_without_finishing() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let next = Arc::new(CountingSender {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let queue = PersistentQueueSender::new(
            next,
            QueueConfig {
                enabled: true,
                num_consumers: 1,
                queue_size: 10,
                storage_id: Some("disk".to_owned()),
            },
            storage,
            "disk".to_owned(),
        );
        let host = crate::sender::StaticHost::new();
        queue.start(&host).await.expect("start");
        queue.shutdown().await.expect("shutdown");

        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished2 = Arc::clone(&finished);
        let request = Request::new(9u32, Scope::new(), 1).with_finished_callback(move |_| {
            finished2.store(true, Ordering::SeqCst);
        });
        queue.put_back(request).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
