// SPDX-License-Identifier: Apache-2.0

//! The bounded in-memory queue: decouples producer rate from delivery
//! rate behind a fixed-capacity buffer drained by a worker pool.

use crate::config::QueueConfig;
use crate::error::SendError;
use crate::queue::DropReason;
use crate::request::{FinishOutcome, Request};
use crate::sender::{Host, Sender};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Buffer<T> {
    queue: VecDeque<Request<T>>,
    /// Workers currently blocked on an empty buffer, awaiting `notify`.
    /// Mutated only while holding the buffer lock, so the `C = 0`
    /// admission check in `send` can claim a waiting worker's slot
    /// atomically with its decision to admit.
    waiting_workers: usize,
}

struct Shared<T> {
    buffer: Mutex<Buffer<T>>,
    notify: Notify,
    capacity: usize,
    enqueue_failed: AtomicU64,
    closed: AtomicBool,
}

/// A fixed-capacity, in-memory FIFO queue sitting in front of the rest of
/// the chain, drained by a fixed pool of worker tasks.
///
/// A capacity of zero is a valid, if unusual, configuration: `send`
/// succeeds only when a worker is already idle and waiting to take the
/// request directly, and is rejected otherwise (see §4.2 edge cases).
pub struct MemoryQueueSender<T> {
    shared: Arc<Shared<T>>,
    next: Arc<dyn Sender<T>>,
    num_consumers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: std::sync::Mutex<Duration>,
}

impl<T: Send + Sync + 'static> MemoryQueueSender<T> {
    /// Creates a queue stage wrapping `next` per `config`.
    #[must_use]
    pub fn new(next: Arc<dyn Sender<T>>, config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                buffer: Mutex::new(Buffer {
                    queue: VecDeque::new(),
                    waiting_workers: 0,
                }),
                notify: Notify::new(),
                capacity: config.queue_size,
                enqueue_failed: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            next,
            num_consumers: config.num_consumers.max(1),
            workers: Mutex::new(Vec::new()),
            shutdown_timeout: std::sync::Mutex::new(Duration::from_secs(30)),
        }
    }

    /// The number of requests currently buffered, read without
    /// synchronization with concurrent `send`/dequeue calls. Callers must
    /// treat this as eventually consistent, not exact (Open Question
    /// resolution: no extra synchronization is added for this).
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.buffer.try_lock().map(|g| g.queue.len()).unwrap_or(0)
    }

    /// True if the queue currently holds no buffered requests, subject to
    /// the same eventual-consistency caveat as [`MemoryQueueSender::len`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
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

    async fn worker_loop(shared: Arc<Shared<T>>, next: Arc<dyn Sender<T>>) {
        loop {
            let request = {
                let mut guard = shared.buffer.lock().await;
                let found = loop {
                    if let Some(request) = guard.queue.pop_front() {
                        break Some(request);
                    }
                    if shared.closed.load(Ordering::Acquire) {
                        break None;
                    }
                    guard.waiting_workers += 1;
                    let notified = shared.notify.notified();
                    drop(guard);
                    notified.await;
                    guard = shared.buffer.lock().await;
                    if guard.queue.is_empty() {
                        // Nobody claimed this worker's slot while it slept
                        // (e.g. a shutdown notification); undo the count.
                        // A claimed slot was already decremented by the
                        // `send` that admitted straight into it.
                        guard.waiting_workers = guard.waiting_workers.saturating_sub(1);
                    }
                };
                match found {
                    Some(request) => request,
                    None => return,
                }
            };

            if let Err(error) = next.send(request).await {
                if !matches!(error, SendError::Cancelled) {
                    debug!(%error, "downstream chain reported an error for a dequeued request");
                }
            }
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Sender<T> for MemoryQueueSender<T> {
    async fn send(&self, mut request: Request<T>) -> Result<(), SendError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed);
        }

        let mut guard = self.shared.buffer.lock().await;
        let has_room = if self.shared.capacity == 0 {
            // Claim a waiting worker's slot atomically with the admission
            // decision, under the same lock the worker's own wait/wake
            // path uses, so a second concurrent `send` can never also
            // see room for the one idle worker.
            if guard.waiting_workers > 0 {
                guard.waiting_workers -= 1;
                true
            } else {
                false
            }
        } else {
            guard.queue.len() < self.shared.capacity
        };

        if !has_room {
            drop(guard);
            let _ = self.shared.enqueue_failed.fetch_add(1, Ordering::Relaxed);
            request.finish(FinishOutcome::Dropped(DropReason::QueueFull));
            return Err(SendError::QueueFull);
        }

        guard.queue.push_back(request);
        drop(guard);
        self.shared.notify.notify_one();
        Ok(())
    }

    async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        // Bottom-up start order (§4.1): everything beneath this stage is
        // already running before workers begin dequeuing.
        self.next.start(host).await?;

        *self.shutdown_timeout.lock().expect("shutdown_timeout lock") = host.shutdown_timeout();

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
                warn!("queue worker did not finish draining within the shutdown timeout");
            }
        }

        // Anything still buffered is dropped here; `Request::drop` reports
        // it as a shutdown drop to its finished-callback.
        self.shared.buffer.lock().await.queue.clear();

        self.next.shutdown().await
    }
}
