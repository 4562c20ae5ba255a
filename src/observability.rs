// SPDX-License-Identifier: Apache-2.0

//! The observability stage: counts delivered and failed items and traces
//! each attempt, without altering the downstream result.

use crate::config::ObservabilityConfig;
use crate::error::SendError;
use crate::request::Request;
use crate::sender::{Host, Sender};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info_span;
use tracing::Instrument;

/// A point-in-time read of the counters an [`ObservabilitySender`] and
/// the queue stage ahead of it maintain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Total items (not requests) that completed delivery successfully.
    pub sent_items: u64,
    /// Total items that were dropped after the downstream chain gave up.
    pub send_failed_items: u64,
    /// Total requests rejected by the queue stage with
    /// [`crate::SendError::QueueFull`]. Zero when the queue stage is
    /// disabled.
    pub enqueue_failed_items: u64,
    /// The number of requests currently buffered in the queue stage.
    /// Zero when the queue stage is disabled.
    pub queue_size: u64,
    /// The queue stage's configured capacity. Zero when the queue stage
    /// is disabled.
    pub queue_capacity: u64,
}

/// Wraps the downstream chain with item-count counters and a tracing
/// span per request, mirroring the teacher's `obsreport`-style wrapping
/// of an exporter without owning retry or delivery decisions itself.
pub struct ObservabilitySender<T> {
    next: Arc<dyn Sender<T>>,
    exporter_id: String,
    signal_type: String,
    sent_items: Arc<AtomicU64>,
    send_failed_items: Arc<AtomicU64>,
}

impl<T> ObservabilitySender<T> {
    /// Creates an observability stage wrapping `next`.
    #[must_use]
    pub fn new(next: Arc<dyn Sender<T>>, config: ObservabilityConfig) -> Self {
        Self {
            next,
            exporter_id: config.exporter_id,
            signal_type: config.signal_type,
            sent_items: Arc::new(AtomicU64::new(0)),
            send_failed_items: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reads the current counters. The queue-related fields are left at
    /// zero here; [`crate::SenderChain::metrics`] fills them in from the
    /// queue stage when one is enabled.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sent_items: self.sent_items.load(Ordering::Relaxed),
            send_failed_items: self.send_failed_items.load(Ordering::Relaxed),
            ..MetricsSnapshot::default()
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Sender<T> for ObservabilitySender<T> {
    async fn send(&self, request: Request<T>) -> Result<(), SendError> {
        let item_count = request.item_count() as u64;
        let span = info_span!(
            "export_attempt",
            exporter_id = %self.exporter_id,
            signal_type = %self.signal_type,
            item_count
        );
        let result = self.next.send(request).instrument(span).await;

        match &result {
            Ok(()) => {
                let _ = self.sent_items.fetch_add(item_count, Ordering::Relaxed);
            }
            Err(SendError::Cancelled) => {}
            Err(_) => {
                let _ = self.send_failed_items.fetch_add(item_count, Ordering::Relaxed);
            }
        }
        result
    }

    async fn start(&self, host: &dyn Host) -> Result<(), SendError> {
        self.next.start(host).await
    }

    async fn shutdown(&self) -> Result<(), SendError> {
        self.next.shutdown().await
    }
}
