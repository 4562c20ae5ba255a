// SPDX-License-Identifier: Apache-2.0

//! The queue stage: decouples producer rate from downstream delivery rate
//! behind a capacity-bounded buffer, in either an in-memory or a
//! host-persisted form.

mod memory;
mod persistent;

pub use memory::MemoryQueueSender;
pub use persistent::PersistentQueueSender;

/// Why a request never reached the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The queue was at capacity and had no waiting consumer to hand the
    /// request to directly.
    QueueFull,
    /// The request's scope was already cancelled or past its deadline when
    /// the queue attempted to dequeue it.
    ScopeExpired,
    /// The downstream chain returned a non-retryable error.
    Permanent,
    /// The retry stage's `max_elapsed` budget was exhausted.
    RetriesExhausted,
}
