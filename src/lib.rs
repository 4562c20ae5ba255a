// SPDX-License-Identifier: Apache-2.0

//! Sender chain for exporting telemetry batches to a remote backend.
//!
//! A [`SenderChainBuilder`] assembles a fixed, ordered pipeline of four
//! stages — queue, observability, retry, timeout — sitting between an
//! in-process producer of telemetry batches and a transport-specific
//! [`Consume`] implementation. The chain decouples production rate from
//! delivery rate, retries transient backend failures with jittered
//! exponential backoff, bounds in-memory resource use via a capacity-limited
//! queue, and can optionally persist buffered work across process restarts
//! through a host-supplied [`Storage`] backend.
//!
//! ```text
//! producer -> queue -> observability -> retry -> timeout -> transport
//! ```
//!
//! This crate does not implement concrete transports, telemetry data
//! models, configuration-file parsing, or process distribution — those are
//! external collaborators reached only through [`Consume`], [`Storage`],
//! and [`Host`].

mod chain;
pub mod config;
mod error;
mod observability;
mod queue;
mod request;
mod retry;
mod scope;
mod sender;
mod storage;
mod timeout;

pub use chain::{SenderChain, SenderChainBuilder};
pub use error::{Cause, ConfigError, SendError};
pub use observability::MetricsSnapshot;
pub use queue::DropReason;
pub use request::{FinishOutcome, Marshal, Request};
pub use scope::Scope;
pub use sender::{Consume, Host, Lifecycle, Sender, StaticHost};
pub use storage::{InMemoryStorage, Storage, StorageFactory, StorageId};
