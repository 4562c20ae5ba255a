// SPDX-License-Identifier: Apache-2.0

//! The configuration surface: one option group per optional stage, plus
//! the capabilities the chain advertises to its producer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-attempt deadline enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// The per-attempt deadline. `Duration::ZERO` disables the timeout
    /// stage (pure pass-through).
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Backoff-with-jitter retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether the retry stage is active. Disabled means an
    /// error-logging pass-through.
    pub enabled: bool,
    /// The delay before the first retry attempt.
    #[serde(with = "duration_secs")]
    pub initial_interval: Duration,
    /// The upper bound the backoff delay is capped at.
    #[serde(with = "duration_secs")]
    pub max_interval: Duration,
    /// The total elapsed-time budget across all retry attempts.
    #[serde(with = "duration_secs")]
    pub max_elapsed: Duration,
    /// The jitter fraction `r`; each sleep is uniform in
    /// `[delay * (1 - r), delay * (1 + r)]`.
    pub randomization_factor: f64,
    /// The multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(5 * 60),
            randomization_factor: 0.5,
            multiplier: 1.5,
        }
    }
}

/// Queue admission and buffering policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Whether the queue stage is active. Disabled means an
    /// error-logging pass-through with synchronous send.
    pub enabled: bool,
    /// The number of worker tasks dequeuing into the downstream chain.
    pub num_consumers: usize,
    /// The maximum number of requests buffered at once.
    pub queue_size: usize,
    /// The storage backend id to resolve from the host for persistent
    /// buffering, or `None` for the bounded in-memory variant.
    pub storage_id: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_consumers: 10,
            queue_size: 1000,
            storage_id: None,
        }
    }
}

/// Identity labels attached to the observability stage's per-attempt span
/// and used to scope the metrics it emits to one exporter and one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// The identity of the transport this chain delivers to, e.g.
    /// `"otlp-http"`. Attached to every per-attempt span.
    pub exporter_id: String,
    /// The telemetry signal (traces, metrics, logs) this chain carries.
    pub signal_type: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            exporter_id: "unknown".to_owned(),
            signal_type: "unknown".to_owned(),
        }
    }
}

/// Capabilities advertised to the upstream producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    /// Whether this chain mutates the request payload in place. Declared
    /// so a producer that retains a copy for its own purposes knows
    /// whether that copy may have diverged.
    pub mutates_data: bool,
}

/// The complete, frozen option set applied at construction. A
/// [`crate::SenderChainBuilder`] reads these once in `build`; nothing in
/// the assembled chain re-reads this struct afterward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Timeout stage configuration.
    pub timeout: TimeoutConfig,
    /// Retry stage configuration.
    pub retry: RetryConfig,
    /// Queue stage configuration.
    pub queue: QueueConfig,
    /// Observability stage identity labels.
    pub observability: ObservabilityConfig,
    /// Capabilities advertised upstream.
    pub capabilities: CapabilitiesConfig,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
