//! Configuration structs for sessions and the forwarding runtime.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound for the cancellation wait slice.
pub const MAX_WAIT_SLICE_MS: u64 = 1_000;

/// Runtime configuration for a single remote session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline applied to every engine-facing operation. `None` disables it.
    pub timeout_ms: Option<u64>,
    /// Length of a bounded wait used wherever cancellation must be observed.
    pub wait_slice_ms: u64,
    /// Interval between keepalive probes. `None` disables keepalives.
    pub keepalive_interval_ms: Option<u64>,
    /// Consecutive keepalive failures tolerated before the session is dropped.
    pub keepalive_max_failures: u32,
    /// Attempt cap for each step of a polite channel close.
    pub close_attempt_cap: u32,
    /// Tuning for port forwarding bridges.
    pub forward: ForwardTuning,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(8_000),
            wait_slice_ms: 250,
            keepalive_interval_ms: None,
            keepalive_max_failures: 8,
            close_attempt_cap: 64,
            forward: ForwardTuning::default(),
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Wait slice clamped to `1..=MAX_WAIT_SLICE_MS` milliseconds.
    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.clamp(1, MAX_WAIT_SLICE_MS))
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice_ms = slice.as_millis() as u64;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration, max_failures: u32) -> Self {
        self.keepalive_interval_ms = Some(interval.as_millis() as u64);
        self.keepalive_max_failures = max_failures;
        self
    }
}

/// Buffer and pacing parameters for forward bridges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardTuning {
    /// Size of each pump's transfer buffer.
    pub buffer_size: usize,
    /// Bytes a pump may move before it yields to the opposite direction.
    pub cycle_byte_cap: usize,
    /// Backlog requested for remote listeners.
    pub listen_backlog: u32,
}

impl Default for ForwardTuning {
    fn default() -> Self {
        Self {
            buffer_size: 131_072,
            cycle_byte_cap: 524_288,
            listen_backlog: 16,
        }
    }
}
