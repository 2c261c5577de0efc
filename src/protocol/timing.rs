//! Adaptive response timeout.

use std::time::Duration;

/// Multiple of the baseline latency used to seed a new connection.
const LATENCY_MULTIPLIER: u32 = 20;

/// Smallest timeout a latency seed may produce.
const MIN_SEEDED_TIMEOUT: Duration = Duration::from_millis(250);

/// Response timeout that grows on retries and shrinks on success.
///
/// Each escalation doubles the timeout up to the maximum. Each relaxation
/// after an escalation halves it back toward the starting value. With
/// adaptation disabled the timeout stays at its starting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveTimeout {
    start: Duration,
    base: Duration,
    max: Duration,
    current: Duration,
    enabled: bool,
}

impl AdaptiveTimeout {
    /// Create a timeout starting at `base` that may grow to `max`.
    pub fn new(base: Duration, max: Duration, enabled: bool) -> Self {
        let max = max.max(base);
        Self {
            start: base,
            base,
            max,
            current: base,
            enabled,
        }
    }

    /// The timeout to use for the next response wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// The value relaxation returns to.
    pub fn start(&self) -> Duration {
        self.start
    }

    /// Double the timeout after a retry or a response timeout. Returns
    /// whether it changed.
    pub fn escalate(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        let next = self.current.saturating_mul(2).min(self.max);
        let changed = next != self.current;
        self.current = next;
        changed
    }

    /// Halve the timeout toward the start after a success. Returns whether it
    /// changed.
    pub fn relax(&mut self) -> bool {
        if !self.enabled || self.current <= self.start {
            return false;
        }
        self.current = (self.current / 2).max(self.start);
        true
    }

    /// Start from a timeout derived from a previously measured latency.
    ///
    /// The seed is `max(latency * 20, 250ms)`, never above the configured
    /// base.
    pub fn seed(&mut self, latency: Duration) {
        if !self.enabled || latency.is_zero() {
            return;
        }
        let seeded = latency
            .saturating_mul(LATENCY_MULTIPLIER)
            .max(MIN_SEEDED_TIMEOUT)
            .min(self.base);
        self.start = seeded;
        self.current = seeded;
    }

    /// Forget escalation and any seed.
    pub fn reset(&mut self) {
        self.start = self.base;
        self.current = self.base;
    }
}
