//! Per-connection protocol counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Weight of the newest sample in the rolling average.
const AVERAGE_WEIGHT: f64 = 0.2;

/// Counters kept by the protocol engine for one connection.
///
/// Shared with the policy layer through an `Arc`; every method takes
/// `&self`. Reset on reconnect.
#[derive(Debug, Default)]
pub struct ProtocolMetrics {
    successful: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    adjustments: AtomicU64,
    recoveries: AtomicU64,
    exit_faults: AtomicU64,
    bytes_sent: AtomicU64,
    average: Mutex<Option<Duration>>,
}

/// A point-in-time copy of [`ProtocolMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Executions that produced a response.
    pub successful_operations: u64,
    /// Executions that ended in a transport or protocol error.
    pub failed_operations: u64,
    /// Retries after protocol faults.
    pub retry_attempts: u64,
    /// Changes to the adaptive response timeout.
    pub adaptive_adjustments: u64,
    /// Recovery sequences run.
    pub recoveries: u64,
    /// Raw mode exits that did not see the normal prompt.
    pub exit_faults: u64,
    /// Bytes written to the transport.
    pub bytes_sent: u64,
    /// Rolling average execution time in milliseconds.
    pub average_operation_ms: f64,
}

impl ProtocolMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_success(&self, elapsed: Duration) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        let mut average = self.average.lock();
        *average = Some(match *average {
            None => elapsed,
            Some(prev) => prev.mul_f64(1.0 - AVERAGE_WEIGHT) + elapsed.mul_f64(AVERAGE_WEIGHT),
        });
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_adjustment(&self) {
        self.adjustments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exit_fault(&self) {
        self.exit_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Executions that produced a response.
    pub fn successful_operations(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    /// Executions that failed.
    pub fn failed_operations(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Retries after protocol faults.
    pub fn retry_attempts(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Recovery sequences run.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Bytes written to the transport.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Rolling average execution time, if anything has succeeded.
    pub fn average_operation_time(&self) -> Option<Duration> {
        *self.average.lock()
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.successful,
            &self.failed,
            &self.retries,
            &self.adjustments,
            &self.recoveries,
            &self.exit_faults,
            &self.bytes_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.average.lock() = None;
    }

    /// Copy the counters into a serializable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            successful_operations: self.successful_operations(),
            failed_operations: self.failed_operations(),
            retry_attempts: self.retry_attempts(),
            adaptive_adjustments: self.adjustments.load(Ordering::Relaxed),
            recoveries: self.recoveries(),
            exit_faults: self.exit_faults.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent(),
            average_operation_ms: self
                .average_operation_time()
                .map_or(0.0, |d| d.as_secs_f64() * 1000.0),
        }
    }
}

impl MetricsSnapshot {
    /// Total executions attempted.
    pub fn total_operations(&self) -> u64 {
        self.successful_operations + self.failed_operations
    }

    /// Fraction of executions that succeeded, `1.0` when nothing ran.
    pub fn success_rate(&self) -> f64 {
        match self.total_operations() {
            0 => 1.0,
            total => self.successful_operations as f64 / total as f64,
        }
    }
}
