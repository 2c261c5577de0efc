//! The two concurrency primitives every policy goes through.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::protocol::{DeviceCapabilities, ExecutionResult, ProtocolMetrics, RawRepl};
use crate::{Error, Result};

/// One device connection shared between callers.
///
/// - The **execution slot** wraps the [`RawRepl`]. Only the holder of the
///   slot talks to the device, so at most one execution is in flight.
///   Waiters are served in FIFO order and give up their place by dropping
///   the acquire future.
/// - The **exclusive permit** is a single FIFO permit taken by exclusive
///   tasks *before* the slot. Exclusive work therefore runs in arrival
///   order and never overlaps other exclusive work.
#[derive(Debug)]
pub struct Connection {
    slot: Mutex<RawRepl>,
    exclusive: Semaphore,
    metrics: Arc<ProtocolMetrics>,
}

impl Connection {
    /// Wrap an engine.
    pub fn new(repl: RawRepl) -> Self {
        let metrics = Arc::clone(repl.metrics());
        Self {
            slot: Mutex::new(repl),
            exclusive: Semaphore::new(1),
            metrics,
        }
    }

    /// Wait for the execution slot.
    pub async fn slot(&self) -> MutexGuard<'_, RawRepl> {
        self.slot.lock().await
    }

    /// Wait for the exclusive permit.
    pub async fn exclusive(&self) -> Result<SemaphorePermit<'_>> {
        self.exclusive
            .acquire()
            .await
            .map_err(|_| Error::ConnectionUnusable)
    }

    /// Run code in the execution slot.
    pub async fn execute(&self, code: &str) -> Result<ExecutionResult> {
        self.slot().await.execute(code).await
    }

    /// Run code in the execution slot, bounded by `limit` including the wait
    /// for the slot.
    pub async fn execute_timeout(&self, code: &str, limit: Duration) -> Result<ExecutionResult> {
        match tokio::time::timeout(limit, self.execute(code)).await {
            Ok(result) => result,
            Err(_) => {
                self.recover_abandoned().await;
                Err(Error::Timeout(limit))
            }
        }
    }

    /// Run code in the execution slot until `token` is cancelled.
    pub async fn execute_cancellable(
        &self,
        code: &str,
        token: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let outcome = tokio::select! {
            result = self.execute(code) => Some(result),
            _ = token.cancelled() => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                self.recover_abandoned().await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Run recovery if a dropped execution left the engine outside
    /// `Normal`.
    pub(crate) async fn recover_abandoned(&self) {
        if let Err(err) = self.slot().await.recover_if_needed().await {
            tracing::warn!(error = %err, "recovery after abandoned execution failed");
        }
    }

    /// Snapshot of the device capabilities.
    pub async fn capabilities(&self) -> DeviceCapabilities {
        self.slot().await.capabilities().clone()
    }

    /// Counters for this connection, readable without the slot.
    pub fn metrics(&self) -> &Arc<ProtocolMetrics> {
        &self.metrics
    }
}
