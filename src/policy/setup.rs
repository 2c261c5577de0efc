//! Setup executor: device initialization, once per connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{MethodId, PolicyCategory, PolicyExecutor, Shared};
use crate::classify::ClassifiedError;

/// Runs [`SetupPolicy`](super::SetupPolicy) methods.
///
/// The first successful run of a method is recorded with its output; later
/// calls return that output without any device I/O. A failed run is not
/// recorded, so it can be retried.
#[derive(Clone)]
pub struct SetupExecutor {
    shared: Arc<Shared>,
}

impl SetupExecutor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Run every setup method in ascending order, ties in registration
    /// order. Methods that already ran are skipped. Stops at the first
    /// failure.
    pub async fn run_all(&self) -> Result<Vec<(MethodId, String)>, ClassifiedError> {
        let mut outputs = Vec::new();
        for spec in self.shared.ordered(PolicyCategory::Setup) {
            let output = self.apply(spec.id(), &[]).await?;
            outputs.push((spec.id().clone(), output));
        }
        tracing::info!(count = outputs.len(), "setup complete");
        Ok(outputs)
    }

    /// Whether `method` has already run on this connection.
    pub fn has_run(&self, method: &MethodId) -> bool {
        self.shared.state.setup_output(method).is_some()
    }
}

#[async_trait]
impl PolicyExecutor for SetupExecutor {
    fn category(&self) -> PolicyCategory {
        PolicyCategory::Setup
    }

    async fn apply(&self, method: &MethodId, args: &[Value]) -> Result<String, ClassifiedError> {
        let spec = self.shared.lookup(method, PolicyCategory::Setup)?;
        if let Some(output) = self.shared.state.setup_output(method) {
            return Ok(output);
        }

        // Concurrent first calls: only one runs, the rest see its record.
        let _setup = self.shared.setup_lock.lock().await;
        if let Some(output) = self.shared.state.setup_output(method) {
            return Ok(output);
        }

        let output = {
            let mut repl = self.shared.connection.slot().await;
            self.shared.invoke(&mut repl, &spec, args).await?
        };
        self.shared.state.record_setup(method, output.clone());
        tracing::debug!(method = %method, "setup ran");
        Ok(output)
    }
}
