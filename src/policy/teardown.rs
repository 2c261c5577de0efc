//! Teardown executor: best-effort cleanup in reverse order.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{MethodId, MethodPolicy, PolicyCategory, PolicyExecutor, Shared, ThreadExecutor};
use crate::classify::ClassifiedError;

/// What a teardown pass did.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    /// Methods that ran cleanly, in the order they ran.
    pub completed: Vec<MethodId>,
    /// Failures that were logged and skipped.
    pub failures: Vec<(MethodId, ClassifiedError)>,
    /// Non-daemon threads stopped after the methods ran.
    pub threads_stopped: usize,
}

/// Runs [`TeardownPolicy`](super::TeardownPolicy) methods.
#[derive(Clone)]
pub struct TeardownExecutor {
    shared: Arc<Shared>,
}

impl TeardownExecutor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Run every teardown method in strict reverse of (order, registration),
    /// then stop the non-daemon threads.
    ///
    /// A failing method with `ignore_errors` is logged and skipped; one
    /// without it ends the pass and its error is returned. A pass started
    /// while another is running is skipped.
    pub async fn run_all(&self) -> Result<TeardownReport, ClassifiedError> {
        let Some(_running) = self.shared.state.begin_teardown() else {
            tracing::info!("teardown already in progress, skipping");
            return Ok(TeardownReport {
                skipped: true,
                ..TeardownReport::default()
            });
        };

        let mut report = TeardownReport::default();
        for spec in self.shared.ordered(PolicyCategory::Teardown).into_iter().rev() {
            let ignore_errors = match spec.policy() {
                MethodPolicy::Teardown(policy) => policy.ignore_errors,
                _ => true,
            };
            match self.run_step(spec.id()).await {
                Ok(_) => report.completed.push(spec.id().clone()),
                Err(err) if ignore_errors => {
                    tracing::warn!(method = %spec.id(), error = %err, "teardown step failed, continuing");
                    report.failures.push((spec.id().clone(), err));
                }
                Err(err) => {
                    tracing::warn!(method = %spec.id(), error = %err, "teardown step failed, stopping");
                    return Err(err);
                }
            }
        }

        let threads = ThreadExecutor::new(Arc::clone(&self.shared));
        report.threads_stopped = threads.stop_non_daemon().await;

        tracing::info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            threads_stopped = report.threads_stopped,
            "teardown complete"
        );
        Ok(report)
    }

    async fn run_step(&self, method: &MethodId) -> Result<String, ClassifiedError> {
        let spec = self.shared.lookup(method, PolicyCategory::Teardown)?;
        let mut repl = self.shared.connection.slot().await;
        self.shared.invoke(&mut repl, &spec, &[]).await
    }
}

#[async_trait]
impl PolicyExecutor for TeardownExecutor {
    fn category(&self) -> PolicyCategory {
        PolicyCategory::Teardown
    }

    /// Run one teardown method. With `ignore_errors` a failure is logged and
    /// an empty output returned.
    async fn apply(&self, method: &MethodId, args: &[Value]) -> Result<String, ClassifiedError> {
        let spec = self.shared.lookup(method, PolicyCategory::Teardown)?;
        let ignore_errors = match spec.policy() {
            MethodPolicy::Teardown(policy) => policy.ignore_errors,
            _ => true,
        };

        let result = {
            let mut repl = self.shared.connection.slot().await;
            self.shared.invoke(&mut repl, &spec, args).await
        };
        match result {
            Err(err) if ignore_errors => {
                tracing::warn!(method = %method, error = %err, "teardown failed, ignored");
                Ok(String::new())
            }
            other => other,
        }
    }
}
