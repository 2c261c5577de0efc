//! Task executor: cached, exclusive and timed-out calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::state::CacheKey;
use super::{MethodId, MethodPolicy, PolicyCategory, PolicyExecutor, Shared};
use crate::classify::{ClassifiedError, ErrorKind};
use crate::Error;

/// Runs [`TaskPolicy`](super::TaskPolicy) methods.
///
/// An exclusive task takes the exclusive permit before the execution slot
/// and holds both until it finishes or times out. A cache hit returns
/// without touching the device.
#[derive(Clone)]
pub struct TaskExecutor {
    shared: Arc<Shared>,
}

impl TaskExecutor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl PolicyExecutor for TaskExecutor {
    fn category(&self) -> PolicyCategory {
        PolicyCategory::Task
    }

    async fn apply(&self, method: &MethodId, args: &[Value]) -> Result<String, ClassifiedError> {
        let spec = self.shared.lookup(method, PolicyCategory::Task)?;
        let MethodPolicy::Task(policy) = spec.policy().clone() else {
            return Err(ClassifiedError::invalid_request(format!(
                "unrecognized policy for {method}"
            )));
        };

        let key = policy.cache.then(|| CacheKey::new(method, args));
        if let Some(hit) = key.as_ref().and_then(|k| self.shared.state.cached_result(k)) {
            tracing::debug!(method = %method, "task cache hit");
            return Ok(hit);
        }

        let connection = &self.shared.connection;
        let call = async {
            let _permit = if policy.exclusive {
                match connection.exclusive().await {
                    Ok(permit) => Some(permit),
                    Err(err) => return Err(ClassifiedError::from(err)),
                }
            } else {
                None
            };
            let mut repl = connection.slot().await;
            self.shared.invoke(&mut repl, &spec, args).await
        };

        let output = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(method = %method, ?limit, "task timed out");
                    connection.recover_abandoned().await;
                    return Err(ClassifiedError::new(
                        ErrorKind::TimeoutError,
                        format!("{method} did not finish within {limit:?}"),
                    )
                    .with_fault(Error::Timeout(limit)));
                }
            },
            None => call.await?,
        };

        if let Some(key) = key {
            self.shared.state.store_result(key, output.clone());
        }
        Ok(output)
    }
}
