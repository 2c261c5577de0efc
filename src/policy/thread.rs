//! Thread executor: background loops on the device.
//!
//! A thread method is deployed like any other method, then started inside a
//! small wrapper that calls it in a loop on a `_thread` thread. The wrapper
//! keeps a run table on the device, `_mpy_threads`, mapping thread ids to a
//! run flag. Stopping is cooperative: the flag is cleared and the loop exits
//! after its current iteration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::code::{check_arity, python_tuple};
use super::{MethodId, MethodPolicy, PolicyCategory, PolicyExecutor, RunningThread, Shared};
use crate::classify::{ClassifiedError, ErrorKind};

/// Defines the run table and the loop wrapper if they are missing.
const THREAD_RUNTIME: &str = "\
import _thread
try:
    _mpy_threads
except NameError:
    _mpy_threads = {}
def _mpy_thread_loop(tid, fn, args, limit):
    import time
    start = time.ticks_ms()
    try:
        while _mpy_threads.get(tid):
            fn(*args)
            if limit and time.ticks_diff(time.ticks_ms(), start) >= limit:
                break
    finally:
        _mpy_threads.pop(tid, None)
";

/// Prints `<ids>|<mem_free>|<mem_alloc>`, ids comma separated.
const HEALTH_PROBE: &str = "\
import gc
try:
    _mpy_ids = ','.join([k for k in _mpy_threads if _mpy_threads[k]])
except NameError:
    _mpy_ids = ''
gc.collect()
print('%s|%d|%d' % (_mpy_ids, gc.mem_free(), gc.mem_alloc()))
del _mpy_ids
";

const STOP_ALL: &str = "\
try:
    for _mpy_k in _mpy_threads:
        _mpy_threads[_mpy_k] = False
except NameError:
    pass
";

/// Device-side thread and memory counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadHealth {
    /// Ids of loops the device reports as running.
    pub running: Vec<String>,
    /// Records kept on the host after pruning stopped loops.
    pub tracked: usize,
    /// Records dropped because their loop had ended on the device.
    pub pruned: usize,
    /// `gc.mem_free()` after a collection.
    pub mem_free: u64,
    /// `gc.mem_alloc()` after a collection.
    pub mem_alloc: u64,
}

/// Runs [`ThreadPolicy`](super::ThreadPolicy) methods.
///
/// [`apply`](PolicyExecutor::apply) returns the id of the started loop.
#[derive(Clone)]
pub struct ThreadExecutor {
    shared: Arc<Shared>,
}

impl ThreadExecutor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Ask one loop to stop.
    pub async fn stop(&self, thread_id: &str) -> Result<(), ClassifiedError> {
        if self.shared.state.thread(thread_id).is_none() {
            return Err(ClassifiedError::invalid_request(format!(
                "no running thread {thread_id}"
            )));
        }
        let code = format!(
            "try:\n    _mpy_threads['{thread_id}'] = False\nexcept NameError:\n    pass\n"
        );
        self.run(&code).await?;
        self.shared.state.remove_thread(thread_id);
        tracing::info!(thread_id, "thread stopped");
        Ok(())
    }

    /// Ask every loop to stop. Returns how many records were dropped.
    pub async fn stop_all(&self) -> Result<usize, ClassifiedError> {
        self.run(STOP_ALL).await?;
        let threads = self.shared.state.threads();
        for thread in &threads {
            self.shared.state.remove_thread(&thread.thread_id);
        }
        tracing::info!(count = threads.len(), "all threads stopped");
        Ok(threads.len())
    }

    /// Stop every non-daemon loop, logging failures. Returns how many
    /// stopped.
    pub(crate) async fn stop_non_daemon(&self) -> usize {
        let mut stopped = 0;
        for thread in self.shared.state.threads() {
            if thread.daemon {
                continue;
            }
            match self.stop(&thread.thread_id).await {
                Ok(()) => stopped += 1,
                Err(err) => {
                    tracing::warn!(thread_id = %thread.thread_id, error = %err, "failed to stop thread");
                }
            }
        }
        stopped
    }

    /// Query the device for running loops and memory, and drop records of
    /// loops that have ended.
    pub async fn health(&self) -> Result<ThreadHealth, ClassifiedError> {
        let output = self.run(HEALTH_PROBE).await?;
        let (running, mem_free, mem_alloc) = parse_health(&output).ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::UnknownError,
                format!("unexpected health probe output: {output}"),
            )
        })?;

        let alive: Vec<&str> = running.iter().map(String::as_str).collect();
        let pruned = self.shared.state.retain_threads(&alive);
        Ok(ThreadHealth {
            tracked: self.shared.state.threads().len(),
            running,
            pruned,
            mem_free,
            mem_alloc,
        })
    }

    async fn run(&self, code: &str) -> Result<String, ClassifiedError> {
        self.shared
            .connection
            .execute(code)
            .await
            .map_err(ClassifiedError::from)?
            .into_result()
    }
}

#[async_trait]
impl PolicyExecutor for ThreadExecutor {
    fn category(&self) -> PolicyCategory {
        PolicyCategory::Thread
    }

    async fn apply(&self, method: &MethodId, args: &[Value]) -> Result<String, ClassifiedError> {
        let spec = self.shared.lookup(method, PolicyCategory::Thread)?;
        let MethodPolicy::Thread(policy) = spec.policy().clone() else {
            return Err(ClassifiedError::invalid_request(format!(
                "unrecognized policy for {method}"
            )));
        };
        check_arity(spec.code().parameters().len(), args)?;
        if spec.code().definition(&spec.device_symbol()).is_none() {
            return Err(not_deployable(method));
        }

        // Starts are serialized by the slot, so the count cannot change
        // between this check and the record insert below.
        let mut repl = self.shared.connection.slot().await;
        let running = self.shared.state.thread_count_for(method);
        if running >= policy.max_instances {
            return Err(ClassifiedError::invalid_request(format!(
                "{method} already has {running} of {} allowed instance(s) running",
                policy.max_instances
            )));
        }

        if !repl.capabilities().platform_known() {
            repl.probe().await.map_err(ClassifiedError::from)?;
        }
        if !repl.capabilities().supports_threading {
            return Err(ClassifiedError::not_supported(format!(
                "{method} needs _thread, which {} does not provide",
                repl.capabilities().platform
            )));
        }

        let symbol = self
            .shared
            .deploy(&mut repl, &spec)
            .await?
            .ok_or_else(|| not_deployable(method))?;

        let thread_id = self.shared.state.next_thread_id(method);
        let code = start_code(&thread_id, &symbol, args, policy.max_runtime);
        super::run(&mut repl, &code).await?;
        self.shared.state.insert_thread(RunningThread {
            thread_id: thread_id.clone(),
            method_name: method.clone(),
            started_at: Utc::now(),
            daemon: policy.daemon,
            max_runtime: policy.max_runtime,
        });
        drop(repl);

        tracing::info!(method = %method, thread_id = %thread_id, "thread started");
        Ok(thread_id)
    }
}

fn not_deployable(method: &MethodId) -> ClassifiedError {
    ClassifiedError::invalid_request(format!(
        "{method} must be a deployable function to run as a thread"
    ))
}

fn start_code(thread_id: &str, symbol: &str, args: &[Value], max_runtime: Option<Duration>) -> String {
    let limit = max_runtime.map_or(0, |d| d.as_millis());
    format!(
        "{THREAD_RUNTIME}_mpy_threads['{thread_id}'] = True\n\
         _thread.start_new_thread(_mpy_thread_loop, ('{thread_id}', {symbol}, {}, {limit}))\n",
        python_tuple(args)
    )
}

fn parse_health(output: &str) -> Option<(Vec<String>, u64, u64)> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    let mut fields = line.rsplitn(3, '|');
    let alloc = fields.next()?.parse().ok()?;
    let free = fields.next()?.parse().ok()?;
    let ids = fields.next()?;
    let running = ids
        .split(',')
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();
    Some((running, free, alloc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_code_shape() {
        let code = start_code(
            "blink-1",
            "_mpy_blink_0123abcd",
            &[json!(2)],
            Some(Duration::from_secs(5)),
        );
        assert!(code.starts_with("import _thread\n"));
        assert!(code.contains("_mpy_threads['blink-1'] = True\n"));
        assert!(code.ends_with(
            "_thread.start_new_thread(_mpy_thread_loop, ('blink-1', _mpy_blink_0123abcd, (2,), 5000))\n"
        ));
    }

    #[test]
    fn health_output() {
        assert_eq!(
            parse_health("blink-1,poll-2|51200|10240\r\n"),
            Some((vec!["blink-1".to_string(), "poll-2".to_string()], 51200, 10240))
        );
        assert_eq!(parse_health("|100|200"), Some((vec![], 100, 200)));
        assert_eq!(parse_health("garbage"), None);
        assert_eq!(parse_health(""), None);
    }
}
