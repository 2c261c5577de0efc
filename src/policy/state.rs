//! Per-connection policy state: deployments, caches, setup record and
//! running threads.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::MethodId;

/// A method whose definition is live on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedMethod {
    /// Hash of the signature the definition was rendered from.
    pub signature_hash: String,
    /// Name the definition is bound to on the device.
    pub device_symbol: String,
    /// When the definition was sent.
    pub deployed_at: DateTime<Utc>,
}

/// A background loop started on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningThread {
    /// Key of the loop in the device-side run table.
    pub thread_id: String,
    /// The method the loop calls.
    pub method_name: MethodId,
    /// When the loop was started.
    pub started_at: DateTime<Utc>,
    /// Left running by teardown.
    pub daemon: bool,
    /// The device stops the loop on its own after this long.
    pub max_runtime: Option<Duration>,
}

/// Key of a cached task result: method plus serialized arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    method: MethodId,
    args: String,
}

impl CacheKey {
    pub(crate) fn new(method: &MethodId, args: &[Value]) -> Self {
        Self {
            method: method.clone(),
            args: Value::Array(args.to_vec()).to_string(),
        }
    }
}

/// State the policy engine keeps for one connection.
///
/// Every map is behind its own lock; entries are inserted whole, so readers
/// never see a partial entry. Nothing here is shared between connections.
#[derive(Debug, Default)]
pub struct SessionState {
    deployments: RwLock<HashMap<MethodId, DeployedMethod>>,
    results: RwLock<HashMap<CacheKey, String>>,
    setup: RwLock<HashMap<MethodId, String>>,
    threads: RwLock<BTreeMap<String, RunningThread>>,
    thread_counter: AtomicU64,
    teardown_running: AtomicBool,
}

impl SessionState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Deployments
    // -------------------------------------------------------------------------

    /// The live deployment of `method`, if any.
    pub fn deployment(&self, method: &MethodId) -> Option<DeployedMethod> {
        self.deployments.read().get(method).cloned()
    }

    pub(crate) fn record_deployment(&self, method: &MethodId, deployed: DeployedMethod) {
        self.deployments.write().insert(method.clone(), deployed);
    }

    // -------------------------------------------------------------------------
    // Task results
    // -------------------------------------------------------------------------

    pub(crate) fn cached_result(&self, key: &CacheKey) -> Option<String> {
        self.results.read().get(key).cloned()
    }

    pub(crate) fn store_result(&self, key: CacheKey, output: String) {
        self.results.write().insert(key, output);
    }

    /// Number of cached task results.
    pub fn cached_results(&self) -> usize {
        self.results.read().len()
    }

    // -------------------------------------------------------------------------
    // Setup
    // -------------------------------------------------------------------------

    /// Output of `method` if it has already run as setup on this connection.
    pub fn setup_output(&self, method: &MethodId) -> Option<String> {
        self.setup.read().get(method).cloned()
    }

    pub(crate) fn record_setup(&self, method: &MethodId, output: String) {
        self.setup.write().insert(method.clone(), output);
    }

    // -------------------------------------------------------------------------
    // Threads
    // -------------------------------------------------------------------------

    /// Snapshot of the threads started on this connection.
    pub fn threads(&self) -> Vec<RunningThread> {
        self.threads.read().values().cloned().collect()
    }

    /// The thread with the given id.
    pub fn thread(&self, thread_id: &str) -> Option<RunningThread> {
        self.threads.read().get(thread_id).cloned()
    }

    pub(crate) fn thread_count_for(&self, method: &MethodId) -> usize {
        self.threads
            .read()
            .values()
            .filter(|t| &t.method_name == method)
            .count()
    }

    pub(crate) fn next_thread_id(&self, method: &MethodId) -> String {
        let n = self.thread_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let stem: String = method
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{stem}-{n}")
    }

    pub(crate) fn insert_thread(&self, thread: RunningThread) {
        self.threads.write().insert(thread.thread_id.clone(), thread);
    }

    pub(crate) fn remove_thread(&self, thread_id: &str) -> Option<RunningThread> {
        self.threads.write().remove(thread_id)
    }

    /// Drop records of threads the device no longer runs.
    pub(crate) fn retain_threads(&self, alive: &[&str]) -> usize {
        let mut threads = self.threads.write();
        let before = threads.len();
        threads.retain(|id, _| alive.contains(&id.as_str()));
        before - threads.len()
    }

    // -------------------------------------------------------------------------
    // Teardown guard
    // -------------------------------------------------------------------------

    /// Mark a teardown pass as running. `None` if one already is.
    pub(crate) fn begin_teardown(&self) -> Option<TeardownGuard<'_>> {
        self.teardown_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TeardownGuard {
                flag: &self.teardown_running,
            })
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Forget cached task results and deployments.
    pub fn clear_caches(&self) {
        self.results.write().clear();
        self.deployments.write().clear();
    }

    /// Forget everything; the device side is gone.
    pub fn reset(&self) {
        self.clear_caches();
        self.setup.write().clear();
        self.threads.write().clear();
    }
}

/// Clears the teardown flag when the pass ends.
pub(crate) struct TeardownGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(name: &str) -> MethodId {
        MethodId::new(name)
    }

    #[test]
    fn cache_key_distinguishes_arguments() {
        let a = CacheKey::new(&id("read"), &[json!(1)]);
        let b = CacheKey::new(&id("read"), &[json!(2)]);
        let c = CacheKey::new(&id("read"), &[json!(1)]);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn teardown_guard_is_exclusive() {
        let state = SessionState::new();
        let guard = state.begin_teardown().unwrap();
        assert!(state.begin_teardown().is_none());
        drop(guard);
        assert!(state.begin_teardown().is_some());
    }

    #[test]
    fn thread_ids_are_unique_and_safe() {
        let state = SessionState::new();
        let first = state.next_thread_id(&id("blink led"));
        let second = state.next_thread_id(&id("blink led"));
        assert_eq!(first, "blink_led-1");
        assert_eq!(second, "blink_led-2");
    }

    #[test]
    fn retain_prunes_dead_threads() {
        let state = SessionState::new();
        for n in 1..=3 {
            state.insert_thread(RunningThread {
                thread_id: format!("poll-{n}"),
                method_name: id("poll"),
                started_at: Utc::now(),
                daemon: true,
                max_runtime: None,
            });
        }
        assert_eq!(state.thread_count_for(&id("poll")), 3);
        assert_eq!(state.retain_threads(&["poll-2"]), 2);
        assert_eq!(state.threads().len(), 1);
        assert!(state.thread("poll-2").is_some());
    }

    #[test]
    fn reset_forgets_everything() {
        let state = SessionState::new();
        state.record_setup(&id("init"), "ok".into());
        state.store_result(CacheKey::new(&id("t"), &[]), "1".into());
        state.record_deployment(
            &id("t"),
            DeployedMethod {
                signature_hash: "abc".into(),
                device_symbol: "_mpy_t_abc".into(),
                deployed_at: Utc::now(),
            },
        );
        state.reset();
        assert!(state.setup_output(&id("init")).is_none());
        assert_eq!(state.cached_results(), 0);
        assert!(state.deployment(&id("t")).is_none());
    }
}
