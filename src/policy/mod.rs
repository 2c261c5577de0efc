//! The execution policy engine.
//!
//! Callers register each method up front with a [`MethodSpec`]: an
//! identity, one [`MethodPolicy`], and a [`CodeProvider`]. Invocations name
//! the method explicitly and the engine applies the policy on top of the
//! protocol engine:
//!
//! | Policy     | Behavior                                                    |
//! |------------|-------------------------------------------------------------|
//! | `Task`     | optional result cache, optional exclusive permit, timeout   |
//! | `Setup`    | runs once per connection, ascending `order`                 |
//! | `Thread`   | background loop on the device, stop and health probes       |
//! | `Teardown` | best effort, strict reverse `order`, one pass at a time     |
//!
//! Every category shares the deployment cache: a deployable method is sent
//! once and afterwards called by a device-side symbol derived from its
//! signature hash.
//!
//! # Example
//!
//! ```ignore
//! use libmpy::policy::{MethodSpec, PythonFunction, TaskPolicy};
//! use serde_json::json;
//!
//! device.register(MethodSpec::task(
//!     "read_adc",
//!     TaskPolicy::new().cached(),
//!     PythonFunction::new("import machine\nreturn machine.ADC(pin).read_u16()").param("pin"),
//! ))?;
//!
//! let value = device.call(&"read_adc".into(), &[json!(26)]).await?;
//! ```

mod code;
mod connection;
mod setup;
mod state;
mod task;
mod teardown;
mod thread;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::classify::ClassifiedError;
use crate::protocol::RawRepl;

pub use code::{python_literal, python_tuple, CodeProvider, InlineCode, PythonFunction};
pub use connection::Connection;
pub use setup::SetupExecutor;
pub use state::{DeployedMethod, RunningThread, SessionState};
pub use task::TaskExecutor;
pub use teardown::{TeardownExecutor, TeardownReport};
pub use thread::{ThreadExecutor, ThreadHealth};

/// Prefix of every symbol the engine binds on the device.
pub const SYMBOL_PREFIX: &str = "_mpy_";

/// Hex digits of the signature hash embedded in a device symbol.
const SYMBOL_HASH_LEN: usize = 8;

/// Identity of a registered method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodId(pub String);

impl MethodId {
    /// Create a new MethodId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        MethodId(id.into())
    }

    /// Get the method ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MethodId {
    fn from(s: String) -> Self {
        MethodId(s)
    }
}

impl From<&str> for MethodId {
    fn from(s: &str) -> Self {
        MethodId(s.to_string())
    }
}

impl AsRef<str> for MethodId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Policies
// =============================================================================

/// An ad hoc unit of work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPolicy {
    /// Cache results by method and arguments.
    pub cache: bool,
    /// Never run concurrently with other exclusive tasks.
    pub exclusive: bool,
    /// Bound on permit wait plus execution.
    pub timeout: Option<Duration>,
    /// Stem of the device-side symbol instead of the method id.
    pub name: Option<String>,
}

impl TaskPolicy {
    /// A task with no caching, exclusivity or timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache results.
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    /// Take the exclusive permit.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Bound the call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Device-side symbol stem.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Device initialization that runs once per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPolicy {
    /// Position in [`PolicyEngine::run_all_setup`]; ties keep registration
    /// order.
    pub order: i32,
}

/// A loop run in the background on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPolicy {
    /// Keep running through a teardown pass.
    pub daemon: bool,
    /// Concurrent instances allowed for the method.
    pub max_instances: usize,
    /// The device ends the loop by itself after this long.
    pub max_runtime: Option<Duration>,
}

impl Default for ThreadPolicy {
    fn default() -> Self {
        Self {
            daemon: true,
            max_instances: 1,
            max_runtime: None,
        }
    }
}

/// Best-effort cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownPolicy {
    /// Teardown runs in descending order; ties in reverse registration order.
    pub order: i32,
    /// Log and continue on failure instead of stopping the pass.
    pub ignore_errors: bool,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            order: 0,
            ignore_errors: true,
        }
    }
}

/// The declared intent of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum MethodPolicy {
    /// See [`TaskPolicy`].
    Task(TaskPolicy),
    /// See [`SetupPolicy`].
    Setup(SetupPolicy),
    /// See [`ThreadPolicy`].
    Thread(ThreadPolicy),
    /// See [`TeardownPolicy`].
    Teardown(TeardownPolicy),
}

impl MethodPolicy {
    /// The category this policy belongs to.
    pub fn category(&self) -> PolicyCategory {
        match self {
            MethodPolicy::Task(_) => PolicyCategory::Task,
            MethodPolicy::Setup(_) => PolicyCategory::Setup,
            MethodPolicy::Thread(_) => PolicyCategory::Thread,
            MethodPolicy::Teardown(_) => PolicyCategory::Teardown,
        }
    }
}

/// Policy category, used to route a method to its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCategory {
    Task,
    Setup,
    Thread,
    Teardown,
}

impl fmt::Display for PolicyCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyCategory::Task => "task",
            PolicyCategory::Setup => "setup",
            PolicyCategory::Thread => "thread",
            PolicyCategory::Teardown => "teardown",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Registration
// =============================================================================

/// Name and parameter names of a method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSignature {
    pub name: String,
    pub parameters: Vec<String>,
}

/// A method registered with the engine.
#[derive(Clone)]
pub struct MethodSpec {
    id: MethodId,
    policy: MethodPolicy,
    code: Arc<dyn CodeProvider>,
}

impl MethodSpec {
    /// Register `code` under `id` with `policy`.
    pub fn new(
        id: impl Into<MethodId>,
        policy: MethodPolicy,
        code: impl CodeProvider + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            policy,
            code: Arc::new(code),
        }
    }

    /// A task method.
    pub fn task(id: impl Into<MethodId>, policy: TaskPolicy, code: impl CodeProvider + 'static) -> Self {
        Self::new(id, MethodPolicy::Task(policy), code)
    }

    /// A setup method with the given order.
    pub fn setup(id: impl Into<MethodId>, order: i32, code: impl CodeProvider + 'static) -> Self {
        Self::new(id, MethodPolicy::Setup(SetupPolicy { order }), code)
    }

    /// A thread method.
    pub fn thread(
        id: impl Into<MethodId>,
        policy: ThreadPolicy,
        code: impl CodeProvider + 'static,
    ) -> Self {
        Self::new(id, MethodPolicy::Thread(policy), code)
    }

    /// A teardown method.
    pub fn teardown(
        id: impl Into<MethodId>,
        policy: TeardownPolicy,
        code: impl CodeProvider + 'static,
    ) -> Self {
        Self::new(id, MethodPolicy::Teardown(policy), code)
    }

    /// The method identity.
    pub fn id(&self) -> &MethodId {
        &self.id
    }

    /// The declared policy.
    pub fn policy(&self) -> &MethodPolicy {
        &self.policy
    }

    /// The code provider.
    pub fn code(&self) -> &Arc<dyn CodeProvider> {
        &self.code
    }

    /// Name and parameter names.
    pub fn signature(&self) -> MethodSignature {
        MethodSignature {
            name: self.id.0.clone(),
            parameters: self.code.parameters().to_vec(),
        }
    }

    /// SHA-256 over the signature and the code fingerprint, hex encoded.
    pub fn signature_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0.as_bytes());
        hasher.update([0u8]);
        for param in self.code.parameters() {
            hasher.update(param.as_bytes());
            hasher.update([b',']);
        }
        hasher.update([0u8]);
        hasher.update(self.code.fingerprint().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Device-side symbol: stem plus the start of the signature hash.
    pub fn device_symbol(&self) -> String {
        let stem = match &self.policy {
            MethodPolicy::Task(TaskPolicy {
                name: Some(name), ..
            }) => name.as_str(),
            _ => self.id.as_str(),
        };
        let stem: String = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        let hash = self.signature_hash();
        format!("{SYMBOL_PREFIX}{stem}_{}", &hash[..SYMBOL_HASH_LEN])
    }
}

impl fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("id", &self.id)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Registry {
    methods: HashMap<MethodId, (MethodSpec, usize)>,
    next_index: usize,
}

// =============================================================================
// Engine
// =============================================================================

/// An executor for one policy category.
#[async_trait]
pub trait PolicyExecutor: Send + Sync {
    /// The category this executor serves.
    fn category(&self) -> PolicyCategory;

    /// Apply the method's policy and run it with `args`.
    ///
    /// Fails with [`ErrorKind::InvalidRequest`](crate::ErrorKind::InvalidRequest)
    /// without touching the device when the method is not registered under
    /// this category or renders empty code.
    async fn apply(&self, method: &MethodId, args: &[Value]) -> Result<String, ClassifiedError>;
}

pub(crate) struct Shared {
    connection: Arc<Connection>,
    registry: RwLock<Registry>,
    state: SessionState,
    setup_lock: Mutex<()>,
}

impl Shared {
    /// Find a method registered under `category`.
    fn lookup(
        &self,
        method: &MethodId,
        category: PolicyCategory,
    ) -> Result<MethodSpec, ClassifiedError> {
        let registry = self.registry.read();
        match registry.methods.get(method) {
            Some((spec, _)) if spec.policy.category() == category => Ok(spec.clone()),
            Some((spec, _)) => Err(ClassifiedError::invalid_request(format!(
                "unrecognized policy for {method}: registered as {}, invoked as {category}",
                spec.policy.category()
            ))),
            None => Err(ClassifiedError::invalid_request(format!(
                "unrecognized policy for {method}: method is not registered"
            ))),
        }
    }

    /// Methods of `category` in (order, registration) order.
    fn ordered(&self, category: PolicyCategory) -> Vec<MethodSpec> {
        let registry = self.registry.read();
        let mut specs: Vec<(i32, usize, MethodSpec)> = registry
            .methods
            .values()
            .filter(|(spec, _)| spec.policy.category() == category)
            .map(|(spec, index)| {
                let order = match spec.policy {
                    MethodPolicy::Setup(p) => p.order,
                    MethodPolicy::Teardown(p) => p.order,
                    _ => 0,
                };
                (order, *index, spec.clone())
            })
            .collect();
        specs.sort_by_key(|(order, index, _)| (*order, *index));
        specs.into_iter().map(|(_, _, spec)| spec).collect()
    }

    /// Render, deploy if needed, and run a method in the held slot.
    async fn invoke(
        &self,
        repl: &mut RawRepl,
        spec: &MethodSpec,
        args: &[Value],
    ) -> Result<String, ClassifiedError> {
        let symbol = spec.device_symbol();
        let call = spec.code.invocation(&symbol, args)?;
        if call.trim().is_empty() {
            return Err(ClassifiedError::invalid_request(format!(
                "{} rendered empty code",
                spec.id
            )));
        }

        self.deploy(repl, spec).await?;
        run(repl, &call).await
    }

    /// Send the method's definition unless the same signature is already
    /// live. Returns the device symbol, or `None` for inline code.
    async fn deploy(
        &self,
        repl: &mut RawRepl,
        spec: &MethodSpec,
    ) -> Result<Option<String>, ClassifiedError> {
        let symbol = spec.device_symbol();
        let Some(definition) = spec.code.definition(&symbol) else {
            return Ok(None);
        };

        let hash = spec.signature_hash();
        if let Some(live) = self.state.deployment(&spec.id) {
            if live.signature_hash == hash {
                return Ok(Some(live.device_symbol));
            }
            tracing::debug!(method = %spec.id, old = %live.device_symbol, "signature changed, redeploying");
        }

        run(repl, &definition).await?;
        self.state.record_deployment(
            &spec.id,
            DeployedMethod {
                signature_hash: hash,
                device_symbol: symbol.clone(),
                deployed_at: Utc::now(),
            },
        );
        tracing::debug!(method = %spec.id, symbol = %symbol, "method deployed");
        Ok(Some(symbol))
    }
}

/// Execute and fold the outcome into one `Result`.
async fn run(repl: &mut RawRepl, code: &str) -> Result<String, ClassifiedError> {
    repl.execute(code)
        .await
        .map_err(ClassifiedError::from)?
        .into_result()
}

/// Registers methods and applies their policies on one connection.
///
/// Cloning is cheap; clones share the registry and the session state.
#[derive(Clone)]
pub struct PolicyEngine {
    shared: Arc<Shared>,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("methods", &self.shared.registry.read().methods.len())
            .field("state", &self.shared.state)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Create an engine with its own session state over `connection`.
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection,
                registry: RwLock::new(Registry::default()),
                state: SessionState::new(),
                setup_lock: Mutex::new(()),
            }),
        }
    }

    /// Register a method. Fails if the id is already taken.
    pub fn register(&self, spec: MethodSpec) -> Result<(), ClassifiedError> {
        let mut registry = self.shared.registry.write();
        if registry.methods.contains_key(&spec.id) {
            return Err(ClassifiedError::invalid_request(format!(
                "{} is already registered",
                spec.id
            )));
        }
        let index = registry.next_index;
        registry.next_index += 1;
        tracing::debug!(method = %spec.id, category = %spec.policy.category(), "method registered");
        registry.methods.insert(spec.id.clone(), (spec, index));
        Ok(())
    }

    /// Replace the code of a registered method, keeping its policy and
    /// position. A changed signature is redeployed on the next call.
    pub fn redefine(
        &self,
        method: &MethodId,
        code: impl CodeProvider + 'static,
    ) -> Result<(), ClassifiedError> {
        let mut registry = self.shared.registry.write();
        let (spec, _) = registry.methods.get_mut(method).ok_or_else(|| {
            ClassifiedError::invalid_request(format!("{method} is not registered"))
        })?;
        spec.code = Arc::new(code);
        Ok(())
    }

    /// The policy registered for `method`.
    pub fn policy(&self, method: &MethodId) -> Option<MethodPolicy> {
        self.shared
            .registry
            .read()
            .methods
            .get(method)
            .map(|(spec, _)| spec.policy.clone())
    }

    /// Route `method` to the executor of its category.
    pub async fn apply(&self, method: &MethodId, args: &[Value]) -> Result<String, ClassifiedError> {
        let category = self
            .policy(method)
            .map(|p| p.category())
            .ok_or_else(|| {
                ClassifiedError::invalid_request(format!(
                    "unrecognized policy for {method}: method is not registered"
                ))
            })?;
        self.executor(category).apply(method, args).await
    }

    /// The executor serving `category`.
    pub fn executor(&self, category: PolicyCategory) -> Box<dyn PolicyExecutor> {
        match category {
            PolicyCategory::Task => Box::new(self.tasks()),
            PolicyCategory::Setup => Box::new(self.setup()),
            PolicyCategory::Thread => Box::new(self.threads()),
            PolicyCategory::Teardown => Box::new(self.teardown()),
        }
    }

    /// Task executor.
    pub fn tasks(&self) -> TaskExecutor {
        TaskExecutor::new(Arc::clone(&self.shared))
    }

    /// Setup executor.
    pub fn setup(&self) -> SetupExecutor {
        SetupExecutor::new(Arc::clone(&self.shared))
    }

    /// Thread executor.
    pub fn threads(&self) -> ThreadExecutor {
        ThreadExecutor::new(Arc::clone(&self.shared))
    }

    /// Teardown executor.
    pub fn teardown(&self) -> TeardownExecutor {
        TeardownExecutor::new(Arc::clone(&self.shared))
    }

    /// Run every setup method in ascending order. Stops at the first
    /// failure.
    pub async fn run_all_setup(&self) -> Result<Vec<(MethodId, String)>, ClassifiedError> {
        self.setup().run_all().await
    }

    /// Run every teardown method in reverse order, then stop non-daemon
    /// threads.
    pub async fn run_all_teardown(&self) -> Result<TeardownReport, ClassifiedError> {
        self.teardown().run_all().await
    }

    /// Per-connection state.
    pub fn state(&self) -> &SessionState {
        &self.shared.state
    }

    /// The connection policies run on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.shared.connection
    }

    /// Forget cached task results and deployments.
    pub fn clear_caches(&self) {
        self.shared.state.clear_caches();
    }

    /// Forget all device-side state after a reconnect.
    pub fn reset_session(&self) {
        self.shared.state.reset();
    }
}
