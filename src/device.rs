//! High-level device handle tying a transport, the protocol engine and the
//! policy engine together.
//!
//! This module provides [`Device`], the main entry point for talking to a
//! MicroPython board.
//!
//! # Example
//!
//! ```ignore
//! use libmpy::{Device, Result};
//! use libmpy::transport::ProcessTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let device = Device::builder()
//!         .transport(ProcessTransport::new("micropython").arg("-i"))
//!         .connect()
//!         .await?;
//!
//!     let result = device.execute("print(2+2)").await?;
//!     println!("{}", result.output);
//!
//!     device.close().await
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::classify::ClassifiedError;
use crate::config::ProtocolConfig;
use crate::observer::ExecutionObserver;
use crate::policy::{Connection, MethodId, MethodSpec, PolicyEngine, TeardownReport};
use crate::protocol::{DeviceCapabilities, ExecutionResult, MetricsSnapshot, RawRepl};
use crate::transport::Transport;
use crate::{Error, Result};

/// A connected MicroPython device.
///
/// `Device` holds one [`Connection`] and the [`PolicyEngine`] bound to it.
/// It provides:
/// - Raw execution ([`execute`](Self::execute) and its timeout and
///   cancellation variants)
/// - Policy-driven calls of registered methods ([`register`](Self::register),
///   [`call`](Self::call))
/// - Lifecycle passes ([`run_all_setup`](Self::run_all_setup),
///   [`run_all_teardown`](Self::run_all_teardown))
///
/// # Thread Safety
///
/// `Device` is `Send + Sync` and cheap to clone. Calls from many tasks are
/// serialized by the connection's execution slot.
#[derive(Debug, Clone)]
pub struct Device {
    connection: Arc<Connection>,
    policies: PolicyEngine,
}

impl Device {
    /// Create a builder for connecting to a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::new()
    }

    /// Wrap an engine that is already connected.
    pub fn from_repl(repl: RawRepl) -> Self {
        let connection = Arc::new(Connection::new(repl));
        let policies = PolicyEngine::new(Arc::clone(&connection));
        Self {
            connection,
            policies,
        }
    }

    // -------------------------------------------------------------------------
    // Raw execution
    // -------------------------------------------------------------------------

    /// Run code and return its output and classified error.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let result = device.execute("print(2+2)").await?;
    /// assert_eq!(result.output, "4");
    /// ```
    pub async fn execute(&self, code: &str) -> Result<ExecutionResult> {
        self.connection.execute(code).await
    }

    /// Run code, giving up after `limit`. The connection is recovered before
    /// the timeout is returned.
    pub async fn execute_timeout(&self, code: &str, limit: Duration) -> Result<ExecutionResult> {
        self.connection.execute_timeout(code, limit).await
    }

    /// Run code until `token` is cancelled. The connection is recovered
    /// before the cancellation is returned.
    pub async fn execute_cancellable(
        &self,
        code: &str,
        token: &CancellationToken,
    ) -> Result<ExecutionResult> {
        self.connection.execute_cancellable(code, token).await
    }

    // -------------------------------------------------------------------------
    // Policies
    // -------------------------------------------------------------------------

    /// Register a method with its policy.
    pub fn register(&self, spec: MethodSpec) -> std::result::Result<(), ClassifiedError> {
        self.policies.register(spec)
    }

    /// Call a registered method under its policy.
    pub async fn call(
        &self,
        method: &MethodId,
        args: &[Value],
    ) -> std::result::Result<String, ClassifiedError> {
        self.policies.apply(method, args).await
    }

    /// Run every setup method in ascending order.
    pub async fn run_all_setup(
        &self,
    ) -> std::result::Result<Vec<(MethodId, String)>, ClassifiedError> {
        self.policies.run_all_setup().await
    }

    /// Run every teardown method in reverse order.
    pub async fn run_all_teardown(&self) -> std::result::Result<TeardownReport, ClassifiedError> {
        self.policies.run_all_teardown().await
    }

    /// The policy engine, for direct access to the executors.
    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// The shared connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Detect capabilities if needed and return them.
    pub async fn probe(&self) -> Result<DeviceCapabilities> {
        self.connection.slot().await.probe().await
    }

    /// Capabilities detected so far.
    pub async fn capabilities(&self) -> DeviceCapabilities {
        self.connection.capabilities().await
    }

    /// Protocol counters for this connection.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.connection.metrics().snapshot()
    }

    /// Start the connection over. Device-side state is assumed lost, so
    /// setup records, deployments, caches and thread records are cleared.
    pub async fn reconnect(&self) -> Result<()> {
        let mut repl = self.connection.slot().await;
        self.policies.reset_session();
        repl.reconnect().await
    }

    /// Close the transport.
    pub async fn close(&self) -> Result<()> {
        let mut repl = self.connection.slot().await;
        self.policies.reset_session();
        repl.close().await
    }
}

/// Builder for [`Device`].
///
/// # Example
///
/// ```ignore
/// let device = Device::builder()
///     .transport(transport)
///     .config(ProtocolConfig::builder().flow_control(false).build()?)
///     .connect()
///     .await?;
/// ```
#[derive(Default)]
pub struct DeviceBuilder {
    transport: Option<Box<dyn Transport>>,
    config: ProtocolConfig,
    observer: Option<Arc<dyn ExecutionObserver>>,
    baseline_latency: Option<Duration>,
}

impl fmt::Debug for DeviceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuilder")
            .field("transport", &self.transport.is_some())
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .field("baseline_latency", &self.baseline_latency)
            .finish()
    }
}

impl DeviceBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The byte transport to the device.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Protocol configuration.
    pub fn config(mut self, config: ProtocolConfig) -> Self {
        self.config = config;
        self
    }

    /// Observe every execution.
    pub fn observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Seed the response timeout from a latency measured on an earlier
    /// connection (see [`DeviceCapabilities::baseline_latency`]).
    pub fn baseline_latency(mut self, latency: Duration) -> Self {
        self.baseline_latency = Some(latency);
        self
    }

    /// Build the device without opening the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportNotConfigured`] if no transport was given.
    pub fn build(self) -> Result<Device> {
        let transport = self.transport.ok_or(Error::TransportNotConfigured)?;
        let mut repl = RawRepl::from_boxed(transport, self.config);
        if let Some(observer) = self.observer {
            repl = repl.with_observer(observer);
        }
        if let Some(latency) = self.baseline_latency {
            repl.seed_latency(latency);
        }
        Ok(Device::from_repl(repl))
    }

    /// Build the device and open its transport.
    pub async fn connect(self) -> Result<Device> {
        let device = self.build()?;
        device.connection.slot().await.connect().await?;
        Ok(device)
    }
}
