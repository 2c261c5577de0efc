//! # libmpy
//!
//! Async host-side client for the MicroPython raw REPL.
//!
//! This library drives a MicroPython device over any byte transport and
//! layers execution policies on top, supporting:
//! - Raw and raw-paste (flow-controlled) code transfer
//! - Capability detection, adaptive timeouts and automatic recovery
//! - Registered methods with task, setup, thread and teardown policies
//! - Classified device errors with remediation hints
//!
//! ## Quick Start
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
//!     let result = device.execute("print(2+2)").await?;
//!     println!("{}", result.output);
//!     Ok(())
//! }
//! ```
//!
//! ## Policies
//!
//! ```ignore
//! use libmpy::policy::{MethodSpec, PythonFunction, TaskPolicy, TeardownPolicy};
//!
//! device.register(MethodSpec::setup(
//!     "init_led",
//!     0,
//!     PythonFunction::new("import machine\nglobal led\nled = machine.Pin(25, machine.Pin.OUT)"),
//! ))?;
//! device.register(MethodSpec::task(
//!     "toggle",
//!     TaskPolicy::new().exclusive(),
//!     PythonFunction::new("led.toggle()\nreturn led.value()"),
//! ))?;
//! device.register(MethodSpec::teardown(
//!     "led_off",
//!     TeardownPolicy::default(),
//!     PythonFunction::new("led.off()"),
//! ))?;
//!
//! device.run_all_setup().await?;
//! let value = device.call(&"toggle".into(), &[]).await?;
//! device.run_all_teardown().await?;
//! ```
//!
//! ## Configuration
//!
//! ```ignore
//! use libmpy::ProtocolConfig;
//! use std::time::Duration;
//!
//! let config = ProtocolConfig::builder()
//!     .base_response_timeout(Duration::from_secs(10))
//!     .flow_control(false)
//!     .build()?;
//! ```

pub mod classify;
pub mod config;
mod device;
mod error;
pub mod observer;
pub mod policy;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};

// Re-export the main device types at crate root
pub use device::{Device, DeviceBuilder};

// Re-export commonly used config types at crate root
pub use config::{ProtocolConfig, ProtocolConfigBuilder};

// Re-export error classification at crate root
pub use classify::{classify, ClassifiedError, ErrorKind};

// Re-export commonly used protocol types at crate root
pub use protocol::{
    DeviceCapabilities, ExecutionResult, MetricsSnapshot, ProtocolState, RawRepl,
};

// Re-export commonly used policy types at crate root
pub use policy::{
    Connection, MethodId, MethodPolicy, MethodSpec, PolicyEngine, SetupPolicy, TaskPolicy,
    TeardownPolicy, ThreadPolicy,
};

pub use observer::{ExecutionObserver, LoggingObserver};
pub use transport::{ProcessTransport, StreamTransport, Transport};
