//! Configuration for the protocol engine.
//!
//! This module provides:
//!
//! - [`ProtocolConfig`] and [`ProtocolConfigBuilder`] for tuning timeouts,
//!   retries and flow control
//! - [`ProtocolConfig::fallback`] for deriving conservative settings when a
//!   device keeps misbehaving
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use libmpy::config::ProtocolConfig;
//!
//! let config = ProtocolConfig::builder()
//!     .startup_delay(Duration::from_millis(500))
//!     .handshake_timeout(Duration::from_secs(3))
//!     .flow_control(false)
//!     .build()?;
//! # Ok::<(), libmpy::Error>(())
//! ```

pub mod builder;

pub use builder::{
    ProtocolConfig, ProtocolConfigBuilder, RawWriteChunking, FALLBACK_RAW_CHUNK,
    FALLBACK_RAW_CHUNK_DELAY,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accessible() {
        let _ = ProtocolConfig::builder();
        let _ = ProtocolConfig::default();
    }
}
