//! Protocol configuration and builder.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use libmpy::config::ProtocolConfig;
//!
//! let config = ProtocolConfig::builder()
//!     .base_response_timeout(Duration::from_secs(3))
//!     .max_retry_attempts(3)
//!     .build()?;
//!
//! // Conservative settings for a device that keeps misbehaving.
//! let fallback = config.fallback();
//! assert!(!fallback.flow_control());
//! # Ok::<(), libmpy::Error>(())
//! ```

use std::time::Duration;

use crate::{Error, Result};

/// Chunk size used on the plain raw path by [`ProtocolConfig::fallback`].
pub const FALLBACK_RAW_CHUNK: usize = 64;

/// Delay between plain raw chunks used by [`ProtocolConfig::fallback`].
pub const FALLBACK_RAW_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Chunked writes on the plain raw path for devices with small UART buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWriteChunking {
    /// Bytes per write.
    pub size: usize,
    /// Pause after each write.
    pub delay: Duration,
}

/// Tunables for the raw REPL protocol engine.
///
/// Use [`ProtocolConfig::builder()`] to create a new configuration.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    // Timing
    pub(crate) base_response_timeout: Duration,
    pub(crate) max_response_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) startup_delay: Duration,
    pub(crate) interrupt_settle: Duration,
    pub(crate) poll_interval: Duration,

    // Retries
    pub(crate) max_retry_attempts: u32,
    pub(crate) retry_backoff: Duration,

    // Feature flags
    pub(crate) adaptive_timing: bool,
    pub(crate) flow_control: bool,
    pub(crate) auto_detect: bool,

    // Transmission
    pub(crate) max_window: u16,
    pub(crate) raw_write_chunk: Option<RawWriteChunking>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            base_response_timeout: Duration::from_secs(5),
            max_response_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(2),
            startup_delay: Duration::ZERO,
            interrupt_settle: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
            max_retry_attempts: 2,
            retry_backoff: Duration::from_millis(100),
            adaptive_timing: true,
            flow_control: true,
            auto_detect: true,
            max_window: 2048,
            raw_write_chunk: None,
        }
    }
}

impl ProtocolConfig {
    /// Create a new builder for ProtocolConfig.
    pub fn builder() -> ProtocolConfigBuilder {
        ProtocolConfigBuilder::default()
    }

    /// Derive a conservative configuration for degraded-device recovery.
    ///
    /// Flow control, capability detection and adaptive timing are disabled,
    /// plain raw writes are chunked with a pause, and every timeout is
    /// doubled.
    pub fn fallback(&self) -> ProtocolConfig {
        let max_response_timeout = self.max_response_timeout.saturating_mul(2);
        ProtocolConfig {
            base_response_timeout: self
                .base_response_timeout
                .saturating_mul(2)
                .min(max_response_timeout),
            max_response_timeout,
            handshake_timeout: self.handshake_timeout.saturating_mul(2),
            startup_delay: self.startup_delay,
            interrupt_settle: self.interrupt_settle.saturating_mul(2),
            poll_interval: self.poll_interval,
            max_retry_attempts: self.max_retry_attempts.max(3),
            retry_backoff: self.retry_backoff.saturating_mul(2),
            adaptive_timing: false,
            flow_control: false,
            auto_detect: false,
            max_window: self.max_window,
            raw_write_chunk: Some(RawWriteChunking {
                size: FALLBACK_RAW_CHUNK,
                delay: FALLBACK_RAW_CHUNK_DELAY,
            }),
        }
    }

    /// Initial response timeout for an execution.
    pub fn base_response_timeout(&self) -> Duration {
        self.base_response_timeout
    }

    /// Upper bound the adaptive timeout may grow to.
    pub fn max_response_timeout(&self) -> Duration {
        self.max_response_timeout
    }

    /// Timeout for banners and prompts during mode transitions.
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Delay after opening the transport before the first handshake.
    pub fn startup_delay(&self) -> Duration {
        self.startup_delay
    }

    /// Pause after an interrupt before draining the input.
    pub fn interrupt_settle(&self) -> Duration {
        self.interrupt_settle
    }

    /// Sleep between empty non-blocking reads.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Retries after a protocol fault.
    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    /// Base delay before a retry; grows linearly with the attempt number.
    pub fn retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Whether timeouts adapt to retries and measured latency.
    pub fn adaptive_timing(&self) -> bool {
        self.adaptive_timing
    }

    /// Whether raw-paste flow control may be used.
    pub fn flow_control(&self) -> bool {
        self.flow_control
    }

    /// Whether capabilities are probed on the first execution.
    pub fn auto_detect(&self) -> bool {
        self.auto_detect
    }

    /// Cap on the chunk size sent against raw-paste credit.
    pub fn max_window(&self) -> u16 {
        self.max_window
    }

    /// Chunking applied on the plain raw path, if any.
    pub fn raw_write_chunk(&self) -> Option<RawWriteChunking> {
        self.raw_write_chunk
    }
}

/// Builder for [`ProtocolConfig`].
///
/// The configuration is validated when [`build()`](ProtocolConfigBuilder::build)
/// is called.
#[derive(Debug, Clone, Default)]
pub struct ProtocolConfigBuilder {
    config: ProtocolConfig,
}

impl ProtocolConfigBuilder {
    // -------------------------------------------------------------------------
    // Timing
    // -------------------------------------------------------------------------

    /// Initial response timeout for an execution.
    pub fn base_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.base_response_timeout = timeout;
        self
    }

    /// Upper bound for the adaptive response timeout.
    pub fn max_response_timeout(mut self, timeout: Duration) -> Self {
        self.config.max_response_timeout = timeout;
        self
    }

    /// Timeout for banners and prompts.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Delay after opening the transport (boards that reset on open need one).
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.config.startup_delay = delay;
        self
    }

    /// Pause after an interrupt before draining.
    pub fn interrupt_settle(mut self, delay: Duration) -> Self {
        self.config.interrupt_settle = delay;
        self
    }

    /// Sleep between empty reads.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    // -------------------------------------------------------------------------
    // Retries
    // -------------------------------------------------------------------------

    /// Retries after a protocol fault.
    pub fn max_retry_attempts(mut self, attempts: u32) -> Self {
        self.config.max_retry_attempts = attempts;
        self
    }

    /// Base delay before a retry.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    // -------------------------------------------------------------------------
    // Feature flags
    // -------------------------------------------------------------------------

    /// Enable or disable adaptive timeouts.
    pub fn adaptive_timing(mut self, enabled: bool) -> Self {
        self.config.adaptive_timing = enabled;
        self
    }

    /// Enable or disable raw-paste flow control.
    pub fn flow_control(mut self, enabled: bool) -> Self {
        self.config.flow_control = enabled;
        self
    }

    /// Enable or disable capability detection.
    pub fn auto_detect(mut self, enabled: bool) -> Self {
        self.config.auto_detect = enabled;
        self
    }

    // -------------------------------------------------------------------------
    // Transmission
    // -------------------------------------------------------------------------

    /// Cap on raw-paste chunk size.
    pub fn max_window(mut self, window: u16) -> Self {
        self.config.max_window = window;
        self
    }

    /// Chunk plain raw writes, pausing `delay` after each chunk.
    pub fn raw_write_chunk(mut self, size: usize, delay: Duration) -> Self {
        self.config.raw_write_chunk = Some(RawWriteChunking { size, delay });
        self
    }

    // -------------------------------------------------------------------------
    // Build
    // -------------------------------------------------------------------------

    /// Build the configuration.
    ///
    /// This validates:
    /// - Timeouts are non-zero and `max_response_timeout >= base_response_timeout`
    /// - The raw-paste window cap is non-zero
    /// - Raw write chunks, if set, are non-empty
    pub fn build(self) -> Result<ProtocolConfig> {
        let config = self.config;

        if config.base_response_timeout.is_zero() || config.handshake_timeout.is_zero() {
            return Err(Error::InvalidConfig("timeouts must be non-zero".into()));
        }

        if config.max_response_timeout < config.base_response_timeout {
            return Err(Error::InvalidConfig(format!(
                "max_response_timeout ({:?}) is below base_response_timeout ({:?})",
                config.max_response_timeout, config.base_response_timeout
            )));
        }

        if config.max_window == 0 {
            return Err(Error::InvalidConfig("max_window must be positive".into()));
        }

        if let Some(chunk) = config.raw_write_chunk {
            if chunk.size == 0 {
                return Err(Error::InvalidConfig(
                    "raw_write_chunk size must be positive".into(),
                ));
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build() {
        let config = ProtocolConfig::builder().build().unwrap();
        assert!(config.flow_control());
        assert!(config.auto_detect());
        assert!(config.adaptive_timing());
        assert_eq!(config.raw_write_chunk(), None);
        assert!(config.max_response_timeout() >= config.base_response_timeout());
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let result = ProtocolConfig::builder()
            .base_response_timeout(Duration::from_secs(10))
            .max_response_timeout(Duration::from_secs(5))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_zero_window() {
        let result = ProtocolConfig::builder().max_window(0).build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_empty_raw_chunk() {
        let result = ProtocolConfig::builder()
            .raw_write_chunk(0, Duration::from_millis(1))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn fallback_is_conservative() {
        let config = ProtocolConfig::builder()
            .base_response_timeout(Duration::from_secs(2))
            .max_response_timeout(Duration::from_secs(8))
            .max_retry_attempts(1)
            .build()
            .unwrap();

        let fallback = config.fallback();
        assert!(!fallback.flow_control());
        assert!(!fallback.auto_detect());
        assert!(!fallback.adaptive_timing());
        assert_eq!(fallback.base_response_timeout(), Duration::from_secs(4));
        assert_eq!(fallback.max_response_timeout(), Duration::from_secs(16));
        assert_eq!(fallback.max_retry_attempts(), 3);
        assert_eq!(
            fallback.raw_write_chunk(),
            Some(RawWriteChunking {
                size: FALLBACK_RAW_CHUNK,
                delay: FALLBACK_RAW_CHUNK_DELAY,
            })
        );
    }

    #[test]
    fn fallback_of_fallback_stays_valid() {
        let twice = ProtocolConfig::default().fallback().fallback();
        assert!(twice.max_response_timeout() >= twice.base_response_timeout());
    }

    #[test]
    fn types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolConfig>();
        assert_send_sync::<ProtocolConfigBuilder>();
    }
}
