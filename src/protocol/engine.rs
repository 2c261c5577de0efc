//! The raw REPL protocol engine.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::capabilities::{
    interpret_paste_reply, parse_platform, paste_reply_end, PasteReply, PLATFORM_PROBE,
};
use super::parser::{
    is_unterminated_response, normal_prompt_end, parse_body, parse_response, position,
    raw_banner_end, response_end, RawResponse,
};
use super::{
    AdaptiveTimeout, DeviceCapabilities, ExecutionResult, ProtocolMetrics, ProtocolState,
    END_OF_DATA, ENTER_RAW, EXIT_RAW, RAW_PASTE_CREDIT, RAW_PASTE_PROBE,
};
use crate::config::ProtocolConfig;
use crate::observer::ExecutionObserver;
use crate::transport::Transport;
use crate::{Error, Result};

/// Outcome of the raw-paste request during capability detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasteProbe {
    Supported(u16),
    Unsupported,
    Inconclusive,
}

/// Drives a MicroPython device through the raw REPL.
///
/// `RawRepl` exclusively owns the transport, the [`ProtocolState`] and the
/// [`DeviceCapabilities`] of one connection. All methods take `&mut self`,
/// so a single engine can never have two executions in flight; share it
/// behind a [`Connection`](crate::policy::Connection) to serialize callers.
///
/// # Cancellation
///
/// Dropping an `execute` future part way leaves the engine in `Raw` or
/// `RawPaste`; the next call notices and runs the recovery sequence first.
/// [`execute_cancellable`](Self::execute_cancellable) and
/// [`execute_timeout`](Self::execute_timeout) run recovery before returning.
///
/// # Example
///
/// ```ignore
/// use libmpy::protocol::RawRepl;
/// use libmpy::config::ProtocolConfig;
///
/// let mut repl = RawRepl::new(transport, ProtocolConfig::default());
/// repl.connect().await?;
/// let result = repl.execute("print(2+2)").await?;
/// assert_eq!(result.output, "4");
/// ```
pub struct RawRepl {
    transport: Box<dyn Transport>,
    config: ProtocolConfig,
    state: ProtocolState,
    capabilities: DeviceCapabilities,
    timeout: AdaptiveTimeout,
    metrics: Arc<ProtocolMetrics>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    buffer: Vec<u8>,
    unusable: bool,
    degraded: bool,
}

impl fmt::Debug for RawRepl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRepl")
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .field("timeout", &self.timeout.current())
            .field("unusable", &self.unusable)
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl RawRepl {
    /// Create an engine over `transport`. Call [`connect`](Self::connect)
    /// before executing anything.
    pub fn new(transport: impl Transport + 'static, config: ProtocolConfig) -> Self {
        Self::from_boxed(Box::new(transport), config)
    }

    /// Create an engine over an already boxed transport.
    pub fn from_boxed(transport: Box<dyn Transport>, config: ProtocolConfig) -> Self {
        let timeout = AdaptiveTimeout::new(
            config.base_response_timeout,
            config.max_response_timeout,
            config.adaptive_timing,
        );
        Self {
            transport,
            config,
            state: ProtocolState::Normal,
            capabilities: DeviceCapabilities::default(),
            timeout,
            metrics: Arc::new(ProtocolMetrics::new()),
            observer: None,
            buffer: Vec::new(),
            unusable: false,
            degraded: false,
        }
    }

    /// Report executions to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Record into shared metrics instead of private ones.
    pub fn with_metrics(mut self, metrics: Arc<ProtocolMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Seed the response timeout from a latency measured on an earlier
    /// connection to the same device.
    pub fn seed_latency(&mut self, latency: Duration) {
        self.timeout.seed(latency);
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Current mode as far as the host knows.
    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// Capabilities detected so far on this connection.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Counters for this connection.
    pub fn metrics(&self) -> &Arc<ProtocolMetrics> {
        &self.metrics
    }

    /// The configuration in effect (the fallback one once degraded).
    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// The response timeout the next execution will use.
    pub fn current_timeout(&self) -> Duration {
        self.timeout.current()
    }

    /// Whether calls are still accepted. False after a failed recovery.
    pub fn is_usable(&self) -> bool {
        !self.unusable
    }

    /// Whether the engine has switched to the fallback configuration.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Open the transport and wait out the startup delay.
    pub async fn connect(&mut self) -> Result<()> {
        self.transport.open().await?;
        if !self.config.startup_delay.is_zero() {
            sleep(self.config.startup_delay).await;
        }
        self.drain().await?;
        self.state = ProtocolState::Normal;
        self.unusable = false;
        tracing::info!("connected to device");
        Ok(())
    }

    /// Start the connection over: forget capabilities and metrics, reopen
    /// the transport if it was closed, and resynchronize with the device.
    ///
    /// The previous connection's baseline latency seeds the new response
    /// timeout.
    pub async fn reconnect(&mut self) -> Result<()> {
        let latency = self.capabilities.baseline_latency;
        self.capabilities = DeviceCapabilities::default();
        self.metrics.reset();
        self.timeout.reset();
        self.timeout.seed(latency);
        self.buffer.clear();
        self.state = ProtocolState::Normal;

        if !self.transport.is_open() {
            self.transport.open().await?;
            if !self.config.startup_delay.is_zero() {
                sleep(self.config.startup_delay).await;
            }
        }

        if let Err(err) = self.resync().await {
            self.unusable = true;
            tracing::error!(error = %err, "reconnect could not resynchronize with the device");
            return Err(err);
        }
        self.unusable = false;
        tracing::info!(seed_timeout = ?self.timeout.current(), "reconnected to device");
        Ok(())
    }

    /// Close the transport.
    pub async fn close(&mut self) -> Result<()> {
        self.state = ProtocolState::Normal;
        self.buffer.clear();
        self.transport.close().await
    }

    /// Switch to the conservative fallback configuration.
    pub fn degrade(&mut self) {
        if self.degraded {
            return;
        }
        self.config = self.config.fallback();
        self.timeout = AdaptiveTimeout::new(
            self.config.base_response_timeout,
            self.config.max_response_timeout,
            self.config.adaptive_timing,
        );
        self.degraded = true;
        tracing::warn!("switching to fallback protocol configuration");
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run `code` on the device and return its output and classified error.
    ///
    /// Protocol faults are retried up to `max_retry_attempts` times, each
    /// retry preceded by the recovery sequence and a longer response
    /// timeout. A response timeout is never retried, since the program may
    /// already have run in part: the device is recovered, the timeout is
    /// raised for the next call and `Error::Timeout` is returned. Code that
    /// raises on the device is not an `Err`: the traceback is in
    /// [`ExecutionResult::error`].
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionResult> {
        self.ensure_usable()?;
        self.recover_if_needed().await?;

        if self.config.auto_detect && !self.capabilities.detection_complete {
            if let Err(err) = self.detect().await {
                self.metrics.record_failure();
                self.fail_with_recovery(&err).await;
                return Err(err);
            }
        }

        if let Some(observer) = &self.observer {
            observer.on_execute(code);
        }

        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match self.run_once(code).await {
                Ok(response) => {
                    self.metrics.record_success(started.elapsed());
                    if self.timeout.relax() {
                        self.metrics.record_adjustment();
                    }
                    let result = ExecutionResult::from(response);
                    if let Some(observer) = &self.observer {
                        observer.on_result(code, &result);
                    }
                    return Ok(result);
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retry_attempts => {
                    attempt += 1;
                    self.metrics.record_retry();
                    tracing::warn!(attempt, error = %err, "execution failed, retrying");
                    self.recover().await?;
                    if self.timeout.escalate() {
                        self.metrics.record_adjustment();
                        tracing::debug!(timeout = ?self.timeout.current(), "response timeout raised");
                    }
                    sleep(self.config.retry_backoff * attempt).await;
                }
                Err(err) => {
                    self.metrics.record_failure();
                    if let Some(observer) = &self.observer {
                        observer.on_fault(code, &err);
                    }
                    self.fail_with_recovery(&err).await;
                    if err.is_protocol_fault() {
                        self.degrade();
                    } else if matches!(err, Error::Timeout(_)) && self.timeout.escalate() {
                        self.metrics.record_adjustment();
                        tracing::debug!(timeout = ?self.timeout.current(), "response timeout raised");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Like [`execute`](Self::execute), but gives up when `token` is
    /// cancelled. The recovery sequence runs before `Error::Cancelled` is
    /// returned.
    pub async fn execute_cancellable(
        &mut self,
        code: &str,
        token: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let outcome = tokio::select! {
            result = self.execute(code) => Some(result),
            _ = token.cancelled() => None,
        };
        match outcome {
            Some(result) => result,
            None => {
                self.abandon().await;
                Err(Error::Cancelled)
            }
        }
    }

    /// Like [`execute`](Self::execute), bounded by `limit` overall. The
    /// recovery sequence runs before `Error::Timeout` is returned.
    pub async fn execute_timeout(&mut self, code: &str, limit: Duration) -> Result<ExecutionResult> {
        match tokio::time::timeout(limit, self.execute(code)).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon().await;
                Err(Error::Timeout(limit))
            }
        }
    }

    /// Detect capabilities now, if that has not completed yet, and return
    /// them.
    pub async fn probe(&mut self) -> Result<DeviceCapabilities> {
        self.ensure_usable()?;
        self.recover_if_needed().await?;
        if let Err(err) = self.detect().await {
            self.metrics.record_failure();
            self.fail_with_recovery(&err).await;
            return Err(err);
        }
        Ok(self.capabilities.clone())
    }

    // -------------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------------

    /// Interrupt the device, drain its output and return to the normal
    /// REPL. A failed recovery marks the connection unusable.
    pub async fn recover(&mut self) -> Result<()> {
        self.metrics.record_recovery();
        tracing::warn!(state = ?self.state, "running recovery sequence");
        match self.resync().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unusable = true;
                self.state = ProtocolState::Normal;
                tracing::error!(error = %err, "recovery failed, connection unusable until reconnect");
                Err(Error::ConnectionUnusable)
            }
        }
    }

    /// Recover only if an abandoned call left the device outside `Normal`.
    pub async fn recover_if_needed(&mut self) -> Result<()> {
        if self.state == ProtocolState::Normal {
            return Ok(());
        }
        tracing::debug!(state = ?self.state, "previous execution was abandoned");
        self.recover().await
    }

    async fn resync(&mut self) -> Result<()> {
        self.transport.send_interrupt().await?;
        self.transport.send_interrupt().await?;
        self.settle_and_drain().await?;
        self.write(&[b'\r', EXIT_RAW]).await?;
        let prompt = self
            .read_frame(normal_prompt_end, self.config.handshake_timeout)
            .await;
        self.state = ProtocolState::Normal;

        match prompt {
            Ok(_) => Ok(()),
            Err(Error::Timeout(_)) => {
                // No prompt; a full raw mode round trip still proves the
                // device is alive.
                self.try_enter_raw().await?;
                self.exit_raw().await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn fail_with_recovery(&mut self, err: &Error) {
        if matches!(err, Error::NotConnected | Error::ConnectionUnusable) {
            return;
        }
        if let Err(recovery) = self.recover().await {
            tracing::debug!(error = %recovery, "recovery after failure did not succeed");
        }
    }

    async fn abandon(&mut self) {
        self.metrics.record_failure();
        if let Err(err) = self.recover().await {
            tracing::debug!(error = %err, "recovery after abandoned execution did not succeed");
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.unusable {
            return Err(Error::ConnectionUnusable);
        }
        if !self.transport.is_open() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Capability detection
    // -------------------------------------------------------------------------

    async fn detect(&mut self) -> Result<()> {
        if self.capabilities.detection_complete {
            return Ok(());
        }

        self.enter_raw().await?;
        let paste = if self.config.flow_control {
            self.probe_raw_paste().await?
        } else {
            PasteProbe::Unsupported
        };

        // The platform probe doubles as the latency measurement.
        let started = Instant::now();
        let probe = match paste {
            PasteProbe::Supported(window) => {
                self.capabilities.supports_raw_paste = true;
                self.capabilities.max_window = window;
                self.capabilities.preferred_window = window.min(self.config.max_window);
                self.paste(PLATFORM_PROBE.as_bytes(), window).await
            }
            PasteProbe::Unsupported => {
                self.capabilities.supports_raw_paste = false;
                self.send_raw(PLATFORM_PROBE.as_bytes()).await
            }
            PasteProbe::Inconclusive => {
                self.capabilities.supports_raw_paste = false;
                self.resync().await?;
                self.enter_raw().await?;
                self.send_raw(PLATFORM_PROBE.as_bytes()).await
            }
        };
        let latency = started.elapsed();

        match probe {
            Ok(response) => {
                self.exit_raw().await;
                match response
                    .error
                    .is_none()
                    .then(|| parse_platform(&response.output))
                    .flatten()
                {
                    Some((platform, threading)) => {
                        self.capabilities.platform = platform;
                        self.capabilities.supports_threading = threading;
                        self.capabilities.baseline_latency = latency;
                    }
                    None => {
                        tracing::warn!(output = %response.output, "platform probe gave no usable answer");
                    }
                }
            }
            Err(err) if err.is_protocol_fault() || matches!(err, Error::Timeout(_)) => {
                tracing::warn!(error = %err, "platform probe failed");
                self.recover().await?;
            }
            Err(err) => return Err(err),
        }

        self.capabilities.detection_complete = paste != PasteProbe::Inconclusive;
        tracing::info!(
            platform = %self.capabilities.platform,
            raw_paste = self.capabilities.supports_raw_paste,
            window = self.capabilities.preferred_window,
            threading = self.capabilities.supports_threading,
            latency = ?self.capabilities.baseline_latency,
            complete = self.capabilities.detection_complete,
            "device capabilities detected"
        );
        Ok(())
    }

    /// Send the raw-paste request from raw mode and classify the answer.
    async fn probe_raw_paste(&mut self) -> Result<PasteProbe> {
        self.write(RAW_PASTE_PROBE).await?;
        match self
            .read_frame(paste_reply_end, self.config.handshake_timeout)
            .await
        {
            Ok(frame) => match interpret_paste_reply(&frame) {
                Some((PasteReply::Supported { window }, _)) if window > 0 => {
                    self.state = ProtocolState::RawPaste;
                    Ok(PasteProbe::Supported(window))
                }
                _ => Ok(PasteProbe::Unsupported),
            },
            Err(Error::Timeout(_)) => {
                tracing::warn!(
                    received = %String::from_utf8_lossy(&self.buffer),
                    "no answer to raw paste request"
                );
                Ok(PasteProbe::Inconclusive)
            }
            Err(err) => Err(err),
        }
    }

    // -------------------------------------------------------------------------
    // Mode transitions
    // -------------------------------------------------------------------------

    async fn run_once(&mut self, code: &str) -> Result<RawResponse> {
        self.enter_raw().await?;
        let response = self.exchange(code.as_bytes()).await?;
        self.exit_raw().await;
        Ok(response)
    }

    /// Enter raw mode, soft-resetting between failed attempts.
    async fn enter_raw(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_enter_raw().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_protocol_fault() && attempt < self.config.max_retry_attempts => {
                    attempt += 1;
                    self.metrics.record_retry();
                    tracing::debug!(attempt, error = %err, "raw mode entry failed, soft reset");
                    self.transport.send_interrupt().await?;
                    sleep(self.config.retry_backoff * attempt).await;
                    self.drain().await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_enter_raw(&mut self) -> Result<()> {
        self.write(b"\r").await?;
        self.transport.send_interrupt().await?;
        self.transport.send_interrupt().await?;
        self.settle_and_drain().await?;
        self.write(&[b'\r', ENTER_RAW]).await?;
        self.read_handshake(raw_banner_end, "raw mode").await?;
        self.state = ProtocolState::Raw;
        Ok(())
    }

    /// Leave raw mode. The state becomes `Normal` even when the device does
    /// not confirm; the missing confirmation is recorded as a fault.
    async fn exit_raw(&mut self) {
        let confirmed = match self.write(&[b'\r', EXIT_RAW]).await {
            Ok(()) => self
                .read_frame(normal_prompt_end, self.config.handshake_timeout)
                .await
                .map(drop),
            Err(err) => Err(err),
        };
        self.state = ProtocolState::Normal;
        if let Err(err) = confirmed {
            self.metrics.record_exit_fault();
            self.buffer.clear();
            tracing::warn!(error = %err, "device did not confirm leaving raw mode");
        }
    }

    // -------------------------------------------------------------------------
    // Transmission
    // -------------------------------------------------------------------------

    /// Send code from raw mode and read the response, staying in raw mode.
    async fn exchange(&mut self, code: &[u8]) -> Result<RawResponse> {
        if self.config.flow_control && self.capabilities.supports_raw_paste {
            self.write(RAW_PASTE_PROBE).await?;
            let frame = self.read_handshake(paste_reply_end, "raw paste").await?;
            match interpret_paste_reply(&frame) {
                Some((PasteReply::Supported { window }, _)) if window > 0 => {
                    self.state = ProtocolState::RawPaste;
                    return self.paste(code, window).await;
                }
                _ => {
                    tracing::warn!("device refused raw paste, sending without flow control");
                }
            }
        }
        self.send_raw(code).await
    }

    /// Plain raw mode: the whole program in one write (or fixed chunks when
    /// configured), then the terminator.
    async fn send_raw(&mut self, code: &[u8]) -> Result<RawResponse> {
        match self.config.raw_write_chunk {
            Some(chunking) => {
                for chunk in code.chunks(chunking.size) {
                    self.write(chunk).await?;
                    sleep(chunking.delay).await;
                }
                self.write(&[END_OF_DATA]).await?;
            }
            None => {
                let mut frame = Vec::with_capacity(code.len() + 1);
                frame.extend_from_slice(code);
                frame.push(END_OF_DATA);
                self.write(&frame).await?;
            }
        }

        let raw = self.read_response(true).await?;
        parse_response(&raw)
    }

    /// Raw-paste transfer against device credit.
    ///
    /// The device grants `window` bytes up front and another `window` with
    /// every credit byte. Nothing is written past the outstanding credit.
    async fn paste(&mut self, code: &[u8], window: u16) -> Result<RawResponse> {
        let increment = usize::from(window);
        let chunk_cap = usize::from(window.min(self.config.max_window)).max(1);
        let wait = self.timeout.current();
        let mut credit = increment;
        let mut sent = 0;
        let mut deadline = Instant::now() + wait;

        while sent < code.len() {
            self.fill().await?;
            if self.take_paste_control(&mut credit, increment)? {
                return self.finish_aborted_paste().await;
            }

            if credit == 0 {
                if Instant::now() >= deadline {
                    tracing::warn!(sent, total = code.len(), "no flow-control credit from device");
                    return Err(Error::Timeout(wait));
                }
                sleep(self.config.poll_interval).await;
                continue;
            }

            let len = credit.min(chunk_cap).min(code.len() - sent);
            self.write(&code[sent..sent + len]).await?;
            sent += len;
            credit -= len;
            deadline = Instant::now() + wait;
        }

        self.write(&[END_OF_DATA]).await?;
        // The device acknowledges the end of data with its own terminator;
        // late credit bytes may precede it.
        self.read_frame(|buf| position(buf, END_OF_DATA).map(|p| p + 1), wait)
            .await?;

        let raw = self.read_response(false).await?;
        self.state = ProtocolState::Raw;
        parse_body(&raw)
    }

    /// Apply credit bytes received during a paste. Returns `true` when the
    /// device asked to end the transfer early.
    fn take_paste_control(&mut self, credit: &mut usize, increment: usize) -> Result<bool> {
        let bytes = std::mem::take(&mut self.buffer);
        for (i, &byte) in bytes.iter().enumerate() {
            match byte {
                RAW_PASTE_CREDIT => *credit += increment,
                END_OF_DATA => {
                    self.buffer = bytes[i + 1..].to_vec();
                    return Ok(true);
                }
                _ => return Err(Error::parse("unexpected byte during raw paste", &bytes[i..])),
            }
        }
        Ok(false)
    }

    async fn finish_aborted_paste(&mut self) -> Result<RawResponse> {
        tracing::debug!("device ended raw paste early");
        self.write(&[END_OF_DATA]).await?;
        let raw = self.read_response(false).await?;
        self.state = ProtocolState::Raw;
        parse_body(&raw)
    }

    // -------------------------------------------------------------------------
    // Byte I/O
    // -------------------------------------------------------------------------

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        tracing::trace!(len = bytes.len(), "write");
        self.transport.write(bytes).await?;
        self.metrics.record_bytes_sent(bytes.len());
        Ok(())
    }

    /// Move pending transport bytes into the buffer. Returns how many arrived.
    async fn fill(&mut self) -> Result<usize> {
        let bytes = self.transport.read_available().await?;
        if !bytes.is_empty() {
            tracing::trace!(len = bytes.len(), "read");
            self.buffer.extend_from_slice(&bytes);
        }
        Ok(bytes.len())
    }

    async fn drain(&mut self) -> Result<()> {
        self.transport.read_available().await?;
        self.buffer.clear();
        Ok(())
    }

    async fn settle_and_drain(&mut self) -> Result<()> {
        sleep(self.config.interrupt_settle).await;
        self.drain().await
    }

    fn take_frame(&mut self, end: usize) -> Vec<u8> {
        let rest = self.buffer.split_off(end);
        std::mem::replace(&mut self.buffer, rest)
    }

    /// Read until `end` finds a frame boundary or `wait` passes.
    async fn read_frame<F>(&mut self, end: F, wait: Duration) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(end) = end(&self.buffer) {
                return Ok(self.take_frame(end));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(wait));
            }
            if self.fill().await? == 0 {
                sleep(self.config.poll_interval).await;
            }
        }
    }

    /// [`read_frame`](Self::read_frame) with the handshake timeout, turning
    /// expiry into a handshake fault.
    async fn read_handshake<F>(&mut self, end: F, stage: &'static str) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> Option<usize>,
    {
        match self.read_frame(end, self.config.handshake_timeout).await {
            Err(Error::Timeout(_)) => Err(Error::handshake(stage, &self.buffer)),
            other => other,
        }
    }

    /// Read a complete execution response. The timeout restarts whenever
    /// bytes arrive.
    ///
    /// A body that ends on the raw prompt without any terminator is only
    /// accepted once the timeout has expired, since output may itself
    /// contain `>` followed by a pause.
    async fn read_response(&mut self, expect_ok: bool) -> Result<Vec<u8>> {
        let wait = self.timeout.current();
        let mut deadline = Instant::now() + wait;
        loop {
            if let Some(end) = response_end(&self.buffer) {
                return Ok(self.take_frame(end));
            }

            if self.fill().await? > 0 {
                deadline = Instant::now() + wait;
                continue;
            }

            if Instant::now() >= deadline {
                if is_unterminated_response(&self.buffer, expect_ok) {
                    tracing::debug!("accepting response that ended on the prompt");
                    let end = self.buffer.len();
                    return Ok(self.take_frame(end));
                }
                return Err(Error::Timeout(wait));
            }
            sleep(self.config.poll_interval).await;
        }
    }
}
