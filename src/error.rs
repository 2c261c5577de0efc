use std::time::Duration;

/// Errors that can occur while talking to a device.
///
/// Errors are organized by category:
/// - Configuration errors: detected at `build()` time
/// - Transport errors: the byte stream itself failed
/// - Protocol errors: the device did not follow the raw REPL protocol
/// - Runtime errors: timeouts, cancellation and unusable connections
///
/// Errors raised by code running *on* the device are not represented here.
/// They arrive as text and are classified into a
/// [`ClassifiedError`](crate::ClassifiedError).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    // -------------------------------------------------------------------------
    // Configuration errors (detected at build() time)
    // -------------------------------------------------------------------------
    /// Invalid configuration provided to a builder.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No transport was supplied to the device builder.
    #[error("no transport configured")]
    TransportNotConfigured,

    // -------------------------------------------------------------------------
    // Transport errors
    // -------------------------------------------------------------------------
    /// Failed to spawn the interpreter subprocess.
    #[error("failed to spawn interpreter process: {0}")]
    ProcessSpawn(#[source] std::io::Error),

    /// IO error on the underlying byte stream.
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    /// The transport was used before `open()` or after `close()`.
    #[error("transport is not open")]
    NotConnected,

    /// The remote end closed the byte stream.
    #[error("transport closed by remote end")]
    TransportClosed,

    // -------------------------------------------------------------------------
    // Protocol errors
    // -------------------------------------------------------------------------
    /// A mode transition handshake did not produce the expected banner.
    #[error("handshake failed entering {stage}: got {received:?}")]
    Handshake {
        stage: &'static str,
        received: String,
    },

    /// The device response could not be parsed.
    #[error("unparseable response: {reason} (raw: {raw:?})")]
    Parse { reason: &'static str, raw: String },

    /// Recovery failed and the connection must be reopened.
    #[error("connection is unusable until reconnect")]
    ConnectionUnusable,

    /// Failed to decode JSON output.
    #[error("failed to parse JSON output: {0}")]
    Json(#[from] serde_json::Error),

    // -------------------------------------------------------------------------
    // Runtime errors
    // -------------------------------------------------------------------------
    /// The device did not respond within the allowed time.
    #[error("device timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized Result type for device operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a parse error, keeping a bounded preview of the raw bytes.
    pub(crate) fn parse(reason: &'static str, raw: &[u8]) -> Self {
        Self::Parse {
            reason,
            raw: preview(raw),
        }
    }

    /// Create a handshake error, keeping a bounded preview of the raw bytes.
    pub(crate) fn handshake(stage: &'static str, raw: &[u8]) -> Self {
        Self::Handshake {
            stage,
            received: preview(raw),
        }
    }

    /// Check if this error means the engine lost sync with the device.
    ///
    /// Protocol faults trigger the recovery sequence.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(self, Error::Handshake { .. } | Error::Parse { .. })
    }

    /// Check if the execution that raised this error may be sent again.
    ///
    /// Only protocol faults qualify. A response timeout or a cancellation
    /// can leave a program half run on the device, so re-sending it would
    /// repeat its side effects.
    pub fn is_retryable(&self) -> bool {
        self.is_protocol_fault()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof => {
                Error::TransportClosed
            }
            _ => Error::Io(err),
        }
    }
}

fn preview(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.chars().take(120).collect()
}
