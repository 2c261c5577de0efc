//! Execution observation for monitoring device traffic.
//!
//! The protocol engine calls an [`ExecutionObserver`] around every
//! execution: before the code is sent, when a response has been parsed, and
//! when the exchange fails with a transport or protocol fault. This is for
//! observation and logging only.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use libmpy::observer::{ExecutionObserver, LoggingObserver, LogLevel};
//!
//! struct Printer;
//!
//! impl ExecutionObserver for Printer {
//!     fn on_execute(&self, code: &str) {
//!         println!("sending {} bytes", code.len());
//!     }
//! }
//!
//! let observer: Arc<dyn ExecutionObserver> = Arc::new(LoggingObserver::with_level(LogLevel::Info));
//! # let _ = observer;
//! ```

use crate::protocol::ExecutionResult;
use crate::Error;

/// Longest code or output preview written to the log.
const PREVIEW_LEN: usize = 200;

/// Observer for execution events.
///
/// # Implementation Notes
///
/// - Implementations must be lightweight; they run while the execution slot
///   is held.
/// - Methods have default empty implementations for selective observation.
pub trait ExecutionObserver: Send + Sync {
    /// Called before code is sent to the device.
    fn on_execute(&self, code: &str) {
        let _ = code;
    }

    /// Called when the device answered, whether or not the code raised.
    fn on_result(&self, code: &str, result: &ExecutionResult) {
        let _ = (code, result);
    }

    /// Called when the exchange itself failed (timeout, desync, closed
    /// transport).
    fn on_fault(&self, code: &str, error: &Error) {
        let _ = (code, error);
    }
}

/// Simple logging observer that logs execution events using tracing.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use libmpy::{Device, LoggingObserver};
///
/// let device = Device::builder()
///     .transport(transport)
///     .observer(Arc::new(LoggingObserver::new()))
///     .connect()
///     .await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct LoggingObserver {
    level: LogLevel,
}

/// Log level for LoggingObserver.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    /// Log at trace level.
    Trace,
    /// Log at debug level (default).
    #[default]
    Debug,
    /// Log at info level.
    Info,
}

impl LoggingObserver {
    /// Create a new logging observer with debug level.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a logging observer with a specific level.
    pub fn with_level(level: LogLevel) -> Self {
        Self { level }
    }
}

impl ExecutionObserver for LoggingObserver {
    fn on_execute(&self, code: &str) {
        let code = preview(code);
        match self.level {
            LogLevel::Trace => tracing::trace!(code = %code, "execute"),
            LogLevel::Debug => tracing::debug!(code = %code, "execute"),
            LogLevel::Info => tracing::info!(code = %code, "execute"),
        }
    }

    fn on_result(&self, _code: &str, result: &ExecutionResult) {
        let output = preview(&result.output);
        let error = result.error.as_ref().map(|e| e.kind.to_string());

        match self.level {
            LogLevel::Trace => {
                tracing::trace!(output = %output, error = ?error, "execution_result");
            }
            LogLevel::Debug => {
                tracing::debug!(output = %output, error = ?error, "execution_result");
            }
            LogLevel::Info => {
                tracing::info!(output = %output, error = ?error, "execution_result");
            }
        }
    }

    fn on_fault(&self, code: &str, error: &Error) {
        tracing::warn!(code = %preview(code), error = %error, "execution_fault");
    }
}

fn preview(text: &str) -> String {
    if text.len() <= PREVIEW_LEN {
        return text.to_string();
    }
    let mut end = PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... ({} bytes total)", &text[..end], text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn execution_observer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn ExecutionObserver>();
        assert_send_sync::<LoggingObserver>();
    }

    #[derive(Default)]
    struct CountingObserver {
        executions: AtomicUsize,
        results: AtomicUsize,
        faults: AtomicUsize,
    }

    impl ExecutionObserver for CountingObserver {
        fn on_execute(&self, _code: &str) {
            self.executions.fetch_add(1, Ordering::Relaxed);
        }

        fn on_result(&self, _code: &str, _result: &ExecutionResult) {
            self.results.fetch_add(1, Ordering::Relaxed);
        }

        fn on_fault(&self, _code: &str, _error: &Error) {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn counting_observer_tracks_calls() {
        let observer = CountingObserver::default();

        observer.on_execute("print(1)");
        observer.on_execute("print(2)");
        observer.on_result("print(1)", &ExecutionResult::ok("1"));
        observer.on_fault("print(2)", &Error::Cancelled);

        assert_eq!(observer.executions.load(Ordering::Relaxed), 2);
        assert_eq!(observer.results.load(Ordering::Relaxed), 1);
        assert_eq!(observer.faults.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn default_trait_methods_are_no_ops() {
        struct EmptyObserver;
        impl ExecutionObserver for EmptyObserver {}

        let observer: Arc<dyn ExecutionObserver> = Arc::new(EmptyObserver);
        observer.on_execute("x = 1");
        observer.on_result("x = 1", &ExecutionResult::ok(""));
        observer.on_fault("x = 1", &Error::ConnectionUnusable);
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "é".repeat(150);
        let shown = preview(&text);
        assert!(shown.ends_with("(300 bytes total)"));

        assert_eq!(preview("short"), "short");
    }
}
