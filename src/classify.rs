//! Classification of interpreter error text.
//!
//! Device-side failures come back from the raw REPL as traceback text. This
//! module turns that text into a [`ClassifiedError`] with a coarse
//! [`ErrorKind`], whether the connection is still worth retrying on, and a
//! human-readable remediation hint.
//!
//! Classification looks only at the exception line of a traceback (the last
//! line naming an exception type), so ordinary output that merely mentions
//! the word "error" is never misclassified.
//!
//! # Example
//!
//! ```
//! use libmpy::classify::{classify, ErrorKind};
//!
//! let text = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\nZeroDivisionError: divide by zero\r\n";
//! let err = classify(text);
//! assert_eq!(err.kind, ErrorKind::RuntimeError);
//! assert!(err.recoverable);
//! ```

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Exception line at the start of a line: `NameError: name 'x' isn't defined`.
static EXCEPTION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*(?:Error|Exception|Interrupt|Iteration))\b(?::[ \t]*(?P<message>[^\r\n]*))?\s*$")
        .expect("exception pattern is valid")
});

/// Traceback location: `File "<stdin>", line 3`.
static LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bline (?P<line>\d+)\b").expect("location pattern is valid"));

/// Host-side or errno timeout wording.
static TIMEOUT_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(timed out|ETIMEDOUT|Errno 110)\b").expect("timeout pattern is valid")
});

/// Coarse category of a device-side or protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The code did not compile on the device.
    SyntaxError,
    /// The code raised while running (name, type, attribute, key, index,
    /// value and zero-division errors among others).
    RuntimeError,
    /// A module could not be imported.
    ImportError,
    /// The device ran out of heap.
    MemoryError,
    /// A filesystem operation failed.
    FileSystemError,
    /// The device or the host gave up waiting.
    TimeoutError,
    /// Execution was interrupted (`KeyboardInterrupt` or host cancellation).
    InterruptedError,
    /// The host lost sync with the raw REPL protocol.
    ProtocolFault,
    /// The device lacks a capability the request needs.
    NotSupported,
    /// The request was rejected before reaching the device.
    InvalidRequest,
    /// Text that matched no known pattern.
    UnknownError,
}

impl ErrorKind {
    /// Whether a retry on the same connection can reasonably succeed.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::SyntaxError
                | ErrorKind::RuntimeError
                | ErrorKind::ImportError
                | ErrorKind::TimeoutError
                | ErrorKind::InterruptedError
                | ErrorKind::NotSupported
                | ErrorKind::InvalidRequest
        )
    }

    /// Default remediation hint for this kind.
    pub fn suggested_action(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => {
                "Check Python syntax, indentation, and parentheses/brackets matching"
            }
            ErrorKind::RuntimeError => {
                "Verify variable names, function calls, and data types are correct"
            }
            ErrorKind::ImportError => {
                "Ensure required modules are available on the MicroPython device"
            }
            ErrorKind::MemoryError => {
                "Reduce payload size or free device memory (gc.collect())"
            }
            ErrorKind::FileSystemError => {
                "Check file paths, permissions, and available storage space"
            }
            ErrorKind::TimeoutError => {
                "Check device connection and increase timeout if necessary"
            }
            ErrorKind::InterruptedError => "Operation was cancelled - retry if needed",
            ErrorKind::ProtocolFault => {
                "Reconnect to the device; the raw REPL session lost synchronization"
            }
            ErrorKind::NotSupported => "Use a firmware build that provides the required feature",
            ErrorKind::InvalidRequest => {
                "Register the method with a matching policy and non-empty code"
            }
            ErrorKind::UnknownError => "Inspect the raw device output for details",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::FileSystemError => "FileSystemError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::InterruptedError => "InterruptedError",
            ErrorKind::ProtocolFault => "ProtocolFault",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::UnknownError => "UnknownError",
        };
        f.write_str(name)
    }
}

/// A failure with its category, diagnostic text and remediation hint.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{kind}: {diagnostic}")]
pub struct ClassifiedError {
    /// Coarse category.
    pub kind: ErrorKind,
    /// The exception line (with location when known) or the raw text.
    pub diagnostic: String,
    /// Whether the connection remains usable for a retry.
    pub recoverable: bool,
    /// Human-readable remediation hint.
    pub suggested_action: String,
    /// Underlying transport or protocol fault, if any.
    #[source]
    pub fault: Option<Arc<Error>>,
}

impl ClassifiedError {
    /// Create an error of the given kind with the kind's default hint.
    pub fn new(kind: ErrorKind, diagnostic: impl Into<String>) -> Self {
        Self {
            kind,
            diagnostic: diagnostic.into(),
            recoverable: kind.is_recoverable(),
            suggested_action: kind.suggested_action().to_string(),
            fault: None,
        }
    }

    /// Shorthand for an [`ErrorKind::InvalidRequest`] error.
    pub fn invalid_request(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, diagnostic)
    }

    /// Shorthand for an [`ErrorKind::NotSupported`] error.
    pub fn not_supported(diagnostic: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, diagnostic)
    }

    /// Replace the remediation hint.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = action.into();
        self
    }

    /// Attach the underlying fault.
    pub fn with_fault(mut self, fault: Error) -> Self {
        self.fault = Some(Arc::new(fault));
        self
    }
}

impl From<Error> for ClassifiedError {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Timeout(_) => ErrorKind::TimeoutError,
            Error::Cancelled => ErrorKind::InterruptedError,
            Error::InvalidConfig(_) | Error::TransportNotConfigured => ErrorKind::InvalidRequest,
            Error::Json(_) => ErrorKind::UnknownError,
            _ => ErrorKind::ProtocolFault,
        };
        ClassifiedError::new(kind, err.to_string()).with_fault(err)
    }
}

/// Classify raw interpreter error text.
///
/// Never fails: text with no recognizable exception line degrades to
/// [`ErrorKind::UnknownError`] with the raw text preserved as the diagnostic.
pub fn classify(text: &str) -> ClassifiedError {
    let trimmed = text.trim();

    let Some(caps) = EXCEPTION_LINE.captures_iter(trimmed).last() else {
        if TIMEOUT_TEXT.is_match(trimmed) {
            return ClassifiedError::new(ErrorKind::TimeoutError, trimmed);
        }
        return ClassifiedError::new(ErrorKind::UnknownError, trimmed);
    };

    let name = caps.name("name").map_or("", |m| m.as_str());
    let message = caps.name("message").map_or("", |m| m.as_str().trim());

    let kind = kind_for_exception(name, message);
    let exception_line = if message.is_empty() {
        name.to_string()
    } else {
        format!("{name}: {message}")
    };
    let diagnostic = match LOCATION.captures_iter(trimmed).last() {
        Some(loc) => format!("{exception_line} (line {})", &loc["line"]),
        None => exception_line,
    };

    let error = ClassifiedError::new(kind, diagnostic);
    match specific_action(name) {
        Some(action) => error.with_action(action),
        None => error,
    }
}

fn kind_for_exception(name: &str, message: &str) -> ErrorKind {
    match name {
        "SyntaxError" | "IndentationError" => ErrorKind::SyntaxError,
        "ImportError" | "ModuleNotFoundError" => ErrorKind::ImportError,
        "MemoryError" => ErrorKind::MemoryError,
        "KeyboardInterrupt" => ErrorKind::InterruptedError,
        "TimeoutError" => ErrorKind::TimeoutError,
        "OSError" | "IOError" | "FileNotFoundError" | "FileExistsError" | "PermissionError"
        | "IsADirectoryError" | "NotADirectoryError" => {
            if TIMEOUT_TEXT.is_match(message) {
                ErrorKind::TimeoutError
            } else {
                ErrorKind::FileSystemError
            }
        }
        // Everything else that names an exception was raised by running code.
        _ => ErrorKind::RuntimeError,
    }
}

fn specific_action(name: &str) -> Option<&'static str> {
    match name {
        "NameError" => Some("Check the variable is defined before use"),
        "ZeroDivisionError" => Some("Guard the divisor against zero before dividing"),
        "AttributeError" => Some("Check the object has the attribute on this firmware"),
        "KeyError" => Some("Check the key exists before indexing the dict"),
        "IndexError" => Some("Check the index is within the sequence bounds"),
        "TypeError" => Some("Check argument types and counts"),
        _ => None,
    }
}
