//! The MicroPython raw REPL protocol.
//!
//! This module holds the control bytes and banners of the wire protocol, the
//! response parser, capability detection, adaptive timing, metrics, and the
//! [`RawRepl`] engine that drives a device through them.
//!
//! # Mode transitions
//!
//! ```text
//!            \r ^A (banner)              0x05 'A' 0x01 (R\x01 + window)
//!   Normal ─────────────────▶ Raw ────────────────────────────▶ RawPaste
//!     ▲                        │ ▲                                  │
//!     │   \r ^B (>>> prompt)   │ │     ^D, device ^D ack, response   │
//!     └────────────────────────┘ └──────────────────────────────────┘
//! ```
//!
//! Every public engine call starts and ends in [`ProtocolState::Normal`].
//!
//! # Example
//!
//! ```
//! use libmpy::protocol::parse_response;
//!
//! let parsed = parse_response(b"OK4\r\n\x04\x04>")?;
//! assert_eq!(parsed.output, "4");
//! assert_eq!(parsed.error, None);
//! # Ok::<(), libmpy::Error>(())
//! ```

pub mod capabilities;
mod engine;
mod metrics;
mod parser;
mod result;
mod timing;

use serde::{Deserialize, Serialize};

pub use capabilities::DeviceCapabilities;
pub use engine::RawRepl;
pub use metrics::{MetricsSnapshot, ProtocolMetrics};
pub use parser::{parse_body, parse_response, RawResponse};
pub use result::ExecutionResult;
pub use timing::AdaptiveTimeout;

/// Ctrl-C: interrupt the running program.
pub const INTERRUPT: u8 = 0x03;
/// Ctrl-A: enter raw mode.
pub const ENTER_RAW: u8 = 0x01;
/// Ctrl-B: leave raw mode.
pub const EXIT_RAW: u8 = 0x02;
/// Ctrl-D: end of code, and the response terminator.
pub const END_OF_DATA: u8 = 0x04;
/// Request raw-paste mode from within raw mode.
pub const RAW_PASTE_PROBE: &[u8] = b"\x05A\x01";
/// Flow-control credit byte sent by the device during raw paste.
pub const RAW_PASTE_CREDIT: u8 = 0x01;
/// Reply prefix when raw paste is available, followed by a `u16` LE window.
pub const RAW_PASTE_SUPPORTED: &[u8] = b"R\x01";
/// Reply when the device understands the request but refuses raw paste.
pub const RAW_PASTE_UNSUPPORTED: &[u8] = b"R\x00";
/// Banner printed on entering raw mode.
pub const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit";
/// The raw mode prompt.
pub const RAW_PROMPT: u8 = b'>';
/// Prefix acknowledging code received in plain raw mode.
pub const OK_PREFIX: &[u8] = b"OK";
/// The friendly REPL prompt.
pub const NORMAL_PROMPT: &[u8] = b">>> ";

/// Which REPL mode the device is in, as far as the host knows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolState {
    /// The friendly `>>>` REPL.
    #[default]
    Normal,
    /// Raw mode: code is sent blind and terminated with Ctrl-D.
    Raw,
    /// Raw-paste mode: code is sent against flow-control credit.
    RawPaste,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolState>();
        assert_send_sync::<DeviceCapabilities>();
        assert_send_sync::<ExecutionResult>();
        assert_send_sync::<ProtocolMetrics>();
        assert_send_sync::<MetricsSnapshot>();
    }

    #[test]
    fn control_bytes_are_distinct() {
        let bytes = [INTERRUPT, ENTER_RAW, EXIT_RAW, END_OF_DATA, RAW_PASTE_PROBE[0]];
        for (i, a) in bytes.iter().enumerate() {
            for b in &bytes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn state_defaults_to_normal() {
        assert_eq!(ProtocolState::default(), ProtocolState::Normal);
        let json = serde_json::to_string(&ProtocolState::RawPaste).unwrap();
        assert_eq!(json, "\"raw_paste\"");
    }
}
