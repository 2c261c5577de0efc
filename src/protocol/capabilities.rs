//! What the connected device can do.
//!
//! Detection runs once per connection, from raw mode:
//!
//! 1. The raw-paste request `0x05 'A' 0x01` is sent. A device that supports
//!    raw paste answers `R\x01` and a little-endian `u16` window, and is
//!    then already waiting for code. `R\x00` means it understands the
//!    request but refuses. Firmware that predates raw paste ignores the
//!    request and the trailing `0x01` re-prints the raw banner.
//! 2. A short platform probe prints `sys.platform` and whether `_thread`
//!    can be imported. Its round trip is the baseline latency.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::parser::{find, raw_banner_end};
use super::{RAW_PASTE_SUPPORTED, RAW_PASTE_UNSUPPORTED};

/// Platform string reported before (or without) a successful probe.
pub const UNKNOWN_PLATFORM: &str = "unknown";

/// Code run once per connection to learn the platform and threading support.
pub(crate) const PLATFORM_PROBE: &str = concat!(
    "import sys\n",
    "try:\n",
    " import _thread\n",
    " _t = 1\n",
    "except ImportError:\n",
    " _t = 0\n",
    "print(sys.platform + '|' + str(_t))\n",
    "del _t\n",
);

/// Snapshot of device capabilities learned on this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// The device accepted raw-paste mode.
    pub supports_raw_paste: bool,
    /// Chunk size used against raw-paste credit (device window capped by
    /// configuration).
    pub preferred_window: u16,
    /// Window size the device advertised.
    pub max_window: u16,
    /// `sys.platform` of the device.
    pub platform: String,
    /// `_thread` is importable on the device.
    pub supports_threading: bool,
    /// Round trip of the platform probe.
    pub baseline_latency: Duration,
    /// No further probing happens on this connection.
    pub detection_complete: bool,
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            supports_raw_paste: false,
            preferred_window: 0,
            max_window: 0,
            platform: UNKNOWN_PLATFORM.to_string(),
            supports_threading: false,
            baseline_latency: Duration::ZERO,
            detection_complete: false,
        }
    }
}

impl DeviceCapabilities {
    /// Whether the platform probe has reported a platform.
    pub fn platform_known(&self) -> bool {
        self.platform != UNKNOWN_PLATFORM
    }
}

/// How the device answered the raw-paste request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PasteReply {
    /// Raw paste is active with the given window.
    Supported { window: u16 },
    /// The device refused, or predates raw paste.
    Unsupported,
}

/// Recognize a raw-paste reply at the start of `buf`.
///
/// Returns the reply and the number of bytes it spans, or `None` while the
/// reply is still incomplete.
pub(crate) fn interpret_paste_reply(buf: &[u8]) -> Option<(PasteReply, usize)> {
    if let Some(start) = find(buf, RAW_PASTE_SUPPORTED) {
        let window_at = start + RAW_PASTE_SUPPORTED.len();
        if buf.len() >= window_at + 2 {
            let window = u16::from_le_bytes([buf[window_at], buf[window_at + 1]]);
            return Some((PasteReply::Supported { window }, window_at + 2));
        }
        return None;
    }
    if let Some(start) = find(buf, RAW_PASTE_UNSUPPORTED) {
        return Some((PasteReply::Unsupported, start + RAW_PASTE_UNSUPPORTED.len()));
    }
    raw_banner_end(buf).map(|end| (PasteReply::Unsupported, end))
}

/// Frame-end predicate for [`interpret_paste_reply`].
pub(crate) fn paste_reply_end(buf: &[u8]) -> Option<usize> {
    interpret_paste_reply(buf).map(|(_, end)| end)
}

/// Parse the platform probe output: `<platform>|<0 or 1>`.
pub(crate) fn parse_platform(output: &str) -> Option<(String, bool)> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?;
    let (platform, threading) = line.trim().rsplit_once('|')?;
    if platform.is_empty() {
        return None;
    }
    Some((platform.to_string(), threading == "1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_reply_carries_window() {
        let reply = interpret_paste_reply(b"R\x01\x80\x00");
        assert_eq!(reply, Some((PasteReply::Supported { window: 128 }, 4)));
    }

    #[test]
    fn incomplete_window_waits() {
        assert_eq!(interpret_paste_reply(b"R\x01\x80"), None);
        assert_eq!(interpret_paste_reply(b""), None);
    }

    #[test]
    fn refused_reply() {
        assert_eq!(
            interpret_paste_reply(b"R\x00"),
            Some((PasteReply::Unsupported, 2))
        );
    }

    #[test]
    fn old_firmware_reprints_banner() {
        let buf = b"raw REPL; CTRL-B to exit\r\n>";
        assert_eq!(
            interpret_paste_reply(buf),
            Some((PasteReply::Unsupported, buf.len()))
        );
    }

    #[test]
    fn platform_probe_output() {
        assert_eq!(parse_platform("esp32|1"), Some(("esp32".to_string(), true)));
        assert_eq!(parse_platform("rp2|0\r\n"), Some(("rp2".to_string(), false)));
        assert_eq!(
            parse_platform("boot noise\r\nlinux|1"),
            Some(("linux".to_string(), true))
        );
        assert_eq!(parse_platform(""), None);
        assert_eq!(parse_platform("garbage"), None);
    }

    #[test]
    fn default_is_undetected() {
        let caps = DeviceCapabilities::default();
        assert!(!caps.detection_complete);
        assert!(!caps.platform_known());
        assert!(!caps.supports_threading);
    }

    #[test]
    fn probe_code_is_valid_shape() {
        assert!(PLATFORM_PROBE.contains("import _thread"));
        assert!(PLATFORM_PROBE.lines().all(|l| !l.ends_with(' ')));
    }
}
