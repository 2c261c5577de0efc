//! Byte transports between the host and the device.
//!
//! The protocol engine only needs a duplex byte channel that can be read
//! without blocking and that can deliver an interrupt. [`Transport`] is that
//! seam. Two implementations ship with the crate:
//!
//! - [`StreamTransport`] wraps any `AsyncRead`/`AsyncWrite` pair, such as a
//!   serial port opened by the caller, a TCP socket, or `tokio::io::duplex`.
//! - [`ProcessTransport`] spawns an interpreter process (for example the
//!   MicroPython unix port) and talks to it over its stdio pipes.
//!
//! # Architecture
//!
//! ```text
//! libmpy                               device
//! ┌───────────────┐                   ┌──────────────┐
//! │ RawRepl       │──write(bytes)────▶│ raw REPL     │
//! │               │◀─read_available───│              │
//! │               │──send_interrupt──▶│              │
//! └───────────────┘                   └──────────────┘
//! ```

mod process;
mod stream;

use async_trait::async_trait;

use crate::protocol::INTERRUPT;
use crate::Result;

pub use process::ProcessTransport;
pub use stream::StreamTransport;

/// Size of a single read from the underlying stream.
pub const READ_CHUNK_SIZE: usize = 1024;

/// A duplex byte channel to a device.
///
/// Implementations must be cheap to poll: the engine calls
/// [`read_available`](Transport::read_available) in a loop, sleeping for the
/// configured poll interval whenever it returns no bytes.
#[async_trait]
pub trait Transport: Send {
    /// Open the channel. Opening an already open transport is a no-op.
    async fn open(&mut self) -> Result<()>;

    /// Close the channel and release its resources.
    async fn close(&mut self) -> Result<()>;

    /// Write all bytes to the device.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Return whatever bytes have arrived since the last call.
    ///
    /// Returns an empty vector when nothing is pending; never waits for data.
    async fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Interrupt whatever the device is running (Ctrl-C).
    async fn send_interrupt(&mut self) -> Result<()> {
        self.write(&[INTERRUPT]).await
    }

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn open(&mut self) -> Result<()> {
        (**self).open().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes).await
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        (**self).read_available().await
    }

    async fn send_interrupt(&mut self) -> Result<()> {
        (**self).send_interrupt().await
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transports_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ProcessTransport>();
        assert_send::<StreamTransport<tokio::io::DuplexStream, tokio::io::DuplexStream>>();
        assert_send::<Box<dyn Transport>>();
    }
}
