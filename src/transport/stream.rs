//! Transport over an arbitrary async byte stream.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

use super::{Transport, READ_CHUNK_SIZE};
use crate::{Error, Result};

/// A [`Transport`] over an `AsyncRead` half and an `AsyncWrite` half.
///
/// Opening the transport spawns a background task that reads from the
/// stream and forwards chunks over a channel, so
/// [`read_available`](Transport::read_available) never blocks.
///
/// A stream transport can be opened once; after [`close`](Transport::close)
/// the halves are released and a new transport must be created.
pub struct StreamTransport<R, W> {
    reader: Option<R>,
    writer: Option<W>,
    rx: Option<mpsc::Receiver<std::io::Result<Vec<u8>>>>,
    task_handle: Option<JoinHandle<()>>,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a transport from the two halves of a stream.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
            rx: None,
            task_handle: None,
        }
    }
}

/// Background loop forwarding everything the device sends.
async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<std::io::Result<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(Ok(buffer[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    async fn open(&mut self) -> Result<()> {
        if self.rx.is_some() {
            return Ok(());
        }

        let reader = self.reader.take().ok_or(Error::TransportClosed)?;
        let (tx, rx) = mpsc::channel(256);
        self.task_handle = Some(tokio::spawn(read_loop(reader, tx)));
        self.rx = Some(rx);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        self.rx = None;

        if let Some(mut writer) = self.writer.take() {
            // The remote end may already be gone.
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.rx.is_none() {
            return Err(Error::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_available(&mut self) -> Result<Vec<u8>> {
        let rx = self.rx.as_mut().ok_or(Error::NotConnected)?;
        let mut collected = Vec::new();

        loop {
            match rx.try_recv() {
                Ok(Ok(chunk)) => collected.extend_from_slice(&chunk),
                Ok(Err(e)) => return Err(Error::from(e)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if collected.is_empty() {
                        return Err(Error::TransportClosed);
                    }
                    break;
                }
            }
        }

        Ok(collected)
    }

    fn is_open(&self) -> bool {
        self.rx.is_some()
    }
}

impl<R, W> Drop for StreamTransport<R, W> {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_before_open_fails() {
        let (host, _device) = duplex(64);
        let (r, w) = tokio::io::split(host);
        let mut transport = StreamTransport::new(r, w);
        assert!(matches!(transport.write(b"x").await, Err(Error::NotConnected)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn bytes_flow_both_ways() {
        let (host, device) = duplex(64);
        let (r, w) = tokio::io::split(host);
        let (mut device_r, mut device_w) = tokio::io::split(device);
        let mut transport = StreamTransport::new(r, w);
        transport.open().await.unwrap();

        transport.write(b"\x03").await.unwrap();
        let mut byte = [0u8; 1];
        device_r.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x03]);

        device_w.write_all(b">>> ").await.unwrap();
        let mut received = Vec::new();
        while received.len() < 4 {
            received.extend(transport.read_available().await.unwrap());
            tokio::task::yield_now().await;
        }
        assert_eq!(received, b">>> ");
    }

    #[tokio::test]
    async fn read_available_is_empty_when_idle() {
        let (host, _device) = duplex(64);
        let (r, w) = tokio::io::split(host);
        let mut transport = StreamTransport::new(r, w);
        transport.open().await.unwrap();
        assert!(transport.read_available().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_close_is_reported() {
        let (host, device) = duplex(64);
        let (r, w) = tokio::io::split(host);
        let mut transport = StreamTransport::new(r, w);
        transport.open().await.unwrap();
        drop(device);

        let mut result = transport.read_available().await;
        for _ in 0..50 {
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
            result = transport.read_available().await;
        }
        assert!(matches!(result, Err(Error::TransportClosed)));
    }

    #[tokio::test]
    async fn cannot_reopen_after_close() {
        let (host, _device) = duplex(64);
        let (r, w) = tokio::io::split(host);
        let mut transport = StreamTransport::new(r, w);
        transport.open().await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert!(matches!(transport.open().await, Err(Error::TransportClosed)));
    }
}
