use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::info;

use crate::routing::transport::ByteTransport;

/// TCP client transport. The stream is split so reads and writes do not
///  serialize against each other; `bytes_to_read` opportunistically pulls
///  whatever the socket already buffered.
pub struct TcpTransport {
    address: String,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: StdMutex<BytesMut>,
    baud_rate: AtomicU32,
}

impl TcpTransport {
    pub fn new(address: &str) -> TcpTransport {
        TcpTransport {
            address: address.to_string(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            pending: StdMutex::new(BytesMut::new()),
            baud_rate: AtomicU32::new(57600),
        }
    }

    fn take_pending(&self, buf: &mut [u8]) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.advance(n);
        n
    }
}

#[async_trait]
impl ByteTransport for TcpTransport {
    async fn open(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.address).await?;
        info!("tcp connection established to {}", self.address);

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let write_half = self.writer.lock().await.take();
        // an abandoned blocking read may still hold the read half; it is released
        //  when that read is cancelled
        drop(self.reader.try_lock().ok().and_then(|mut guard| guard.take()));

        if write_half.is_none() {
            bail!("tcp connection to {} is already closed", self.address);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true) // contended means in active use
    }

    async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let n = self.take_pending(buf);
        if n > 0 {
            return Ok(n);
        }

        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut()
            .ok_or_else(|| anyhow!("tcp connection to {} is closed", self.address))?;
        Ok(reader.read(buf).await?)
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut()
            .ok_or_else(|| anyhow!("tcp connection to {} is closed", self.address))?;
        writer.write_all(buf).await?;
        Ok(())
    }

    fn bytes_to_read(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Ok(guard) = self.reader.try_lock() {
            if let Some(reader) = guard.as_ref() {
                let mut chunk = [0u8; 2048];
                while let Ok(n) = reader.try_read(&mut chunk) {
                    if n == 0 {
                        break;
                    }
                    pending.extend_from_slice(&chunk[..n]);
                }
            }
        }

        pending.len()
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        // meaningless for a tcp link, but remembered for symmetry with serial
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let transport = TcpTransport::new(&addr.to_string());
        transport.open().await.unwrap();
        assert!(transport.is_open());

        transport.write(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert!(transport.close().await.is_err());

        server.await.unwrap();
    }
}
