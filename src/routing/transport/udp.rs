use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::routing::transport::ByteTransport;

fn take_pending(pending: &StdMutex<BytesMut>, buf: &mut [u8]) -> usize {
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    let n = pending.len().min(buf.len());
    buf[..n].copy_from_slice(&pending[..n]);
    pending.advance(n);
    n
}

/// UDP in listening mode: binds the given local address, accepts datagrams from
///  anyone and addresses writes to whoever sent last. Writes before the first
///  peer is known are dropped.
pub struct UdpTransport {
    address: String,
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    peer: StdMutex<Option<SocketAddr>>,
    pending: StdMutex<BytesMut>,
    baud_rate: AtomicU32,
}

impl UdpTransport {
    pub fn bound(address: &str) -> UdpTransport {
        UdpTransport {
            address: address.to_string(),
            socket: StdMutex::new(None),
            peer: StdMutex::new(None),
            pending: StdMutex::new(BytesMut::new()),
            baud_rate: AtomicU32::new(57600),
        }
    }

    fn socket(&self) -> anyhow::Result<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("udp socket on {} is closed", self.address))
    }
}

#[async_trait]
impl ByteTransport for UdpTransport {
    async fn open(&self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(&self.address).await?;
        info!("udp socket listening on {}", socket.local_addr()?);
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(socket));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let prev = self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        if prev.is_none() {
            bail!("udp socket on {} is already closed", self.address);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let n = take_pending(&self.pending, buf);
        if n > 0 {
            return Ok(n);
        }

        let socket = self.socket()?;
        let (n, from) = socket.recv_from(buf).await?;
        *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(from);
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        let peer = *self.peer.lock().unwrap_or_else(PoisonError::into_inner);
        match peer {
            Some(peer) => {
                self.socket()?.send_to(buf, peer).await?;
            }
            None => {
                debug!("no udp peer yet on {} - dropping {} byte(s)", self.address, buf.len());
            }
        }
        Ok(())
    }

    fn bytes_to_read(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Ok(socket) = self.socket() {
            let mut chunk = [0u8; 2048];
            while let Ok((n, from)) = socket.try_recv_from(&mut chunk) {
                pending.extend_from_slice(&chunk[..n]);
                *self.peer.lock().unwrap_or_else(PoisonError::into_inner) = Some(from);
            }
        }

        pending.len()
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
    }
}


/// UDP in connected mode: sends to a fixed remote address and only accepts
///  datagrams from it.
pub struct UdpConnectTransport {
    address: String,
    socket: StdMutex<Option<Arc<UdpSocket>>>,
    pending: StdMutex<BytesMut>,
    baud_rate: AtomicU32,
}

impl UdpConnectTransport {
    pub fn new(address: &str) -> UdpConnectTransport {
        UdpConnectTransport {
            address: address.to_string(),
            socket: StdMutex::new(None),
            pending: StdMutex::new(BytesMut::new()),
            baud_rate: AtomicU32::new(57600),
        }
    }

    fn socket(&self) -> anyhow::Result<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| anyhow!("udp connection to {} is closed", self.address))
    }
}

#[async_trait]
impl ByteTransport for UdpConnectTransport {
    async fn open(&self) -> anyhow::Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.address).await?;
        info!("udp socket connected to {}", self.address);
        *self.socket.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(socket));
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        let prev = self.socket.lock().unwrap_or_else(PoisonError::into_inner).take();
        if prev.is_none() {
            bail!("udp connection to {} is already closed", self.address);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let n = take_pending(&self.pending, buf);
        if n > 0 {
            return Ok(n);
        }
        Ok(self.socket()?.recv(buf).await?)
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.socket()?.send(buf).await?;
        Ok(())
    }

    fn bytes_to_read(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if let Ok(socket) = self.socket() {
            let mut chunk = [0u8; 2048];
            while let Ok(n) = socket.try_recv(&mut chunk) {
                pending.extend_from_slice(&chunk[..n]);
            }
        }

        pending.len()
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_connected_pair_round_trip() {
        let listening = UdpTransport::bound("127.0.0.1:0");
        listening.open().await.unwrap();
        let addr = listening.socket().unwrap().local_addr().unwrap();

        let connected = UdpConnectTransport::new(&addr.to_string());
        connected.open().await.unwrap();

        connected.write(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = listening.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        // the listener learned its peer from the first datagram
        listening.write(b"world").await.unwrap();
        let n = connected.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        listening.close().await.unwrap();
        assert!(listening.close().await.is_err());
    }

    #[tokio::test]
    async fn test_writes_without_peer_are_dropped() {
        let listening = UdpTransport::bound("127.0.0.1:0");
        listening.open().await.unwrap();
        listening.write(b"nowhere to go").await.unwrap();
    }
}
