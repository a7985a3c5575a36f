//! Test doubles and packet builders. They are used by this crate's own tests,
//!  but they are part of the regular (non-`#[cfg(test)]`) tree so applications
//!  can drive readers, pipelines and connections against scripted data too.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use anyhow::bail;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;

use crate::api::uplink::{Uplink, UplinkMetrics};
use crate::dialect::{Heartbeat, MavMessage, SystemTime};
use crate::routing::transport::{ByteTransport, TransportFactory};
use crate::wire::{FrameCodec, RawMessage};

pub fn mock_frame<M: MavMessage>(data: &M, sysid: u8, compid: u8, seq: u8) -> Bytes {
    let mut payload = BytesMut::new();
    data.encode(&mut payload);
    FrameCodec::new().encode_v2(M::ID, &payload, sysid, compid, seq)
}

pub fn mock_message<M: MavMessage>(data: &M, sysid: u8, compid: u8, seq: u8) -> RawMessage {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&mock_frame(data, sysid, compid, seq));
    FrameCodec::new().try_parse(&mut buf)
        .expect("a freshly encoded frame parses")
}

pub fn mock_heartbeat_frame(sysid: u8, compid: u8, seq: u8) -> Bytes {
    mock_frame(&Heartbeat::gcs(), sysid, compid, seq)
}

pub fn mock_heartbeat_message() -> RawMessage {
    mock_message(&Heartbeat::gcs(), 1, 1, 0)
}

pub fn mock_heartbeat_message_from(sysid: u8, compid: u8) -> RawMessage {
    mock_message(&Heartbeat::gcs(), sysid, compid, 0)
}

/// a heartbeat with a distinguishing payload and a forged receive time, for
///  exercising identity- and deadline-sensitive code
pub fn mock_heartbeat_message_with(custom_mode: u32, rx_time: Instant) -> RawMessage {
    let data = Heartbeat {
        custom_mode,
        ..Heartbeat::gcs()
    };
    let mut message = mock_message(&data, 1, 1, 0);
    message.rx_time = rx_time;
    message
}

pub fn mock_system_time_message() -> RawMessage {
    mock_message(&SystemTime { time_unix_usec: 1_000, time_boot_ms: 1 }, 1, 1, 0)
}


/// Scripted [ByteTransport]: reads pop pre-loaded chunks, writes are recorded,
///  open/close transitions are timestamped. With [Self::with_good_baud] the
///  scripted data is only visible at one baud rate, which is what the
///  auto-tune sweep needs to fail realistically at the wrong rates - reads at
///  a wrong rate block forever, like a serial port with mismatched framing.
pub struct MockTransport {
    reads: StdMutex<VecDeque<Bytes>>,
    written: StdMutex<Vec<u8>>,
    open: AtomicBool,
    baud_rate: AtomicU32,
    good_baud: Option<u32>,
    baud_history: StdMutex<Vec<u32>>,
    open_times: StdMutex<Vec<Instant>>,
    close_times: StdMutex<Vec<Instant>>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport {
            reads: StdMutex::new(VecDeque::new()),
            written: StdMutex::new(Vec::new()),
            open: AtomicBool::new(false),
            baud_rate: AtomicU32::new(57600),
            good_baud: None,
            baud_history: StdMutex::new(Vec::new()),
            open_times: StdMutex::new(Vec::new()),
            close_times: StdMutex::new(Vec::new()),
        }
    }

    pub fn with_good_baud(mut self, baud_rate: u32) -> MockTransport {
        self.good_baud = Some(baud_rate);
        self
    }

    pub fn push_read(&self, bytes: Bytes) {
        self.reads.lock().unwrap_or_else(PoisonError::into_inner).push_back(bytes);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn baud_history(&self) -> Vec<u32> {
        self.baud_history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.open_times.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn close_times(&self) -> Vec<Instant> {
        self.close_times.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn data_visible(&self) -> bool {
        self.good_baud
            .map(|good| self.baud_rate.load(Ordering::SeqCst) == good)
            .unwrap_or(true)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransport::new()
    }
}

#[async_trait]
impl ByteTransport for MockTransport {
    async fn open(&self) -> anyhow::Result<()> {
        self.open_times.lock().unwrap_or_else(PoisonError::into_inner).push(Instant::now());
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            bail!("mock transport is already closed");
        }
        self.close_times.lock().unwrap_or_else(PoisonError::into_inner).push(Instant::now());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if self.data_visible() {
            let chunk = self.reads.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
            if let Some(mut chunk) = chunk {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                chunk.advance(n);
                if !chunk.is_empty() {
                    self.reads.lock().unwrap_or_else(PoisonError::into_inner).push_front(chunk);
                }
                return Ok(n);
            }
        }

        // nothing to deliver: block like a quiet serial port
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
        Ok(())
    }

    fn bytes_to_read(&self) -> usize {
        if !self.data_visible() {
            return 0;
        }
        self.reads.lock().unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|chunk| chunk.len())
            .sum()
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::SeqCst);
        self.baud_history.lock().unwrap_or_else(PoisonError::into_inner).push(baud_rate);
    }
}


/// Adapts a shared transport handle into the boxed factory shape so tests can
///  keep a reference for assertions.
pub fn shared_factory(transport: Arc<dyn ByteTransport>) -> TransportFactory {
    Box::new(move |_| Ok(Box::new(SharedTransport(transport.clone()))))
}

struct SharedTransport(Arc<dyn ByteTransport>);

#[async_trait]
impl ByteTransport for SharedTransport {
    async fn open(&self) -> anyhow::Result<()> {
        self.0.open().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.0.close().await
    }

    fn is_open(&self) -> bool {
        self.0.is_open()
    }

    async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.0.read(buf).await
    }

    async fn write(&self, buf: &[u8]) -> anyhow::Result<()> {
        self.0.write(buf).await
    }

    fn bytes_to_read(&self) -> usize {
        self.0.bytes_to_read()
    }

    fn baud_rate(&self) -> u32 {
        self.0.baud_rate()
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.0.set_baud_rate(baud_rate)
    }
}


/// [Uplink] double that serves a scripted packet list and records what is
///  written to it.
pub struct DummyUplink {
    packets: StdMutex<VecDeque<RawMessage>>,
    written: StdMutex<Vec<Vec<u8>>>,
    metrics: UplinkMetrics,
}

impl DummyUplink {
    pub fn new() -> DummyUplink {
        DummyUplink::with_packets(Vec::new())
    }

    pub fn with_packets(packets: Vec<RawMessage>) -> DummyUplink {
        DummyUplink {
            packets: StdMutex::new(packets.into()),
            written: StdMutex::new(Vec::new()),
            metrics: UplinkMetrics::new(),
        }
    }

    pub fn push_packet(&self, message: RawMessage) {
        self.packets.lock().unwrap_or_else(PoisonError::into_inner).push_back(message);
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Default for DummyUplink {
    fn default() -> Self {
        DummyUplink::new()
    }
}

#[async_trait]
impl Uplink for DummyUplink {
    fn bytes_available(&self) -> usize {
        if self.packets.lock().unwrap_or_else(PoisonError::into_inner).is_empty() {
            0
        }
        else {
            100
        }
    }

    async fn next_packet(&self) -> anyhow::Result<Option<RawMessage>> {
        let next = self.packets.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        if let Some(message) = &next {
            self.metrics.record_received(message.msgid);
        }
        Ok(next)
    }

    async fn write_raw(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).push(frame.to_vec());
        Ok(())
    }

    fn metrics(&self) -> &UplinkMetrics {
        &self.metrics
    }
}
