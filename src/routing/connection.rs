use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::message::Component;
use crate::api::pipe::Pipe;
use crate::api::reader::Reader;
use crate::api::uplink::{Uplink, UplinkMetrics};
use crate::routing::io_stream::IoStream;
use crate::wire::RawMessage;

/// A live MAVLink endpoint on one [IoStream]: the packet source readers
///  subscribe to, plus the typed write path. Keeps per-ID receive counters and
///  a buffer-pressure gauge as it pulls packets.
pub struct MavConnection {
    io: Arc<IoStream>,
    pub this_component: Component,
    tx_seq: AtomicU8,
    metrics: UplinkMetrics,
}

impl MavConnection {
    pub fn new(io: Arc<IoStream>) -> MavConnection {
        MavConnection {
            io,
            this_component: Component::gcs(),
            tx_seq: AtomicU8::new(0),
            metrics: UplinkMetrics::new(),
        }
    }

    pub fn io(&self) -> &Arc<IoStream> {
        &self.io
    }

    /// subscribes a pipe to this connection's raw packet stream
    pub fn read<T: 'static>(self: Arc<Self>, pipe: Pipe<T>) -> Reader<T> {
        Reader::new(self as Arc<dyn Uplink>, pipe)
    }
}

#[async_trait]
impl Uplink for MavConnection {
    fn bytes_available(&self) -> usize {
        self.io.bytes_to_read()
    }

    async fn next_packet(&self) -> anyhow::Result<Option<RawMessage>> {
        match self.io.read_packet().await? {
            Some(message) => {
                self.metrics.record_received(message.msgid);
                self.metrics.set_pressure(self.io.bytes_to_read());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn write_raw(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.io.write_bytes(frame).await
    }

    fn metrics(&self) -> &UplinkMetrics {
        &self.metrics
    }

    fn next_tx_seq(&self) -> u8 {
        self.tx_seq.fetch_add(1, Ordering::SeqCst)
    }
}
