use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;

use crate::api::indexed::IdIndexed;
use crate::api::message::TxMessage;
use crate::dialect::MavMessage;
use crate::wire::RawMessage;

/// Per-uplink receive statistics: one atomic counter per message ID plus a
///  gauge for bytes still pending in the receive buffer.
pub struct UplinkMetrics {
    counters: StdMutex<IdIndexed<Arc<AtomicU64>>>,
    pressure: AtomicUsize,
}

impl UplinkMetrics {
    pub fn new() -> UplinkMetrics {
        UplinkMetrics {
            counters: StdMutex::new(IdIndexed::new()),
            pressure: AtomicUsize::new(0),
        }
    }

    pub fn counter(&self, id: u32) -> Arc<AtomicU64> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(id, Default::default)
            .clone()
    }

    pub fn record_received(&self, id: u32) {
        self.counter(id).fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self, id: u32) -> u64 {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn count_of<M: MavMessage>(&self) -> u64 {
        self.count(M::ID)
    }

    pub fn set_pressure(&self, pending_bytes: usize) {
        self.pressure.store(pending_bytes, Ordering::SeqCst);
    }

    pub fn pressure(&self) -> usize {
        self.pressure.load(Ordering::SeqCst)
    }
}

impl Default for UplinkMetrics {
    fn default() -> Self {
        UplinkMetrics::new()
    }
}


/// A source of raw packets a [crate::api::reader::Reader] can subscribe to -
///  usually a live connection, or a scripted double in tests.
///
/// Several readers may share one uplink; the implementation serializes physical
///  reads so they cannot interleave.
#[async_trait]
pub trait Uplink: Send + Sync {
    /// bytes buffered and ready, used to bound draining
    fn bytes_available(&self) -> usize;

    /// the next framed packet, [None] once the source is closed/exhausted
    async fn next_packet(&self) -> anyhow::Result<Option<RawMessage>>;

    /// sends an already-framed packet
    async fn write_raw(&self, frame: &[u8]) -> anyhow::Result<()>;

    fn metrics(&self) -> &UplinkMetrics;

    /// outgoing sequence counter; sources that cannot send just keep 0
    fn next_tx_seq(&self) -> u8 {
        0
    }
}

/// Typed send on top of [Uplink::write_raw]: frames the value with the GCS
///  identity and this uplink's sequence counter.
#[async_trait]
pub trait UplinkExt: Uplink {
    async fn write_data<M: MavMessage>(&self, data: M) -> anyhow::Result<()> {
        let frame = TxMessage::gcs(data).encode(self.next_tx_seq());
        self.write_raw(&frame).await
    }
}

#[async_trait]
impl<U: Uplink + ?Sized> UplinkExt for U {}

#[cfg(test)]
mod test {
    use crate::dialect::Heartbeat;

    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = UplinkMetrics::new();
        assert_eq!(metrics.count_of::<Heartbeat>(), 0);

        metrics.record_received(Heartbeat::ID);
        metrics.record_received(Heartbeat::ID);
        assert_eq!(metrics.count_of::<Heartbeat>(), 2);
        assert_eq!(metrics.count(9999), 0);
    }

    #[test]
    fn test_pressure_gauge() {
        let metrics = UplinkMetrics::new();
        metrics.set_pressure(42);
        assert_eq!(metrics.pressure(), 42);
    }
}
