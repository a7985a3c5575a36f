use std::collections::VecDeque;
use std::sync::Arc;

use crate::api::pipe::Pipe;
use crate::api::uplink::Uplink;
use crate::wire::RawMessage;

pub const DEFAULT_DRAIN_LEFTOVER: usize = 8;

/// A subscription: one pipe applied lazily to the raw packet stream of one or
///  more uplinks. Readers over the *same* uplink compose by merging their
///  pipes; readers over different uplinks keep every connection as an
///  independent source, consumed in order.
pub struct Reader<T: 'static> {
    sources: Vec<(Arc<dyn Uplink>, Pipe<T>)>,
    pending: VecDeque<T>,
    cursor: usize,
}

impl<T: 'static> std::fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("sources", &self.sources.len())
            .field("pending", &self.pending.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl<T: 'static> Reader<T> {
    pub fn new(uplink: Arc<dyn Uplink>, pipe: Pipe<T>) -> Reader<T> {
        Reader {
            sources: vec![(uplink, pipe)],
            pending: VecDeque::new(),
            cursor: 0,
        }
    }

    pub fn sources(&self) -> &[(Arc<dyn Uplink>, Pipe<T>)] {
        &self.sources
    }

    /// Pulls packets and applies the pipe while a source reports more than
    ///  `leftover` buffered bytes, returning everything produced.
    pub async fn drain(&mut self, leftover: usize) -> anyhow::Result<Vec<T>> {
        let mut out: Vec<T> = self.pending.drain(..).collect();

        for (uplink, pipe) in &self.sources {
            while uplink.bytes_available() > leftover {
                match uplink.next_packet().await? {
                    Some(message) => out.extend(pipe.process(&message)),
                    None => break,
                }
            }
        }
        Ok(out)
    }

    pub async fn drain_default(&mut self) -> anyhow::Result<Vec<T>> {
        self.drain(DEFAULT_DRAIN_LEFTOVER).await
    }

    /// The next produced value, pulling packets as needed. Sources are consumed
    ///  in order; [None] once every source is exhausted.
    pub async fn next(&mut self) -> anyhow::Result<Option<T>> {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return Ok(Some(value));
            }

            let Some((uplink, pipe)) = self.sources.get(self.cursor) else {
                return Ok(None);
            };
            match uplink.next_packet().await? {
                Some(message) => self.pending.extend(pipe.process(&message)),
                None => self.cursor += 1,
            }
        }
    }

    /// whether a value is currently producible without blocking on a read
    pub fn has_more(&self) -> bool {
        !self.pending.is_empty()
            || self.sources.iter().any(|(uplink, _)| uplink.bytes_available() > 0)
    }

    /// Merges with another reader: pipes are unioned where both readers share
    ///  an uplink, and the other reader's remaining uplinks become additional
    ///  sources.
    pub fn union(mut self, other: Reader<T>) -> Reader<T> {
        self.combine(other, |left, right| left.union(right))
    }

    /// Like [Self::union] with left-biased fallback semantics on shared
    ///  uplinks.
    pub fn or_else(mut self, other: Reader<T>) -> Reader<T> {
        self.combine(other, |left, right| left.or_else(right))
    }

    fn combine(
        &mut self,
        other: Reader<T>,
        merge: impl Fn(&Pipe<T>, &Pipe<T>) -> Pipe<T>,
    ) -> Reader<T> {
        let mut sources = std::mem::take(&mut self.sources);
        for (uplink, pipe) in other.sources {
            match sources.iter_mut().find(|(known, _)| Arc::ptr_eq(known, &uplink)) {
                Some((_, existing)) => *existing = merge(existing, &pipe),
                None => sources.push((uplink, pipe)),
            }
        }

        let mut pending = std::mem::take(&mut self.pending);
        pending.extend(other.pending);

        Reader {
            sources,
            pending,
            cursor: 0,
        }
    }

    /// Recomposes every source's pipe through a flattening transform. Only
    ///  affects packets read from here on.
    pub fn select_many<T2: 'static>(
        self,
        f: impl Fn(&RawMessage, T) -> Vec<T2> + Send + Sync + 'static,
    ) -> Reader<T2> {
        debug_assert!(self.pending.is_empty(), "recomposing a reader drops pending values");

        let f = Arc::new(f);
        Reader {
            sources: self.sources.into_iter()
                .map(|(uplink, pipe)| {
                    let mapped = pipe.select_many_arc(f.clone());
                    (uplink, mapped)
                })
                .collect(),
            pending: VecDeque::new(),
            cursor: 0,
        }
    }

    pub fn select<T2: 'static>(
        self,
        f: impl Fn(&RawMessage, T) -> T2 + Send + Sync + 'static,
    ) -> Reader<T2> {
        self.select_many(move |message, value| vec![f(message, value)])
    }
}

#[cfg(test)]
mod test {
    use crate::api::pipe::{on, Pipe};
    use crate::dialect::{Heartbeat, MavMessage, SystemTime};
    use crate::test_util::{mock_heartbeat_message, mock_system_time_message, DummyUplink};

    use super::*;

    #[tokio::test]
    async fn test_raw_drain_emits_the_message() {
        let uplink = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let mut reader = Reader::new(uplink, Pipe::raw());

        let result = reader.drain_default().await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].msgid, Heartbeat::ID);
    }

    #[tokio::test]
    async fn test_typed_drain() {
        let uplink = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let mut reader = Reader::new(uplink, on::<Heartbeat>());

        let result = reader.drain_default().await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].data().unwrap(), &Heartbeat::gcs());
    }

    #[tokio::test]
    async fn test_select_transforms_output() {
        let uplink = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let reader = Reader::new(uplink, on::<Heartbeat>().select(|_, _| 1));

        let mut transformed = reader.select(|_, _| "transformed");
        let result = transformed.drain_default().await.unwrap();
        assert_eq!(result, vec!["transformed"]);
    }

    #[tokio::test]
    async fn test_select_many_flattens_output() {
        let uplink = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let reader = Reader::new(uplink, on::<Heartbeat>().select(|_, _| 1));

        let mut flattened = reader.select_many(|_, _| vec!["a", "b"]);
        let result = flattened.drain_default().await.unwrap();
        assert_eq!(result, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_union_with_different_uplinks_tracks_both_sources() {
        let uplink1: Arc<dyn Uplink> = Arc::new(DummyUplink::new());
        let uplink2: Arc<dyn Uplink> = Arc::new(DummyUplink::new());
        let pipe = on::<Heartbeat>().select(|_, _| 1);

        let combined = Reader::new(uplink1.clone(), pipe.clone())
            .union(Reader::new(uplink2.clone(), pipe));

        assert_eq!(combined.sources().len(), 2);
        assert!(Arc::ptr_eq(&combined.sources()[0].0, &uplink1));
        assert!(Arc::ptr_eq(&combined.sources()[1].0, &uplink2));
    }

    #[tokio::test]
    async fn test_union_with_same_uplink_combines_pipes() {
        let uplink = Arc::new(DummyUplink::with_packets(vec![
            mock_heartbeat_message(),
            mock_system_time_message(),
        ]));

        let hearts = Reader::new(uplink.clone() as Arc<dyn Uplink>, on::<Heartbeat>().select(|_, _| 1));
        let times = Reader::new(uplink as Arc<dyn Uplink>, on::<SystemTime>().select(|_, _| 2));

        let mut combined = hearts.union(times);
        assert_eq!(combined.sources().len(), 1);

        let mut result = combined.drain_default().await.unwrap();
        result.sort();
        assert_eq!(result, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_or_else_with_different_uplinks_tracks_both_sources() {
        let uplink1: Arc<dyn Uplink> = Arc::new(DummyUplink::new());
        let uplink2: Arc<dyn Uplink> = Arc::new(DummyUplink::new());
        let pipe = on::<Heartbeat>().select(|_, _| 1);

        let combined = Reader::new(uplink1, pipe.clone())
            .or_else(Reader::new(uplink2, pipe));

        assert_eq!(combined.sources().len(), 2);
    }

    #[tokio::test]
    async fn test_or_else_with_same_uplink_combines_pipes() {
        let uplink: Arc<dyn Uplink> = Arc::new(DummyUplink::new());

        let combined = Reader::new(uplink.clone(), on::<Heartbeat>().select(|_, _| 1))
            .or_else(Reader::new(uplink, on::<SystemTime>().select(|_, _| 2)));

        assert_eq!(combined.sources().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_respects_the_leftover_threshold() {
        let uplink = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let mut reader = Reader::new(uplink.clone() as Arc<dyn Uplink>, on::<Heartbeat>());

        // the dummy reports 100 buffered bytes; a higher threshold stops the drain
        let result = reader.drain(200).await.unwrap();
        assert!(result.is_empty());
        assert!(reader.has_more());

        let result = reader.drain_default().await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(!reader.has_more());
    }

    #[tokio::test]
    async fn test_next_walks_sources_in_order() {
        let uplink1 = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let uplink2 = Arc::new(DummyUplink::with_packets(vec![mock_heartbeat_message()]));
        let pipe = on::<Heartbeat>().select(|_, _| ());

        let mut reader = Reader::new(uplink1 as Arc<dyn Uplink>, pipe.clone())
            .union(Reader::new(uplink2 as Arc<dyn Uplink>, pipe));

        assert!(reader.next().await.unwrap().is_some());
        assert!(reader.next().await.unwrap().is_some());
        assert!(reader.next().await.unwrap().is_none());
    }
}
