use std::fmt::{Debug, Formatter};

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use tokio::time::Instant;

use crate::api::registry::IdRegistry;
use crate::dialect::{MavMessage, MessageDescriptor};
use crate::wire::{FrameCodec, RawMessage, SignatureBlock};

/// A system/component pair identifying one end of a link.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Component {
    pub system_id: u8,
    pub component_id: u8,
}

impl Component {
    /// the conventional ground-control-station identity
    pub fn gcs() -> Component {
        Component {
            system_id: 255,
            component_id: 0,
        }
    }

    pub fn to_message<M: MavMessage>(self, data: M) -> TxMessage<M> {
        TxMessage { data, sender: self }
    }
}


/// A received, typed message: the raw frame plus a payload that is decoded
///  lazily on first access and memoized. Decoding is pure, so repeated access
///  always yields the same value.
#[derive(Clone)]
pub struct RxMessage<M: MavMessage> {
    raw: RawMessage,
    decoded: OnceCell<M>,
}

impl<M: MavMessage> RxMessage<M> {
    pub fn from_raw(raw: RawMessage) -> RxMessage<M> {
        RxMessage {
            raw,
            decoded: OnceCell::new(),
        }
    }

    /// The decoded payload. The first call decodes and caches; a message whose
    ///  frame does not actually carry this type fails here rather than at
    ///  construction time.
    pub fn data(&self) -> anyhow::Result<&M> {
        self.decoded.get_or_try_init(|| {
            if self.raw.msgid != M::ID {
                return Err(anyhow!(
                    "frame carries message id {}, not {}", self.raw.msgid, M::ID
                ));
            }
            M::decode(&self.raw.payload)
        })
    }

    pub fn sender(&self) -> Component {
        Component {
            system_id: self.raw.sysid,
            component_id: self.raw.compid,
        }
    }

    pub fn rx_time(&self) -> Instant {
        self.raw.rx_time
    }

    pub fn signature(&self) -> Option<&SignatureBlock> {
        self.raw.signature.as_ref()
    }

    pub fn info(&self) -> &'static MessageDescriptor {
        IdRegistry::global().descriptor_of::<M>()
    }

    pub fn raw(&self) -> &RawMessage {
        &self.raw
    }
}

impl<M: MavMessage + Debug> Debug for RxMessage<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RxMessage{{{:?}, decoded:{:?}}}", self.raw, self.decoded.get())
    }
}


/// An outgoing typed message, framed on demand.
#[derive(Debug, Clone)]
pub struct TxMessage<M: MavMessage> {
    pub data: M,
    pub sender: Component,
}

impl<M: MavMessage> TxMessage<M> {
    pub fn gcs(data: M) -> TxMessage<M> {
        Component::gcs().to_message(data)
    }

    pub fn encode(&self, seq: u8) -> Bytes {
        let mut payload = BytesMut::new();
        self.data.encode(&mut payload);

        FrameCodec::new().encode_v2(
            M::ID,
            &payload,
            self.sender.system_id,
            self.sender.component_id,
            seq,
        )
    }
}

#[cfg(test)]
mod test {
    use crate::dialect::Heartbeat;
    use crate::test_util::mock_heartbeat_message;

    use super::*;

    #[test]
    fn test_lazy_decode_is_memoized() {
        let msg: RxMessage<Heartbeat> = RxMessage::from_raw(mock_heartbeat_message());

        let first = msg.data().unwrap() as *const Heartbeat;
        let second = msg.data().unwrap() as *const Heartbeat;
        assert_eq!(first, second);
        assert_eq!(msg.data().unwrap(), &Heartbeat::gcs());
    }

    #[test]
    fn test_decode_of_mismatched_frame_fails() {
        use crate::dialect::SystemTime;

        let msg: RxMessage<SystemTime> = RxMessage::from_raw(mock_heartbeat_message());
        assert!(msg.data().is_err());
    }

    #[test]
    fn test_sender_identity() {
        let msg: RxMessage<Heartbeat> = RxMessage::from_raw(mock_heartbeat_message());
        assert_eq!(msg.sender(), Component { system_id: 1, component_id: 1 });
    }

    #[test]
    fn test_tx_round_trip() {
        use bytes::BytesMut;
        use crate::wire::FrameCodec;

        let tx = TxMessage::gcs(Heartbeat::gcs());
        let frame = tx.encode(3);

        let mut buf = BytesMut::from(&frame[..]);
        let raw = FrameCodec::new().try_parse(&mut buf).unwrap();
        assert_eq!(raw.sysid, 255);
        assert_eq!(raw.seq, 3);

        let rx: RxMessage<Heartbeat> = RxMessage::from_raw(raw);
        assert_eq!(rx.data().unwrap(), &Heartbeat::gcs());
    }
}
