use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The compiled message catalog: a closed set of message kinds with fixed numeric
///  IDs, CRC-extra bytes and little-endian field layouts.
///
/// This plays the role of a generated dialect. The rest of the crate never matches
///  on concrete message types - it goes through [MavMessage] and the descriptor
///  table, so growing the catalog is purely additive.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum MessageKind {
    Heartbeat = 0,
    SystemTime = 2,
    Ping = 4,
    Attitude = 30,
    GlobalPositionInt = 33,
    RequestDataStream = 66,
}

/// Static per-kind metadata, the unit of the ID registry's lookup tables.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MessageDescriptor {
    pub id: u32,
    pub kind: MessageKind,
    pub crc_extra: u8,
    /// full (untruncated) payload length on the wire
    pub payload_len: usize,
}

/// A message type of the catalog: knows its wire identity and how to move itself
///  in and out of a payload buffer.
///
/// Decoding must tolerate payloads longer than it consumes (forward compatibility)
///  but fails on payloads that are too short after zero-extension.
pub trait MavMessage: Clone + Send + Sync + 'static {
    const ID: u32;
    const CRC_EXTRA: u8;
    const PAYLOAD_LEN: usize;

    fn kind() -> MessageKind;

    fn decode(payload: &[u8]) -> anyhow::Result<Self>;
    fn encode(&self, buf: &mut BytesMut);
}

pub static MESSAGE_INFOS: &[MessageDescriptor] = &[
    MessageDescriptor { id: Heartbeat::ID, kind: MessageKind::Heartbeat, crc_extra: Heartbeat::CRC_EXTRA, payload_len: Heartbeat::PAYLOAD_LEN },
    MessageDescriptor { id: SystemTime::ID, kind: MessageKind::SystemTime, crc_extra: SystemTime::CRC_EXTRA, payload_len: SystemTime::PAYLOAD_LEN },
    MessageDescriptor { id: Ping::ID, kind: MessageKind::Ping, crc_extra: Ping::CRC_EXTRA, payload_len: Ping::PAYLOAD_LEN },
    MessageDescriptor { id: Attitude::ID, kind: MessageKind::Attitude, crc_extra: Attitude::CRC_EXTRA, payload_len: Attitude::PAYLOAD_LEN },
    MessageDescriptor { id: GlobalPositionInt::ID, kind: MessageKind::GlobalPositionInt, crc_extra: GlobalPositionInt::CRC_EXTRA, payload_len: GlobalPositionInt::PAYLOAD_LEN },
    MessageDescriptor { id: RequestDataStream::ID, kind: MessageKind::RequestDataStream, crc_extra: RequestDataStream::CRC_EXTRA, payload_len: RequestDataStream::PAYLOAD_LEN },
];


#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub custom_mode: u32,
    pub mav_type: u8,
    pub autopilot: u8,
    pub base_mode: u8,
    pub system_status: u8,
    pub mavlink_version: u8,
}
impl Heartbeat {
    pub const MAV_TYPE_GCS: u8 = 6;
    pub const MAV_AUTOPILOT_INVALID: u8 = 8;

    /// the heartbeat a ground station sends, regardless of what it received
    pub fn gcs() -> Heartbeat {
        Heartbeat {
            custom_mode: 0,
            mav_type: Self::MAV_TYPE_GCS,
            autopilot: Self::MAV_AUTOPILOT_INVALID,
            base_mode: 0,
            system_status: 0,
            mavlink_version: 3,
        }
    }
}
impl MavMessage for Heartbeat {
    const ID: u32 = 0;
    const CRC_EXTRA: u8 = 50;
    const PAYLOAD_LEN: usize = 9;

    fn kind() -> MessageKind {
        MessageKind::Heartbeat
    }

    fn decode(mut payload: &[u8]) -> anyhow::Result<Heartbeat> {
        Ok(Heartbeat {
            custom_mode: payload.try_get_u32_le()?,
            mav_type: payload.try_get_u8()?,
            autopilot: payload.try_get_u8()?,
            base_mode: payload.try_get_u8()?,
            system_status: payload.try_get_u8()?,
            mavlink_version: payload.try_get_u8()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.custom_mode);
        buf.put_u8(self.mav_type);
        buf.put_u8(self.autopilot);
        buf.put_u8(self.base_mode);
        buf.put_u8(self.system_status);
        buf.put_u8(self.mavlink_version);
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct SystemTime {
    pub time_unix_usec: u64,
    pub time_boot_ms: u32,
}
impl MavMessage for SystemTime {
    const ID: u32 = 2;
    const CRC_EXTRA: u8 = 137;
    const PAYLOAD_LEN: usize = 12;

    fn kind() -> MessageKind {
        MessageKind::SystemTime
    }

    fn decode(mut payload: &[u8]) -> anyhow::Result<SystemTime> {
        Ok(SystemTime {
            time_unix_usec: payload.try_get_u64_le()?,
            time_boot_ms: payload.try_get_u32_le()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.time_unix_usec);
        buf.put_u32_le(self.time_boot_ms);
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub time_usec: u64,
    pub seq: u32,
    pub target_system: u8,
    pub target_component: u8,
}
impl MavMessage for Ping {
    const ID: u32 = 4;
    const CRC_EXTRA: u8 = 237;
    const PAYLOAD_LEN: usize = 14;

    fn kind() -> MessageKind {
        MessageKind::Ping
    }

    fn decode(mut payload: &[u8]) -> anyhow::Result<Ping> {
        Ok(Ping {
            time_usec: payload.try_get_u64_le()?,
            seq: payload.try_get_u32_le()?,
            target_system: payload.try_get_u8()?,
            target_component: payload.try_get_u8()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.time_usec);
        buf.put_u32_le(self.seq);
        buf.put_u8(self.target_system);
        buf.put_u8(self.target_component);
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct Attitude {
    pub time_boot_ms: u32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub rollspeed: f32,
    pub pitchspeed: f32,
    pub yawspeed: f32,
}
impl MavMessage for Attitude {
    const ID: u32 = 30;
    const CRC_EXTRA: u8 = 39;
    const PAYLOAD_LEN: usize = 28;

    fn kind() -> MessageKind {
        MessageKind::Attitude
    }

    fn decode(mut payload: &[u8]) -> anyhow::Result<Attitude> {
        Ok(Attitude {
            time_boot_ms: payload.try_get_u32_le()?,
            roll: payload.try_get_f32_le()?,
            pitch: payload.try_get_f32_le()?,
            yaw: payload.try_get_f32_le()?,
            rollspeed: payload.try_get_f32_le()?,
            pitchspeed: payload.try_get_f32_le()?,
            yawspeed: payload.try_get_f32_le()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.time_boot_ms);
        buf.put_f32_le(self.roll);
        buf.put_f32_le(self.pitch);
        buf.put_f32_le(self.yaw);
        buf.put_f32_le(self.rollspeed);
        buf.put_f32_le(self.pitchspeed);
        buf.put_f32_le(self.yawspeed);
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct GlobalPositionInt {
    pub time_boot_ms: u32,
    pub lat: i32,
    pub lon: i32,
    pub alt: i32,
    pub relative_alt: i32,
    pub vx: i16,
    pub vy: i16,
    pub vz: i16,
    pub hdg: u16,
}
impl MavMessage for GlobalPositionInt {
    const ID: u32 = 33;
    const CRC_EXTRA: u8 = 104;
    const PAYLOAD_LEN: usize = 28;

    fn kind() -> MessageKind {
        MessageKind::GlobalPositionInt
    }

    fn decode(mut payload: &[u8]) -> anyhow::Result<GlobalPositionInt> {
        Ok(GlobalPositionInt {
            time_boot_ms: payload.try_get_u32_le()?,
            lat: payload.try_get_i32_le()?,
            lon: payload.try_get_i32_le()?,
            alt: payload.try_get_i32_le()?,
            relative_alt: payload.try_get_i32_le()?,
            vx: payload.try_get_i16_le()?,
            vy: payload.try_get_i16_le()?,
            vz: payload.try_get_i16_le()?,
            hdg: payload.try_get_u16_le()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.time_boot_ms);
        buf.put_i32_le(self.lat);
        buf.put_i32_le(self.lon);
        buf.put_i32_le(self.alt);
        buf.put_i32_le(self.relative_alt);
        buf.put_i16_le(self.vx);
        buf.put_i16_le(self.vy);
        buf.put_i16_le(self.vz);
        buf.put_u16_le(self.hdg);
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct RequestDataStream {
    pub req_message_rate: u16,
    pub target_system: u8,
    pub target_component: u8,
    pub req_stream_id: u8,
    pub start_stop: u8,
}
impl RequestDataStream {
    pub const STREAM_ALL: u8 = 0;

    /// ask the remote to start sending all of its data streams
    pub fn all_streams(target_system: u8, target_component: u8, rate_hz: u16) -> RequestDataStream {
        RequestDataStream {
            req_message_rate: rate_hz,
            target_system,
            target_component,
            req_stream_id: Self::STREAM_ALL,
            start_stop: 1,
        }
    }
}
impl MavMessage for RequestDataStream {
    const ID: u32 = 66;
    const CRC_EXTRA: u8 = 148;
    const PAYLOAD_LEN: usize = 6;

    fn kind() -> MessageKind {
        MessageKind::RequestDataStream
    }

    fn decode(mut payload: &[u8]) -> anyhow::Result<RequestDataStream> {
        Ok(RequestDataStream {
            req_message_rate: payload.try_get_u16_le()?,
            target_system: payload.try_get_u8()?,
            target_component: payload.try_get_u8()?,
            req_stream_id: payload.try_get_u8()?,
            start_stop: payload.try_get_u8()?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.req_message_rate);
        buf.put_u8(self.target_system);
        buf.put_u8(self.target_component);
        buf.put_u8(self.req_stream_id);
        buf.put_u8(self.start_stop);
    }
}
