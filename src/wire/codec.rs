use bytes::{Buf, Bytes, BytesMut};
use crc::Crc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::api::registry::IdRegistry;
use crate::wire::raw_message::{RawMessage, SignatureBlock};

pub const STX_V1: u8 = 0xFE;
pub const STX_V2: u8 = 0xFD;

const HEADER_LEN_V1: usize = 6;
const HEADER_LEN_V2: usize = 10;
const CHECKSUM_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;

const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// Framing codec for MAVLink v1/v2 packets on a byte stream.
///
/// Parsing never returns an error: malformed input is skipped by resynchronizing
///  on the next start byte so the read loop can keep scanning, and an incomplete
///  trailing frame just waits for more bytes. Signatures are parsed and carried
///  but not verified here.
pub struct FrameCodec {
    registry: &'static IdRegistry,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            registry: IdRegistry::global(),
        }
    }

    /// Extracts the next complete, CRC-valid frame from the front of `buf`,
    ///  consuming it (and any leading garbage). Returns [None] when no complete
    ///  frame is buffered yet.
    pub fn try_parse(&self, buf: &mut BytesMut) -> Option<RawMessage> {
        loop {
            match buf.iter().position(|&b| b == STX_V1 || b == STX_V2) {
                None => {
                    // nothing resembling a frame start: all garbage
                    buf.clear();
                    return None;
                }
                Some(pos) => buf.advance(pos),
            }

            if buf.len() < 3 {
                return None;
            }

            let is_v2 = buf[0] == STX_V2;
            let payload_len = buf[1] as usize;
            let (header_len, signed) = if is_v2 {
                (HEADER_LEN_V2, buf[2] & INCOMPAT_FLAG_SIGNED != 0)
            }
            else {
                (HEADER_LEN_V1, false)
            };

            let frame_len = header_len
                + payload_len
                + CHECKSUM_LEN
                + if signed { SIGNATURE_LEN } else { 0 };
            if buf.len() < frame_len {
                return None;
            }

            let msgid = if is_v2 {
                u32::from_le_bytes([buf[7], buf[8], buf[9], 0])
            }
            else {
                buf[5] as u32
            };

            let descriptor = match self.registry.by_id(msgid) {
                Some(d) => d,
                None => {
                    // without a CRC-extra the frame cannot be validated: drop it whole
                    debug!("skipping frame with unknown message id {}", msgid);
                    buf.advance(frame_len);
                    continue;
                }
            };

            let crc_offset = header_len + payload_len;
            let expected = u16::from_le_bytes([buf[crc_offset], buf[crc_offset + 1]]);
            if frame_crc(&buf[1..crc_offset], descriptor.crc_extra) != expected {
                trace!("crc mismatch for message id {} - resynchronizing", msgid);
                buf.advance(1);
                continue;
            }

            let frame = buf.split_to(frame_len).freeze();
            let payload = zero_extended(
                frame.slice(header_len..header_len + payload_len),
                descriptor.payload_len,
            );

            let signature = signed.then(|| {
                let sig = &frame[crc_offset + CHECKSUM_LEN..];
                let mut ts = [0u8; 8];
                ts[..6].copy_from_slice(&sig[1..7]);
                SignatureBlock {
                    link_id: sig[0],
                    timestamp: u64::from_le_bytes(ts),
                    signature: sig[7..13].try_into().expect("6 signature bytes"),
                }
            });

            let (sysid, compid, seq) = if is_v2 {
                (frame[5], frame[6], frame[4])
            }
            else {
                (frame[3], frame[4], frame[2])
            };

            return Some(RawMessage {
                msgid,
                sysid,
                compid,
                seq,
                payload,
                rx_time: Instant::now(),
                signature,
                frame,
            });
        }
    }

    /// Frames a payload as a v2 packet, applying the trailing-zero truncation the
    ///  v2 wire format prescribes. Panics on message ids outside the 24-bit range
    ///  or payloads longer than 255 bytes (programmer error, not wire input).
    pub fn encode_v2(&self, msgid: u32, payload: &[u8], sysid: u8, compid: u8, seq: u8) -> Bytes {
        assert!(msgid < 1 << 24, "message id {} exceeds 24 bits", msgid);

        let mut truncated = payload.len();
        while truncated > 1 && payload[truncated - 1] == 0 {
            truncated -= 1;
        }
        assert!(truncated <= 255, "payload of {} bytes does not fit a frame", truncated);

        let mut buf = BytesMut::with_capacity(HEADER_LEN_V2 + truncated + CHECKSUM_LEN);
        buf.extend_from_slice(&[
            STX_V2,
            truncated as u8,
            0, // incompat flags: unsigned
            0, // compat flags
            seq,
            sysid,
            compid,
        ]);
        buf.extend_from_slice(&msgid.to_le_bytes()[..3]);
        buf.extend_from_slice(&payload[..truncated]);

        self.put_checksum(&mut buf, msgid);
        buf.freeze()
    }

    pub fn encode_v1(&self, msgid: u32, payload: &[u8], sysid: u8, compid: u8, seq: u8) -> Bytes {
        assert!(msgid <= 255, "message id {} does not fit a v1 frame", msgid);
        assert!(payload.len() <= 255, "payload of {} bytes does not fit a frame", payload.len());

        let mut buf = BytesMut::with_capacity(HEADER_LEN_V1 + payload.len() + CHECKSUM_LEN);
        buf.extend_from_slice(&[STX_V1, payload.len() as u8, seq, sysid, compid, msgid as u8]);
        buf.extend_from_slice(payload);

        self.put_checksum(&mut buf, msgid);
        buf.freeze()
    }

    fn put_checksum(&self, buf: &mut BytesMut, msgid: u32) {
        let crc_extra = self.registry.by_id(msgid)
            .map(|d| d.crc_extra)
            .expect("message id not in the catalog");
        let crc = frame_crc(&buf[1..], crc_extra);
        buf.extend_from_slice(&crc.to_le_bytes());
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new()
    }
}

/// X.25 checksum over everything after the start byte, folding in the per-kind
///  CRC-extra byte as the final input.
fn frame_crc(frame_after_stx: &[u8], crc_extra: u8) -> u16 {
    let hasher = Crc::<u16>::new(&crc::CRC_16_MCRF4XX);
    let mut digest = hasher.digest();
    digest.update(frame_after_stx);
    digest.update(&[crc_extra]);
    digest.finalize()
}

fn zero_extended(payload: Bytes, full_len: usize) -> Bytes {
    if payload.len() >= full_len {
        return payload;
    }
    let mut extended = BytesMut::with_capacity(full_len);
    extended.extend_from_slice(&payload);
    extended.resize(full_len, 0);
    extended.freeze()
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use crate::dialect::{Heartbeat, MavMessage, SystemTime};

    use super::*;

    fn heartbeat_frame(codec: &FrameCodec, seq: u8) -> Bytes {
        let mut payload = BytesMut::new();
        Heartbeat::gcs().encode(&mut payload);
        codec.encode_v2(Heartbeat::ID, &payload, 1, 1, seq)
    }

    #[test]
    fn test_v2_round_trip() {
        let codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&heartbeat_frame(&codec, 7));

        let msg = codec.try_parse(&mut buf).unwrap();
        assert_eq!(msg.msgid, Heartbeat::ID);
        assert_eq!(msg.sysid, 1);
        assert_eq!(msg.seq, 7);
        assert_eq!(msg.payload.len(), Heartbeat::PAYLOAD_LEN);
        assert_eq!(Heartbeat::decode(&msg.payload).unwrap(), Heartbeat::gcs());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_v1_round_trip() {
        let codec = FrameCodec::new();
        let mut payload = BytesMut::new();
        let original = SystemTime { time_unix_usec: 1_000_000, time_boot_ms: 17 };
        original.encode(&mut payload);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&codec.encode_v1(SystemTime::ID, &payload, 2, 3, 0));

        let msg = codec.try_parse(&mut buf).unwrap();
        assert_eq!(msg.msgid, SystemTime::ID);
        assert_eq!((msg.sysid, msg.compid), (2, 3));
        assert_eq!(SystemTime::decode(&msg.payload).unwrap(), original);
    }

    #[test]
    fn test_truncation_zero_extends() {
        let codec = FrameCodec::new();
        // a GCS heartbeat has custom_mode == 0 but non-zero trailing fields, so
        //  truncation only kicks in for an all-defaults payload
        let all_zero = Heartbeat {
            custom_mode: 0,
            mav_type: 0,
            autopilot: 0,
            base_mode: 0,
            system_status: 0,
            mavlink_version: 0,
        };
        let mut payload = BytesMut::new();
        all_zero.encode(&mut payload);

        let frame = codec.encode_v2(Heartbeat::ID, &payload, 1, 1, 0);
        assert_eq!(frame[1], 1); // truncated to the minimum of one payload byte

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        let msg = codec.try_parse(&mut buf).unwrap();
        assert_eq!(msg.payload.len(), Heartbeat::PAYLOAD_LEN);
        assert_eq!(Heartbeat::decode(&msg.payload).unwrap(), all_zero);
    }

    #[test]
    fn test_resync_after_garbage() {
        let codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x00, 0x12, 0xAB]);
        buf.extend_from_slice(&heartbeat_frame(&codec, 1));

        let msg = codec.try_parse(&mut buf).unwrap();
        assert_eq!(msg.seq, 1);
    }

    #[test]
    fn test_corrupt_crc_is_dropped_silently() {
        let codec = FrameCodec::new();
        let mut corrupt = BytesMut::from(&heartbeat_frame(&codec, 1)[..]);
        let len = corrupt.len();
        corrupt[12] ^= 0x11; // flip a payload byte
        corrupt[len - 2] = 0; // and pin the checksum to a known-bad value
        corrupt[len - 1] = 0;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&corrupt);
        buf.extend_from_slice(&heartbeat_frame(&codec, 2));

        // the corrupted frame is skipped, the next one still parses
        let msg = codec.try_parse(&mut buf).unwrap();
        assert_eq!(msg.seq, 2);
        assert!(codec.try_parse(&mut buf).is_none());
    }

    #[test]
    fn test_incomplete_frame_waits_for_more() {
        let codec = FrameCodec::new();
        let frame = heartbeat_frame(&codec, 3);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame[..frame.len() - 4]);

        assert!(codec.try_parse(&mut buf).is_none());
        buf.put_slice(&frame[frame.len() - 4..]);
        assert_eq!(codec.try_parse(&mut buf).unwrap().seq, 3);
    }

    #[test]
    fn test_signed_frame_carries_signature() {
        let codec = FrameCodec::new();
        let unsigned = heartbeat_frame(&codec, 5);

        // re-frame by hand with the signed incompat flag and a signature block
        let payload_and_header = &unsigned[..unsigned.len() - CHECKSUM_LEN];
        let mut signed = BytesMut::from(payload_and_header);
        signed[2] = INCOMPAT_FLAG_SIGNED;
        let crc = frame_crc(&signed[1..], Heartbeat::CRC_EXTRA);
        signed.extend_from_slice(&crc.to_le_bytes());
        signed.extend_from_slice(&[9]); // link id
        signed.extend_from_slice(&42u64.to_le_bytes()[..6]);
        signed.extend_from_slice(&[1, 2, 3, 4, 5, 6]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&signed);
        let msg = codec.try_parse(&mut buf).unwrap();

        let sig = msg.signature.unwrap();
        assert_eq!(sig.link_id, 9);
        assert_eq!(sig.timestamp, 42);
        assert_eq!(sig.signature, [1, 2, 3, 4, 5, 6]);
        assert!(buf.is_empty());
    }
}
