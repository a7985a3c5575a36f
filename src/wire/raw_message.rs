use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use tokio::time::Instant;

/// The trailing signature block of a signed v2 frame: link id, a 48-bit
///  monotonic timestamp and the first six bytes of the link's HMAC.
///
/// The core does not verify signatures - that is the codec owner's concern -
///  but it carries them because the high-availability verifier uses the
///  signature as part of a message's structural identity.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SignatureBlock {
    pub link_id: u8,
    pub timestamp: u64,
    pub signature: [u8; 6],
}
impl Debug for SignatureBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sig[link:{} ts:{}]", self.link_id, self.timestamp)
    }
}

/// A raw framed packet as produced by the codec: identity, payload and receive
///  timestamp. Owned and immutable; cloning is cheap ([Bytes] is refcounted).
#[derive(Clone, Eq, PartialEq)]
pub struct RawMessage {
    pub msgid: u32,
    pub sysid: u8,
    pub compid: u8,
    pub seq: u8,
    /// payload zero-extended to the catalog length (v2 truncation undone)
    pub payload: Bytes,
    pub rx_time: Instant,
    pub signature: Option<SignatureBlock>,
    /// the frame exactly as it appeared on the wire
    pub frame: Bytes,
}
impl Debug for RawMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawMessage{{msgid:{} from:{}/{} seq:{} len:{}}}",
               self.msgid, self.sysid, self.compid, self.seq, self.payload.len())
    }
}
