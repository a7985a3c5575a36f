use std::fmt::{Display, Formatter};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    UdpConnect,
    WebSocket,
    Serial,
}

impl FromStr for Protocol {
    type Err = ArgsError;

    fn from_str(s: &str) -> Result<Protocol, ArgsError> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "udpcl" | "udp-connect" => Ok(Protocol::UdpConnect),
            "ws" | "websocket" => Ok(Protocol::WebSocket),
            "serial" => Ok(Protocol::Serial),
            other => Err(ArgsError::UnknownProtocol(other.to_string())),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::UdpConnect => "udpcl",
            Protocol::WebSocket => "ws",
            Protocol::Serial => "serial",
        };
        write!(f, "{}", tag)
    }
}

/// Malformed connection strings fail fast - they are programmer errors, not
///  transient conditions, and are never retried.
#[derive(Debug, Error)]
pub enum ArgsError {
    #[error("invalid connection string {0:?}, expecting protocol://address")]
    MalformedUri(String),
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
}

/// Where and how to connect: a protocol tag plus an address, parsed from a
///  `protocol://address` string. The DTR/RTS flags only matter for serial
///  transports and default to off.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StreamArgs {
    pub protocol: Protocol,
    pub address: String,
    pub dtr_enabled: bool,
    pub rts_enabled: bool,
}

impl StreamArgs {
    pub fn new(protocol: Protocol, address: impl Into<String>) -> StreamArgs {
        StreamArgs {
            protocol,
            address: address.into(),
            dtr_enabled: false,
            rts_enabled: false,
        }
    }

    /// the conventional local MAVLink forwarding target of a ground station
    pub fn udp_local_default() -> StreamArgs {
        StreamArgs::new(Protocol::Udp, "127.0.0.1:14550")
    }

    pub fn parse(s: &str) -> Result<StreamArgs, ArgsError> {
        let (protocol, address) = s
            .split_once("://")
            .ok_or_else(|| ArgsError::MalformedUri(s.to_string()))?;

        if address.is_empty() {
            return Err(ArgsError::MalformedUri(s.to_string()));
        }

        Ok(StreamArgs::new(protocol.parse::<Protocol>()?, address))
    }
}

impl Display for StreamArgs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}
