pub mod tcp;
pub mod udp;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::routing::args::{Protocol, StreamArgs};

/// The duplexed byte stream a connection runs on. Implementations own their
///  socket/port state internally so all methods take `&self`; the connection
///  layer on top serializes reads and writes.
///
/// The baud rate is stored-but-inert for IP transports; serial implementations
///  (provided externally) apply it to the port.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ByteTransport: Send + Sync {
    async fn open(&self) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn is_open(&self) -> bool;

    async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize>;
    async fn write(&self, buf: &[u8]) -> anyhow::Result<()>;

    /// bytes that can be read without blocking - best effort, used for drain
    ///  bounds and the handshake's liveness probe
    fn bytes_to_read(&self) -> usize;

    fn baud_rate(&self) -> u32;
    fn set_baud_rate(&self, baud_rate: u32);
}

pub type TransportFactory = Box<dyn Fn(&StreamArgs) -> anyhow::Result<Box<dyn ByteTransport>> + Send + Sync>;

/// Builds the bundled transport for an address. Serial ports and websockets
///  are external concerns: connecting to them requires a caller-supplied
///  factory, and asking the default factory for one is a configuration error.
pub fn default_transport_factory() -> TransportFactory {
    Box::new(|args| match args.protocol {
        Protocol::Tcp => Ok(Box::new(tcp::TcpTransport::new(&args.address))),
        Protocol::Udp => Ok(Box::new(udp::UdpTransport::bound(&args.address))),
        Protocol::UdpConnect => Ok(Box::new(udp::UdpConnectTransport::new(&args.address))),
        Protocol::WebSocket | Protocol::Serial => Err(anyhow!(
            "no built-in transport for {} - provide a custom transport factory", args
        )),
    })
}
