use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use bytes::BytesMut;
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::routing::args::StreamArgs;
use crate::routing::transport::{default_transport_factory, ByteTransport, TransportFactory};
use crate::util::retry::Retry;
use crate::wire::{FrameCodec, RawMessage};

pub const DEFAULT_BAUD_RATE: u32 = 57600;
pub const PREFERRED_BAUD_RATES: &[u32] = &[DEFAULT_BAUD_RATE];

/// A connection over one [ByteTransport], created lazily and exactly once from
///  the stream args.
///
/// The read path (frame scanning) is serialized under one lock so concurrent
///  readers cannot interleave partial frames; the write path and the open/close
///  state machine are serialized under another. Reopening after a close blocks
///  until [Self::min_reopen_interval] has passed - flaky serial adapters and
///  remote endpoints tend to need the grace period.
pub struct IoStream {
    pub args: StreamArgs,
    factory: TransportFactory,
    transport: OnceCell<Box<dyn ByteTransport>>,
    min_reopen_interval: Duration,
    last_close: StdMutex<Option<Instant>>,
    read_state: Mutex<ReadState>,
    write_lock: Mutex<()>,
}

struct ReadState {
    codec: FrameCodec,
    buf: BytesMut,
}

impl IoStream {
    pub fn new(args: StreamArgs) -> IoStream {
        IoStream {
            args,
            factory: default_transport_factory(),
            transport: OnceCell::new(),
            min_reopen_interval: Duration::from_secs(1),
            last_close: StdMutex::new(None),
            read_state: Mutex::new(ReadState {
                codec: FrameCodec::new(),
                buf: BytesMut::new(),
            }),
            write_lock: Mutex::new(()),
        }
    }

    /// replaces the bundled transport factory, e.g. to plug in a serial port
    ///  implementation or a test double
    pub fn with_factory(mut self, factory: TransportFactory) -> IoStream {
        self.factory = factory;
        self
    }

    pub fn with_min_reopen_interval(mut self, interval: Duration) -> IoStream {
        self.min_reopen_interval = interval;
        self
    }

    fn transport(&self) -> anyhow::Result<&dyn ByteTransport> {
        self.transport
            .get_or_try_init(|| (self.factory)(&self.args))
            .map(|transport| transport.as_ref())
    }

    pub fn is_open(&self) -> bool {
        // a transport that was never created cannot be open
        self.transport.get()
            .map(|transport| transport.is_open())
            .unwrap_or(false)
    }

    /// Drives the open/close state machine. A request matching the current
    ///  state is a no-op; otherwise the transition is attempted a few times,
    ///  and the observed state must equal the requested state afterwards or
    ///  the transition fails as an I/O error.
    pub async fn set_open(&self, open: bool) -> anyhow::Result<()> {
        let _write = self.write_lock.lock().await;
        let transport = self.transport()?;

        if transport.is_open() == open {
            return Ok(());
        }

        Retry::up_to(4)
            .with_interval(Duration::from_millis(500))
            .run(|_, _| self.transition(transport, open))
            .await?;

        debug!("{} is now {}, baud rate {}",
               self.args, if open { "open" } else { "closed" }, transport.baud_rate());
        Ok(())
    }

    async fn transition(&self, transport: &dyn ByteTransport, open: bool) -> anyhow::Result<()> {
        if open {
            let since_close = self.last_close.lock().unwrap_or_else(PoisonError::into_inner)
                .map(|closed_at| closed_at.elapsed());
            if let Some(elapsed) = since_close {
                if elapsed < self.min_reopen_interval {
                    let wait = self.min_reopen_interval - elapsed;
                    debug!("waiting {:?} before reopening {}", wait, self.args);
                    sleep(wait).await;
                }
            }

            transport.open().await?;
            info!("connected to {} at {} baud", self.args, transport.baud_rate());
        }
        else {
            match transport.close().await {
                Ok(()) => {
                    *self.last_close.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                }
                Err(e) if !transport.is_open() => {
                    warn!("error on closing {} but it is already closed: {:#}", self.args, e);
                }
                Err(e) => return Err(e),
            }
        }

        if transport.is_open() != open {
            bail!("failed to set {} to {}, baud rate {}",
                  self.args, if open { "open" } else { "closed" }, transport.baud_rate());
        }
        Ok(())
    }

    /// Opens the stream and optionally writes an all-zero probe to prove the
    ///  link is writable.
    pub async fn connect(&self, verify_write: bool) -> anyhow::Result<()> {
        self.set_open(true).await?;

        if verify_write {
            self.write_bytes(&[0u8; 8]).await?;
        }
        Ok(())
    }

    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.set_open(false).await
    }

    pub async fn write_bytes(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let _write = self.write_lock.lock().await;
        self.transport()?.write(bytes).await
    }

    /// Pulls the next framed packet off the transport, refilling the scan
    ///  buffer as needed. [None] once the stream is closed or at end of input.
    ///  Only one caller at a time performs physical reads.
    pub async fn read_packet(&self) -> anyhow::Result<Option<RawMessage>> {
        let mut state = self.read_state.lock().await;

        loop {
            if !self.is_open() {
                return Ok(None);
            }

            let ReadState { codec, buf } = &mut *state;
            if let Some(message) = codec.try_parse(buf) {
                return Ok(Some(message));
            }

            let mut chunk = [0u8; 2048];
            let n = self.transport()?.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            state.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// buffered-but-unparsed bytes plus whatever the transport reports
    pub fn bytes_to_read(&self) -> usize {
        let buffered = self.read_state.try_lock()
            .map(|state| state.buf.len())
            .unwrap_or(0);

        buffered + self.transport.get()
            .map(|transport| transport.bytes_to_read())
            .unwrap_or(0)
    }

    pub fn baud_rate(&self) -> anyhow::Result<u32> {
        Ok(self.transport()?.baud_rate())
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> anyhow::Result<()> {
        self.transport()?.set_baud_rate(baud_rate);
        Ok(())
    }
}
