use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::api::message::RxMessage;
use crate::api::pipe;
use crate::api::reader::Reader;
use crate::api::uplink::{Uplink, UplinkExt};
use crate::dialect::{Heartbeat, RequestDataStream};
use crate::util::retry::Retry;

/// a link that cannot produce at least this much during the handshake is
///  considered unusable
pub const MIN_HANDSHAKE_BYTES: usize = 8;

const WATCHDOG_ATTEMPTS: usize = 12;
const BYTES_PROBE_ATTEMPTS: usize = 24;
const RESPONSE_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no heartbeat received")]
    NoHeartbeat,
    #[error("only received {received} byte(s) after {elapsed:?}, expecting at least {expected}")]
    InsufficientBytes {
        received: usize,
        expected: usize,
        elapsed: Duration,
    },
}

/// Heartbeat-based liveness check for a freshly connected uplink, in the
///  "nudge and retry" style flaky links need: every attempt first writes our
///  own heartbeat to provoke a response, then optionally verifies that bytes
///  are flowing at all, then drains heartbeats - acknowledging each one and
///  asking its sender to start streaming all of its data.
///
/// Fails with the aggregate retry error once the attempts are exhausted;
///  returns a heartbeat reader on the uplink otherwise.
pub async fn watchdog(
    uplink: Arc<dyn Uplink>,
    require_received_bytes: bool,
    require_heartbeat: bool,
) -> anyhow::Result<Reader<RxMessage<Heartbeat>>> {
    Retry::up_to(WATCHDOG_ATTEMPTS)
        .with_interval(Duration::ZERO)
        .run(|_, _| watchdog_attempt(&uplink, require_received_bytes, require_heartbeat))
        .await?;

    Ok(Reader::new(uplink, pipe::on::<Heartbeat>()))
}

async fn watchdog_attempt(
    uplink: &Arc<dyn Uplink>,
    require_received_bytes: bool,
    require_heartbeat: bool,
) -> anyhow::Result<()> {
    // nudge the remote regardless of how this attempt ends
    uplink.write_data(Heartbeat::gcs()).await?;
    sleep(RESPONSE_GRACE).await;

    if require_received_bytes {
        Retry::up_to(BYTES_PROBE_ATTEMPTS)
            .with_interval(Duration::from_millis(200))
            .run(|_, elapsed| {
                let uplink = uplink.clone();
                async move {
                    let received = uplink.bytes_available();
                    if received >= MIN_HANDSHAKE_BYTES {
                        Ok(())
                    }
                    else {
                        Err(HandshakeError::InsufficientBytes {
                            received,
                            expected: MIN_HANDSHAKE_BYTES,
                            elapsed,
                        }
                        .into())
                    }
                }
            })
            .await?;
    }

    if require_heartbeat {
        let mut senders = Reader::new(
            uplink.clone(),
            pipe::on::<Heartbeat>().select(|_, heartbeat| heartbeat.sender()),
        );

        for sender in senders.drain_default().await? {
            debug!("heartbeat from {:?} - acknowledging and requesting all data streams", sender);
            uplink.write_data(Heartbeat::gcs()).await?;
            uplink.write_data(RequestDataStream::all_streams(
                sender.system_id,
                sender.component_id,
                2,
            )).await?;
        }

        if uplink.metrics().count_of::<Heartbeat>() == 0 {
            return Err(HandshakeError::NoHeartbeat.into());
        }
    }

    Ok(())
}
