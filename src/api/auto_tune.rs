use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tracing::{debug, warn};

use crate::routing::io_stream::{IoStream, PREFERRED_BAUD_RATES};
use crate::util::retry::Retry;

/// Sweeps connection parameters (currently: candidate baud rates) until a
///  handshake succeeds. Each attempt sets the candidate rate, (re)connects and
///  runs the handshake under a wall-clock timeout; on failure or timeout the
///  stream is force-disconnected - abandoning the in-flight handshake is the
///  only cancellation mechanism - and the next candidate is tried. Exhaustion
///  yields the retry engine's aggregate error.
pub struct AutoTune {
    pub preferred_baud_rates: Vec<u32>,
    pub attempt_timeout: Duration,
    pub disconnect_first: bool,
}

impl Default for AutoTune {
    fn default() -> AutoTune {
        AutoTune {
            preferred_baud_rates: PREFERRED_BAUD_RATES.to_vec(),
            attempt_timeout: Duration::from_secs(10),
            disconnect_first: true,
        }
    }
}

impl AutoTune {
    pub async fn on_stream<T, F, Fut>(&self, io: &Arc<IoStream>, handshake: F) -> anyhow::Result<T>
    where
        F: Fn(Arc<IoStream>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if self.preferred_baud_rates.is_empty() {
            return self.attempt(io, &handshake).await;
        }

        Retry::over(self.preferred_baud_rates.clone())
            .with_interval(Duration::from_millis(200))
            .run(|baud_rate, _| {
                let handshake = &handshake;
                async move {
                    io.set_baud_rate(baud_rate)?;
                    self.attempt(io, handshake).await
                }
            })
            .await
    }

    async fn attempt<T, F, Fut>(&self, io: &Arc<IoStream>, handshake: &F) -> anyhow::Result<T>
    where
        F: Fn(Arc<IoStream>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let result = async {
            if self.disconnect_first {
                io.disconnect().await?;
            }
            io.connect(true).await?;
            debug!("connected to {}, waiting for handshake", io.args);

            match tokio::time::timeout(self.attempt_timeout, handshake(io.clone())).await {
                Ok(result) => result,
                Err(_) => bail!("handshake timeout after {:?}", self.attempt_timeout),
            }
        }
        .await;

        match &result {
            Ok(_) => debug!("handshake on {} completed", io.args),
            Err(e) => {
                warn!("handshake on {} failed, cleaning up: {:#}", io.args, e);
                if let Err(e) = io.disconnect().await {
                    warn!("cleanup disconnect of {} failed: {:#}", io.args, e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use anyhow::Context;

    use crate::dialect::{Heartbeat, MavMessage};
    use crate::routing::args::{Protocol, StreamArgs};
    use crate::test_util::{mock_heartbeat_frame, shared_factory, MockTransport};

    use super::*;

    fn stream_with(transport: Arc<MockTransport>) -> Arc<IoStream> {
        Arc::new(
            IoStream::new(StreamArgs::new(Protocol::Serial, "/dev/ttyTEST"))
                .with_factory(shared_factory(transport)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_baud_sweep_stops_at_the_first_working_rate() {
        // the link only produces data at 57600 baud
        let transport = Arc::new(MockTransport::new().with_good_baud(57600));
        transport.push_read(mock_heartbeat_frame(1, 1, 0));
        let io = stream_with(transport.clone());

        let tuner = AutoTune {
            preferred_baud_rates: vec![38400, 57600, 115200],
            attempt_timeout: Duration::from_millis(500),
            disconnect_first: true,
        };

        let message = tuner
            .on_stream(&io, |io| async move {
                io.read_packet().await?.context("stream closed during handshake")
            })
            .await
            .unwrap();

        assert_eq!(message.msgid, Heartbeat::ID);
        // 38400 was tried and failed, 57600 succeeded, 115200 never attempted
        assert_eq!(transport.baud_history(), vec![38400, 57600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_forces_a_disconnect() {
        let transport = Arc::new(MockTransport::new().with_good_baud(57600));
        let io = stream_with(transport.clone());

        let tuner = AutoTune {
            preferred_baud_rates: vec![38400],
            attempt_timeout: Duration::from_millis(500),
            disconnect_first: false,
        };

        let result = tuner
            .on_stream(&io, |io| async move {
                io.read_packet().await?.context("stream closed during handshake")
            })
            .await;

        assert!(result.is_err());
        assert!(!io.is_open());
        assert_eq!(transport.close_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_every_attempt() {
        let transport = Arc::new(MockTransport::new().with_good_baud(921600));
        let io = stream_with(transport.clone());

        let tuner = AutoTune {
            preferred_baud_rates: vec![38400, 57600],
            attempt_timeout: Duration::from_millis(100),
            disconnect_first: true,
        };

        let error = tuner
            .on_stream(&io, |io| async move {
                io.read_packet().await?.context("stream closed during handshake")
            })
            .await
            .unwrap_err();

        let message = error.to_string();
        assert!(message.contains("all 2 attempt(s) failed"), "was: {}", message);
        assert!(message.contains("handshake timeout"), "was: {}", message);
        assert!(message.contains("(x2)"), "was: {}", message);
    }
}
