//! Keepalive pings and pong-based liveness.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use wsrelay_proto::frame::{self, Opcode};
use wsrelay_proto::{CloseCode, CloseFrame};

use super::handle::SessionHandle;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No pong arrived within the timeout window.
    TimedOut,
    /// A ping could not be queued: the transport is gone or the peer is
    /// not draining its queue.
    SendFailed,
    /// The session was cancelled or left the Open state.
    Cancelled,
}

/// Send a Ping every `interval` while the session is Open.
///
/// Before each ping the last-pong timestamp is checked; when it is older than
/// `timeout` the loop returns [`HeartbeatResult::TimedOut`]. Ticks that land
/// after the session started closing do nothing.
pub async fn run_heartbeat(
    handle: Arc<SessionHandle>,
    interval: Duration,
    timeout: Duration,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ping = frame::encode(Opcode::Ping, b"", true);
    let cancel = handle.cancel_token().clone();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                if !handle.is_open() {
                    return HeartbeatResult::Cancelled;
                }
                let silent = handle.last_pong_elapsed();
                if silent > timeout {
                    debug!(session_id = %handle.id(), ?silent, "no pong within timeout");
                    return HeartbeatResult::TimedOut;
                }
                if let Err(e) = handle.send_frame(&ping) {
                    debug!(session_id = %handle.id(), error = %e, "keepalive ping failed");
                    return HeartbeatResult::SendFailed;
                }
            }
        }
    }
}

/// Spawn the heartbeat for `handle`. A timeout or failed ping closes the session.
pub fn spawn_heartbeat(
    handle: Arc<SessionHandle>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<HeartbeatResult> {
    tokio::spawn(async move {
        let result = run_heartbeat(Arc::clone(&handle), interval, timeout).await;
        match result {
            HeartbeatResult::TimedOut => {
                warn!(session_id = %handle.id(), ?timeout, "keepalive timed out, closing session");
                metrics::counter!("ws_keepalive_timeouts_total").increment(1);
                handle
                    .close(&CloseFrame::new(CloseCode::POLICY_VIOLATION, "keepalive timeout"))
                    .await;
            }
            HeartbeatResult::SendFailed => handle.cancel_token().cancel(),
            HeartbeatResult::Cancelled => {}
        }
        result
    })
}
