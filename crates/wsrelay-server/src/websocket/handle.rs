//! Shared, write-side view of one websocket session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wsrelay_proto::frame::{self, Opcode};
use wsrelay_proto::{CloseFrame, SessionId};

use crate::config::ServerConfig;
use crate::errors::SendError;

/// Write half of a session's transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bound on queueing a Close behind a full queue, and on draining the queue
/// at teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Outbound buffering for one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendLimits {
    /// Frames waiting for the writer before sends fail with
    /// [`SendError::QueueFull`].
    pub queue_size: usize,
    /// Longest a single frame write may take before the transport is dropped.
    pub write_timeout: Duration,
}

impl Default for SendLimits {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for SendLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            queue_size: config.send_queue_size,
            write_timeout: config.write_timeout(),
        }
    }
}

enum Outbound {
    Frame(Bytes),
    /// Last frame written; anything queued behind it is dropped.
    Close(Bytes),
}

/// Lifecycle of a session. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Handshaking = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle to a live session, shared by the read loop, the keepalive task,
/// the registry and application code.
///
/// Senders never touch the socket. Frames go into a bounded queue that one
/// writer task drains, whole frame by whole frame, so concurrent senders
/// never interleave on the wire and a peer that stops reading only fills its
/// own queue.
pub struct SessionHandle {
    id: SessionId,
    peer: Option<SocketAddr>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    state: AtomicU8,
    cancel: CancellationToken,
    connected_at: Instant,
    last_pong: Mutex<Instant>,
    frames_sent: Arc<AtomicU64>,
}

impl SessionHandle {
    /// Spawns the session's writer task; must be called inside a runtime.
    pub fn new(
        id: SessionId,
        peer: Option<SocketAddr>,
        writer: BoxedWriter,
        cancel: CancellationToken,
        limits: SendLimits,
    ) -> Self {
        let (tx, rx) = mpsc::channel(limits.queue_size.max(1));
        let frames_sent = Arc::new(AtomicU64::new(0));
        let writer_task = tokio::spawn(write_loop(
            id.clone(),
            writer,
            rx,
            cancel.clone(),
            limits.write_timeout,
            Arc::clone(&frames_sent),
        ));
        let now = Instant::now();
        Self {
            id,
            peer,
            outbound: Mutex::new(Some(tx)),
            writer_task: Mutex::new(Some(writer_task)),
            state: AtomicU8::new(SessionState::Handshaking as u8),
            cancel,
            connected_at: now,
            last_pong: Mutex::new(now),
            frames_sent,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Handshaking → Open. Returns `false` if the session already moved on.
    pub(crate) fn mark_open(&self) -> bool {
        self.transition(SessionState::Handshaking, SessionState::Open)
    }

    /// Open → Closing. Exactly one caller wins and owns sending the Close frame.
    pub fn begin_closing(&self) -> bool {
        self.transition(SessionState::Open, SessionState::Closing)
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancelled when the session should stop: shutdown, keepalive timeout,
    /// a dead transport or an app close.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record a pong (or any proof of liveness).
    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last pong, or since the connection started.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames fully written to the transport.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Queue one pre-encoded frame. Never waits on the socket.
    ///
    /// Fails with [`SendError::Closed`] unless the session is Open and its
    /// writer is running, and with [`SendError::QueueFull`] when the peer is
    /// not keeping up; the frame is dropped in both cases.
    pub fn send_frame(&self, frame: &Bytes) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(SendError::Closed)?;
        match tx.try_send(Outbound::Frame(frame.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(session_id = %self.id, len = frame.len(), "send queue full, dropping frame");
                metrics::counter!("ws_send_queue_full_total").increment(1);
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.send_frame(&frame::encode(Opcode::Text, text.as_bytes(), true))
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), SendError> {
        self.send_frame(&frame::encode(Opcode::Binary, data, true))
    }

    /// Queue a Close frame regardless of state. It goes out after everything
    /// already queued and nothing goes out after it.
    pub(crate) async fn send_close_frame(&self, frame: &Bytes) -> Result<(), SendError> {
        let tx = self.outbound.lock().clone().ok_or(SendError::Closed)?;
        match tokio::time::timeout(CLOSE_TIMEOUT, tx.send(Outbound::Close(frame.clone()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout(CLOSE_TIMEOUT)),
        }
    }

    /// Server-initiated close: send `close` if this call moved the session to
    /// Closing, then cancel the session so its read loop tears it down.
    pub async fn close(&self, close: &CloseFrame) {
        if self.begin_closing() {
            if let Err(e) = self.send_close_frame(&close.encode()).await {
                debug!(session_id = %self.id, error = %e, "close frame not queued");
            }
        }
        self.cancel.cancel();
    }

    /// Stop accepting frames, give the writer a bounded time to flush what is
    /// queued, then shut the transport down. Returns `true` for the call that
    /// did it.
    pub(crate) async fn close_transport(&self) -> bool {
        if self.outbound.lock().take().is_none() {
            return false;
        }
        let task = self.writer_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                debug!(session_id = %self.id, "writer still busy, aborting");
                task.abort();
            }
        }
        true
    }
}

/// Drain `rx` into `writer`.
///
/// A frame is only ever cut short by a write error or by `write_timeout`, and
/// then the transport is dropped with nothing more written to it.
async fn write_loop(
    id: SessionId,
    mut writer: BoxedWriter,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    write_timeout: Duration,
    frames_sent: Arc<AtomicU64>,
) {
    while let Some(outbound) = rx.recv().await {
        let (bytes, last) = match outbound {
            Outbound::Frame(bytes) => (bytes, false),
            Outbound::Close(bytes) => (bytes, true),
        };
        match tokio::time::timeout(write_timeout, write_frame(&mut writer, &bytes)).await {
            Ok(Ok(())) => {
                let _ = frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!(session_id = %id, error = %e, "write failed, dropping transport");
                cancel.cancel();
                return;
            }
            Err(_) => {
                warn!(session_id = %id, ?write_timeout, "write stalled, dropping transport");
                metrics::counter!("ws_write_timeouts_total").increment(1);
                cancel.cancel();
                return;
            }
        }
        if last {
            break;
        }
    }

    match tokio::time::timeout(write_timeout, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session_id = %id, error = %e, "transport shutdown failed"),
        Err(_) => debug!(session_id = %id, "transport shutdown timed out"),
    }
}

async fn write_frame(writer: &mut BoxedWriter, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
