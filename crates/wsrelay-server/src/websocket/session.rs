//! Per-connection session: handshake, read loop, frame dispatch, teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, trace, warn};
use wsrelay_proto::close::{self, CloseCode, CloseFrame};
use wsrelay_proto::frame::{self, Decoded, Frame, Opcode};
use wsrelay_proto::{Message, MessageAssembler, ProtocolError, SessionId};

use super::handle::{BoxedWriter, SendLimits, SessionHandle};
use super::handshake::{accept_upgrade, HandshakeOutcome};
use super::heartbeat::spawn_heartbeat;
use crate::config::ServerConfig;
use crate::errors::SessionError;
use crate::handler::{MessageHandler, SessionContext};
use crate::server::ServerContext;

/// Whether the read loop keeps going after a frame.
enum Flow {
    Continue,
    Close,
}

/// Serve one accepted TCP connection until it closes.
///
/// Errors stay inside the connection; they are logged and never reach the
/// acceptor.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn serve_connection(mut stream: TcpStream, peer: SocketAddr, ctx: ServerContext) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY");
    }

    // A connection slot is reserved before the 101 goes out and held until
    // the session ends.
    let mut slot = None;
    let handshake_timeout = ctx.config.handshake_timeout();
    let handshake = accept_upgrade(&mut stream, ctx.config.max_handshake_size, || {
        slot = Arc::clone(&ctx.slots).try_acquire_owned().ok();
        slot.is_none()
    });
    let outcome = tokio::select! {
        () = ctx.shutdown.cancelled() => {
            debug!("shutdown during handshake");
            return;
        }
        outcome = tokio::time::timeout(handshake_timeout, handshake) => outcome,
    };

    let leftover = match outcome {
        Ok(Ok(HandshakeOutcome::Upgraded { request, leftover })) => {
            debug!(target_path = %request.target, "handshake complete");
            leftover
        }
        Ok(Ok(HandshakeOutcome::Rejected(err))) => {
            metrics::counter!("ws_handshake_rejections_total", "kind" => err.error_kind())
                .increment(1);
            debug!(kind = err.error_kind(), "request not upgraded");
            return;
        }
        Ok(Err(e)) => {
            debug!(error = %e, kind = e.error_kind(), "handshake failed");
            return;
        }
        Err(_) => {
            metrics::counter!("ws_handshake_timeouts_total").increment(1);
            debug!(timeout = ?handshake_timeout, "handshake timed out");
            return;
        }
    };

    let (reader, writer) = stream.into_split();
    let _ = run_session(reader, Box::new(writer), Some(peer), leftover, ctx).await;
    drop(slot);
}

/// Run an upgraded session over `reader`/`writer`.
///
/// `leftover` seeds the parse buffer with bytes read past the handshake.
/// The session is registered for the duration of the call and always
/// deregistered before it returns.
#[instrument(skip_all, fields(session_id))]
pub async fn run_session<R>(
    reader: R,
    writer: BoxedWriter,
    peer: Option<SocketAddr>,
    leftover: BytesMut,
    ctx: ServerContext,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin + Send,
{
    let started = Instant::now();
    let id = SessionId::new();
    let _ = tracing::Span::current().record("session_id", tracing::field::display(&id));

    let handle = Arc::new(SessionHandle::new(
        id.clone(),
        peer,
        writer,
        ctx.shutdown.child_token(),
        SendLimits::from(ctx.config.as_ref()),
    ));
    let _ = handle.mark_open();
    ctx.registry.join(Arc::clone(&handle));
    metrics::counter!("ws_connections_total").increment(1);
    info!(?peer, "session opened");

    let session_ctx = SessionContext::new(Arc::clone(&handle), Arc::clone(&ctx.registry));
    let _heartbeat = spawn_heartbeat(
        Arc::clone(&handle),
        ctx.config.heartbeat_interval(),
        ctx.config.heartbeat_timeout(),
    );

    ctx.handler.on_open(&session_ctx).await;

    let mut session = Session {
        handle: Arc::clone(&handle),
        reader,
        buffer: leftover,
        assembler: MessageAssembler::new(ctx.config.max_message_size),
        handler: Arc::clone(&ctx.handler),
        ctx: session_ctx.clone(),
        config: Arc::clone(&ctx.config),
    };
    let result = session.run().await;

    // Teardown: leave the registry, stop keepalive, release the socket.
    let _ = ctx.registry.leave(&id);
    handle.mark_closed();
    handle.cancel_token().cancel();
    let _ = handle.close_transport().await;
    ctx.handler.on_close(&session_ctx).await;

    let duration = started.elapsed();
    metrics::histogram!("ws_connection_duration_seconds").record(duration.as_secs_f64());
    match &result {
        Ok(()) => info!(?duration, "session closed"),
        Err(e) if e.is_disconnect() => info!(?duration, reason = %e, "session disconnected"),
        Err(e) => warn!(?duration, error = %e, kind = e.error_kind(), "session failed"),
    }
    result
}

struct Session<R> {
    handle: Arc<SessionHandle>,
    reader: R,
    buffer: BytesMut,
    assembler: MessageAssembler,
    handler: Arc<dyn MessageHandler>,
    ctx: SessionContext,
    config: Arc<ServerConfig>,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            if let Flow::Close = self.drain_buffer().await? {
                return Ok(());
            }

            self.buffer.reserve(self.config.read_buffer_size);
            let cancel = self.handle.cancel_token().clone();
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                read = self.reader.read_buf(&mut self.buffer) => Some(read),
            };

            match read {
                None => {
                    self.close_on_cancel().await;
                    return Ok(());
                }
                Some(Ok(0)) => return Err(SessionError::PeerClosed),
                Some(Ok(n)) => trace!(bytes = n, buffered = self.buffer.len(), "read"),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Decode and handle every complete frame in the buffer.
    async fn drain_buffer(&mut self) -> Result<Flow, SessionError> {
        loop {
            let frame = match frame::decode_with_limit(&self.buffer, self.config.max_frame_size) {
                Ok(Decoded::Incomplete) => return Ok(Flow::Continue),
                Ok(Decoded::Frame { frame, consumed }) => {
                    self.buffer.advance(consumed);
                    frame
                }
                Err(err) => return Err(self.fail(err).await),
            };

            metrics::counter!("ws_frames_received_total").increment(1);
            trace!(opcode = %frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");
            if !frame.masked {
                warn!(opcode = %frame.opcode, "client frame is not masked");
            }

            let flow = if frame.opcode.is_control() {
                self.on_control(frame).await?
            } else {
                self.on_data(frame).await?
            };
            if let Flow::Close = flow {
                return Ok(Flow::Close);
            }
        }
    }

    async fn on_control(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        match frame.opcode {
            Opcode::Ping => {
                let pong = frame::encode(Opcode::Pong, &frame.payload, true);
                if let Err(e) = self.handle.send_frame(&pong) {
                    debug!(error = %e, "pong not queued");
                }
                Ok(Flow::Continue)
            }
            Opcode::Pong => {
                self.handle.record_pong();
                Ok(Flow::Continue)
            }
            Opcode::Close => {
                self.on_close_frame(&frame.payload).await;
                Ok(Flow::Close)
            }
            other => Err(self.fail(ProtocolError::NotADataFrame(other)).await),
        }
    }

    /// Echo the peer's Close. A 1-byte payload gets an empty Close back; a
    /// code the peer may not send or a non-UTF-8 reason gets the matching
    /// error code.
    async fn on_close_frame(&mut self, payload: &[u8]) {
        let reply = match close::parse_close_payload(payload) {
            Ok(Some(close)) => {
                info!(code = %close.code, reason = %close.reason, "peer sent close");
                frame::encode(Opcode::Close, payload, true)
            }
            Ok(None) => {
                info!("peer sent close without status");
                frame::encode(Opcode::Close, &[], true)
            }
            Err(err @ ProtocolError::InvalidClosePayload(_)) => {
                warn!(error = %err, len = payload.len(), "malformed close payload");
                frame::encode(Opcode::Close, &[], true)
            }
            Err(err) => {
                warn!(error = %err, "invalid close payload");
                CloseFrame::new(err.close_code(), err.error_kind()).encode()
            }
        };
        if self.handle.begin_closing() {
            if let Err(e) = self.handle.send_close_frame(&reply).await {
                debug!(error = %e, "close echo not delivered");
            }
        }
    }

    async fn on_data(&mut self, frame: Frame) -> Result<Flow, SessionError> {
        match self.assembler.push(frame) {
            Ok(Some(message)) => {
                self.dispatch(message).await;
                Ok(Flow::Continue)
            }
            Ok(None) => Ok(Flow::Continue),
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn dispatch(&self, message: Message) {
        debug!(kind = ?message.kind(), len = message.len(), "message");
        match message {
            Message::Text(text) => self.handler.on_text(&self.ctx, text).await,
            Message::Binary(data) => self.handler.on_binary(&self.ctx, data).await,
        }
    }

    /// Best-effort Close with the error's status code, then fail the session.
    async fn fail(&self, err: ProtocolError) -> SessionError {
        if self.handle.begin_closing() {
            let close = CloseFrame::new(err.close_code(), err.error_kind());
            if let Err(e) = self.handle.send_close_frame(&close.encode()).await {
                debug!(error = %e, "close frame not delivered");
            }
        }
        SessionError::Protocol(err)
    }

    /// Cancelled from outside: shutdown, keepalive timeout or an app close.
    /// Only shutdown finds the session still Open.
    async fn close_on_cancel(&self) {
        if self.handle.begin_closing() {
            let close = CloseFrame::new(CloseCode::GOING_AWAY, "server shutting down");
            if let Err(e) = self.handle.send_close_frame(&close.encode()).await {
                debug!(error = %e, "going-away close not delivered");
            }
        }
    }
}
