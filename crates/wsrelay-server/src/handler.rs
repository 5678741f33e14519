//! Application callbacks and the per-session context they receive.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use wsrelay_proto::{CloseFrame, SessionId};

use crate::errors::SendError;
use crate::registry::{BroadcastReport, SessionRegistry};
use crate::websocket::handle::SessionHandle;

/// Application logic plugged into the server.
///
/// Callbacks for one session run on that session's task, one at a time and
/// in arrival order. A slow callback delays only its own session.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// The session joined the registry and can be written to.
    async fn on_open(&self, _ctx: &SessionContext) {}

    /// A complete Text message arrived.
    async fn on_text(&self, ctx: &SessionContext, text: String);

    /// A complete Binary message arrived.
    async fn on_binary(&self, _ctx: &SessionContext, _data: Vec<u8>) {}

    /// The session left the registry; writes to it will fail.
    async fn on_close(&self, _ctx: &SessionContext) {}
}

/// What a callback can do: write to its own session or fan out to all.
///
/// Sends only queue frames and return immediately.
#[derive(Clone)]
pub struct SessionContext {
    handle: Arc<SessionHandle>,
    registry: Arc<SessionRegistry>,
}

impl SessionContext {
    pub fn new(handle: Arc<SessionHandle>, registry: Arc<SessionRegistry>) -> Self {
        Self { handle, registry }
    }

    pub fn session_id(&self) -> &SessionId {
        self.handle.id()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.handle.peer()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Queue a Text message for this session only.
    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.handle.send_text(text)
    }

    pub fn send_binary(&self, data: &[u8]) -> Result<(), SendError> {
        self.handle.send_binary(data)
    }

    pub fn broadcast_text(&self, text: &str) -> BroadcastReport {
        self.registry.broadcast_text(text)
    }

    pub fn broadcast_binary(&self, data: &[u8]) -> BroadcastReport {
        self.registry.broadcast_binary(data)
    }

    pub fn broadcast_frame(&self, frame: &Bytes) -> BroadcastReport {
        self.registry.broadcast_frame(frame)
    }

    /// Close this session with `close` and stop reading from it.
    pub async fn close(&self, close: CloseFrame) {
        self.handle.close(&close).await;
    }
}
