//! Demo application: a text relay that announces membership changes.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};
use wsrelay_proto::SessionId;
use wsrelay_server::{MessageHandler, SessionContext};

/// Membership announcement, `{"type":"connections","data":[ids]}`.
#[derive(Debug, Serialize)]
struct Announcement<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a [SessionId],
}

/// JSON text sent to everyone whenever a session joins or leaves.
pub fn connections_message(ids: &[SessionId]) -> String {
    let announcement = Announcement {
        kind: "connections",
        data: ids,
    };
    // Serializing a struct of strings cannot fail.
    serde_json::to_string(&announcement).unwrap_or_default()
}

/// Re-broadcasts every text message to all sessions.
#[derive(Debug, Default)]
pub struct Relay;

impl Relay {
    fn announce(ctx: &SessionContext) {
        let ids = ctx.registry().ids();
        let report = ctx.broadcast_text(&connections_message(&ids));
        debug!(members = ids.len(), delivered = report.delivered, "membership announced");
    }
}

#[async_trait]
impl MessageHandler for Relay {
    async fn on_open(&self, ctx: &SessionContext) {
        info!(session_id = %ctx.session_id(), peer = ?ctx.peer(), "joined");
        Self::announce(ctx);
    }

    async fn on_text(&self, ctx: &SessionContext, text: String) {
        let report = ctx.broadcast_text(&text);
        debug!(
            session_id = %ctx.session_id(),
            len = text.len(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "relayed"
        );
    }

    async fn on_binary(&self, ctx: &SessionContext, data: Vec<u8>) {
        debug!(session_id = %ctx.session_id(), len = data.len(), "binary message ignored");
    }

    async fn on_close(&self, ctx: &SessionContext) {
        info!(session_id = %ctx.session_id(), "left");
        Self::announce(ctx);
    }
}
