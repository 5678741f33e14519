use std::io;
use std::time::Duration;

use wsrelay_proto::{HandshakeError, ProtocolError};

/// Why a session ended other than by a clean close handshake.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("connection reset by peer: {0}")]
    PeerReset(io::Error),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::PeerReset(e),
            io::ErrorKind::UnexpectedEof => Self::PeerClosed,
            _ => Self::Io(e),
        }
    }
}

impl SessionError {
    /// Disconnects that are part of normal peer behaviour.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::PeerClosed | Self::PeerReset(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Protocol(e) => e.error_kind(),
            Self::Handshake(e) => e.error_kind(),
            Self::PeerClosed => "peer_closed",
            Self::PeerReset(_) => "peer_reset",
            Self::Io(_) => "io",
        }
    }
}

/// Failure to write a frame to one session.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session is closed")]
    Closed,

    #[error("send queue is full")]
    QueueFull,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("session not found")]
    NotFound,
}

/// Failures starting or running the acceptor.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
