use crate::close::CloseCode;
use crate::frame::Opcode;
use crate::message::MessageKind;

/// Violations of RFC 6455 framing or message sequencing.
///
/// Every variant is terminal for the connection that produced it; nothing
/// here is retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    // Framing
    #[error("reserved opcode 0x{0:X}")]
    ReservedOpcode(u8),
    #[error("reserved bits set without a negotiated extension (rsv=0b{0:03b})")]
    ReservedBits(u8),
    #[error("fragmented {0} control frame")]
    FragmentedControl(Opcode),
    #[error("{opcode} control frame payload of {len} bytes exceeds 125")]
    ControlTooLarge { opcode: Opcode, len: u64 },
    #[error("64-bit payload length has the most significant bit set ({0})")]
    InvalidLength(u64),
    #[error("frame payload of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: u64, limit: usize },
    #[error("frame size overflows the address space")]
    LengthOverflow,

    // Message sequencing
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new {opcode} frame while a {in_progress:?} message is in progress")]
    MessageInProgress {
        opcode: Opcode,
        in_progress: MessageKind,
    },
    #[error("{0} frame cannot be part of a message")]
    NotADataFrame(Opcode),
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    // Close payloads
    #[error("close payload of {0} byte(s) cannot carry a status code")]
    InvalidClosePayload(usize),
    #[error("close status code {0} may not appear on the wire")]
    InvalidCloseCode(u16),
}

impl ProtocolError {
    /// Close code the server sends before dropping the connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::FrameTooLarge { .. } | Self::MessageTooLarge { .. } | Self::LengthOverflow => {
                CloseCode::MESSAGE_TOO_BIG
            }
            Self::InvalidUtf8 => CloseCode::INVALID_PAYLOAD,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ReservedOpcode(_) => "reserved_opcode",
            Self::ReservedBits(_) => "reserved_bits",
            Self::FragmentedControl(_) => "fragmented_control",
            Self::ControlTooLarge { .. } => "control_too_large",
            Self::InvalidLength(_) => "invalid_length",
            Self::FrameTooLarge { .. } => "frame_too_large",
            Self::LengthOverflow => "length_overflow",
            Self::UnexpectedContinuation => "unexpected_continuation",
            Self::MessageInProgress { .. } => "message_in_progress",
            Self::NotADataFrame(_) => "not_a_data_frame",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::InvalidUtf8 => "invalid_utf8",
            Self::InvalidClosePayload(_) => "invalid_close_payload",
            Self::InvalidCloseCode(_) => "invalid_close_code",
        }
    }
}

/// Reasons an HTTP request is not answered with `101 Switching Protocols`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("request is not a websocket upgrade")]
    NotUpgrade,
    #[error("websocket upgrade requires GET, got {0}")]
    MethodNotAllowed(String),
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("invalid Sec-WebSocket-Key (must be base64 of 16 bytes)")]
    InvalidKey,
    #[error("unsupported websocket version {0}")]
    UnsupportedVersion(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("server at capacity")]
    AtCapacity,
}

impl HandshakeError {
    /// HTTP status line used to answer the rejected request.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            Self::NotUpgrade => (200, "OK"),
            Self::MethodNotAllowed(_) => (405, "Method Not Allowed"),
            Self::MissingKey | Self::InvalidKey | Self::MalformedRequest(_) => {
                (400, "Bad Request")
            }
            Self::UnsupportedVersion(_) => (426, "Upgrade Required"),
            Self::HeadTooLarge(_) => (431, "Request Header Fields Too Large"),
            Self::AtCapacity => (503, "Service Unavailable"),
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotUpgrade => "not_upgrade",
            Self::MethodNotAllowed(_) => "method_not_allowed",
            Self::MissingKey => "missing_key",
            Self::InvalidKey => "invalid_key",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::MalformedRequest(_) => "malformed_request",
            Self::HeadTooLarge(_) => "head_too_large",
            Self::AtCapacity => "at_capacity",
        }
    }
}
