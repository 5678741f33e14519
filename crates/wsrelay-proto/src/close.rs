//! Close frame payloads (RFC 6455 §5.5.1, §7.4).

use std::fmt;

use bytes::Bytes;

use crate::errors::ProtocolError;
use crate::frame::{self, Opcode};

/// Status code carried in the first two bytes of a Close payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const INVALID_PAYLOAD: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const INTERNAL_ERROR: Self = Self(1011);

    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// Whether a peer may send this code: the defined 1000-1014 range minus
    /// 1004 (reserved) and 1005/1006 (local-only), or an application code in
    /// 3000-4999.
    pub fn is_sendable(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed Close payload: a code and an optional UTF-8 reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Wire payload: big-endian code followed by the reason bytes.
    ///
    /// The reason is truncated on a character boundary so the payload stays
    /// within the 125-byte control frame limit.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut end = self.reason.len().min(frame::MAX_CONTROL_PAYLOAD - 2);
        while !self.reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&self.code.0.to_be_bytes());
        payload.extend_from_slice(&self.reason.as_bytes()[..end]);
        payload
    }

    /// Encoded, unmasked Close frame.
    pub fn encode(&self) -> Bytes {
        frame::encode(Opcode::Close, &self.to_payload(), true)
    }
}

/// Parse a Close payload.
///
/// Empty payloads carry no status and yield `None`. A single byte cannot hold
/// a code and is malformed, as is a code outside [`CloseCode::is_sendable`].
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>, ProtocolError> {
    match payload {
        [] => Ok(None),
        [_] => Err(ProtocolError::InvalidClosePayload(1)),
        [hi, lo, reason @ ..] => {
            let code = CloseCode(u16::from_be_bytes([*hi, *lo]));
            if !code.is_sendable() {
                return Err(ProtocolError::InvalidCloseCode(code.0));
            }
            let reason = std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidUtf8)?;
            Ok(Some(CloseFrame {
                code,
                reason: reason.to_owned(),
            }))
        }
    }
}
