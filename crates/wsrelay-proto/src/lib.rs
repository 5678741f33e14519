//! # wsrelay-proto
//!
//! The I/O-free half of the websocket engine:
//!
//! - [`frame`]: incremental RFC 6455 frame decoding and unmasked encoding
//! - [`message`]: fragmentation reassembly into Text/Binary messages
//! - [`close`]: Close payload codes and reasons
//! - [`handshake`]: HTTP upgrade request parsing, validation and responses

#![deny(unsafe_code)]

pub mod close;
pub mod errors;
pub mod frame;
pub mod handshake;
pub mod ids;
pub mod message;

pub use close::{CloseCode, CloseFrame};
pub use errors::{HandshakeError, ProtocolError};
pub use frame::{Decoded, Frame, Opcode};
pub use ids::SessionId;
pub use message::{Message, MessageAssembler, MessageKind};
