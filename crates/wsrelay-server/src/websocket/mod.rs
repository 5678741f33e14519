//! Websocket session machinery: upgrade, per-session state, keepalive and
//! the read loop.

pub mod handle;
pub mod handshake;
pub mod heartbeat;
pub mod session;
