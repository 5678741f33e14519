//! # wsrelay-server
//!
//! Async websocket server built on `wsrelay-proto`:
//!
//! - [`server`]: TCP acceptor, one task per connection
//! - [`websocket`]: upgrade handshake, session read loop, keepalive
//! - [`registry`]: live sessions and broadcast fan-out
//! - [`handler`]: application callbacks
//! - [`config`]: layered configuration
//! - [`shutdown`]: graceful shutdown

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod handler;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{load_config, ServerConfig};
pub use errors::{ConfigError, SendError, ServerError, SessionError};
pub use handler::{MessageHandler, SessionContext};
pub use registry::{BroadcastReport, SessionRegistry};
pub use server::WsServer;
pub use shutdown::ShutdownCoordinator;
pub use websocket::handle::{SendLimits, SessionHandle, SessionState};
