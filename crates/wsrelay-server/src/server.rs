//! `WsServer`: TCP acceptor handing each connection to its own session task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::handler::MessageHandler;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::serve_connection;

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection task needs, cloned per connection.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<dyn MessageHandler>,
    /// Parent of every session's cancellation token.
    pub shutdown: CancellationToken,
    /// One permit per session up to `max_connections`.
    pub slots: Arc<Semaphore>,
}

impl ServerContext {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<SessionRegistry>,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            config,
            registry,
            handler,
            shutdown,
            slots,
        }
    }
}

/// The websocket server.
pub struct WsServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    handler: Arc<dyn MessageHandler>,
    shutdown: Arc<ShutdownCoordinator>,
    tracker: TaskTracker,
}

impl WsServer {
    pub fn new(config: ServerConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            handler,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }


    /// Bind the configured address and start accepting in the background.
    ///
    /// Returns the bound address (useful with port 0) and the acceptor task,
    /// which ends once shutdown is initiated.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        self.config.validate()?;
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        info!(addr = %local, "websocket server listening");

        let ctx = ServerContext::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.handler),
            self.shutdown.token(),
        );
        let handle = tokio::spawn(accept_loop(listener, ctx, self.tracker.clone()));
        Ok((local, handle))
    }

    /// Stop accepting, send Close 1001 to every session and wait up to
    /// `shutdown_timeout_secs` for connection tasks to finish.
    pub async fn graceful_shutdown(&self) -> bool {
        info!(sessions = self.registry.count(), "shutting down");
        self.shutdown
            .graceful_shutdown(&self.tracker, self.config.shutdown_timeout())
            .await
    }
}

async fn accept_loop(listener: TcpListener, ctx: ServerContext, tracker: TaskTracker) {
    loop {
        let accepted = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                metrics::counter!("ws_accepts_total").increment(1);
                let _ = tracker.spawn(serve_connection(stream, peer, ctx.clone()));
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    info!("acceptor stopped");
}
