//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Coordinates graceful shutdown of the acceptor and every session.
///
/// Session tokens are children of [`token`](Self::token), so cancelling it
/// reaches every live connection.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything, then wait up to `timeout` for tracked tasks.
    ///
    /// Returns `true` if every task finished in time.
    pub async fn graceful_shutdown(&self, tracker: &TaskTracker, timeout: Duration) -> bool {
        self.shutdown();
        let _ = tracker.close();
        info!(
            task_count = tracker.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for connections to finish"
        );

        if tokio::time::timeout(timeout, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                "shutdown timed out after {timeout:?}, some connections may still be running"
            );
            return false;
        }
        info!("all connections finished");
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
