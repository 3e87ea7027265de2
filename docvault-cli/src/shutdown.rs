//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the run token: collections still waiting never start,
//! in-flight chunk writes finish, and the run reports itself interrupted.

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled when a shutdown signal arrives
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), finishing in-flight chunks and stopping...");
            }
            _ = terminate => {
                info!("Received SIGTERM, finishing in-flight chunks and stopping...");
            }
        }

        self.token.cancel();
    }

    /// Listen for signals in the background until the run ends.
    pub fn spawn(self) -> (CancellationToken, JoinHandle<()>) {
        let token = self.token();
        let handle = tokio::spawn(async move {
            self.wait_for_signal().await;
        });
        (token, handle)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert!(!coordinator.is_interrupted());

        // Spawn a task that will observe the cancellation
        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.token.cancel();

        handle.await.unwrap();
        assert!(coordinator.is_interrupted());
    }

    #[tokio::test]
    async fn test_spawned_listener_can_be_aborted() {
        let (token, handle) = ShutdownCoordinator::new().spawn();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!token.is_cancelled());
    }
}
