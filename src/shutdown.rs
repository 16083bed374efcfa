//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT (or Ctrl+C) and closes the proxy within a
//! bounded time.

use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{info, warn};

use crate::proxy::Proxy;
use crate::Result;

/// Shutdown coordinator for the proxy process
pub struct ShutdownCoordinator {
    /// Upper bound for closing the proxy
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Block until SIGTERM, SIGINT or Ctrl+C
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Close the proxy, giving up after the shutdown timeout
    pub async fn shutdown_proxy(&self, proxy: &Proxy) -> Result<()> {
        info!(
            "Closing proxy {} ({} active sessions, timeout: {:?})",
            proxy.frontend_addr(),
            proxy.active_sessions(),
            self.timeout
        );
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, proxy.close()).await {
            Ok(result) => {
                result?;
                info!("Proxy closed in {:?}", start_time.elapsed());
            }
            Err(_) => {
                warn!(
                    "Shutdown timeout reached after {:?} with {} sessions still active",
                    start_time.elapsed(),
                    proxy.active_sessions()
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Endpoint;

    #[tokio::test]
    async fn test_shutdown_proxy_closes_it() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let proxy = Proxy::new(
            Endpoint::tcp("127.0.0.1:0".parse().unwrap()),
            Endpoint::tcp("127.0.0.1:9".parse().unwrap()),
        )
        .await
        .unwrap();
        proxy.run().unwrap();

        coordinator.shutdown_proxy(&proxy).await.unwrap();
        assert!(proxy.is_closed());
    }

    #[tokio::test]
    async fn test_signal_listener_waits_for_a_signal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let waited =
            tokio::time::timeout(Duration::from_millis(50), coordinator.listen_for_signals()).await;
        assert!(waited.is_err(), "listener returned without a signal");
    }
}
