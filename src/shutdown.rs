use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::review::FraudReview;

/// How long in-flight work gets after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Graceful shutdown coordinator for the fraud review worker
pub struct ShutdownCoordinator {
    drain_timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Wait for Ctrl-C, then stop the service.
    pub async fn wait_for_shutdown(self, review: &FraudReview) -> Result<()> {
        self.run_until(review, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Stop the service once `signal` resolves.
    pub async fn run_until<S>(self, review: &FraudReview, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        signal.await;
        info!("Initiating graceful shutdown...");

        // Let runs being driven reach their next save point.
        let controller = review.engine().controller();
        let drained = timeout(self.drain_timeout, async {
            while controller.active_drives() > 0 {
                sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                active_drives = controller.active_drives(),
                "In-flight runs did not settle before the drain timeout"
            );
        }

        review.shutdown();
        info!("Graceful shutdown completed; pending timers are rebuilt on next recover");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FraudReviewConfig, StorageBackend};

    #[tokio::test]
    async fn test_shutdown_aborts_pending_timers() {
        let mut config = FraudReviewConfig::default();
        config.storage.backend = StorageBackend::Memory;
        let review = FraudReview::from_config(&config).await.unwrap();

        let snapshot = review
            .start_json(serde_json::json!({
                "id": 21, "amount": 80.0, "location": "Boise", "vendor": "Bookshop", "score": 3
            }))
            .await
            .unwrap();
        assert_eq!(snapshot.pending_callbacks.len(), 2);
        assert_eq!(review.engine().controller().gateway().pending_timers(), 2);

        ShutdownCoordinator::new()
            .run_until(&review, async {})
            .await
            .unwrap();
        assert_eq!(review.engine().controller().gateway().pending_timers(), 0);
    }
}
