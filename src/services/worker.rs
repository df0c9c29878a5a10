use crate::services::separation::SeparationService;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodically removes jobs older than the configured TTL.
pub struct BackgroundWorker {
    service: Arc<SeparationService>,
    interval: Duration,
    ttl: Option<chrono::Duration>,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    pub fn new(
        service: Arc<SeparationService>,
        interval: Duration,
        ttl: Option<chrono::Duration>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            service,
            interval,
            ttl,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let Some(ttl) = self.ttl else {
            tracing::info!("⏸️  Job expiry disabled, background worker not started");
            return;
        };

        tracing::info!(
            "🚀 Background worker started (ttl {}h, every {:?})",
            ttl.num_hours(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.perform_cleanup(Utc::now() - ttl).await;
                }
            }
        }
    }

    /// Removes expired jobs and stale directories the registry does not know.
    /// Returns the number of jobs and directories removed.
    pub async fn perform_cleanup(&self, cutoff: DateTime<Utc>) -> usize {
        tracing::info!("🧹 Running background cleanup tasks...");

        let mut removed = self.service.cleanup_expired(cutoff).await;

        // Leftovers of crashed runs, or jobs whose manifest was never written
        match self.service.registry().untracked_dirs().await {
            Ok(dirs) => {
                for dir in dirs {
                    if !modified_before(&dir, cutoff).await {
                        continue;
                    }
                    match tokio::fs::remove_dir_all(&dir).await {
                        Ok(()) => {
                            tracing::info!("Removed stale directory {}", dir.display());
                            removed += 1;
                        }
                        Err(e) => {
                            tracing::error!("Failed to remove {}: {}", dir.display(), e)
                        }
                    }
                }
            }
            Err(e) => tracing::error!("Failed to scan output directory: {}", e),
        }

        tracing::info!("✅ Background cleanup completed ({} removed)", removed);
        removed
    }
}

async fn modified_before(path: &Path, cutoff: DateTime<Utc>) -> bool {
    match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified) < cutoff,
        Err(_) => false,
    }
}
