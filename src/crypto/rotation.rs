//! Background key rotation.
//!
//! One cooperative loop drives both cadences: cheap shifts every couple of
//! hours and a full regeneration daily. After a regeneration the old
//! snapshots must stay loadable for the overlap window, so their cleanup
//! is a separately spawned delayed task, never an inline step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info};

use crate::crypto::signatures::SignatureEngine;
use crate::crypto::storage::KeyStorage;
use crate::error::AuditError;

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub shift_interval: Duration,
    pub regenerate_interval: Duration,
    pub overlap_window: Duration,
    pub startup_delay: Duration,
    pub tick: Duration,
    pub error_backoff: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            shift_interval: Duration::from_secs(2 * 60 * 60),
            regenerate_interval: Duration::from_secs(24 * 60 * 60),
            overlap_window: Duration::from_secs(60 * 60),
            startup_delay: Duration::from_secs(30),
            tick: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5 * 60),
        }
    }
}

pub struct RotationScheduler {
    engine: Arc<SignatureEngine>,
    storage: Arc<KeyStorage>,
    config: RotationConfig,
    shutdown: watch::Receiver<bool>,
}

impl RotationScheduler {
    pub fn new(
        engine: Arc<SignatureEngine>,
        storage: Arc<KeyStorage>,
        config: RotationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            storage,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips. Intended to be spawned as its
    /// own task.
    pub async fn run(mut self) {
        info!("Key rotation service starting");

        if self.wait(self.config.startup_delay).await {
            info!("Key rotation service stopping");
            return;
        }

        let mut last_shift = Instant::now();
        let mut last_regenerate = Instant::now();

        loop {
            if self.wait(self.config.tick).await {
                break;
            }

            match self.run_due_rotations(&mut last_shift, &mut last_regenerate).await {
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "Key rotation error");
                    if self.wait(self.config.error_backoff).await {
                        break;
                    }
                }
            }
        }

        info!("Key rotation service stopping");
    }

    async fn run_due_rotations(
        &self,
        last_shift: &mut Instant,
        last_regenerate: &mut Instant,
    ) -> Result<(), AuditError> {
        if last_shift.elapsed() >= self.config.shift_interval {
            info!("Initiating scheduled key shift");
            let engine = self.engine.clone();
            tokio::task::spawn_blocking(move || engine.shift_keys())
                .await
                .map_err(|e| {
                    AuditError::CryptographicError(format!("Key shift task failed: {}", e))
                })??;
            *last_shift = Instant::now();
        }

        if last_regenerate.elapsed() >= self.config.regenerate_interval {
            info!("Initiating full key regeneration");
            let engine = self.engine.clone();
            tokio::task::spawn_blocking(move || engine.regenerate_keys())
                .await
                .map_err(|e| {
                    AuditError::CryptographicError(format!("Regeneration task failed: {}", e))
                })??;
            // Timestamps only advance on success, so a failed cycle is
            // retried at the next tick.
            *last_regenerate = Instant::now();

            self.schedule_cleanup();
        }

        Ok(())
    }

    /// Remove snapshots that predate the regeneration, but only once the
    /// overlap window has passed. Runs detached from the rotation loop.
    fn schedule_cleanup(&self) {
        let storage = self.storage.clone();
        let overlap = self.config.overlap_window;
        let mut shutdown = self.shutdown.clone();
        let cutoff = Utc::now();

        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(overlap) => {}
                _ = shutdown.changed() => return,
            }

            info!("Cleaning up stale snapshots");
            match tokio::task::spawn_blocking(move || storage.remove_stale_snapshots(cutoff)).await
            {
                Ok(Ok(removed)) => info!(removed, "Snapshot cleanup finished"),
                Ok(Err(e)) => error!(error = %e, "Snapshot cleanup failed"),
                Err(e) => error!(error = %e, "Snapshot cleanup task failed"),
            }
        });
    }

    /// Sleep, returning `true` when shutdown was signalled instead.
    async fn wait(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = sleep(duration) => false,
            _ = self.shutdown.changed() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypool::KeyPoolManager;
    use std::path::Path;
    use tempfile::tempdir;

    const TEST_POOL: usize = 24;

    fn engine_in(dir: &Path) -> (Arc<SignatureEngine>, Arc<KeyStorage>) {
        let passphrase = dir.join("passphrase.txt");
        std::fs::write(&passphrase, "rotation test passphrase").unwrap();
        let storage = Arc::new(
            KeyStorage::new("rotation-test-secret", passphrase, dir.join("keys")).unwrap(),
        );
        storage.bootstrap_seeds(3).unwrap();
        let pool = Arc::new(
            KeyPoolManager::initialize(
                storage.clone(),
                TEST_POOL,
                Duration::from_secs(2 * 60 * 60),
            )
            .unwrap(),
        );
        (
            Arc::new(SignatureEngine::new(pool, storage.clone())),
            storage,
        )
    }

    #[tokio::test]
    async fn test_scheduler_shifts_on_interval() {
        let dir = tempdir().unwrap();
        let (engine, storage) = engine_in(dir.path());
        let before = engine.pool().entries();

        let (tx, rx) = watch::channel(false);
        let scheduler = RotationScheduler::new(
            engine.clone(),
            storage,
            RotationConfig {
                shift_interval: Duration::from_millis(50),
                regenerate_interval: Duration::from_secs(3600),
                overlap_window: Duration::from_secs(3600),
                startup_delay: Duration::from_millis(1),
                tick: Duration::from_millis(20),
                error_backoff: Duration::from_millis(50),
            },
            rx,
        );
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();

        let after = engine.pool().entries();
        assert_ne!(before[0].public_key, after[0].public_key);
    }

    #[tokio::test]
    async fn test_scheduler_stops_during_startup_delay() {
        let dir = tempdir().unwrap();
        let (engine, storage) = engine_in(dir.path());

        let (tx, rx) = watch::channel(false);
        let scheduler =
            RotationScheduler::new(engine, storage, RotationConfig::default(), rx);
        let handle = tokio::spawn(scheduler.run());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should exit on shutdown")
            .unwrap();
    }
}
