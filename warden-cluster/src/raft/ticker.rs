//! Background snapshot trigger.
//!
//! openraft's own log-count policy is disabled; this task checks on a fixed
//! interval whether enough entries were applied since the last snapshot.

use crate::types::{WardenMetrics, WardenRaft};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Periodically triggers snapshots once `threshold` entries were applied.
pub struct SnapshotTicker {
    raft: Arc<WardenRaft>,
    threshold: u64,
    check_interval: Duration,
    running: Arc<AtomicBool>,
}

impl SnapshotTicker {
    /// Create a ticker. A threshold of zero never triggers.
    pub fn new(raft: Arc<WardenRaft>, threshold: u64, check_interval: Duration) -> Self {
        Self {
            raft,
            threshold,
            check_interval,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Check if the ticker is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until `stop()` is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!(
            threshold = self.threshold,
            interval = ?self.check_interval,
            "snapshot ticker started"
        );

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.check_interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.check().await;
        }

        tracing::debug!("snapshot ticker stopped");
    }

    async fn check(&self) {
        let metrics = self.raft.metrics().borrow().clone();
        if !snapshot_due(&metrics, self.threshold) {
            return;
        }

        tracing::info!(
            last_applied = ?metrics.last_applied,
            snapshot = ?metrics.snapshot,
            "snapshot threshold reached"
        );
        if let Err(e) = self.raft.trigger().snapshot().await {
            tracing::warn!(error = %e, "failed to trigger snapshot");
        }
    }

    /// Stop the ticker after its current sleep.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Whether at least `threshold` entries were applied since the last snapshot.
pub fn snapshot_due(metrics: &WardenMetrics, threshold: u64) -> bool {
    if threshold == 0 {
        return false;
    }
    let applied = metrics.last_applied.map_or(0, |id| id.index);
    let snapshotted = metrics.snapshot.map_or(0, |id| id.index);
    applied.saturating_sub(snapshotted) >= threshold
}
