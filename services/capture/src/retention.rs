//! Age-based retention for the segment buffer.
//!
//! Runs on its own timer, independent of the recorder.

use crate::config::BufferConfig;
use crate::segment::{remove_segment_file, SegmentIndex};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one retention pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Segment files deleted
    pub removed: usize,
    /// Expired segments kept because an extraction is using them
    pub pinned: usize,
    /// Files that could not be deleted
    pub failed: usize,
}

/// Periodically deletes segments older than the retention window.
pub struct RetentionSweeper {
    index: Arc<SegmentIndex>,
    window: Duration,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(config: &BufferConfig, index: Arc<SegmentIndex>) -> Self {
        Self {
            index,
            window: config.retention_window(),
            period: config.segment_duration().max(Duration::from_secs(1)),
        }
    }

    /// Sweep forever, once per segment duration.
    pub async fn run(&self) {
        info!(
            window_secs = self.window.as_secs(),
            period_secs = self.period.as_secs(),
            "Retention sweeper started"
        );

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.sweep(Utc::now()).await;
        }
    }

    /// Delete every unleased segment that ended more than one retention
    /// window before `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let window = chrono::Duration::milliseconds(self.window.as_millis() as i64);
        let eviction = self.index.evict_expired(now - window);

        let mut report = SweepReport {
            pinned: eviction.pinned,
            ..Default::default()
        };

        for segment in eviction.evicted {
            match remove_segment_file(&segment.path).await {
                Ok(_) => report.removed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(path = %segment.path.display(), error = %e, "Failed to delete expired segment");
                }
            }
        }

        if report.removed > 0 || report.pinned > 0 {
            debug!(
                removed = report.removed,
                pinned = report.pinned,
                remaining = self.index.len(),
                "Retention sweep complete"
            );
        }
        metrics::counter!("capture.segments.expired").increment(report.removed as u64);

        report
    }
}
