//! Continuous segment recorder with automatic restart.
//!
//! Records the source stream into fixed-length segment files, one media tool
//! invocation per segment, and appends each finished segment to the
//! [`SegmentIndex`]. Failures (unreachable camera, non-zero exit, watchdog
//! kill) are logged and retried with exponential backoff; the loop only ends
//! when [`SegmentRecorder::stop`] is called.

use crate::config::CaptureConfig;
use crate::media_tool::{MediaError, MediaTool};
use crate::segment::{remove_segment_file, Segment, SegmentIndex};
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from a single recording cycle.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("media tool failed: {0}")]
    Media(#[from] MediaError),

    #[error("recorder produced an empty segment: {0}")]
    EmptySegment(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Statistics for the recorder.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RecorderStats {
    pub segments_recorded: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_segment_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// State of the recorder loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Recording,
    BackingOff,
    Stopped,
}

/// Records the source stream into the rolling segment buffer.
pub struct SegmentRecorder {
    source: String,
    segment_dir: PathBuf,
    segment_duration: Duration,
    base_delay: Duration,
    max_delay: Duration,
    tool: Arc<dyn MediaTool>,
    index: Arc<SegmentIndex>,
    state: Arc<RwLock<RecorderState>>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<RecorderStats>>,
}

impl SegmentRecorder {
    pub fn new(config: &CaptureConfig, tool: Arc<dyn MediaTool>, index: Arc<SegmentIndex>) -> Self {
        Self {
            source: config.stream.url.clone(),
            segment_dir: config.buffer.segment_dir.clone(),
            segment_duration: config.buffer.segment_duration(),
            base_delay: config.stream.reconnect_base_delay(),
            max_delay: config.stream.reconnect_max_delay(),
            tool,
            index,
            state: Arc::new(RwLock::new(RecorderState::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(RecorderStats::default())),
        }
    }

    /// Get the current recorder state.
    pub fn state(&self) -> RecorderState {
        *self.state.read()
    }

    /// Get current recorder statistics.
    pub fn stats(&self) -> RecorderStats {
        self.stats.read().clone()
    }

    /// Ask the loop to exit after the current cycle.
    pub fn stop(&self) {
        info!(source = %self.source, "Stopping segment recorder");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Record segments until stopped.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);

        let mut backoff = ExponentialBackoff {
            initial_interval: self.base_delay,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..Default::default()
        };

        info!(
            source = %self.source,
            segment_dir = %self.segment_dir.display(),
            segment_secs = self.segment_duration.as_secs(),
            "Segment recorder started"
        );

        while self.running.load(Ordering::SeqCst) {
            *self.state.write() = RecorderState::Recording;

            match self.record_next().await {
                Ok(segment) => {
                    backoff.reset();
                    {
                        let mut s = self.stats.write();
                        s.segments_recorded += 1;
                        s.consecutive_failures = 0;
                        s.last_segment_at = Some(segment.started_at);
                    }
                    metrics::counter!("capture.segments.recorded").increment(1);
                    debug!(
                        sequence = segment.sequence,
                        path = %segment.path.display(),
                        "Segment recorded"
                    );
                }
                Err(e) => {
                    let attempt = {
                        let mut s = self.stats.write();
                        s.failures += 1;
                        s.consecutive_failures += 1;
                        s.last_error = Some(e.to_string());
                        s.consecutive_failures
                    };
                    metrics::counter!("capture.segments.failed").increment(1);

                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }

                    // max_elapsed_time is None, so this always yields a delay.
                    let delay = backoff.next_backoff().unwrap_or(self.max_delay);
                    warn!(
                        source = %self.source,
                        attempt = attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Segment recording failed, restarting"
                    );
                    *self.state.write() = RecorderState::BackingOff;
                    tokio::time::sleep(delay).await;
                }
            }
        }

        *self.state.write() = RecorderState::Stopped;
        info!(source = %self.source, "Segment recorder stopped");
    }

    /// Record one segment and add it to the index.
    async fn record_next(&self) -> Result<Segment, RecorderError> {
        let started_at = Utc::now();
        let path = self.segment_dir.join(Segment::file_name_for(started_at));

        if let Err(e) = self
            .tool
            .record_segment(&self.source, self.segment_duration, &path)
            .await
        {
            discard_partial(&path).await;
            return Err(e.into());
        }

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size == 0 {
            discard_partial(&path).await;
            return Err(RecorderError::EmptySegment(path));
        }

        let segment = Segment {
            sequence: self.index.allocate_sequence(),
            started_at,
            path,
            duration: self.segment_duration,
        };

        for evicted in self.index.push(segment.clone()) {
            if let Err(e) = remove_segment_file(&evicted.path).await {
                warn!(path = %evicted.path.display(), error = %e, "Failed to delete overflow segment");
            }
        }

        Ok(segment)
    }
}

async fn discard_partial(path: &Path) {
    if let Err(e) = remove_segment_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove partial segment");
    }
}
