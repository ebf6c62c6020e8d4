//! Event-triggered clip extraction from the rolling segment buffer.
//!
//! After an event, the extractor waits for the post-event footage to be
//! recorded, picks the window of buffered segments covering the event
//! (skipping the newest segments that only exist because of stream latency),
//! stitches them losslessly into one clip and samples a thumbnail from it.
//!
//! ```text
//!  oldest                                                     newest
//!  [ .. | start ............ end | latency skip ............. ] total
//!         \__ clip segments __/
//! ```

use crate::config::{CaptureConfig, ClipConfig};
use crate::media_tool::{MediaError, MediaTool};
use crate::segment::{remove_segment_file, SegmentIndex};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

/// Errors that prevent a clip from being produced.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("insufficient buffered segments: have {available}, need {required}")]
    InsufficientSegments { available: usize, required: usize },

    #[error("{missing} selected segments were evicted before they could be leased")]
    SegmentsEvicted { missing: usize },

    #[error("media tool failed: {0}")]
    Media(#[from] MediaError),

    #[error("clip {path} is {size} bytes, below the {min} byte minimum")]
    CorruptOutput { path: PathBuf, size: u64, min: u64 },

    #[error("extractor is shut down")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A request to cut a clip around a detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRequest {
    pub plate: String,
    pub event_time: DateTime<Utc>,
}

/// A validated clip on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalClip {
    /// File name relative to the clip directory
    pub filename: String,
    pub path: PathBuf,
    /// Thumbnail next to the clip, if one could be generated
    pub thumbnail_path: Option<PathBuf>,
    pub size_bytes: u64,
}

/// Timing inputs for window selection, all in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowParams {
    pub segment_duration_secs: u64,
    pub pre_buffer_secs: u64,
    pub post_buffer_secs: u64,
    pub stream_latency_secs: u64,
}

impl WindowParams {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            segment_duration_secs: config.buffer.segment_duration_secs,
            pre_buffer_secs: config.clip.pre_buffer_secs,
            post_buffer_secs: config.clip.post_buffer_secs,
            stream_latency_secs: config.clip.stream_latency_secs,
        }
    }
}

/// Half-open `[start, end)` range of segment positions forming a clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipWindow {
    pub start: usize,
    pub end: usize,
    pub clip_segment_count: usize,
    pub latency_segments_skipped: usize,
}

/// Select which of `total` time-ordered segments make up the clip.
///
/// `clip_segment_count = ceil((pre + post) / segment)` segments are taken,
/// ending `floor(latency / segment)` segments before the newest one.
pub fn plan_window(total: usize, params: &WindowParams) -> Result<ClipWindow, ExtractError> {
    let segment = params.segment_duration_secs.max(1);
    let clip_segment_count =
        (params.pre_buffer_secs + params.post_buffer_secs).div_ceil(segment) as usize;
    let latency_segments_skipped = (params.stream_latency_secs / segment) as usize;

    let required = clip_segment_count + latency_segments_skipped;
    if total < required || clip_segment_count == 0 {
        return Err(ExtractError::InsufficientSegments {
            available: total,
            required,
        });
    }

    let end = total - latency_segments_skipped;
    Ok(ClipWindow {
        start: end - clip_segment_count,
        end,
        clip_segment_count,
        latency_segments_skipped,
    })
}

/// File name for the clip of `plate` seen at `event_time`.
pub fn clip_file_name(plate: &str, event_time: DateTime<Utc>) -> String {
    let stamp = event_time
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    format!("{}_{}.mp4", sanitize_path_component(plate), stamp)
}

/// Thumbnail location for a clip: the clip path with `.jpg` appended.
pub fn thumbnail_path_for(clip: &Path) -> PathBuf {
    let mut name = clip.as_os_str().to_os_string();
    name.push(".jpg");
    PathBuf::from(name)
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Anything that can turn a detection into a clip.
#[async_trait]
pub trait ClipCapture: Send + Sync {
    /// Produce a clip for the request, or `None` if it could not be made.
    async fn capture(&self, request: ClipRequest) -> Option<FinalClip>;
}

/// Cuts clips out of the shared segment index.
pub struct ClipExtractor {
    config: ClipConfig,
    params: WindowParams,
    index: Arc<SegmentIndex>,
    tool: Arc<dyn MediaTool>,
    permits: Semaphore,
}

impl ClipExtractor {
    pub fn new(config: &CaptureConfig, index: Arc<SegmentIndex>, tool: Arc<dyn MediaTool>) -> Self {
        Self {
            config: config.clip.clone(),
            params: WindowParams::from_config(config),
            index,
            tool,
            permits: Semaphore::new(config.clip.max_concurrent_extractions.max(1)),
        }
    }

    /// Extract a clip, logging any failure and returning `None` instead.
    pub async fn extract(&self, request: ClipRequest) -> Option<FinalClip> {
        match self.try_extract(&request).await {
            Ok(clip) => {
                metrics::counter!("capture.clips.created").increment(1);
                Some(clip)
            }
            Err(e) => {
                metrics::counter!("capture.clips.failed").increment(1);
                match e {
                    ExtractError::InsufficientSegments { .. } | ExtractError::SegmentsEvicted { .. } => {
                        warn!(plate = %request.plate, error = %e, "Not enough footage buffered for clip");
                    }
                    _ => {
                        error!(plate = %request.plate, error = %e, "Clip extraction failed");
                    }
                }
                None
            }
        }
    }

    #[instrument(skip(self, request), fields(plate = %request.plate, event_time = %request.event_time))]
    async fn try_extract(&self, request: &ClipRequest) -> Result<FinalClip, ExtractError> {
        let delay = self.config.settle_delay();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis(), "Waiting for post-event footage");
            tokio::time::sleep(delay).await;
        }

        let mut segments = self.index.snapshot();
        segments.sort_by_key(|s| (s.started_at, s.sequence));

        let window = plan_window(segments.len(), &self.params)?;
        let selected = &segments[window.start..window.end];

        let lease = self.index.lease(selected);
        if lease.missing() > 0 {
            return Err(ExtractError::SegmentsEvicted {
                missing: lease.missing(),
            });
        }

        let _permit = self.permits.acquire().await.map_err(|_| ExtractError::Closed)?;

        let filename = clip_file_name(&request.plate, request.event_time);
        let path = self.config.clip_dir.join(&filename);
        let inputs: Vec<PathBuf> = selected.iter().map(|s| s.path.clone()).collect();

        debug!(
            start = window.start,
            end = window.end,
            skipped = window.latency_segments_skipped,
            "Concatenating segments"
        );

        if let Err(e) = self.tool.concat(&inputs, &path).await {
            discard(&path).await;
            return Err(e.into());
        }
        drop(lease);

        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size < self.config.min_clip_bytes {
            discard(&path).await;
            return Err(ExtractError::CorruptOutput {
                path,
                size,
                min: self.config.min_clip_bytes,
            });
        }

        let thumbnail = thumbnail_path_for(&path);
        let thumbnail_path = match self
            .tool
            .thumbnail(&path, self.config.thumbnail_offset(), &thumbnail)
            .await
        {
            Ok(()) => Some(thumbnail),
            Err(e) => {
                warn!(clip = %path.display(), error = %e, "Thumbnail generation failed");
                discard(&thumbnail).await;
                None
            }
        };

        info!(
            clip = %filename,
            size_bytes = size,
            segments = window.clip_segment_count,
            thumbnail = thumbnail_path.is_some(),
            "Clip created"
        );

        Ok(FinalClip {
            filename,
            path,
            thumbnail_path,
            size_bytes: size,
        })
    }
}

#[async_trait]
impl ClipCapture for ClipExtractor {
    async fn capture(&self, request: ClipRequest) -> Option<FinalClip> {
        self.extract(request).await
    }
}

async fn discard(path: &Path) {
    if let Err(e) = remove_segment_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove rejected output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BufferConfig, StreamConfig};
    use crate::segment::Segment;
    use crate::testing::FakeMediaTool;
    use chrono::TimeZone;
    use std::time::Duration;

    fn example_params() -> WindowParams {
        WindowParams {
            segment_duration_secs: 2,
            pre_buffer_secs: 10,
            post_buffer_secs: 5,
            stream_latency_secs: 60,
        }
    }

    fn create_test_config(clip_dir: &Path) -> CaptureConfig {
        CaptureConfig {
            stream: StreamConfig {
                url: "rtsp://camera:554/stream".to_string(),
                ..StreamConfig::default()
            },
            buffer: BufferConfig {
                segment_dir: PathBuf::from("buffer"),
                segment_duration_secs: 2,
                retention_window_minutes: 10,
            },
            clip: ClipConfig {
                clip_dir: clip_dir.to_path_buf(),
                pre_buffer_secs: 10,
                post_buffer_secs: 5,
                stream_latency_secs: 60,
                safety_margin_secs: 0,
                min_clip_bytes: 1024,
                ..ClipConfig::default()
            },
        }
    }

    fn filled_index(count: usize) -> Arc<SegmentIndex> {
        let index = Arc::new(SegmentIndex::with_capacity(count + 10));
        let base = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        for i in 0..count {
            let started_at = base + chrono::Duration::seconds(2 * i as i64);
            index.push(Segment {
                sequence: index.allocate_sequence(),
                started_at,
                path: PathBuf::from(format!("/buffer/{}", Segment::file_name_for(started_at))),
                duration: Duration::from_secs(2),
            });
        }
        index
    }

    fn request() -> ClipRequest {
        ClipRequest {
            plate: "AB12CDE".to_string(),
            event_time: Utc.with_ymd_and_hms(2024, 1, 15, 10, 6, 40).unwrap(),
        }
    }

    #[test]
    fn test_plan_window_example() {
        let window = plan_window(200, &example_params()).unwrap();
        assert_eq!(window.clip_segment_count, 8);
        assert_eq!(window.latency_segments_skipped, 30);
        assert_eq!((window.start, window.end), (162, 170));
    }

    #[test]
    fn test_plan_window_is_deterministic() {
        let params = example_params();
        assert_eq!(plan_window(57, &params).unwrap(), plan_window(57, &params).unwrap());
    }

    #[test]
    fn test_plan_window_exact_fit() {
        let window = plan_window(38, &example_params()).unwrap();
        assert_eq!((window.start, window.end), (0, 8));
    }

    #[test]
    fn test_plan_window_insufficient() {
        assert!(matches!(
            plan_window(37, &example_params()),
            Err(ExtractError::InsufficientSegments { available: 37, required: 38 })
        ));
        assert!(matches!(
            plan_window(0, &example_params()),
            Err(ExtractError::InsufficientSegments { .. })
        ));
    }

    #[test]
    fn test_plan_window_without_latency() {
        let params = WindowParams {
            stream_latency_secs: 0,
            ..example_params()
        };
        let window = plan_window(10, &params).unwrap();
        assert_eq!((window.start, window.end), (2, 10));
    }

    #[test]
    fn test_clip_file_name() {
        let name = clip_file_name("AB12CDE", request().event_time);
        assert_eq!(name, "AB12CDE_2024-01-15T10-06-40.000Z.mp4");

        let hostile = clip_file_name("../etc", request().event_time);
        assert!(hostile.starts_with("___etc_"));
    }

    #[test]
    fn test_thumbnail_path() {
        let path = thumbnail_path_for(Path::new("/videos/AB12CDE_x.mp4"));
        assert_eq!(path, PathBuf::from("/videos/AB12CDE_x.mp4.jpg"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_concatenates_selected_window() {
        let dir = tempfile::tempdir().unwrap();
        let index = filled_index(200);
        let tool = Arc::new(FakeMediaTool::default());
        let extractor =
            ClipExtractor::new(&create_test_config(dir.path()), index.clone(), tool.clone());

        let clip = extractor.extract(request()).await.unwrap();

        let snapshot = index.snapshot();
        let expected: Vec<PathBuf> = snapshot[162..170].iter().map(|s| s.path.clone()).collect();
        assert_eq!(tool.concat_calls(), vec![expected]);

        assert_eq!(clip.filename, "AB12CDE_2024-01-15T10-06-40.000Z.mp4");
        assert!(clip.path.exists());
        let thumbnail = clip.thumbnail_path.unwrap();
        assert!(thumbnail.exists());
        assert!(thumbnail.to_string_lossy().ends_with(".mp4.jpg"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_with_short_buffer_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeMediaTool::default());
        let extractor =
            ClipExtractor::new(&create_test_config(dir.path()), filled_index(20), tool.clone());

        assert!(extractor.extract(request()).await.is_none());
        assert!(tool.concat_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_undersized_clip_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeMediaTool::default().with_clip_bytes(10));
        let extractor =
            ClipExtractor::new(&create_test_config(dir.path()), filled_index(200), tool.clone());

        assert!(extractor.extract(request()).await.is_none());
        let clip_path = dir.path().join(clip_file_name("AB12CDE", request().event_time));
        assert!(!clip_path.exists());
        assert_eq!(tool.thumbnail_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_concat_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeMediaTool::default().failing_concat());
        let extractor =
            ClipExtractor::new(&create_test_config(dir.path()), filled_index(200), tool.clone());

        assert!(extractor.extract(request()).await.is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thumbnail_failure_keeps_clip() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(FakeMediaTool::default().failing_thumbnails());
        let extractor =
            ClipExtractor::new(&create_test_config(dir.path()), filled_index(200), tool.clone());

        let clip = extractor.extract(request()).await.unwrap();
        assert!(clip.path.exists());
        assert!(clip.thumbnail_path.is_none());
        assert_eq!(tool.thumbnail_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_segments_are_leased_during_concat() {
        let dir = tempfile::tempdir().unwrap();
        let index = filled_index(200);
        let tool = Arc::new(FakeMediaTool::default().evicting_during_concat(index.clone()));
        let extractor =
            ClipExtractor::new(&create_test_config(dir.path()), index.clone(), tool.clone());

        assert!(extractor.extract(request()).await.is_some());
        // Everything outside the leased window was evicted mid-concat.
        assert_eq!(tool.pinned_during_concat(), Some(8));
        assert_eq!(index.len(), 8);
    }
}
