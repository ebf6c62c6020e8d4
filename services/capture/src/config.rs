//! Configuration for the segment recorder, the rolling buffer and clip
//! extraction.
//!
//! These sections are embedded into the worker configuration under the
//! `capture` key and are loaded together with it.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Capture pipeline configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaptureConfig {
    /// Source stream configuration
    #[serde(default)]
    pub stream: StreamConfig,

    /// Rolling segment buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Clip extraction configuration
    #[serde(default)]
    pub clip: ClipConfig,
}

/// Source stream and recorder process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream URL (e.g., "rtsp://camera:554/stream")
    #[serde(default)]
    pub url: String,

    /// RTSP transport protocol (tcp or udp)
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Extra time a media process may run past its expected duration
    /// before it is killed, in seconds
    #[serde(default = "default_watchdog_grace_secs")]
    pub watchdog_grace_secs: u64,

    /// Base delay between recorder restarts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between recorder restarts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

/// Rolling segment buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Directory holding recorded segments
    #[serde(default = "default_segment_dir")]
    pub segment_dir: PathBuf,

    /// Length of each recorded segment in seconds
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,

    /// How long segments are kept before retention deletes them
    #[serde(default = "default_retention_window_minutes")]
    pub retention_window_minutes: u64,
}

/// Clip extraction configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClipConfig {
    /// Directory where final clips and thumbnails are written
    #[serde(default = "default_clip_dir")]
    pub clip_dir: PathBuf,

    /// Seconds of footage before the event
    #[serde(default = "default_pre_buffer_secs")]
    pub pre_buffer_secs: u64,

    /// Seconds of footage after the event
    #[serde(default = "default_post_buffer_secs")]
    pub post_buffer_secs: u64,

    /// Measured delay between a real-world event and its arrival in the
    /// recorded stream, in seconds
    #[serde(default)]
    pub stream_latency_secs: u64,

    /// Extra wait after the post buffer so the last segment is finalized
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,

    /// Clips smaller than this are treated as corrupt and deleted
    #[serde(default = "default_min_clip_bytes")]
    pub min_clip_bytes: u64,

    /// Offset into the clip used for the thumbnail frame, in milliseconds
    #[serde(default = "default_thumbnail_offset_ms")]
    pub thumbnail_offset_ms: u64,

    /// Number of extractions allowed to run their concat step at once
    #[serde(default = "default_max_concurrent_extractions")]
    pub max_concurrent_extractions: usize,
}

// Default value functions
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_watchdog_grace_secs() -> u64 {
    15
}
fn default_reconnect_base_delay_ms() -> u64 {
    5000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60000
}
fn default_segment_dir() -> PathBuf {
    PathBuf::from("buffer")
}
fn default_segment_duration_secs() -> u64 {
    2
}
fn default_retention_window_minutes() -> u64 {
    5
}
fn default_clip_dir() -> PathBuf {
    PathBuf::from("videos")
}
fn default_pre_buffer_secs() -> u64 {
    10
}
fn default_post_buffer_secs() -> u64 {
    5
}
fn default_safety_margin_secs() -> u64 {
    2
}
fn default_min_clip_bytes() -> u64 {
    64 * 1024
}
fn default_thumbnail_offset_ms() -> u64 {
    1000
}
fn default_max_concurrent_extractions() -> usize {
    1
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            transport: default_transport(),
            ffmpeg_path: default_ffmpeg_path(),
            watchdog_grace_secs: default_watchdog_grace_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            segment_dir: default_segment_dir(),
            segment_duration_secs: default_segment_duration_secs(),
            retention_window_minutes: default_retention_window_minutes(),
        }
    }
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            clip_dir: default_clip_dir(),
            pre_buffer_secs: default_pre_buffer_secs(),
            post_buffer_secs: default_post_buffer_secs(),
            stream_latency_secs: 0,
            safety_margin_secs: default_safety_margin_secs(),
            min_clip_bytes: default_min_clip_bytes(),
            thumbnail_offset_ms: default_thumbnail_offset_ms(),
            max_concurrent_extractions: default_max_concurrent_extractions(),
        }
    }
}

impl CaptureConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.stream.url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.stream.url".to_string(),
            ));
        }
        const SCHEMES: [&str; 5] = ["rtsp://", "rtsps://", "http://", "https://", "file://"];
        if !SCHEMES.iter().any(|s| self.stream.url.starts_with(s)) {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.stream.url".to_string(),
                message: "URL must start with rtsp://, rtsps://, http://, https:// or file://"
                    .to_string(),
            });
        }

        if !matches!(self.stream.transport.as_str(), "tcp" | "udp") {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.stream.transport".to_string(),
                message: "Transport must be tcp or udp".to_string(),
            });
        }

        if self.buffer.segment_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.buffer.segment_dir".to_string(),
            ));
        }
        if self.clip.clip_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "capture.clip.clip_dir".to_string(),
            ));
        }

        if self.buffer.segment_duration_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.buffer.segment_duration_secs".to_string(),
                message: "Segment duration must be greater than 0".to_string(),
            });
        }

        if self.clip.pre_buffer_secs + self.clip.post_buffer_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.clip.pre_buffer_secs/post_buffer_secs".to_string(),
                message: "Clip window must be longer than 0 seconds".to_string(),
            });
        }

        if self.clip.max_concurrent_extractions == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.clip.max_concurrent_extractions".to_string(),
                message: "At least one extraction slot is required".to_string(),
            });
        }

        // Segments must outlive the whole wait + window, otherwise retention
        // races extraction.
        let horizon = self.required_history();
        if self.buffer.retention_window() <= horizon {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.buffer.retention_window_minutes".to_string(),
                message: format!(
                    "Retention window must exceed the {}s needed to extract a clip",
                    horizon.as_secs()
                ),
            });
        }

        Ok(())
    }

    /// Amount of recorded history an extraction may reach back into.
    pub fn required_history(&self) -> Duration {
        Duration::from_secs(
            self.clip.pre_buffer_secs
                + self.clip.post_buffer_secs
                + self.clip.stream_latency_secs
                + self.clip.safety_margin_secs
                + self.buffer.segment_duration_secs,
        )
    }
}

impl StreamConfig {
    /// Get the watchdog grace period as Duration.
    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_secs(self.watchdog_grace_secs)
    }

    /// Get base restart delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum restart delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl BufferConfig {
    /// Get segment duration as Duration.
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    /// Get retention window as Duration.
    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_window_minutes * 60)
    }

    /// Number of segments the retention window can hold, plus slack for the
    /// segment being written and one awaiting the next sweep.
    pub fn index_capacity(&self) -> usize {
        let window = self.retention_window_minutes * 60;
        let per_segment = self.segment_duration_secs.max(1);
        (window.div_ceil(per_segment) + 2) as usize
    }
}

impl ClipConfig {
    /// Time to wait after an event before the buffer holds the full window.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.post_buffer_secs + self.safety_margin_secs)
    }

    pub fn thumbnail_offset(&self) -> Duration {
        Duration::from_millis(self.thumbnail_offset_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
