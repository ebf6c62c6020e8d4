//! Plate Tracker Capture
//!
//! Keeps a rolling buffer of short video segments recorded from the camera
//! stream and cuts evidence clips out of it when a plate detection arrives.
//!
//! ## Architecture
//!
//! ```text
//! Camera stream
//!      │
//!      ▼
//! ┌──────────────┐   push    ┌──────────────┐   evict   ┌──────────────┐
//! │ Segment      │──────────▶│ Segment      │◀──────────│ Retention    │
//! │ Recorder     │           │ Index        │           │ Sweeper      │
//! └──────────────┘           └──────────────┘           └──────────────┘
//!      │                            │ snapshot + lease
//!      ▼                            ▼
//! ┌──────────────┐           ┌──────────────┐
//! │ MediaTool    │◀──────────│ Clip         │──▶ clip.mp4 + clip.mp4.jpg
//! │ (ffmpeg)     │  concat   │ Extractor    │
//! └──────────────┘  thumb    └──────────────┘
//! ```
//!
//! The recorder, sweeper and extractor share one [`SegmentIndex`]; segments
//! leased by an extraction are never deleted until the lease is released.

pub mod config;
pub mod extractor;
pub mod media_tool;
pub mod recorder;
pub mod retention;
pub mod segment;

pub use config::{BufferConfig, CaptureConfig, ClipConfig, ConfigValidationError, StreamConfig};
pub use extractor::{
    clip_file_name, plan_window, ClipCapture, ClipExtractor, ClipRequest, ClipWindow, ExtractError,
    FinalClip, WindowParams,
};
pub use media_tool::{Ffmpeg, MediaError, MediaTool};
pub use recorder::{RecorderState, RecorderStats, SegmentRecorder};
pub use retention::{RetentionSweeper, SweepReport};
pub use segment::{Segment, SegmentIndex, SegmentLease};
