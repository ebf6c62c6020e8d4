//! Recorded segments and the in-memory rolling index over them.
//!
//! The index is the single source of truth for which segments exist. The
//! recorder appends, retention evicts by age, and the extractor snapshots and
//! leases a window so the files it concatenates cannot be deleted underneath
//! it.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SEGMENT_PREFIX: &str = "segment_";
const SEGMENT_EXTENSION: &str = ".mp4";

/// A fixed-duration chunk of recorded video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Monotonic sequence number assigned by the index
    pub sequence: u64,

    /// Wall-clock time recording of this segment began
    pub started_at: DateTime<Utc>,

    /// Location of the segment file
    pub path: PathBuf,

    /// Nominal length of the segment
    pub duration: Duration,
}

impl Segment {
    /// File name for a segment started at `started_at`.
    pub fn file_name_for(started_at: DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            SEGMENT_PREFIX,
            started_at.timestamp_millis(),
            SEGMENT_EXTENSION
        )
    }

    /// Recover a segment descriptor from a file written by the recorder.
    ///
    /// Returns `None` for files that do not follow the segment naming scheme.
    pub fn from_path(path: &Path, sequence: u64, duration: Duration) -> Option<Self> {
        let millis: i64 = path
            .file_name()?
            .to_str()?
            .strip_prefix(SEGMENT_PREFIX)?
            .strip_suffix(SEGMENT_EXTENSION)?
            .parse()
            .ok()?;

        Some(Self {
            sequence,
            started_at: DateTime::from_timestamp_millis(millis)?,
            path: path.to_path_buf(),
            duration,
        })
    }

    /// Time the segment finished recording.
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(self.duration.as_millis() as i64)
    }
}

/// Delete a segment file, treating an already missing file as success.
///
/// Returns whether a file was actually removed.
pub async fn remove_segment_file(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Result of an age-based eviction pass.
#[derive(Debug, Default)]
pub struct Eviction {
    /// Descriptors removed from the index; their files still need deleting
    pub evicted: Vec<Segment>,

    /// Expired descriptors kept because an extraction holds a lease on them
    pub pinned: usize,
}

type PinTable = Arc<Mutex<HashMap<u64, usize>>>;

/// Fixed-capacity, time-ordered index of recorded segments.
pub struct SegmentIndex {
    segments: RwLock<VecDeque<Segment>>,
    pinned: PinTable,
    capacity: usize,
    next_sequence: AtomicU64,
}

impl SegmentIndex {
    /// Create an empty index holding at most `capacity` unpinned segments.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            segments: RwLock::new(VecDeque::with_capacity(capacity)),
            pinned: Arc::new(Mutex::new(HashMap::new())),
            capacity,
            next_sequence: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Reserve the sequence number for the next segment.
    pub fn allocate_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a freshly recorded segment.
    ///
    /// When the index is over capacity the oldest unpinned descriptors are
    /// dropped and returned so the caller can delete their files. If every
    /// overflowing descriptor is pinned, the index temporarily grows.
    pub fn push(&self, segment: Segment) -> Vec<Segment> {
        let mut segments = self.segments.write();

        // Keep ordering by start time even if a segment arrives late.
        let position = segments
            .iter()
            .rposition(|s| (s.started_at, s.sequence) <= (segment.started_at, segment.sequence))
            .map(|p| p + 1)
            .unwrap_or(0);
        segments.insert(position, segment);

        let mut overflow = Vec::new();
        if segments.len() > self.capacity {
            let pinned = self.pinned.lock();
            while segments.len() > self.capacity {
                match segments.iter().position(|s| !pinned.contains_key(&s.sequence)) {
                    Some(idx) => {
                        if let Some(evicted) = segments.remove(idx) {
                            overflow.push(evicted);
                        }
                    }
                    None => break,
                }
            }
        }

        metrics::gauge!("capture.buffer.segments").set(segments.len() as f64);
        overflow
    }

    /// Copy of the current index, oldest first.
    pub fn snapshot(&self) -> Vec<Segment> {
        self.segments.read().iter().cloned().collect()
    }

    /// Remove every unpinned segment that finished before `cutoff`.
    pub fn evict_expired(&self, cutoff: DateTime<Utc>) -> Eviction {
        let mut segments = self.segments.write();
        let pinned = self.pinned.lock();

        let mut eviction = Eviction::default();
        segments.retain(|s| {
            if s.ends_at() >= cutoff {
                return true;
            }
            if pinned.contains_key(&s.sequence) {
                eviction.pinned += 1;
                return true;
            }
            eviction.evicted.push(s.clone());
            false
        });

        metrics::gauge!("capture.buffer.segments").set(segments.len() as f64);
        eviction
    }

    /// Pin `segments` against eviction until the returned lease is dropped.
    ///
    /// Segments that are no longer indexed are not pinned and are reported by
    /// [`SegmentLease::missing`].
    pub fn lease(&self, segments: &[Segment]) -> SegmentLease {
        let indexed = self.segments.read();
        let mut pinned = self.pinned.lock();

        let mut sequences = Vec::with_capacity(segments.len());
        let mut missing = 0;
        for segment in segments {
            if indexed.iter().any(|s| s.sequence == segment.sequence) {
                *pinned.entry(segment.sequence).or_insert(0) += 1;
                sequences.push(segment.sequence);
            } else {
                missing += 1;
            }
        }

        SegmentLease {
            pins: self.pinned.clone(),
            sequences,
            missing,
        }
    }

    /// Index segment files left behind by a previous run.
    ///
    /// Files are ordered by the start time encoded in their names; anything
    /// not matching the segment naming scheme is ignored.
    pub async fn load_existing(&self, dir: &Path, duration: Duration) -> std::io::Result<usize> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(segment) = Segment::from_path(&path, 0, duration) {
                found.push(segment);
            } else {
                debug!(path = %path.display(), "Skipping non-segment file");
            }
        }

        found.sort_by_key(|s| s.started_at);
        let count = found.len();
        let mut overflow = Vec::new();
        for mut segment in found {
            segment.sequence = self.allocate_sequence();
            overflow.extend(self.push(segment));
        }
        for segment in overflow {
            remove_segment_file(&segment.path).await?;
        }

        info!(dir = %dir.display(), segments = count, "Loaded existing segments");
        Ok(count)
    }
}

/// Keeps a set of segments pinned in the index while alive.
#[derive(Debug)]
pub struct SegmentLease {
    pins: PinTable,
    sequences: Vec<u64>,
    missing: usize,
}

impl SegmentLease {
    /// Number of requested segments that had already been evicted.
    pub fn missing(&self) -> usize {
        self.missing
    }

    /// Number of segments held by this lease.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        for sequence in &self.sequences {
            if let Some(count) = pins.get_mut(sequence) {
                *count -= 1;
                if *count == 0 {
                    pins.remove(sequence);
                }
            }
        }
    }
}
