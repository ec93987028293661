//! Segment Module
//!
//! Implements the **immutable**, **disk-backed** segment files that hold
//! flushed and compacted time-series data.  A segment stores every point
//! of a subset of series over one time window, together with aggregate
//! metadata that lets readers skip the file without touching its body.
//!
//! # On-disk layout
//!
//! ```text
//! [HDR_LEN_LE][HEADER_BYTES]
//! [SH_LEN_LE][SERIES_HEADER_BYTES]          ── series "a"
//!   [P_LEN_LE][POINT_BYTES]
//!   [P_LEN_LE][POINT_BYTES]
//!   ...
//! [SH_LEN_LE][SERIES_HEADER_BYTES]          ── series "b"
//!   ...
//! ```
//!
//! - **Header** — a [`SegmentHeader`] with ID, creation time, series and
//!   point counts, min/max timestamps, integrity checksum, and a free-form
//!   metadata map.
//! - **Series blocks** — one per series, in **lexicographic series-ID
//!   order**; each opens with a [`SeriesBlockHeader`] naming the series
//!   and its point count, followed by exactly that many framed points in
//!   insertion order.
//!
//! All length prefixes are 4-byte little-endian.  The uniform framing is
//! what lets the reader skip payloads it does not need and recover the
//! record boundary after a bad payload.
//!
//! # Concurrency model
//!
//! Segments are immutable once the writer's rename makes them visible, so
//! reads are lock-free: every reader maps the file with `memmap2` and
//! walks its own cursor.
//!
//! # Sub-modules
//!
//! - [`writer`] — [`SegmentWriter`]: serializes a memtable into a segment.
//! - [`reader`] — [`SegmentReader`]: whole and range-filtered reads,
//!   directory listing.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod reader;
pub mod writer;

mod encoding_impls;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Re-exports — public API surface
// ------------------------------------------------------------------------------------------------

pub use reader::SegmentReader;
pub use writer::SegmentWriter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::PathBuf,
};

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::types::{DataPoint, SeriesId};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// File extension of finished segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// Builds the canonical file name for a segment ID.
pub fn segment_file_name(id: u64) -> String {
    format!("segment_{id}.{SEGMENT_EXTENSION}")
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations (read, write, list).
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The memtable handed to the writer holds no data.
    #[error("segment write rejected: memtable has no data")]
    EmptyMemtable,

    /// Structural damage — a frame length pointing past end of file, a
    /// header that cannot be decoded, or similar.
    #[error("segment corrupt: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// Metadata structures
// ------------------------------------------------------------------------------------------------

/// In-memory description of one segment file.  Immutable once written.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Unique, strictly-increasing segment ID (wall-clock seeded).
    pub id: u64,

    /// Location of the segment file.
    pub path: PathBuf,

    /// File size on disk in bytes.
    pub size: u64,

    /// Smallest point timestamp contained (nanoseconds).
    pub min_time: i64,

    /// Largest point timestamp contained (nanoseconds).
    pub max_time: i64,

    /// Every series present in this segment.
    pub series_ids: BTreeSet<SeriesId>,

    /// Creation instant, nanoseconds since the Unix epoch.
    pub created_at: i64,
}

impl Segment {
    /// Whether `[min_time, max_time]` intersects `[start, end]`.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min_time <= end && self.max_time >= start
    }

    /// Whether the segment contains any points of `series_id`.
    pub fn contains_series(&self, series_id: &str) -> bool {
        self.series_ids.contains(series_id)
    }
}

/// Persisted header at the front of every segment file.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    /// Segment ID.
    pub id: u64,

    /// Creation instant, nanoseconds since the Unix epoch.
    pub created_at: i64,

    /// Number of series blocks that follow.
    pub series_count: u32,

    /// Total number of points across all series.
    pub point_count: u64,

    /// Smallest point timestamp (nanoseconds).
    pub min_time: i64,

    /// Largest point timestamp (nanoseconds).
    pub max_time: i64,

    /// Wrapping 32-bit sum over every series' ID bytes and point terms.
    /// See [`crate::types::integrity_checksum`].
    pub checksum: u32,

    /// Free-form metadata.  Persisted for forward compatibility; the
    /// engine itself writes an empty map.
    pub metadata: BTreeMap<String, String>,
}

/// Per-series block header: the series ID and how many framed points follow.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesBlockHeader {
    /// Series this block belongs to.
    pub series_id: SeriesId,

    /// Number of point records in the block.
    pub point_count: u32,
}

// ------------------------------------------------------------------------------------------------
// Read results
// ------------------------------------------------------------------------------------------------

/// Outcome of reading one series block.
///
/// A payload-level failure inside a block is captured here instead of
/// aborting the whole read; structural damage aborts with
/// [`SegmentError::Corrupt`] instead.
#[derive(Debug)]
pub struct SeriesReadResult {
    /// Series the block belongs to.
    pub series_id: SeriesId,

    /// Successfully decoded points, in on-disk order.
    pub points: Vec<DataPoint>,

    /// First decode failure encountered in this block, if any.
    pub error: Option<SegmentError>,
}
