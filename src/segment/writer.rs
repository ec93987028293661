//! Segment writer — serializes one memtable into an immutable segment file.
//!
//! # Input Requirements
//!
//! The memtable must hold at least one series (an empty table is rejected
//! with [`SegmentError::EmptyMemtable`]).  Series order comes for free:
//! the memtable keys its data with a `BTreeMap`, so iteration is already
//! in the lexicographic order the format requires.  Points are written in
//! insertion order within each series.
//!
//! # Atomicity
//!
//! 1. Write everything to `segment_<id>.seg.tmp`.
//! 2. Flush and sync the file.
//! 3. Rename `…​.seg.tmp` → `…​.seg`.
//!
//! A crash mid-write leaves only a `.tmp` file, which directory listing
//! ignores — a half-written segment is never visible to readers.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info};

use crate::encoding::{self, Encode};
use crate::memstore::MemTable;
use crate::types::{integrity_checksum, now_nanos};

use super::{Segment, SegmentError, SegmentHeader, SeriesBlockHeader, segment_file_name};

// ------------------------------------------------------------------------------------------------
// Aggregates
// ------------------------------------------------------------------------------------------------

/// Header aggregates computed in one pass over the memtable before any
/// byte is written.
struct HeaderStats {
    series_count: u32,
    point_count: u64,
    min_time: i64,
    max_time: i64,
    checksum: u32,
}

/// Scans all points once, tracking counts, time bounds, and the
/// segment-wide checksum.
fn collect_stats(memtable: &MemTable) -> HeaderStats {
    let mut point_count = 0u64;
    let mut min_time = i64::MAX;
    let mut max_time = i64::MIN;
    let mut checksum = 0u32;

    for (series_id, points) in memtable.data() {
        checksum = checksum.wrapping_add(integrity_checksum(series_id, points));
        point_count += points.len() as u64;
        for point in points {
            min_time = min_time.min(point.timestamp);
            max_time = max_time.max(point.timestamp);
        }
    }

    HeaderStats {
        series_count: memtable.data().len() as u32,
        point_count,
        min_time,
        max_time,
        checksum,
    }
}

// ------------------------------------------------------------------------------------------------
// SegmentWriter
// ------------------------------------------------------------------------------------------------

/// Serializes memtables into immutable segment files under one directory.
///
/// Segment IDs come from a process-local counter seeded from the
/// nanosecond clock at construction, so IDs are strictly increasing
/// within a shard's lifetime and still increase across restarts.
pub struct SegmentWriter {
    /// Directory that receives `segment_<id>.seg` files.
    dir: PathBuf,

    /// Next segment ID.
    next_id: AtomicU64,
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl SegmentWriter {
    /// Creates a writer over `dir` (the directory must already exist).
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            next_id: AtomicU64::new(now_nanos() as u64),
        }
    }

    /// Serializes `memtable` into a fresh segment file and returns its
    /// metadata.
    ///
    /// Rejects an empty memtable.  The file becomes visible atomically
    /// via rename once fully written and synced.
    pub fn write_memtable(&self, memtable: &MemTable) -> Result<Segment, SegmentError> {
        if memtable.data().is_empty() {
            return Err(SegmentError::EmptyMemtable);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created_at = now_nanos();
        let stats = collect_stats(memtable);

        let header = SegmentHeader {
            id,
            created_at,
            series_count: stats.series_count,
            point_count: stats.point_count,
            min_time: stats.min_time,
            max_time: stats.max_time,
            checksum: stats.checksum,
            metadata: Default::default(),
        };

        let final_path = self.dir.join(segment_file_name(id));
        let tmp_path = {
            let mut name = final_path.as_os_str().to_os_string();
            name.push(".tmp");
            PathBuf::from(name)
        };

        debug!(
            id,
            series = stats.series_count,
            points = stats.point_count,
            path = %final_path.display(),
            "writing segment"
        );

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        write_framed(&mut writer, &header)?;

        for (series_id, points) in memtable.data() {
            let block_header = SeriesBlockHeader {
                series_id: series_id.clone(),
                point_count: points.len() as u32,
            };
            write_framed(&mut writer, &block_header)?;
            for point in points {
                write_framed(&mut writer, point)?;
            }
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &final_path)?;

        let size = fs::metadata(&final_path)?.len();

        info!(
            id,
            size,
            series = stats.series_count,
            points = stats.point_count,
            min_time = stats.min_time,
            max_time = stats.max_time,
            "segment written"
        );

        Ok(Segment {
            id,
            path: final_path,
            size,
            min_time: stats.min_time,
            max_time: stats.max_time,
            series_ids: memtable.data().keys().cloned().collect(),
            created_at,
        })
    }

    /// Directory this writer targets.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Writes `[u32 LE length][encoded value]`.
fn write_framed<T: Encode>(writer: &mut BufWriter<File>, value: &T) -> Result<(), SegmentError> {
    let payload = encoding::encode_to_vec(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        SegmentError::Corrupt(format!("record of {} bytes exceeds u32", payload.len()))
    })?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}
