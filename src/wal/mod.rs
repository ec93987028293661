//! Write-Ahead Logging (WAL) Module
//!
//! This module implements a **durable**, **append-only** write-ahead log for
//! time-series writes.  Every point accepted by the memstore is recorded
//! here as a [`WalEntry`] before the write is acknowledged, so a crash can
//! never lose an acknowledged point that has not yet reached a segment.
//!
//! ## Design Overview
//!
//! The WAL is a single active file (`wal/shard.wal`) that rotates by size:
//! when the file reaches the configured maximum, it is flushed, synced, and
//! renamed to `shard.wal.<YYYYMMDD-HHMMSS.mmm>`, and a fresh file is opened
//! at the base path.  Rotated files are consumed later by
//! [`replay::WalReplayer`] and swept by its age-based cleanup.
//!
//! # On-disk layout
//!
//! ```text
//! [REC_LEN_LE][REC_BYTES]
//! [REC_LEN_LE][REC_BYTES]
//! ...
//! ```
//!
//! Each record is a 4-byte little-endian length prefix followed by an
//! encoded [`WalEntry`].  The length prefix is what makes replay tolerant
//! of a truncated tail: a partial final record is recognised and treated
//! as clean end-of-log, never as corruption.  Integrity of the entry
//! itself is covered by the checksum *field* inside the payload (see
//! [`WalEntry::checksum`]), which replay callers may verify via
//! [`replay::WalReplayer::validate_entry`].
//!
//! # Concurrency model
//!
//! All WAL state (file handle, running size, per-file sequence counter)
//! lives behind one mutex; `append`, `flush`, `close`, and rotation are
//! fully serialized.  Appends go through a `BufWriter` and are **not**
//! individually fsynced — [`Wal::flush`] provides the explicit durability
//! point, and rotation/close always flush + sync.
//!
//! # Guarantees
//!
//! - **Ordering:** entry IDs are assigned under the mutex in append order;
//!   within one series, WAL order equals memtable order.
//! - **Truncation tolerance:** a crash mid-append leaves at most one
//!   partial record, which replay discards silently.
//! - **Idempotent shutdown:** `close()` may be called any number of times;
//!   appends after close fail with [`WalError::Closed`].

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod replay;

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::metrics::{self, MetricsSink, names};
use crate::types::{DataPoint, SeriesId, integrity_checksum, now_nanos};

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Timestamp format for rotated WAL filenames (millisecond precision).
const ROTATION_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S%.3f";

/// Fallback stamp with nanosecond precision, used when two rotations land
/// in the same millisecond.
const ROTATION_STAMP_FORMAT_FINE: &str = "%Y%m%d-%H%M%S%.9f";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// The WAL has been closed; no further appends are accepted.
    #[error("WAL is closed")]
    Closed,

    /// Rotation to a fresh WAL file failed; the triggering append is
    /// reported as failed.
    #[error("WAL rotation failed: {0}")]
    Rotation(#[source] io::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// WalEntry
// ------------------------------------------------------------------------------------------------

/// One durable record of a write: a batch of points for a single series.
///
/// The memstore writes one entry per point, so `points` is a singleton on
/// the normal write path; the format nevertheless carries a vector so a
/// batched producer replays identically.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    /// Sequence number, monotone within one WAL file.  Assigned by
    /// [`Wal::append`]; zero until then.
    pub id: u64,

    /// Append instant, nanoseconds since the Unix epoch.
    pub timestamp: i64,

    /// Target series.
    pub series_id: SeriesId,

    /// The recorded points, in write order.
    pub points: Vec<DataPoint>,

    /// Wrapping 32-bit sum over the series-ID bytes and per-point terms.
    /// See [`crate::types::integrity_checksum`].
    pub checksum: u32,
}

impl WalEntry {
    /// Builds an entry for `points`, stamping the current time and
    /// computing the checksum.  The sequence number is assigned later by
    /// [`Wal::append`].
    pub fn new(series_id: impl Into<SeriesId>, points: Vec<DataPoint>) -> Self {
        let series_id = series_id.into();
        let checksum = integrity_checksum(&series_id, &points);
        Self {
            id: 0,
            timestamp: now_nanos(),
            series_id,
            points,
            checksum,
        }
    }
}

impl Encode for WalEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.series_id.encode_to(buf)?;
        encoding::encode_vec(&self.points, buf)?;
        self.checksum.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for WalEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (timestamp, n) = i64::decode_from(&buf[offset..])?;
        offset += n;
        let (series_id, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (points, n) = encoding::decode_vec::<DataPoint>(&buf[offset..])?;
        offset += n;
        let (checksum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                timestamp,
                series_id,
                points,
                checksum,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// Append-only write-ahead log with size-based rotation.
///
/// See the [module-level documentation](self) for format, concurrency,
/// and durability semantics.
pub struct Wal {
    /// All mutable state, serialized behind one mutex.
    inner: Mutex<WalInner>,

    /// Base path of the active WAL file (`.../wal/shard.wal`).
    path: PathBuf,

    /// Size threshold that triggers rotation, in bytes.
    max_file_size: u64,

    /// Metrics destination.
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("path", &self.path)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}

/// Mutex-protected WAL state.
struct WalInner {
    /// Buffered handle to the active file.  `None` once closed.
    writer: Option<BufWriter<File>>,

    /// Running size of the active file in bytes (framing included).
    size: u64,

    /// Next sequence number to assign; reset to 1 on rotation.
    next_id: u64,
}

impl Wal {
    /// Opens (or creates) the active WAL file at `path`.
    ///
    /// An existing file is opened in append mode and its current length
    /// counts toward the rotation threshold.  Sequence numbers restart at
    /// 1 on every open — they are meaningful only within one file and are
    /// never used to order entries across files.
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_file_size: u64,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        info!(path = %path.display(), size, "WAL opened");

        Ok(Self {
            inner: Mutex::new(WalInner {
                writer: Some(BufWriter::new(file)),
                size,
                next_id: 1,
            }),
            path,
            max_file_size,
            metrics,
        })
    }

    /// Opens a WAL with a no-op metrics sink.  Test convenience.
    pub fn open_plain<P: AsRef<Path>>(path: P, max_file_size: u64) -> Result<Self, WalError> {
        Self::open(path, max_file_size, metrics::noop())
    }

    /// Appends one entry, returning the sequence number it was assigned.
    ///
    /// Under the mutex: rotates first when the active file has reached
    /// [`max_file_size`](Self::open), assigns the next sequence number,
    /// then writes `[u32 LE length][encoded entry]` into the buffered
    /// writer.  The bytes are buffered — call [`Wal::flush`] for an
    /// explicit durability point.
    pub fn append(&self, mut entry: WalEntry) -> Result<u64, WalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        if inner.writer.is_none() {
            return Err(WalError::Closed);
        }

        if inner.size >= self.max_file_size {
            self.rotate_locked(&mut inner)?;
        }

        entry.id = inner.next_id;

        let payload = encoding::encode_to_vec(&entry)?;
        let len = u32::try_from(payload.len()).map_err(|_| {
            WalError::Internal(format!("WAL record of {} bytes exceeds u32", payload.len()))
        })?;

        let writer = inner
            .writer
            .as_mut()
            .ok_or(WalError::Closed)?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&payload)?;

        inner.next_id += 1;
        inner.size += (U32_SIZE + payload.len()) as u64;

        self.metrics
            .set_gauge(names::WAL_SIZE_BYTES, inner.size as f64);

        trace!(
            id = entry.id,
            series = %entry.series_id,
            len,
            size = inner.size,
            "WAL entry appended"
        );

        Ok(entry.id)
    }

    /// Pushes all buffered writes to disk (`flush` + `fsync`).
    ///
    /// A no-op on a closed WAL.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Flushes and releases the file handle.  Idempotent.
    pub fn close(&self) -> Result<(), WalError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;

        if let Some(mut writer) = inner.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            info!(path = %self.path.display(), size = inner.size, "WAL closed");
        }
        Ok(())
    }

    /// Current size of the active file in bytes (framing included).
    pub fn size(&self) -> Result<u64, WalError> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))?;
        Ok(inner.size)
    }

    /// Base path of the active WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rotates the active file: flush + sync, rename to a timestamped
    /// sibling, then reopen the base path empty.
    ///
    /// Any failure maps to [`WalError::Rotation`] and fails the append
    /// that triggered it.  The old handle is kept until the fresh file is
    /// open — a failed rename leaves the WAL fully usable (renaming an
    /// open file is fine on the platforms this engine targets).
    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        {
            let writer = inner.writer.as_mut().ok_or(WalError::Closed)?;
            writer.flush().map_err(WalError::Rotation)?;
            writer
                .get_ref()
                .sync_all()
                .map_err(WalError::Rotation)?;
        }

        let rotated = self.rotation_target();
        std::fs::rename(&self.path, &rotated).map_err(WalError::Rotation)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(WalError::Rotation)?;

        // Dropping the previous writer here is safe: it was flushed and
        // synced above.
        inner.writer = Some(BufWriter::new(file));
        inner.size = 0;
        inner.next_id = 1;

        self.metrics.incr_counter(names::WAL_ROTATIONS_TOTAL, 1);
        info!(
            path = %self.path.display(),
            rotated = %rotated.display(),
            "WAL rotated"
        );

        Ok(())
    }

    /// Picks a timestamped rename target that does not collide with an
    /// existing rotated file.  Millisecond precision normally; nanosecond
    /// precision when rotations land inside the same millisecond.
    fn rotation_target(&self) -> PathBuf {
        let now = Utc::now();
        let candidate = stamped_path(&self.path, &now.format(ROTATION_STAMP_FORMAT).to_string());
        if !candidate.exists() {
            return candidate;
        }
        debug!(path = %candidate.display(), "rotation stamp collision, using fine stamp");
        stamped_path(
            &self.path,
            &now.format(ROTATION_STAMP_FORMAT_FINE).to_string(),
        )
    }
}

/// `<path>.<stamp>` — appends the stamp as an extra dotted suffix.
fn stamped_path(path: &Path, stamp: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{stamp}"));
    PathBuf::from(name)
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.inner.lock() {
            Ok(mut inner) => {
                if let Some(writer) = inner.writer.as_mut() {
                    if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_all()) {
                        error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                    }
                }
            }
            Err(poisoned) => {
                let mut inner = poisoned.into_inner();
                if let Some(writer) = inner.writer.as_mut() {
                    if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_all()) {
                        error!(
                            path = %self.path.display(),
                            error = %e,
                            "WAL sync failed on drop (poisoned lock)"
                        );
                    }
                }
            }
        }
    }
}
