//! WAL replay and cleanup.
//!
//! On shard startup, [`WalReplayer`] reads every WAL file in the log
//! directory in chronological (modification-time) order and reconstructs
//! the per-series point map that was live at crash time.  After recovery
//! has fed that state back through the normal write path, the age-based
//! [`WalReplayer::cleanup_old_wals`] sweep removes rotated files that can
//! no longer matter.
//!
//! # Failure posture
//!
//! Replay is deliberately forgiving: a partial record at the tail of a
//! file is truncation (stop that file, no error), an undecodable payload
//! is counted in [`ReplayResult::error_count`] and skipped using the frame
//! length, a frame claiming more than [`MAX_RECORD_LEN`] bytes abandons
//! the file (counted, never allocated), and a file that cannot be read at
//! all is logged, counted, and skipped.  Only an unreadable directory —
//! or a runaway directory with more than [`MAX_WAL_FILES`] entries —
//! aborts replay.

use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding;
use crate::types::{DataPoint, SeriesId, integrity_checksum};

use super::WalEntry;

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Safety cap on the number of WAL files a single replay will touch.
/// A directory with more is treated as misconfiguration, not data.
pub const MAX_WAL_FILES: usize = 1000;

/// Upper bound on a single replayed record's payload, matching the
/// encoding layer's byte cap.  The frame length is untrusted input; a
/// prefix claiming more than this is corruption, and the allocation is
/// refused before it can happen.
pub const MAX_RECORD_LEN: usize = encoding::MAX_BYTE_LEN as usize;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by replay and cleanup.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The WAL directory itself could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// More than [`MAX_WAL_FILES`] WAL files were found.
    #[error("too many WAL files: {count} (limit {MAX_WAL_FILES})")]
    TooManyFiles {
        /// Number of files discovered.
        count: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// ReplayResult
// ------------------------------------------------------------------------------------------------

/// Everything recovered from one replay pass.
#[derive(Debug, Default)]
pub struct ReplayResult {
    /// All accepted entries, in file order then record order.
    pub entries: Vec<WalEntry>,

    /// Recovered points grouped by series, in replay order.
    pub series_data: BTreeMap<SeriesId, Vec<DataPoint>>,

    /// Number of accepted entries (`entries.len()`).
    pub total_count: usize,

    /// Number of records that failed to decode or read and were skipped.
    pub error_count: usize,
}

// ------------------------------------------------------------------------------------------------
// WalReplayer
// ------------------------------------------------------------------------------------------------

/// Chronological reader over every WAL file in one directory.
#[derive(Debug)]
pub struct WalReplayer {
    /// Directory holding the active and rotated WAL files.
    dir: PathBuf,
}

impl WalReplayer {
    /// Creates a replayer over `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Replays every WAL file in modification-time order.
    ///
    /// See the [module documentation](self) for the failure posture.
    pub fn replay(&self) -> Result<ReplayResult, ReplayError> {
        let files = self.wal_files()?;
        if files.len() > MAX_WAL_FILES {
            return Err(ReplayError::TooManyFiles { count: files.len() });
        }

        let mut result = ReplayResult::default();

        for path in &files {
            self.replay_file(path, &mut result);
        }

        result.total_count = result.entries.len();

        info!(
            files = files.len(),
            entries = result.total_count,
            errors = result.error_count,
            series = result.series_data.len(),
            "WAL replay finished"
        );

        Ok(result)
    }

    /// Recomputes the entry checksum from its **first point** and compares
    /// it to the stored value.
    ///
    /// The normal write path logs one point per entry, so the first point
    /// covers the whole entry there.  Callers decide whether a mismatch
    /// rejects the entry.
    pub fn validate_entry(entry: &WalEntry) -> bool {
        let prefix = &entry.points[..entry.points.len().min(1)];
        integrity_checksum(&entry.series_id, prefix) == entry.checksum
    }

    /// Removes WAL files whose modification time is older than
    /// `now − max_age`.  Per-file errors are logged and skipped; returns
    /// the number of files removed.
    pub fn cleanup_old_wals(&self, max_age: Duration) -> Result<usize, ReplayError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = 0usize;
        for path in self.wal_files()? {
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cleanup: cannot stat WAL file");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "old WAL file removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cleanup: cannot remove WAL file");
                }
            }
        }

        if removed > 0 {
            info!(removed, "WAL cleanup swept old files");
        }
        Ok(removed)
    }

    /// Lists matching WAL files sorted by modification time ascending.
    ///
    /// Files whose metadata cannot be read sort as oldest — they are
    /// almost certainly unreadable later anyway and will be skipped then.
    fn wal_files(&self) -> Result<Vec<PathBuf>, ReplayError> {
        let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_wal_file_name(name) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((path, modified));
        }

        files.sort_by_key(|(_, modified)| *modified);
        Ok(files.into_iter().map(|(path, _)| path).collect())
    }

    /// Reads one WAL file record-by-record into `result`.
    fn replay_file(&self, path: &Path, result: &mut ReplayResult) {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "replay: cannot open WAL file");
                result.error_count += 1;
                return;
            }
        };
        let mut reader = BufReader::new(file);
        let mut accepted = 0usize;

        loop {
            // Length prefix.  EOF here — clean or partial — ends the file:
            // a torn prefix cannot frame a record either way.
            let mut len_bytes = [0u8; U32_SIZE];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "replay: read error, abandoning file");
                    result.error_count += 1;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_bytes) as usize;

            // An absurd length prefix means the record boundaries are
            // gone; refuse the allocation and abandon the file.
            if len > MAX_RECORD_LEN {
                warn!(
                    path = %path.display(),
                    len,
                    "replay: oversized record frame, abandoning file"
                );
                result.error_count += 1;
                break;
            }

            // Payload.  A short read is a truncated tail, not corruption.
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(path = %path.display(), len, "replay: truncated tail record");
                    break;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "replay: read error, abandoning file");
                    result.error_count += 1;
                    break;
                }
            }

            // Decode.  The frame length already advanced the cursor, so a
            // bad payload skips exactly one record.
            match encoding::decode_from_slice::<WalEntry>(&payload) {
                Ok((entry, _)) => {
                    result
                        .series_data
                        .entry(entry.series_id.clone())
                        .or_default()
                        .extend(entry.points.iter().cloned());
                    result.entries.push(entry);
                    accepted += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "replay: undecodable record skipped");
                    result.error_count += 1;
                }
            }
        }

        debug!(path = %path.display(), accepted, "WAL file replayed");
    }
}

/// WAL filename filter: the active file ends in `.wal`, rotated files
/// contain `.wal.`; in-flight temporary files end in `.tmp`.
fn is_wal_file_name(name: &str) -> bool {
    if name.ends_with(".tmp") {
        return false;
    }
    name.ends_with(".wal") || name.contains(".wal.")
}
