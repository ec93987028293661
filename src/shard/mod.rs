//! # Shard Module
//!
//! The top-level orchestrator: one shard owns one data directory and wires
//! the WAL, memstore, segment writer/reader, and compaction manager into a
//! crash-safe storage unit.
//!
//! ## Lifecycle
//!
//! ```text
//! Shard::new ──► constructed ──open()──► open ──close()──► closed
//!                                 │
//!                          (recovering: WAL replay
//!                           through the write path)
//! ```
//!
//! - [`Shard::open`] starts the compaction manager, re-registers segments
//!   found on disk, then replays the WAL directory into the memstore and
//!   sweeps WAL files older than 24 hours.  Opening a closed shard fails.
//! - [`Shard::close`] is idempotent: stop compaction, flush the memstore,
//!   flush + close the WAL.  `Drop` performs a best-effort close.
//!
//! ## Data flow
//!
//! Writes go `Shard::write → MemStore::write` (WAL-first, flush-on-full);
//! a full memtable travels through [`FlushPipeline`] — segment write, then
//! registration with the compaction manager.  Reads merge the live
//! memtable with every on-disk segment that contains the series and
//! overlaps the time range; corrupt segments are skipped silently so one
//! bad file never masks the rest.
//!
//! ## Concurrency
//!
//! One reader-writer lock over the lifecycle state: `write`/`read` take
//! the read lock and delegate to the subcomponents' own locks;
//! `open`/`close` take the write lock.  Lock order is always
//! Shard → (MemStore | CompactionManager) → WAL.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs, io,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionConfig, CompactionError, CompactionManager, CompactionStats};
use crate::memstore::{FlushError, FlushSink, MemStore, MemStoreError, MemTable};
use crate::metrics::{self, MetricsSink};
use crate::segment::{SegmentError, SegmentReader, SegmentWriter};
use crate::types::{DataPoint, ReadRequest, WriteRequest};
use crate::wal::{
    Wal, WalError,
    replay::{ReplayError, WalReplayer},
};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// WAL subdirectory under the shard's data directory.
pub const WAL_DIR: &str = "wal";

/// Segment subdirectory under the shard's data directory.
pub const SEGMENT_DIR: &str = "segments";

/// Name of the active WAL file.
pub const WAL_FILE_NAME: &str = "shard.wal";

/// Age past which rotated WAL files are swept during recovery.
const WAL_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by shard operations.
#[derive(Debug, Error)]
pub enum ShardError {
    /// The shard has been closed.
    #[error("shard '{0}' is closed")]
    Closed(String),

    /// The shard is replaying its WAL; writes are rejected until done.
    #[error("shard '{0}' is recovering")]
    Recovering(String),

    /// `open()` was called on a shard that is already open.
    #[error("shard '{0}' is already open")]
    AlreadyOpen(String),

    /// Rejected configuration.
    #[error("invalid shard configuration: {0}")]
    Config(String),

    /// Error from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error from WAL replay.
    #[error("WAL replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Error from the memstore.
    #[error("Memstore error: {0}")]
    MemStore(#[from] MemStoreError),

    /// Error from the segment layer.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Error from the compaction manager.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Caller-supplied shard configuration.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Shard identity, used in errors, logs, and stats.
    pub id: String,

    /// Root directory; `wal/` and `segments/` are created beneath it.
    pub data_dir: PathBuf,

    /// Memtable flush threshold in bytes.
    pub max_memtable_size: usize,

    /// WAL rotation threshold in bytes.
    pub max_wal_size: u64,

    /// Number of compaction levels.
    pub max_levels: usize,

    /// Segments a level tolerates before compaction is scheduled.
    pub max_segments_per_level: usize,

    /// Size cap of compaction level 0; doubles per level.
    pub max_segment_size: u64,

    /// Compaction scheduler tick interval.
    pub compaction_interval: Duration,
}

impl ShardConfig {
    /// Production defaults for everything except identity and location.
    pub fn new(id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            data_dir: data_dir.into(),
            max_memtable_size: 8 * 1024 * 1024,
            max_wal_size: 64 * 1024 * 1024,
            max_levels: 5,
            max_segments_per_level: 10,
            max_segment_size: 32 * 1024 * 1024,
            compaction_interval: Duration::from_secs(30),
        }
    }

    /// Rejects configurations the engine cannot operate with.
    fn validate(&self) -> Result<(), ShardError> {
        if self.id.is_empty() {
            return Err(ShardError::Config("shard id must not be empty".into()));
        }
        if self.max_memtable_size == 0 {
            return Err(ShardError::Config("max_memtable_size must be > 0".into()));
        }
        if self.max_wal_size == 0 {
            return Err(ShardError::Config("max_wal_size must be > 0".into()));
        }
        if self.max_levels == 0 {
            return Err(ShardError::Config("max_levels must be >= 1".into()));
        }
        if self.max_segments_per_level == 0 {
            return Err(ShardError::Config(
                "max_segments_per_level must be >= 1".into(),
            ));
        }
        if self.max_segment_size == 0 {
            return Err(ShardError::Config("max_segment_size must be > 0".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Snapshot returned by [`Shard::stats`].
#[derive(Debug, Clone)]
pub struct ShardStats {
    /// Shard identity.
    pub id: String,

    /// Whether the shard has been closed.
    pub closed: bool,

    /// Whether WAL replay is in progress.
    pub recovering: bool,

    /// Estimated live memtable size in bytes.
    pub memstore_size: usize,

    /// Active WAL file size in bytes.
    pub wal_size: u64,

    /// Total segments across all compaction levels.
    pub segment_count: usize,

    /// Total on-disk segment size in bytes.
    pub total_segment_size: u64,

    /// Per-level compaction statistics.
    pub compaction: CompactionStats,
}

// ------------------------------------------------------------------------------------------------
// Flush pipeline
// ------------------------------------------------------------------------------------------------

/// The memstore's flush destination: materialize a segment, then hand it
/// to the compaction manager.
///
/// Lives here rather than in the memstore so that neither the memstore
/// nor the segment layer ever depends on the other.
struct FlushPipeline {
    writer: Arc<SegmentWriter>,
    compaction: Arc<CompactionManager>,
}

impl FlushSink for FlushPipeline {
    fn flush(&self, memtable: &MemTable) -> Result<(), FlushError> {
        let segment = self.writer.write_memtable(memtable)?;
        debug!(
            segment_id = segment.id,
            memtable_id = memtable.id(),
            "memtable flushed to segment"
        );
        self.compaction.add_segment(segment)?;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Shard
// ------------------------------------------------------------------------------------------------

/// Lifecycle state behind the shard's reader-writer lock.
#[derive(Debug, Default)]
struct ShardState {
    opened: bool,
    closed: bool,
    recovering: bool,
}

/// One storage unit: WAL + memstore + segments + compaction under a
/// single data directory.
pub struct Shard {
    config: ShardConfig,
    state: RwLock<ShardState>,
    wal: Arc<Wal>,
    memstore: MemStore,
    compaction: Arc<CompactionManager>,
    reader: SegmentReader,
    replayer: WalReplayer,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.config.id)
            .field("data_dir", &self.config.data_dir)
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Builds a shard with a no-op metrics sink.
    pub fn new(config: ShardConfig) -> Result<Self, ShardError> {
        Self::with_metrics(config, metrics::noop())
    }

    /// Builds a shard, creating `wal/` and `segments/` beneath the data
    /// directory.  The shard is in the *constructed* state afterwards —
    /// call [`open`](Self::open) before serving traffic.
    pub fn with_metrics(
        config: ShardConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ShardError> {
        config.validate()?;

        let wal_dir = config.data_dir.join(WAL_DIR);
        let segment_dir = config.data_dir.join(SEGMENT_DIR);
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&segment_dir)?;

        let wal = Arc::new(Wal::open(
            wal_dir.join(WAL_FILE_NAME),
            config.max_wal_size,
            Arc::clone(&metrics),
        )?);

        let writer = Arc::new(SegmentWriter::new(&segment_dir));
        let reader = SegmentReader::new(&segment_dir);

        let compaction = Arc::new(CompactionManager::new(
            CompactionConfig {
                max_levels: config.max_levels,
                max_segments_per_level: config.max_segments_per_level,
                base_max_segment_size: config.max_segment_size,
                interval: config.compaction_interval,
            },
            Arc::clone(&writer),
            reader.clone(),
            Arc::clone(&metrics),
        ));

        let memstore = MemStore::new(
            Arc::clone(&wal),
            config.max_memtable_size,
            Box::new(FlushPipeline {
                writer,
                compaction: Arc::clone(&compaction),
            }),
            metrics,
        );

        let replayer = WalReplayer::new(&wal_dir);

        info!(shard = %config.id, data_dir = %config.data_dir.display(), "shard constructed");

        Ok(Self {
            config,
            state: RwLock::new(ShardState::default()),
            wal,
            memstore,
            compaction,
            reader,
            replayer,
        })
    }

    /// Opens the shard: starts compaction, re-registers on-disk segments,
    /// then recovers memtable state from the WAL.
    ///
    /// Fails on a closed shard; re-opening an already-open shard fails
    /// with [`ShardError::AlreadyOpen`].  A failed open leaves the shard
    /// in the open state — the recovery path is `close()` (which tears
    /// down whatever was started) and a fresh `Shard`.
    pub fn open(&self) -> Result<(), ShardError> {
        {
            let mut state = self.lock_state_write()?;
            if state.closed {
                return Err(ShardError::Closed(self.config.id.clone()));
            }
            if state.opened {
                return Err(ShardError::AlreadyOpen(self.config.id.clone()));
            }
            state.opened = true;
        }

        self.compaction.start()?;

        // Rebuild the level structure from whatever survived on disk.
        for segment in self.reader.list_segments()? {
            self.compaction.add_segment(segment)?;
        }

        {
            let mut state = self.lock_state_write()?;
            state.recovering = true;
        }
        let recovered = self.recover();
        {
            let mut state = self.lock_state_write()?;
            state.recovering = false;
        }
        recovered?;

        info!(shard = %self.config.id, "shard open");
        Ok(())
    }

    /// Closes the shard: stop compaction, flush the memstore, close the
    /// WAL.  Idempotent — a second close succeeds without effect.
    pub fn close(&self) -> Result<(), ShardError> {
        let mut state = self.lock_state_write()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        self.compaction.stop()?;
        self.memstore.force_flush()?;
        self.wal.flush()?;
        self.wal.close()?;

        info!(shard = %self.config.id, "shard closed");
        Ok(())
    }

    /// Writes a batch of points.  Rejected while closed or recovering.
    pub fn write(&self, request: &WriteRequest) -> Result<(), ShardError> {
        let state = self.lock_state_read()?;
        if state.closed {
            return Err(ShardError::Closed(self.config.id.clone()));
        }
        if state.recovering {
            return Err(ShardError::Recovering(self.config.id.clone()));
        }

        self.memstore.write(&request.series_id, &request.points)?;
        Ok(())
    }

    /// Reads one series over a closed time interval, merging the live
    /// memtable with every overlapping segment.
    ///
    /// Best-effort across segments: an unreadable segment is skipped, the
    /// rest still contribute.  Results are sorted by timestamp ascending
    /// and truncated to `limit` when `limit > 0`.
    pub fn read(&self, request: &ReadRequest) -> Result<Vec<DataPoint>, ShardError> {
        let _state = self.lock_state_read()?;

        let mut points = self
            .memstore
            .read(&request.series_id, request.start, request.end)?;

        for segment in self.reader.list_segments()? {
            if !segment.contains_series(&request.series_id)
                || !segment.overlaps(request.start, request.end)
            {
                continue;
            }
            match self
                .reader
                .read_segment_range(&segment.path, request.start, request.end)
            {
                Ok((_, results)) => {
                    for result in results {
                        if result.series_id == request.series_id {
                            points.extend(result.points);
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        shard = %self.config.id,
                        segment_id = segment.id,
                        error = %e,
                        "skipping unreadable segment during read"
                    );
                }
            }
        }

        // Stable sort: duplicates and equal timestamps keep tier order.
        points.sort_by_key(|p| p.timestamp);

        if request.limit > 0 && points.len() > request.limit {
            points.truncate(request.limit);
        }

        Ok(points)
    }

    /// Rotates and flushes the live memtable regardless of fill level.
    pub fn force_flush(&self) -> Result<(), ShardError> {
        let state = self.lock_state_read()?;
        if state.closed {
            return Err(ShardError::Closed(self.config.id.clone()));
        }
        self.memstore.force_flush()?;
        Ok(())
    }

    /// Enqueues a top-priority compaction of `level`.
    pub fn force_compaction(&self, level: usize) -> Result<(), ShardError> {
        let state = self.lock_state_read()?;
        if state.closed {
            return Err(ShardError::Closed(self.config.id.clone()));
        }
        self.compaction.force_compaction(level)?;
        Ok(())
    }

    /// Point-in-time operational snapshot.
    pub fn stats(&self) -> Result<ShardStats, ShardError> {
        let (closed, recovering) = {
            let state = self.lock_state_read()?;
            (state.closed, state.recovering)
        };

        let compaction = self.compaction.stats()?;

        Ok(ShardStats {
            id: self.config.id.clone(),
            closed,
            recovering,
            memstore_size: self.memstore.size()?,
            wal_size: self.wal.size()?,
            segment_count: compaction.segment_count,
            total_segment_size: compaction.total_segment_size,
            compaction,
        })
    }

    /// Shard identity.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Whether [`close`](Self::close) has completed.
    pub fn is_closed(&self) -> bool {
        self.lock_state_read().map(|s| s.closed).unwrap_or(true)
    }

    /// WAL replay: feed recovered per-series data back through the normal
    /// write path (re-logging is fine — merging is multiset union), then
    /// sweep WAL files past the retention window.
    fn recover(&self) -> Result<(), ShardError> {
        let replay = self.replayer.replay()?;
        if replay.total_count == 0 {
            debug!(shard = %self.config.id, "nothing to recover");
            return Ok(());
        }

        info!(
            shard = %self.config.id,
            entries = replay.total_count,
            errors = replay.error_count,
            series = replay.series_data.len(),
            "recovering WAL state"
        );

        for (series_id, points) in &replay.series_data {
            self.memstore.write(series_id, points)?;
        }

        if let Err(e) = self.replayer.cleanup_old_wals(WAL_RETENTION) {
            warn!(shard = %self.config.id, error = %e, "WAL cleanup failed");
        }

        Ok(())
    }

    fn lock_state_read(&self) -> Result<std::sync::RwLockReadGuard<'_, ShardState>, ShardError> {
        self.state
            .read()
            .map_err(|_| ShardError::Internal("shard state lock poisoned".into()))
    }

    fn lock_state_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, ShardState>, ShardError> {
        self.state
            .write()
            .map_err(|_| ShardError::Internal("shard state lock poisoned".into()))
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                error!(shard = %self.config.id, error = %e, "shard close failed on drop");
            }
        }
    }
}
