//! # Memstore Module
//!
//! The write buffer of the storage engine: a single live [`MemTable`]
//! guarded by a reader-writer lock, fronted by [`MemStore`].
//!
//! ## Design Invariants
//!
//! - All writes are WAL-first: an entry per point is appended to the WAL
//!   before the memtable mutates, so a WAL failure fails the write with
//!   memory untouched.
//! - Within one series, memtable order equals arrival order equals WAL
//!   append order (everything happens under the write lock).
//! - `size` grows by a flat [`POINT_SIZE_ESTIMATE`] per point and only
//!   ever grows until the memtable is replaced.
//! - Once `is_flushed` is set the memtable is read-only and owned by the
//!   flush pipeline; the store has already swapped in a fresh one.
//!
//! ## Flush Semantics
//!
//! When a write pushes `size` to `max_size` or beyond, the memtable is
//! rotated *before the write returns*: the full table is handed to the
//! configured [`FlushSink`] (the shard's segment-write pipeline) while the
//! write lock is held, so readers never observe the gap between "left the
//! memtable" and "visible in a segment".  A sink error is surfaced to the
//! writer as [`MemStoreError::Flush`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Instant,
};

use thiserror::Error;
use tracing::{debug, error, info, trace};

use crate::metrics::{MetricsSink, names};
use crate::types::{DataPoint, SeriesId, now_nanos};
use crate::wal::{Wal, WalEntry, WalError};

/// Flat per-point size estimate used for flush accounting.
///
/// Intentionally coarse — flush thresholds are tuned against this
/// constant, so replacing it with precise accounting would silently
/// change flush behavior.
pub const POINT_SIZE_ESTIMATE: usize = 64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Boxed error type produced by a [`FlushSink`].
pub type FlushError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by [`MemStore`] operations.
#[derive(Debug, Error)]
pub enum MemStoreError {
    /// The WAL append failed; the write was not applied.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// The flush pipeline rejected the rotated memtable.
    #[error("memtable flush failed: {0}")]
    Flush(#[source] FlushError),

    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// FlushSink
// ------------------------------------------------------------------------------------------------

/// Receiver for a full memtable.
///
/// The shard implements this to materialize a segment and hand it to the
/// compaction manager; modelling the callback as a single-method trait
/// keeps the memstore free of any dependency on those components.
pub trait FlushSink: Send + Sync {
    /// Persist `memtable` durably.  On error the triggering write fails,
    /// but the memstore has already swapped in a fresh memtable — the
    /// rejected table's data remains recoverable from the WAL.
    fn flush(&self, memtable: &MemTable) -> Result<(), FlushError>;
}

/// A sink that drops every memtable.  Test convenience.
pub struct DiscardSink;

impl FlushSink for DiscardSink {
    fn flush(&self, _memtable: &MemTable) -> Result<(), FlushError> {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// The in-memory buffer of recent writes for one shard.
///
/// Points are grouped per series; `BTreeMap` keying keeps series in
/// lexicographic order, which is exactly the order the segment format
/// requires, so flushing never re-sorts.
#[derive(Debug)]
pub struct MemTable {
    /// Unique ID, taken from the nanosecond clock at creation.
    id: u64,

    /// Per-series points in arrival order.
    data: BTreeMap<SeriesId, Vec<DataPoint>>,

    /// Estimated size in bytes ([`POINT_SIZE_ESTIMATE`] per point).
    size: usize,

    /// Size threshold at which the owning store rotates this table.
    max_size: usize,

    /// Creation instant, nanoseconds since the Unix epoch.
    created_at: i64,

    /// Set when the table has been handed to the flush pipeline.
    is_flushed: bool,
}

impl MemTable {
    /// Creates an empty memtable with the given flush threshold.
    pub fn new(max_size: usize) -> Self {
        Self {
            id: now_nanos() as u64,
            data: BTreeMap::new(),
            size: 0,
            max_size,
            created_at: now_nanos(),
            is_flushed: false,
        }
    }

    /// Appends `points` to the series' sequence, growing the size
    /// estimate.  Arrival order is preserved.
    pub fn insert(&mut self, series_id: &str, points: &[DataPoint]) {
        if points.is_empty() {
            return;
        }
        self.data
            .entry(series_id.to_string())
            .or_default()
            .extend_from_slice(points);
        self.size += points.len() * POINT_SIZE_ESTIMATE;
    }

    /// Points of `series_id` whose timestamp lies in `[start, end]`.
    pub fn points_in_range(&self, series_id: &str, start: i64, end: i64) -> Vec<DataPoint> {
        match self.data.get(series_id) {
            Some(points) => points
                .iter()
                .filter(|p| p.timestamp >= start && p.timestamp <= end)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Whether the size estimate has reached the flush threshold.
    pub fn is_full(&self) -> bool {
        self.size >= self.max_size
    }

    /// `true` when the table holds no points at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Per-series data, series in lexicographic order.
    pub fn data(&self) -> &BTreeMap<SeriesId, Vec<DataPoint>> {
        &self.data
    }

    /// Unique memtable ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Estimated size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Configured flush threshold in bytes.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Creation instant, nanoseconds since the Unix epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Whether this table has been handed to the flush pipeline.
    pub fn is_flushed(&self) -> bool {
        self.is_flushed
    }

    /// Total number of points across all series.
    pub fn point_count(&self) -> u64 {
        self.data.values().map(|v| v.len() as u64).sum()
    }

    /// Marks the table as flushed (read-only from here on).
    pub(crate) fn mark_flushed(&mut self) {
        self.is_flushed = true;
    }
}

// ------------------------------------------------------------------------------------------------
// MemStore
// ------------------------------------------------------------------------------------------------

/// Write buffer with WAL-backed durability and flush-on-full rotation.
///
/// # Concurrency
/// One reader-writer lock over the live memtable: writes (and the flush
/// they may trigger) hold the write lock, reads share the read lock.
/// WAL appends happen under the write lock so WAL order always matches
/// memtable order.
pub struct MemStore {
    /// The live memtable.
    inner: RwLock<MemTable>,

    /// Durability log; shared with the shard, which closes it on shutdown.
    wal: Arc<Wal>,

    /// Flush destination (the shard's segment-write pipeline).
    sink: Box<dyn FlushSink>,

    /// Flush threshold for each fresh memtable.
    max_memtable_size: usize,

    /// Metrics destination.
    metrics: Arc<dyn MetricsSink>,
}

impl MemStore {
    /// Creates a store with an empty live memtable.
    pub fn new(
        wal: Arc<Wal>,
        max_memtable_size: usize,
        sink: Box<dyn FlushSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        info!(max_memtable_size, "memstore initialized");
        Self {
            inner: RwLock::new(MemTable::new(max_memtable_size)),
            wal,
            sink,
            max_memtable_size,
            metrics,
        }
    }

    /// Writes a batch of points to one series.
    ///
    /// Under the write lock: one [`WalEntry`] per point is appended to the
    /// WAL first, then the points enter the memtable, then the flush
    /// threshold is checked — a full memtable is rotated and flushed
    /// before this call returns.
    pub fn write(&self, series_id: &str, points: &[DataPoint]) -> Result<(), MemStoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let mut table = self.inner.write().map_err(|_| {
            error!("memstore lock poisoned during write");
            MemStoreError::Internal("RwLock poisoned".into())
        })?;

        // WAL first.  One entry per point keeps the checksum formula and
        // replay granularity aligned with the rest of the engine.
        for point in points {
            let entry = WalEntry::new(series_id, vec![point.clone()]);
            if let Err(e) = self.wal.append(entry) {
                self.metrics.incr_counter(names::WRITE_ERRORS_TOTAL, 1);
                return Err(e.into());
            }
        }

        table.insert(series_id, points);

        self.metrics
            .incr_counter(names::POINTS_WRITTEN_TOTAL, points.len() as u64);
        self.metrics
            .set_gauge(names::MEMSTORE_SIZE_BYTES, table.size() as f64);

        trace!(
            series = %series_id,
            points = points.len(),
            size = table.size(),
            "memstore write applied"
        );

        if table.is_full() {
            self.rotate_locked(&mut table)?;
        }

        Ok(())
    }

    /// Points of `series_id` in `[start, end]` from the live memtable.
    ///
    /// Flushed memtables live inside segments and are not visible here.
    pub fn read(
        &self,
        series_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<DataPoint>, MemStoreError> {
        let table = self
            .inner
            .read()
            .map_err(|_| MemStoreError::Internal("RwLock poisoned".into()))?;
        Ok(table.points_in_range(series_id, start, end))
    }

    /// Rotates the live memtable regardless of its fill level.
    ///
    /// An empty memtable is left in place — the segment writer rejects
    /// empty tables, and rotating one would only churn IDs.
    pub fn force_flush(&self) -> Result<(), MemStoreError> {
        let mut table = self.inner.write().map_err(|_| {
            error!("memstore lock poisoned during force_flush");
            MemStoreError::Internal("RwLock poisoned".into())
        })?;

        if table.is_empty() {
            debug!("force_flush on empty memtable skipped");
            return Ok(());
        }
        self.rotate_locked(&mut table)
    }

    /// Estimated size of the live memtable in bytes.
    pub fn size(&self) -> Result<usize, MemStoreError> {
        let table = self
            .inner
            .read()
            .map_err(|_| MemStoreError::Internal("RwLock poisoned".into()))?;
        Ok(table.size())
    }

    /// ID of the live memtable.
    pub fn memtable_id(&self) -> Result<u64, MemStoreError> {
        self.with_memtable(MemTable::id)
    }

    /// Runs `f` against the live memtable under the shared read lock.
    ///
    /// The closure must not attempt to re-enter the store — it runs with
    /// the read lock held.
    pub fn with_memtable<R>(
        &self,
        f: impl FnOnce(&MemTable) -> R,
    ) -> Result<R, MemStoreError> {
        let table = self
            .inner
            .read()
            .map_err(|_| MemStoreError::Internal("RwLock poisoned".into()))?;
        Ok(f(&table))
    }

    /// Swaps in a fresh memtable and pushes the old one through the sink.
    ///
    /// Runs under the write lock held by the caller, so readers never see
    /// the flushed data missing from both tiers.
    fn rotate_locked(&self, table: &mut MemTable) -> Result<(), MemStoreError> {
        let mut full = std::mem::replace(table, MemTable::new(self.max_memtable_size));
        full.mark_flushed();

        info!(
            memtable_id = full.id(),
            size = full.size(),
            series = full.data().len(),
            "memtable rotated, flushing"
        );

        let started = Instant::now();
        let outcome = self.sink.flush(&full);
        self.metrics.observe(
            names::FLUSH_DURATION_SECONDS,
            started.elapsed().as_secs_f64(),
        );
        self.metrics
            .set_gauge(names::MEMSTORE_SIZE_BYTES, table.size() as f64);

        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                self.metrics.incr_counter(names::WRITE_ERRORS_TOTAL, 1);
                error!(memtable_id = full.id(), error = %e, "memtable flush failed");
                Err(MemStoreError::Flush(e))
            }
        }
    }
}
