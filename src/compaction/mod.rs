//! # Compaction Module
//!
//! Caps the number of segments per level and merges overlapping data into
//! progressively larger files.
//!
//! ## Level geometry
//!
//! Level `i` accepts segments up to `base_max_segment_size << i` bytes and
//! tolerates `max_segments_per_level` files before a merge is scheduled.
//! A new segment lands at the first level whose size cap fits it; anything
//! larger than the top level's cap lands in the top level anyway.
//!
//! ## Scheduling
//!
//! [`CompactionManager::start`] spawns two long-lived threads:
//!
//! - a **scheduler** that ticks every `interval` and enqueues a task for
//!   every level over its file cap,
//! - a **worker** that consumes a bounded task queue (capacity 100) and
//!   performs the merges.
//!
//! Both threads `select!` on a stop channel; [`CompactionManager::stop`]
//! drops the sender side, which wakes and terminates them at their next
//! select point.  A full queue drops the task with a warning — the next
//! tick re-enqueues it.  Per level the state machine is
//! `idle → scheduled → running → idle`; a level never runs two tasks at
//! once.
//!
//! ## Merge semantics
//!
//! A merge reads every source segment whole, concatenates points per
//! series in level order, and **stable-sorts** each series by timestamp.
//! Duplicate `(series, timestamp)` pairs are preserved — merging is
//! multiset union, never deduplication.  The merged memtable is written
//! through the shared [`SegmentWriter`], the level's segment list is
//! swapped under the write lock, source files are deleted best-effort,
//! and the new segment is promoted one level up when it fits there.
//!
//! Background errors never surface to callers: a failed task is logged,
//! counted in metrics, and the level returns to idle.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    sync::{Arc, Mutex, RwLock},
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use crossbeam::select;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::memstore::MemTable;
use crate::metrics::{MetricsSink, names};
use crate::segment::{Segment, SegmentError, SegmentReader, SegmentWriter};
use crate::types::{DataPoint, SeriesId};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Capacity of the bounded compaction task queue.
pub const TASK_QUEUE_CAPACITY: usize = 100;

/// Priority assigned to user-forced compactions (above any level index).
const FORCE_PRIORITY: i64 = 1000;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction-manager operations.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// `start()` was called on a manager that is already running.
    #[error("compaction manager already running")]
    AlreadyRunning,

    /// A level index outside `0..max_levels`.
    #[error("invalid compaction level {level} (max_levels = {max_levels})")]
    InvalidLevel {
        /// The offending level.
        level: usize,
        /// Configured number of levels.
        max_levels: usize,
    },

    /// The bounded task queue is full.
    #[error("compaction task queue full")]
    QueueFull,

    /// Reading or writing a segment failed.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Internal invariant violation, poisoned lock, or stopped manager.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration & stats
// ------------------------------------------------------------------------------------------------

/// Level geometry and scheduling knobs.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Number of levels.
    pub max_levels: usize,

    /// Segments a level tolerates before compaction is scheduled.
    pub max_segments_per_level: usize,

    /// Size cap of level 0; doubles per level.
    pub base_max_segment_size: u64,

    /// Scheduler tick interval.
    pub interval: Duration,
}

/// Snapshot of one level, as reported by [`CompactionManager::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct LevelStats {
    /// Level index.
    pub level: usize,

    /// Segments currently in the level.
    pub segment_count: usize,

    /// Size cap of the level in bytes.
    pub max_size: u64,

    /// File cap of the level.
    pub max_files: usize,

    /// Sum of segment file sizes in the level, bytes.
    pub total_size: u64,
}

/// Snapshot of the whole level structure.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionStats {
    /// Per-level statistics, level 0 first.
    pub levels: Vec<LevelStats>,

    /// Total segments across all levels.
    pub segment_count: usize,

    /// Total on-disk size across all levels, bytes.
    pub total_segment_size: u64,
}

// ------------------------------------------------------------------------------------------------
// Levels and tasks
// ------------------------------------------------------------------------------------------------

/// One tier of the LSM tree.
#[derive(Debug)]
struct CompactionLevel {
    /// Level index.
    level: usize,

    /// Segments in the level, sorted by `created_at` ascending (ties keep
    /// insertion order — the sort is stable).
    segments: Vec<Segment>,

    /// Size cap (`base << level`).
    max_size: u64,

    /// File cap.
    max_files: usize,

    /// A task for this level sits in the queue.
    scheduled: bool,

    /// The worker is merging this level right now.
    compacting: bool,
}

impl CompactionLevel {
    fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.size).sum()
    }

    fn over_capacity(&self) -> bool {
        self.segments.len() > self.max_files
    }
}

/// One unit of work for the compaction worker.
#[derive(Debug, Clone, Copy)]
struct CompactionTask {
    /// Level to merge.
    level: usize,

    /// Priority: the level index for scheduled tasks, [`FORCE_PRIORITY`]
    /// for user-forced ones.  Recorded for logging; the queue itself is
    /// FIFO.
    priority: i64,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// State shared between the manager handle and its background threads.
struct Shared {
    /// The level structure.
    levels: RwLock<Vec<CompactionLevel>>,

    /// Writer used to materialize merged segments.
    writer: Arc<SegmentWriter>,

    /// Reader used to load source segments.
    reader: SegmentReader,

    /// Metrics destination.
    metrics: Arc<dyn MetricsSink>,

    /// Configuration snapshot.
    config: CompactionConfig,
}

/// Channels and join handles of a running manager.
struct Runtime {
    task_tx: Sender<CompactionTask>,
    stop_tx: Sender<()>,
    scheduler: JoinHandle<()>,
    worker: JoinHandle<()>,
}

// ------------------------------------------------------------------------------------------------
// CompactionManager
// ------------------------------------------------------------------------------------------------

/// Owns the level structure and the background scheduler/worker pair.
pub struct CompactionManager {
    shared: Arc<Shared>,
    runtime: Mutex<Option<Runtime>>,
}

impl std::fmt::Debug for CompactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionManager")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl CompactionManager {
    /// Builds a manager with empty levels.  Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        config: CompactionConfig,
        writer: Arc<SegmentWriter>,
        reader: SegmentReader,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let levels = (0..config.max_levels)
            .map(|level| CompactionLevel {
                level,
                segments: Vec::new(),
                max_size: config
                    .base_max_segment_size
                    .checked_shl(level as u32)
                    .unwrap_or(u64::MAX),
                max_files: config.max_segments_per_level,
                scheduled: false,
                compacting: false,
            })
            .collect();

        Self {
            shared: Arc::new(Shared {
                levels: RwLock::new(levels),
                writer,
                reader,
                metrics,
                config,
            }),
            runtime: Mutex::new(None),
        }
    }

    /// Spawns the scheduler and worker threads.
    ///
    /// Errors with [`CompactionError::AlreadyRunning`] when called twice
    /// without an intervening [`stop`](Self::stop).
    pub fn start(&self) -> Result<(), CompactionError> {
        let mut runtime = self
            .runtime
            .lock()
            .map_err(|_| CompactionError::Internal("runtime mutex poisoned".into()))?;

        if runtime.is_some() {
            return Err(CompactionError::AlreadyRunning);
        }

        let (task_tx, task_rx) = channel::bounded::<CompactionTask>(TASK_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        let scheduler = {
            let shared = Arc::clone(&self.shared);
            let task_tx = task_tx.clone();
            let stop_rx = stop_rx.clone();
            std::thread::Builder::new()
                .name("compaction-scheduler".into())
                .spawn(move || scheduler_loop(&shared, &task_tx, &stop_rx))
                .map_err(|e| CompactionError::Internal(format!("spawn scheduler: {e}")))?
        };

        let worker = {
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name("compaction-worker".into())
                .spawn(move || worker_loop(&shared, &task_rx, &stop_rx))
                .map_err(|e| CompactionError::Internal(format!("spawn worker: {e}")))?
        };

        *runtime = Some(Runtime {
            task_tx,
            stop_tx,
            scheduler,
            worker,
        });

        info!(
            levels = self.shared.config.max_levels,
            interval = ?self.shared.config.interval,
            "compaction manager started"
        );
        Ok(())
    }

    /// Signals shutdown and joins both threads.  Idempotent.
    pub fn stop(&self) -> Result<(), CompactionError> {
        let runtime = {
            let mut guard = self
                .runtime
                .lock()
                .map_err(|_| CompactionError::Internal("runtime mutex poisoned".into()))?;
            guard.take()
        };

        let Some(runtime) = runtime else {
            return Ok(());
        };

        // Dropping both senders wakes the threads at their next select.
        drop(runtime.stop_tx);
        drop(runtime.task_tx);

        if runtime.scheduler.join().is_err() {
            error!("compaction scheduler thread panicked");
        }
        if runtime.worker.join().is_err() {
            error!("compaction worker thread panicked");
        }

        info!("compaction manager stopped");
        Ok(())
    }

    /// Registers a segment, placing it at the first level whose size cap
    /// fits it, and schedules a merge when the level overflows its file
    /// cap.  A full queue drops the task silently — the scheduler tick
    /// re-enqueues it.
    pub fn add_segment(&self, segment: Segment) -> Result<(), CompactionError> {
        let overflowed = self.shared.place_segment(segment)?;

        if let Some(level) = overflowed {
            let task = CompactionTask {
                level,
                priority: level as i64,
            };
            match self.try_enqueue(task) {
                Ok(()) => self.shared.mark_scheduled(level, true)?,
                Err(CompactionError::QueueFull) => {
                    warn!(level, "compaction queue full, task dropped");
                }
                Err(CompactionError::Internal(_)) => {
                    // Manager not started yet; the first tick after start
                    // will pick the level up.
                    debug!(level, "compaction not running, deferring to scheduler");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Enqueues a top-priority task for `level`.
    ///
    /// Rejects a level outside `0..max_levels`; an empty level succeeds
    /// without enqueueing anything; a full queue is surfaced as
    /// [`CompactionError::QueueFull`].
    pub fn force_compaction(&self, level: usize) -> Result<(), CompactionError> {
        if level >= self.shared.config.max_levels {
            return Err(CompactionError::InvalidLevel {
                level,
                max_levels: self.shared.config.max_levels,
            });
        }

        {
            let levels = self
                .shared
                .levels
                .read()
                .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;
            if levels[level].segments.is_empty() {
                debug!(level, "force compaction on empty level is a no-op");
                return Ok(());
            }
        }

        self.try_enqueue(CompactionTask {
            level,
            priority: FORCE_PRIORITY,
        })?;
        info!(level, "compaction forced");
        Ok(())
    }

    /// Snapshot of every level.
    pub fn stats(&self) -> Result<CompactionStats, CompactionError> {
        let levels = self
            .shared
            .levels
            .read()
            .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;

        let per_level: Vec<LevelStats> = levels
            .iter()
            .map(|l| LevelStats {
                level: l.level,
                segment_count: l.segments.len(),
                max_size: l.max_size,
                max_files: l.max_files,
                total_size: l.total_size(),
            })
            .collect();

        Ok(CompactionStats {
            segment_count: per_level.iter().map(|l| l.segment_count).sum(),
            total_segment_size: per_level.iter().map(|l| l.total_size).sum(),
            levels: per_level,
        })
    }

    /// `true` while the scheduler/worker pair is alive.
    pub fn is_running(&self) -> bool {
        self.runtime.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Pushes a task into the bounded queue without blocking.
    fn try_enqueue(&self, task: CompactionTask) -> Result<(), CompactionError> {
        let runtime = self
            .runtime
            .lock()
            .map_err(|_| CompactionError::Internal("runtime mutex poisoned".into()))?;

        let Some(rt) = runtime.as_ref() else {
            return Err(CompactionError::Internal(
                "compaction manager not running".into(),
            ));
        };

        match rt.task_tx.try_send(task) {
            Ok(()) => {
                trace!(level = task.level, priority = task.priority, "compaction task enqueued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(CompactionError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(CompactionError::Internal(
                "compaction worker channel disconnected".into(),
            )),
        }
    }
}

impl Drop for CompactionManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "compaction manager stop failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background loops
// ------------------------------------------------------------------------------------------------

/// Periodic re-check of every level; runs until the stop sender drops.
fn scheduler_loop(shared: &Shared, task_tx: &Sender<CompactionTask>, stop_rx: &Receiver<()>) {
    let ticker = channel::tick(shared.config.interval);
    debug!("compaction scheduler running");

    loop {
        select! {
            recv(ticker) -> _ => shared.schedule_pending(task_tx),
            recv(stop_rx) -> _ => {
                debug!("compaction scheduler stopping");
                return;
            }
        }
    }
}

/// Task consumer; runs until both the task and stop senders drop.
fn worker_loop(shared: &Shared, task_rx: &Receiver<CompactionTask>, stop_rx: &Receiver<()>) {
    debug!("compaction worker running");

    loop {
        select! {
            recv(task_rx) -> msg => match msg {
                Ok(task) => shared.run_task(task),
                Err(_) => {
                    debug!("compaction worker stopping (queue closed)");
                    return;
                }
            },
            recv(stop_rx) -> _ => {
                debug!("compaction worker stopping");
                return;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared — placement, scheduling, merging
// ------------------------------------------------------------------------------------------------

impl Shared {
    /// Inserts a segment at its target level.  Returns `Some(level)` when
    /// the level is now over its file cap and not already scheduled or
    /// running.
    fn place_segment(&self, segment: Segment) -> Result<Option<usize>, CompactionError> {
        let mut levels = self
            .levels
            .write()
            .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;

        let target = levels
            .iter()
            .position(|l| l.max_size >= segment.size)
            .unwrap_or(levels.len().saturating_sub(1));

        debug!(
            segment_id = segment.id,
            size = segment.size,
            level = target,
            "segment placed"
        );

        let level = &mut levels[target];
        level.segments.push(segment);
        level.segments.sort_by_key(|s| s.created_at);

        let overflowed =
            level.over_capacity() && !level.scheduled && !level.compacting;
        Ok(overflowed.then_some(target))
    }

    /// Sets or clears a level's `scheduled` flag.
    fn mark_scheduled(&self, level: usize, scheduled: bool) -> Result<(), CompactionError> {
        let mut levels = self
            .levels
            .write()
            .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;
        if let Some(l) = levels.get_mut(level) {
            l.scheduled = scheduled;
        }
        Ok(())
    }

    /// One scheduler tick: enqueue a task for every over-capacity level
    /// that has nothing in flight.
    fn schedule_pending(&self, task_tx: &Sender<CompactionTask>) {
        let Ok(mut levels) = self.levels.write() else {
            error!("levels lock poisoned in scheduler");
            return;
        };

        for level in levels.iter_mut() {
            if !level.over_capacity() || level.scheduled || level.compacting {
                continue;
            }
            let task = CompactionTask {
                level: level.level,
                priority: level.level as i64,
            };
            match task_tx.try_send(task) {
                Ok(()) => {
                    level.scheduled = true;
                    trace!(level = level.level, "scheduler enqueued compaction task");
                }
                Err(TrySendError::Full(_)) => {
                    warn!(level = level.level, "compaction queue full, task dropped");
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Executes one compaction task end-to-end.  All failures are logged
    /// and counted; nothing propagates to callers.
    fn run_task(&self, task: CompactionTask) {
        // Claim the level and snapshot its sources.
        let (sources, level_max_size) = {
            let Ok(mut levels) = self.levels.write() else {
                error!("levels lock poisoned in worker");
                return;
            };
            let Some(level) = levels.get_mut(task.level) else {
                warn!(level = task.level, "compaction task for unknown level dropped");
                return;
            };
            level.scheduled = false;
            if level.compacting {
                debug!(level = task.level, "level already compacting, task skipped");
                return;
            }
            if level.segments.len() < 2 {
                debug!(level = task.level, "nothing to merge, task skipped");
                return;
            }
            level.compacting = true;
            (level.segments.clone(), level.max_size)
        };

        info!(
            level = task.level,
            priority = task.priority,
            sources = sources.len(),
            "compaction started"
        );

        let outcome = self.merge_sources(&sources, level_max_size);

        match outcome {
            Ok(merged) => {
                if let Err(e) = self.apply_replacement(task.level, &sources, merged) {
                    error!(level = task.level, error = %e, "compaction replacement failed");
                    self.metrics.incr_counter(names::COMPACTION_ERRORS_TOTAL, 1);
                } else {
                    self.metrics.incr_counter(names::COMPACTIONS_TOTAL, 1);
                }
            }
            Err(e) => {
                error!(level = task.level, error = %e, "compaction task aborted");
                self.metrics.incr_counter(names::COMPACTION_ERRORS_TOTAL, 1);
            }
        }

        if let Ok(mut levels) = self.levels.write() {
            if let Some(level) = levels.get_mut(task.level) {
                level.compacting = false;
            }
        }
    }

    /// Reads every source segment, merges per-series point streams, and
    /// writes the merged segment.
    ///
    /// Any read problem — including a captured per-series decode error —
    /// aborts the merge: deleting sources after a lossy read would break
    /// the multiset-preservation invariant.
    fn merge_sources(
        &self,
        sources: &[Segment],
        level_max_size: u64,
    ) -> Result<Segment, CompactionError> {
        let mut all_points: BTreeMap<SeriesId, Vec<DataPoint>> = BTreeMap::new();

        for source in sources {
            let (_, results) = self.reader.read_segment(&source.path)?;
            for result in results {
                if let Some(e) = result.error {
                    return Err(CompactionError::Segment(SegmentError::Corrupt(format!(
                        "series '{}' in segment {} unreadable: {e}",
                        result.series_id, source.id
                    ))));
                }
                all_points
                    .entry(result.series_id)
                    .or_default()
                    .extend(result.points);
            }
        }

        // Stable sort keeps duplicate timestamps in source order.
        for points in all_points.values_mut() {
            points.sort_by_key(|p| p.timestamp);
        }

        let mut memtable = MemTable::new(level_max_size as usize);
        for (series_id, points) in &all_points {
            memtable.insert(series_id, points);
        }

        Ok(self.writer.write_memtable(&memtable)?)
    }

    /// Swaps the source segments for the merged one under the write lock,
    /// deletes the source files, and promotes the new segment when it
    /// fits the next level's size cap.
    fn apply_replacement(
        &self,
        level_idx: usize,
        sources: &[Segment],
        merged: Segment,
    ) -> Result<(), CompactionError> {
        let source_ids: BTreeSet<u64> = sources.iter().map(|s| s.id).collect();
        let merged_id = merged.id;

        {
            let mut levels = self
                .levels
                .write()
                .map_err(|_| CompactionError::Internal("levels lock poisoned".into()))?;

            if let Some(level) = levels.get_mut(level_idx) {
                level.segments.retain(|s| !source_ids.contains(&s.id));
            }

            // Promotion: the merged segment moves up when a higher level
            // exists and its size cap fits the new file.
            let target = match levels.get(level_idx + 1) {
                Some(next) if merged.size <= next.max_size => level_idx + 1,
                _ => level_idx,
            };
            if target != level_idx {
                debug!(segment_id = merged_id, from = level_idx, to = target, "segment promoted");
            }

            let level = &mut levels[target];
            level.segments.push(merged);
            level.segments.sort_by_key(|s| s.created_at);
        }

        for source in sources {
            if let Err(e) = fs::remove_file(&source.path) {
                warn!(
                    segment_id = source.id,
                    path = %source.path.display(),
                    error = %e,
                    "failed to remove compacted segment file"
                );
            }
        }

        info!(
            level = level_idx,
            merged_id,
            removed = source_ids.len(),
            "compaction applied"
        );
        Ok(())
    }
}
