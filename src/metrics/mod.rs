//! Metrics sink interface.
//!
//! The engine reports operational metrics (WAL size, flush latency,
//! compaction runs, points written, error counts) through the
//! [`MetricsSink`] trait.  Components receive the sink as an
//! `Arc<dyn MetricsSink>` at construction time; when no real exporter is
//! wired in, [`noop`] supplies a sink that discards everything.  The
//! presence or absence of a sink never changes engine behavior.
//!
//! Metric names are centralised in [`names`] so that call sites and
//! exporters agree on the vocabulary.


use std::sync::Arc;

// ------------------------------------------------------------------------------------------------
// Metric names
// ------------------------------------------------------------------------------------------------

/// Canonical metric names emitted by the engine.
pub mod names {
    /// Gauge: current size of the active WAL file in bytes.
    pub const WAL_SIZE_BYTES: &str = "wal_size_bytes";

    /// Counter: WAL rotations performed.
    pub const WAL_ROTATIONS_TOTAL: &str = "wal_rotations_total";

    /// Gauge: estimated size of the live memtable in bytes.
    pub const MEMSTORE_SIZE_BYTES: &str = "memstore_size_bytes";

    /// Counter: data points accepted by the memstore.
    pub const POINTS_WRITTEN_TOTAL: &str = "points_written_total";

    /// Counter: failed writes (WAL or flush errors).
    pub const WRITE_ERRORS_TOTAL: &str = "write_errors_total";

    /// Histogram: memtable flush latency in seconds.
    pub const FLUSH_DURATION_SECONDS: &str = "flush_duration_seconds";

    /// Counter: compaction tasks completed successfully.
    pub const COMPACTIONS_TOTAL: &str = "compactions_total";

    /// Counter: compaction tasks aborted by an error.
    pub const COMPACTION_ERRORS_TOTAL: &str = "compaction_errors_total";
}

// ------------------------------------------------------------------------------------------------
// Sink trait
// ------------------------------------------------------------------------------------------------

/// Destination for engine metrics.
///
/// Implementations must be cheap and non-blocking — these methods are
/// called on the write path and from background workers.  All methods
/// are infallible by design; an exporter that can fail must buffer or
/// drop internally.
pub trait MetricsSink: Send + Sync {
    /// Add `value` to the named monotonic counter.
    fn incr_counter(&self, name: &'static str, value: u64);

    /// Set the named gauge to `value`.
    fn set_gauge(&self, name: &'static str, value: f64);

    /// Record one observation into the named histogram.
    fn observe(&self, name: &'static str, value: f64);
}

// ------------------------------------------------------------------------------------------------
// No-op sink
// ------------------------------------------------------------------------------------------------

/// A sink that discards every metric.  Used when no exporter is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}

    fn set_gauge(&self, _name: &'static str, _value: f64) {}

    fn observe(&self, _name: &'static str, _value: f64) {}
}

/// Returns a shared no-op sink.
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}
