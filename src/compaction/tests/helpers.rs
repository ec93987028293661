use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::compaction::{CompactionConfig, CompactionManager};
use crate::memstore::MemTable;
use crate::metrics;
use crate::segment::{Segment, SegmentReader, SegmentWriter};
use crate::types::{DataPoint, NANOS_PER_SECOND};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An unlabeled point at `seconds` (whole seconds) with the given value.
pub fn point(seconds: i64, value: f64) -> DataPoint {
    DataPoint::new(seconds * NANOS_PER_SECOND, value)
}

/// A manager over a fresh temp segment directory.
pub fn manager(config: CompactionConfig) -> (Arc<CompactionManager>, Arc<SegmentWriter>, TempDir) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let writer = Arc::new(SegmentWriter::new(tmp.path()));
    let reader = SegmentReader::new(tmp.path());
    let manager = Arc::new(CompactionManager::new(
        config,
        Arc::clone(&writer),
        reader,
        metrics::noop(),
    ));
    (manager, writer, tmp)
}

/// Small default geometry for tests: 3 levels, 2 files per level, 1 KiB
/// base size, slow ticking.
pub fn small_config() -> CompactionConfig {
    CompactionConfig {
        max_levels: 3,
        max_segments_per_level: 2,
        base_max_segment_size: 1024,
        interval: Duration::from_secs(3600),
    }
}

/// Writes a real segment holding the given points under one series.
pub fn write_segment(writer: &SegmentWriter, series: &str, points: &[DataPoint]) -> Segment {
    let mut table = MemTable::new(64 * 1024 * 1024);
    table.insert(series, points);
    writer.write_memtable(&table).unwrap()
}

/// Builds detached segment metadata (no backing file) for placement
/// tests that never touch disk.
pub fn fake_segment(id: u64, size: u64, created_at: i64) -> Segment {
    Segment {
        id,
        path: PathBuf::from(format!("/nonexistent/segment_{id}.seg")),
        size,
        min_time: 0,
        max_time: NANOS_PER_SECOND,
        series_ids: BTreeSet::from(["cpu".to_string()]),
        created_at,
    }
}
