use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::memstore::MemTable;
use crate::segment::{SegmentReader, SegmentWriter};
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

/// Builds a memtable holding the given per-series points.
pub fn memtable(series: &[(&str, Vec<DataPoint>)]) -> MemTable {
    let mut table = MemTable::new(64 * 1024 * 1024);
    for (series_id, points) in series {
        table.insert(series_id, points);
    }
    table
}

/// A fresh temp dir with a writer and reader over it.
pub fn writer_reader() -> (SegmentWriter, SegmentReader, TempDir) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let writer = SegmentWriter::new(tmp.path());
    let reader = SegmentReader::new(tmp.path());
    (writer, reader, tmp)
}
