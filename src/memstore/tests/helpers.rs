use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::memstore::{FlushError, FlushSink, MemStore, MemTable};
use crate::metrics;
use crate::types::{DataPoint, NANOS_PER_SECOND};
use crate::wal::Wal;

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

/// Snapshot of one flushed memtable, captured by [`RecordingSink`].
#[derive(Debug, Clone)]
pub struct FlushedTable {
    pub id: u64,
    pub size: usize,
    pub was_marked_flushed: bool,
    pub data: BTreeMap<String, Vec<DataPoint>>,
}

/// A sink that records every flushed memtable for assertions.
#[derive(Default, Clone)]
pub struct RecordingSink {
    pub flushed: Arc<Mutex<Vec<FlushedTable>>>,
}

impl FlushSink for RecordingSink {
    fn flush(&self, memtable: &MemTable) -> Result<(), FlushError> {
        self.flushed.lock().unwrap().push(FlushedTable {
            id: memtable.id(),
            size: memtable.size(),
            was_marked_flushed: memtable.is_flushed(),
            data: memtable.data().clone(),
        });
        Ok(())
    }
}

/// A sink that rejects every flush with a fixed message.
pub struct FailingSink;

impl FlushSink for FailingSink {
    fn flush(&self, _memtable: &MemTable) -> Result<(), FlushError> {
        Err("flush pipeline unavailable".into())
    }
}

/// Builds a memstore over a fresh temp WAL with the given memtable cap
/// and sink.  Returns the temp dir so callers can inspect the WAL.
pub fn store_with_sink(
    max_memtable_size: usize,
    sink: Box<dyn FlushSink>,
) -> (MemStore, TempDir) {
    let (store, _, tmp) = store_with_shared_wal(max_memtable_size, sink);
    (store, tmp)
}

/// Like [`store_with_sink`], but also hands back the WAL `Arc` so tests
/// can fail it underneath the store.
pub fn store_with_shared_wal(
    max_memtable_size: usize,
    sink: Box<dyn FlushSink>,
) -> (MemStore, Arc<Wal>, TempDir) {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let wal = Arc::new(Wal::open_plain(tmp.path().join("shard.wal"), 64 * 1024 * 1024).unwrap());
    let store = MemStore::new(
        Arc::clone(&wal),
        max_memtable_size,
        sink,
        metrics::noop(),
    );
    (store, wal, tmp)
}
