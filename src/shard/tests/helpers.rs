use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::shard::{Shard, ShardConfig};
use crate::types::{DataPoint, NANOS_PER_SECOND, ReadRequest, WriteRequest};

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

/// Config with a large memtable — nothing flushes unless forced.
pub fn memtable_only_config(dir: &Path) -> ShardConfig {
    init_tracing();
    ShardConfig {
        max_memtable_size: 1024 * 1024,
        max_wal_size: 64 * 1024 * 1024,
        max_levels: 3,
        max_segments_per_level: 4,
        max_segment_size: 1024 * 1024,
        compaction_interval: Duration::from_secs(3600),
        ..ShardConfig::new("shard-test", dir)
    }
}

/// Config with a tiny memtable (100 bytes) so the second point flushes.
pub fn small_buffer_config(dir: &Path) -> ShardConfig {
    ShardConfig {
        max_memtable_size: 100,
        ..memtable_only_config(dir)
    }
}

/// Creates and opens a shard.
pub fn open_shard(config: ShardConfig) -> Shard {
    let shard = Shard::new(config).expect("shard construction");
    shard.open().expect("shard open");
    shard
}

/// Writes `points` to `series` through the public API.
pub fn write(shard: &Shard, series: &str, points: Vec<DataPoint>) {
    shard
        .write(&WriteRequest {
            series_id: series.to_string(),
            points,
        })
        .expect("write");
}

/// Reads `series` over `[start_s, end_s]` (whole seconds), no limit.
pub fn read(shard: &Shard, series: &str, start_s: i64, end_s: i64) -> Vec<DataPoint> {
    shard
        .read(&ReadRequest {
            series_id: series.to_string(),
            start: start_s * NANOS_PER_SECOND,
            end: end_s * NANOS_PER_SECOND,
            limit: 0,
        })
        .expect("read")
}
