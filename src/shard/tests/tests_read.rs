//! Read fan-out: merging the memtable with segments, ordering, limits,
//! and flush-on-full behavior through the shard surface.

use tempfile::TempDir;

use crate::shard::tests::helpers::{
    memtable_only_config, open_shard, point, read, small_buffer_config, write,
};
use crate::types::{NANOS_PER_SECOND, ReadRequest};

// ------------------------------------------------------------------------------------------------
// Memtable-only reads
// ------------------------------------------------------------------------------------------------

/// # Scenario
/// Two points written and read back in timestamp order.
///
/// # Actions
/// 1. Write `{t=1 s, v=1.0}` and `{t=2 s, v=2.0}` to `cpu`.
/// 2. Read `[0, 3 s]`.
///
/// # Expected behavior
/// Exactly `[1.0, 2.0]` in that order.
#[test]
fn basic_write_read_in_order() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(&shard, "cpu", vec![point(1, 1.0), point(2, 2.0)]);

    let values: Vec<f64> = read(&shard, "cpu", 0, 3).iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1.0, 2.0]);
    shard.close().unwrap();
}

/// # Scenario
/// Out-of-order arrivals come back sorted by timestamp.
#[test]
fn reads_sort_by_timestamp() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(&shard, "cpu", vec![point(5, 5.0), point(1, 1.0), point(3, 3.0)]);

    let values: Vec<f64> = read(&shard, "cpu", 0, 10).iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1.0, 3.0, 5.0]);
    shard.close().unwrap();
}

/// # Scenario
/// An unknown series reads as empty, not as an error.
#[test]
fn unknown_series_reads_empty() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));
    assert!(read(&shard, "ghost", 0, 100).is_empty());
    shard.close().unwrap();
}

/// # Scenario
/// `limit` truncates after the timestamp sort; `limit = 0` is unlimited.
#[test]
fn limit_truncates_sorted_results() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(
        &shard,
        "cpu",
        vec![point(4, 4.0), point(1, 1.0), point(3, 3.0), point(2, 2.0)],
    );

    let limited = shard
        .read(&ReadRequest {
            series_id: "cpu".into(),
            start: 0,
            end: 10 * NANOS_PER_SECOND,
            limit: 2,
        })
        .unwrap();
    let values: Vec<f64> = limited.iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1.0, 2.0], "limit keeps the earliest points");

    assert_eq!(read(&shard, "cpu", 0, 10).len(), 4);
    shard.close().unwrap();
}

// ------------------------------------------------------------------------------------------------
// Flush-on-full and merged reads
// ------------------------------------------------------------------------------------------------

/// # Scenario
/// With a 100-byte memtable cap, the second write crosses the 64-byte
/// per-point threshold and flushes a segment.
///
/// # Actions
/// 1. Write 3 points one at a time.
/// 2. Inspect `segments/`.
///
/// # Expected behavior
/// - At least one `segment_*.seg` file exists after the second write.
/// - The listed segment's series set is exactly `{"cpu"}`.
#[test]
fn small_memtable_flushes_to_segment() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(small_buffer_config(tmp.path()));

    write(&shard, "cpu", vec![point(1, 1.0)]);
    write(&shard, "cpu", vec![point(2, 2.0)]);

    let segment_files: Vec<_> = std::fs::read_dir(tmp.path().join("segments"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("segment_") && n.ends_with(".seg"))
        .collect();
    assert!(
        !segment_files.is_empty(),
        "second write must have flushed a segment"
    );

    let listed = crate::segment::SegmentReader::new(tmp.path().join("segments"))
        .list_segments()
        .unwrap();
    assert_eq!(listed.len(), 1);
    let series: Vec<&str> = listed[0].series_ids.iter().map(String::as_str).collect();
    assert_eq!(series, vec!["cpu"]);

    write(&shard, "cpu", vec![point(3, 3.0)]);
    shard.close().unwrap();
}

/// # Scenario
/// Reads merge the memtable tier with the segment tier.
///
/// # Actions
/// 1. Write two points, `force_flush` (now only in a segment).
/// 2. Write a third point (only in the memtable).
/// 3. Read the full range.
///
/// # Expected behavior
/// All three points, in timestamp order.
#[test]
fn reads_merge_memtable_and_segments() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(&shard, "cpu", vec![point(1, 1.0), point(2, 2.0)]);
    shard.force_flush().unwrap();
    write(&shard, "cpu", vec![point(3, 3.0)]);

    let values: Vec<f64> = read(&shard, "cpu", 0, 10).iter().map(|p| p.value).collect();
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
    shard.close().unwrap();
}

/// # Scenario
/// Segment pruning by series and time bounds: a read over a disjoint
/// window returns nothing even with segments on disk.
#[test]
fn segment_pruning_respects_bounds() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(&shard, "cpu", vec![point(1, 1.0), point(2, 2.0)]);
    shard.force_flush().unwrap();

    assert!(read(&shard, "cpu", 50, 100).is_empty());
    assert!(read(&shard, "mem", 0, 100).is_empty());
    shard.close().unwrap();
}

/// # Scenario
/// Duplicate `(series, timestamp)` writes are preserved through flushes
/// and merged reads — the engine never deduplicates.
#[test]
fn duplicate_points_survive_tiers() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(&shard, "cpu", vec![point(1, 1.0)]);
    shard.force_flush().unwrap();
    write(&shard, "cpu", vec![point(1, 1.0)]);

    let points = read(&shard, "cpu", 0, 10);
    assert_eq!(points.len(), 2, "duplicates must be preserved");
    shard.close().unwrap();
}

/// # Scenario
/// A corrupt segment is skipped silently; the healthy tier still serves.
#[test]
fn corrupt_segment_does_not_mask_reads() {
    let tmp = TempDir::new().unwrap();
    let shard = open_shard(memtable_only_config(tmp.path()));

    write(&shard, "cpu", vec![point(1, 1.0)]);
    shard.force_flush().unwrap();
    write(&shard, "cpu", vec![point(2, 2.0)]);

    // Corrupt the flushed segment in place.
    let seg_dir = tmp.path().join("segments");
    let seg = std::fs::read_dir(&seg_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().and_then(|e| e.to_str()) == Some("seg"))
        .unwrap();
    std::fs::write(&seg, b"garbage").unwrap();

    let values: Vec<f64> = read(&shard, "cpu", 0, 10).iter().map(|p| p.value).collect();
    assert_eq!(values, vec![2.0], "memtable data must still be served");
    shard.close().unwrap();
}
