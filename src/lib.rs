//! # TempusDB
//!
//! An embeddable, single-node time-series storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed for
//! fast ingestion of numeric measurements and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                      Shard                           │
//! │  ┌────────────┐   ┌──────────────┐  ┌────────────┐  │
//! │  │  MemStore  │   │   Segments   │  │ Compaction │  │
//! │  │  (live     │   │  (immutable  │  │  (levels,  │  │
//! │  │  memtable  │   │   on-disk    │  │  scheduler │  │
//! │  │  + WAL)    │   │   files)     │  │  + worker) │  │
//! │  └─────┬──────┘   └──────▲───────┘  └─────▲──────┘  │
//! │        │   flush on full │    add segment │         │
//! │        └─────────────────┴────────────────┘         │
//! │                                                     │
//! │  ┌─────────────────────────────────────────────────┐│
//! │  │   WAL replay (crash recovery on open)           ││
//! │  └─────────────────────────────────────────────────┘│
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`shard`] | Top-level orchestrator — lifecycle, recovery, read fan-out |
//! | [`memstore`] | In-memory write buffer with WAL-first durability |
//! | [`wal`] | Append-only write-ahead log with size-based rotation and replay |
//! | [`segment`] | Immutable, sorted, on-disk segment files |
//! | [`compaction`] | Multi-level compaction with background scheduling |
//! | [`encoding`] | Deterministic binary wire format for all persisted records |
//! | [`metrics`] | Pluggable metrics sink (no-op by default) |
//! | [`types`] | Data points, requests, integrity checksums |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every point is persisted to a WAL before
//!   being acknowledged, guaranteeing durability and crash recovery.
//! - **Truncation-tolerant replay** — a torn record at the WAL tail is
//!   recognised by its length-prefixed framing and discarded cleanly.
//! - **Immutable segments** — memtables flush to sorted, checksummed
//!   segment files that readers access lock-free via memory mapping.
//! - **Leveled compaction** — background merging caps the file count per
//!   level and promotes merged segments into doubling size tiers.
//! - **Best-effort reads** — one corrupt segment never masks results from
//!   the memtable or the remaining segments.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tempusdb::{DataPoint, ReadRequest, Shard, ShardConfig, WriteRequest};
//!
//! let shard = Shard::new(ShardConfig::new("shard-0", "/tmp/tempusdb"))?;
//! shard.open()?;
//!
//! // Write
//! shard.write(&WriteRequest {
//!     series_id: "cpu.total{host=web-1}".into(),
//!     points: vec![DataPoint::new(1_000_000_000, 0.42)],
//! })?;
//!
//! // Read
//! let points = shard.read(&ReadRequest {
//!     series_id: "cpu.total{host=web-1}".into(),
//!     start: 0,
//!     end: 2_000_000_000,
//!     limit: 0,
//! })?;
//! assert_eq!(points.len(), 1);
//!
//! // Graceful shutdown
//! shard.close()?;
//! # Ok::<(), tempusdb::ShardError>(())
//! ```

#![allow(dead_code)]

pub mod compaction;
pub mod encoding;
pub mod memstore;
pub mod metrics;
pub mod segment;
pub mod shard;
pub mod types;
pub mod wal;

pub use shard::{Shard, ShardConfig, ShardError, ShardStats};
pub use types::{DataPoint, ReadRequest, WriteRequest};
