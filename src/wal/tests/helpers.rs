use tracing_subscriber::EnvFilter;

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
