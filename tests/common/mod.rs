//! Common test utilities and helpers

#![allow(dead_code)]

use noema_core::{ConcurrentMemory, EngineConfig};
use std::path::Path;
use std::sync::Once;

static TRACING: Once = Once::new();

/// Route engine logs through the test harness, honoring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// Engine config tuned for tests: tight reconcile cadence, small segments
pub fn fast_config(data_dir: &Path) -> EngineConfig {
    EngineConfig {
        reconcile_interval_ms: 2,
        segment_flush_interval_ms: 20,
        segment_size_threshold_bytes: 64 * 1024,
        ..EngineConfig::for_data_dir(data_dir)
    }
}

/// Open an engine over a test directory
pub fn open_engine(data_dir: &Path) -> ConcurrentMemory {
    init_tracing();
    ConcurrentMemory::open(fast_config(data_dir)).expect("engine should open")
}

/// Scoring function used across tests: product of hop weights
pub fn weight_product(path: &noema_core::TraversalPath) -> f64 {
    path.hops.iter().map(|hop| hop.weight as f64).product()
}
