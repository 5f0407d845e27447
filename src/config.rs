//! Engine configuration
//!
//! Settings are layered the usual way: built-in defaults, then an optional
//! TOML file, then `NOEMA_`-prefixed environment variables.
//!
//! # Configuration File Format
//!
//! ```toml
//! data_dir = "/var/lib/noema"
//! reconcile_interval_ms = 5
//! segment_size_threshold_bytes = 4194304
//! segment_flush_interval_ms = 200
//! write_log_soft_watermark = 100000
//! orphan_retry_budget = 16
//! drain_batch_limit = 65536
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tunable parameters for a ConcurrentMemory instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding segment files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Reconciliation cadence. Lower = fresher reads, higher CPU cost; this
    /// is also the read staleness bound.
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Seal the active segment once it grows past this size
    #[serde(default = "default_segment_size_threshold_bytes")]
    pub segment_size_threshold_bytes: u64,

    /// Seal the active segment after this long with unflushed frames, even
    /// if undersized
    #[serde(default = "default_segment_flush_interval_ms")]
    pub segment_flush_interval_ms: u64,

    /// Pending-write count past which the advisory pressure signal flips
    #[serde(default = "default_write_log_soft_watermark")]
    pub write_log_soft_watermark: usize,

    /// Reconciliation cycles a forward-referencing association may wait for
    /// its endpoints before being reported as orphaned
    #[serde(default = "default_orphan_retry_budget")]
    pub orphan_retry_budget: u32,

    /// Maximum mutations drained per reconciliation cycle
    #[serde(default = "default_drain_batch_limit")]
    pub drain_batch_limit: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./noema-data")
}

fn default_reconcile_interval_ms() -> u64 {
    5
}

fn default_segment_size_threshold_bytes() -> u64 {
    4 * 1024 * 1024
}

fn default_segment_flush_interval_ms() -> u64 {
    200
}

fn default_write_log_soft_watermark() -> usize {
    100_000
}

fn default_orphan_retry_budget() -> u32 {
    16
}

fn default_drain_batch_limit() -> usize {
    65_536
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            segment_size_threshold_bytes: default_segment_size_threshold_bytes(),
            segment_flush_interval_ms: default_segment_flush_interval_ms(),
            write_log_soft_watermark: default_write_log_soft_watermark(),
            orphan_retry_budget: default_orphan_retry_budget(),
            drain_batch_limit: default_drain_batch_limit(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from an optional TOML file plus `NOEMA_` env vars
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings: EngineConfig = builder
            .add_source(config::Environment::with_prefix("NOEMA"))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject parameter combinations that would stall the engine
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "reconcile_interval_ms must be > 0".to_string(),
            )
            .into());
        }
        if self.segment_flush_interval_ms == 0 {
            return Err(config::ConfigError::Message(
                "segment_flush_interval_ms must be > 0".to_string(),
            )
            .into());
        }
        if self.segment_size_threshold_bytes == 0 {
            return Err(config::ConfigError::Message(
                "segment_size_threshold_bytes must be > 0".to_string(),
            )
            .into());
        }
        if self.drain_batch_limit == 0 {
            return Err(config::ConfigError::Message(
                "drain_batch_limit must be > 0".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Convenience constructor for tests: defaults rooted at `data_dir` with
    /// a fast reconcile cadence
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}
