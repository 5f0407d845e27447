//! Error types for the Noema knowledge-graph engine
//!
//! This module provides structured error definitions using thiserror, with
//! anyhow interop for callers that propagate opaque errors.

use crate::types::{ConceptId, OrphanReport};
use thiserror::Error;

/// Main error type for Noema operations
#[derive(Error, Debug)]
pub enum NoemaError {
    /// Advisory signal: queued-but-undrained write volume crossed the soft
    /// watermark. Never returned from `append` itself; surfaced through
    /// pressure probes and stats.
    #[error("write log backpressure: {pending} mutations pending")]
    Backpressure { pending: usize },

    /// An association's endpoints never materialized within the retry budget
    #[error("orphaned association {source_id} -[{label}]-> {target_id}")]
    OrphanedAssociation {
        source_id: ConceptId,
        target_id: ConceptId,
        label: String,
    },

    /// Concept not present in the queried snapshot
    #[error("concept not found: {0}")]
    NotFound(ConceptId),

    /// Traversal deadline exceeded
    #[error("query deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Checksum mismatch at recovery; the sequence range is lost, not the store
    #[error("segment {segment_id} corrupt, sequence range {lo}..={hi} lost")]
    SegmentCorruption { segment_id: u64, lo: u64, hi: u64 },

    /// Disk unavailable during flush/seal; reads keep serving from memory,
    /// flushes are rejected until restart
    #[error("fatal I/O on segment store: {0}")]
    FatalIo(String),

    /// A mutation that can never be applied (bad weight, empty label, ...)
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    /// Engine is shutting down; no further mutations accepted
    #[error("engine is shutting down")]
    ShuttingDown,

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment payload (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Noema operations
pub type Result<T> = std::result::Result<T, NoemaError>;

impl From<bincode::Error> for NoemaError {
    fn from(err: bincode::Error) -> Self {
        NoemaError::Serialization(err.to_string())
    }
}

/// Convert anyhow::Error to NoemaError
impl From<anyhow::Error> for NoemaError {
    fn from(err: anyhow::Error) -> Self {
        NoemaError::Other(err.to_string())
    }
}

/// Promote a drained orphan report to an error, for callers that propagate
/// unresolved associations instead of inspecting the report
impl From<OrphanReport> for NoemaError {
    fn from(report: OrphanReport) -> Self {
        NoemaError::OrphanedAssociation {
            source_id: report.key.source_id,
            target_id: report.key.target_id,
            label: report.key.label,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = ConceptId::new();
        let err = NoemaError::NotFound(id);
        assert_eq!(err.to_string(), format!("concept not found: {}", id));
    }

    #[test]
    fn test_corruption_reports_range() {
        let err = NoemaError::SegmentCorruption {
            segment_id: 7,
            lo: 100,
            hi: 250,
        };
        let msg = err.to_string();
        assert!(msg.contains("segment 7"));
        assert!(msg.contains("100..=250"));
    }

    #[test]
    fn test_orphan_report_to_error() {
        use crate::types::AssociationKey;

        let (a, b) = (ConceptId::new(), ConceptId::new());
        let report = OrphanReport {
            key: AssociationKey {
                source_id: a,
                target_id: b,
                label: "supports".to_string(),
            },
            sequence: 9,
            cycles_waited: 16,
        };

        let err = NoemaError::from(report);
        assert_eq!(
            err.to_string(),
            format!("orphaned association {} -[supports]-> {}", a, b)
        );
        // Orphaning is a domain outcome, not a wrapped error chain
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let noema_err: NoemaError = io_err.into();
        assert!(matches!(noema_err, NoemaError::Io(_)));
    }
}
