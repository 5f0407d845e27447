//! Noema - Concurrent Knowledge-Graph Memory Engine
//!
//! A crash-resilient knowledge-graph store built to serve two adversarial
//! workloads at once: bursty write-heavy ingestion and high-rate read-heavy
//! multi-hop traversal, with neither degrading the other.
//!
//! # Architecture
//!
//! - **WriteLog**: lock-free ingestion queue; a single atomic counter assigns
//!   every mutation a globally unique sequence number at enqueue time
//! - **Snapshot**: immutable, versioned views of the whole graph; readers
//!   acquire the current one with an atomic load plus a refcount bump
//! - **Reconciler**: the one background task allowed to produce snapshots;
//!   applies drained mutations in sequence order and publishes via an atomic
//!   pointer swap
//! - **SegmentStore**: append-only, checksummed on-disk segments replayed
//!   through the reconciler's own apply logic at startup
//! - **ConcurrentMemory**: the facade composing the above
//!
//! Reads may lag committed state by at most one reconcile interval plus
//! reconciliation compute time; callers needing read-your-writes call
//! [`ConcurrentMemory::flush`] first.
//!
//! # Example
//!
//! ```no_run
//! use noema_core::{ConcurrentMemory, EngineConfig, TraverseOptions};
//! use std::collections::BTreeMap;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let memory = ConcurrentMemory::open(EngineConfig::default())?;
//!
//!     let sun = memory.insert_concept("the sun is a star", BTreeMap::new())?;
//!     let star = memory.insert_concept("stars emit light", BTreeMap::new())?;
//!     memory.insert_association(sun, star, "implies", 0.9)?;
//!
//!     // Make the writes durable and visible
//!     memory.flush().await?;
//!
//!     for entry in memory.traverse(sun, TraverseOptions::with_max_hops(2), |path| {
//!         path.hops.iter().map(|hop| hop.weight as f64).product()
//!     })? {
//!         let (path, score) = entry;
//!         println!("{:?} scored {score}", path.concepts);
//!     }
//!
//!     memory.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod memory;
mod reconciler;
pub mod segment;
pub mod snapshot;
pub mod types;
pub mod writelog;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{NoemaError, Result};
pub use memory::ConcurrentMemory;
pub use segment::Recovery;
pub use snapshot::{Snapshot, SnapshotCell, Traversal, TraversalPath, TraverseOptions};
pub use types::{
    Association, AssociationKey, Concept, ConceptId, MemoryStats, Mutation, OrphanReport,
    SequencedMutation, WritePressure,
};
pub use writelog::WriteLog;
