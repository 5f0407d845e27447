//! ConcurrentMemory: the public engine facade
//!
//! Composes the write log, snapshot cell, reconciler, and segment store.
//! Ingestion enqueues to the write log and returns immediately; "accepted"
//! means queued, not yet visible to readers. Queries read the current
//! snapshot without synchronization. `flush` is the explicit durability
//! checkpoint: it forces an out-of-cycle reconciliation and a segment seal.
//!
//! Open the engine inside a tokio runtime; the reconciler and segment writer
//! run as background tasks. Writers and readers themselves never suspend.

use crate::config::EngineConfig;
use crate::error::{NoemaError, Result};
use crate::reconciler::{replay, ReconcilerHandle, ReconcilerMetrics};
use crate::segment::{self, SegmentStore, SegmentWriterHandle};
use crate::snapshot::{Snapshot, SnapshotCell, TraversalPath, TraverseOptions};
use crate::types::{
    Association, AssociationKey, Concept, ConceptId, MemoryStats, Mutation, OrphanReport,
};
use crate::writelog::WriteLog;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Concurrent, crash-resilient knowledge-graph store
pub struct ConcurrentMemory {
    write_log: Arc<WriteLog>,
    cell: Arc<SnapshotCell>,
    metrics: Arc<ReconcilerMetrics>,
    sealed_segments: Arc<AtomicU64>,
    io_failed: Arc<AtomicBool>,
    recovery_damage: Vec<NoemaError>,
    reconciler: ReconcilerHandle,
    segment_writer: SegmentWriterHandle,
}

impl ConcurrentMemory {
    /// Recover state from the segment directory, publish the rebuilt
    /// snapshot, and start the background tasks. No traffic is accepted
    /// before recovery completes.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let recovery = segment::recover(&config.data_dir)?;
        let recovered_count = recovery.mutations.len();
        let (snapshot, replay_orphans) =
            replay(recovery.mutations, config.orphan_retry_budget);

        if !recovery.corrupt.is_empty() {
            for report in &recovery.corrupt {
                error!(%report, "segment lost during recovery");
            }
        }

        info!(
            mutations = recovered_count,
            concepts = snapshot.concept_count(),
            associations = snapshot.association_count(),
            snapshot_version = snapshot.version(),
            "recovery complete, accepting traffic"
        );

        let write_log = Arc::new(WriteLog::new(config.write_log_soft_watermark));
        write_log.advance_past(recovery.max_sequence);

        let cell = Arc::new(SnapshotCell::new(snapshot));
        let metrics = Arc::new(ReconcilerMetrics::new());
        metrics.record_orphans(replay_orphans);

        let sealed_segments = Arc::new(AtomicU64::new(0));
        let io_failed = Arc::new(AtomicBool::new(false));

        let store = SegmentStore::open(&config.data_dir, recovery.next_segment_id)?;
        let segment_writer = SegmentWriterHandle::spawn(
            store,
            config.segment_size_threshold_bytes,
            config.segment_flush_interval_ms,
            Arc::clone(&sealed_segments),
            Arc::clone(&io_failed),
        );

        let reconciler = ReconcilerHandle::spawn(
            config,
            Arc::clone(&write_log),
            Arc::clone(&cell),
            Arc::clone(&metrics),
            segment_writer.sender(),
        );

        Ok(Self {
            write_log,
            cell,
            metrics,
            sealed_segments,
            io_failed,
            recovery_damage: recovery.corrupt,
            reconciler,
            segment_writer,
        })
    }

    // === Ingestion API ===

    /// Queue a new concept. Returns once the mutation is enqueued; it becomes
    /// visible to readers after the next reconciliation cycle.
    pub fn insert_concept(
        &self,
        content: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Result<ConceptId> {
        let concept = Concept::new(content, attributes);
        let id = concept.id;
        self.enqueue(Mutation::CreateConcept { concept })?;
        Ok(id)
    }

    /// Queue a replacement of an existing concept's content and attributes
    /// (creates the concept if the id has never been seen)
    pub fn upsert_concept(
        &self,
        id: ConceptId,
        content: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Result<()> {
        let concept = Concept {
            id,
            content: content.into(),
            attributes,
            created_at: Utc::now(),
        };
        self.enqueue(Mutation::UpsertConcept { concept })
    }

    /// Queue a directed, labeled edge. Endpoints need not be visible yet:
    /// forward references are deferred by the reconciler and surface through
    /// [`drain_orphans`](Self::drain_orphans) if they never resolve within
    /// the retry budget.
    pub fn insert_association(
        &self,
        source_id: ConceptId,
        target_id: ConceptId,
        label: impl Into<String>,
        weight: f32,
    ) -> Result<()> {
        let association = Association {
            source_id,
            target_id,
            label: label.into(),
            weight,
            created_at: Utc::now(),
        };
        self.enqueue(Mutation::CreateAssociation { association })
    }

    /// Queue a concept tombstone; edges touching it go with it
    pub fn delete_concept(&self, id: ConceptId) -> Result<()> {
        self.enqueue(Mutation::DeleteConcept { id })
    }

    /// Queue an edge tombstone
    pub fn delete_association(
        &self,
        source_id: ConceptId,
        target_id: ConceptId,
        label: impl Into<String>,
    ) -> Result<()> {
        self.enqueue(Mutation::DeleteAssociation {
            key: AssociationKey {
                source_id,
                target_id,
                label: label.into(),
            },
        })
    }

    fn enqueue(&self, mutation: Mutation) -> Result<()> {
        mutation
            .validate()
            .map_err(NoemaError::InvalidMutation)?;
        self.write_log.append(mutation)?;
        Ok(())
    }

    // === Query API ===

    /// Acquire the current snapshot: an immutable view that stays frozen for
    /// as long as the handle is held, regardless of concurrent writes
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.cell.current()
    }

    /// Look up a concept in the current snapshot
    pub fn get_concept(&self, id: &ConceptId) -> Result<Concept> {
        self.snapshot().get_concept(id).cloned()
    }

    /// Best-first multi-hop traversal over the current snapshot, collected.
    /// Take [`snapshot()`](Self::snapshot) directly for lazy iteration.
    pub fn traverse<F>(
        &self,
        start: ConceptId,
        options: TraverseOptions,
        score: F,
    ) -> Result<Vec<(TraversalPath, f64)>>
    where
        F: Fn(&TraversalPath) -> f64,
    {
        self.snapshot()
            .traverse(start, options, score)
            .collect()
    }

    // === Administrative API ===

    /// Force an out-of-cycle reconciliation and a segment seal, blocking
    /// until both complete. Callers that need durability call this and
    /// inspect the result; `insert_*` alone acknowledges queuing only.
    pub async fn flush(&self) -> Result<()> {
        if self.io_failed.load(Ordering::Acquire) {
            return Err(NoemaError::FatalIo(
                "segment store latched after I/O failure".to_string(),
            ));
        }
        self.reconciler.flush().await?;
        self.segment_writer.seal().await
    }

    /// Engine statistics, gathered from atomics and the current snapshot
    pub fn stats(&self) -> MemoryStats {
        let snapshot = self.snapshot();
        MemoryStats {
            concept_count: snapshot.concept_count(),
            association_count: snapshot.association_count(),
            pending_writes: self.write_log.pending(),
            current_snapshot_version: snapshot.version(),
            last_reconcile_duration_ms: self
                .metrics
                .last_reconcile_duration_ms
                .load(Ordering::Relaxed),
            orphaned_mutations: self.metrics.orphaned_total.load(Ordering::Relaxed),
            sealed_segments: self.sealed_segments.load(Ordering::Relaxed),
            pressure: self.write_log.pressure(),
        }
    }

    /// Advisory capacity probe: `Backpressure` while the write log sits
    /// above its soft watermark. Writers that can shed load check this
    /// before bursting; `insert_*` succeeds regardless.
    pub fn check_capacity(&self) -> Result<()> {
        self.write_log.check_capacity()
    }

    /// Take buffered reports of associations that exceeded the retry budget
    pub fn drain_orphans(&self) -> Vec<OrphanReport> {
        self.metrics.drain_orphans()
    }

    /// Segments found unreadable at startup, with their lost sequence ranges
    pub fn recovery_damage(&self) -> &[NoemaError] {
        &self.recovery_damage
    }

    /// Flush, then stop the background tasks. Appends fail with
    /// `ShuttingDown` from the moment this is called; queued mutations are
    /// reconciled and persisted before the tasks exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.write_log.begin_shutdown();
        self.reconciler.stop().await?;
        self.segment_writer.stop().await?;
        info!(
            last_sequence = self.write_log.last_assigned_sequence(),
            "engine shut down"
        );
        Ok(())
    }
}
