//! The reconciler: sole producer of new snapshots
//!
//! A single background task drains the write log on a timer, applies
//! mutations in strict sequence order to a derivation of the prior snapshot,
//! and publishes the result through the snapshot cell. Write/write and
//! write/read contention are eliminated by construction: nothing else ever
//! mutates graph state.
//!
//! The batch apply logic is a pure function so startup recovery replays
//! persisted mutations through exactly the code path live traffic takes.

use crate::config::EngineConfig;
use crate::error::{NoemaError, Result};
use crate::segment::SegmentCommand;
use crate::snapshot::{Snapshot, SnapshotCell};
use crate::types::{Mutation, OrphanReport, SequencedMutation};
use crate::writelog::WriteLog;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Most recent orphan reports retained for `drain_orphans`
const ORPHAN_BUFFER_CAP: usize = 1024;

/// A forward-referencing mutation waiting for its dependencies
#[derive(Debug, Clone)]
pub(crate) struct DeferredMutation {
    pub record: SequencedMutation,
    pub cycles_waited: u32,
}

/// Result of applying one batch
pub(crate) struct BatchOutcome {
    /// The derived snapshot (the prior one if nothing changed)
    pub snapshot: Arc<Snapshot>,

    /// Mutations settled this cycle, for segment persistence. Includes
    /// last-writer-wins losers (no-ops on replay) but never deferred or
    /// orphaned mutations.
    pub applied: Vec<SequencedMutation>,

    /// Still waiting on dependencies; retry next cycle
    pub deferred: Vec<DeferredMutation>,

    /// Gave up past the retry budget
    pub orphaned: Vec<OrphanReport>,
}

/// Apply `incoming` plus previously `deferred` mutations on top of `prior`.
///
/// Mutations are applied in strict sequence order. Associations whose
/// endpoints are not yet visible are re-queued with an incremented wait
/// count; past `retry_budget` cycles they surface as orphans. Malformed
/// mutations are logged and skipped: partial progress beats halted ingestion.
pub(crate) fn apply_batch(
    prior: &Arc<Snapshot>,
    incoming: Vec<SequencedMutation>,
    deferred: Vec<DeferredMutation>,
    retry_budget: u32,
) -> BatchOutcome {
    let mut work: Vec<DeferredMutation> = deferred;
    work.extend(incoming.into_iter().map(|record| DeferredMutation {
        record,
        cycles_waited: 0,
    }));
    work.sort_unstable_by_key(|d| d.record.sequence);

    let mut graph = prior.graph().clone();
    let mut dirty = false;
    let mut applied = Vec::new();
    let mut still_deferred = Vec::new();
    let mut orphaned = Vec::new();

    for item in work {
        let DeferredMutation {
            record,
            cycles_waited,
        } = item;

        if let Err(reason) = record.mutation.validate() {
            warn!(
                sequence = record.sequence,
                reason, "skipping malformed mutation"
            );
            continue;
        }

        let seq = record.sequence;
        match &record.mutation {
            Mutation::CreateConcept { concept } | Mutation::UpsertConcept { concept } => {
                dirty |= graph.upsert_concept(concept.clone(), seq);
                applied.push(record);
            }
            Mutation::CreateAssociation { association } => {
                // A later delete of either endpoint outranks this edge. The
                // check keeps the settled graph identical whether the edge
                // was applied in sequence (then cascaded away) or deferred
                // past the delete and retried after the endpoint returned.
                let superseded = graph.last_delete_seq(&association.source_id) >= seq
                    || graph.last_delete_seq(&association.target_id) >= seq;
                if superseded {
                    debug!(
                        edge = %association.key(),
                        sequence = seq,
                        "edge superseded by a later endpoint delete"
                    );
                    applied.push(record);
                    continue;
                }

                let satisfiable = graph.contains_concept(&association.source_id)
                    && graph.contains_concept(&association.target_id);
                if satisfiable {
                    dirty |= graph.insert_association(association.clone(), seq);
                    applied.push(record);
                } else if cycles_waited >= retry_budget {
                    let report = OrphanReport {
                        key: association.key(),
                        sequence: seq,
                        cycles_waited,
                    };
                    warn!(
                        edge = %report.key,
                        cycles_waited,
                        "association orphaned past retry budget"
                    );
                    orphaned.push(report);
                } else {
                    still_deferred.push(DeferredMutation {
                        record,
                        cycles_waited: cycles_waited + 1,
                    });
                }
            }
            Mutation::DeleteConcept { id } => {
                dirty |= graph.delete_concept(*id, seq);
                applied.push(record);
            }
            Mutation::DeleteAssociation { key } => {
                dirty |= graph.delete_association(key, seq);
                applied.push(record);
            }
        }
    }

    let snapshot = if dirty {
        Arc::new(Snapshot::next(prior, graph))
    } else {
        Arc::clone(prior)
    };

    BatchOutcome {
        snapshot,
        applied,
        deferred: still_deferred,
        orphaned,
    }
}

/// Replay recovered mutations through the live apply path, cycling deferred
/// forward references until they settle or exhaust the retry budget.
pub(crate) fn replay(
    mutations: Vec<SequencedMutation>,
    retry_budget: u32,
) -> (Arc<Snapshot>, Vec<OrphanReport>) {
    let mut snapshot = Arc::new(Snapshot::empty());
    let mut orphans = Vec::new();

    let mut outcome = apply_batch(&snapshot, mutations, Vec::new(), retry_budget);
    snapshot = outcome.snapshot;
    orphans.extend(outcome.orphaned);

    // Each pass either settles deferred mutations or advances their wait
    // count toward the budget, so this terminates.
    while !outcome.deferred.is_empty() {
        outcome = apply_batch(&snapshot, Vec::new(), outcome.deferred, retry_budget);
        snapshot = outcome.snapshot;
        orphans.extend(outcome.orphaned);
    }

    (snapshot, orphans)
}

/// Shared reconciler-side observability state
pub(crate) struct ReconcilerMetrics {
    pub last_reconcile_duration_ms: AtomicU64,
    pub orphaned_total: AtomicU64,
    orphans: Mutex<VecDeque<OrphanReport>>,
}

impl ReconcilerMetrics {
    pub fn new() -> Self {
        Self {
            last_reconcile_duration_ms: AtomicU64::new(0),
            orphaned_total: AtomicU64::new(0),
            orphans: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn record_orphans(&self, reports: Vec<OrphanReport>) {
        if reports.is_empty() {
            return;
        }
        self.orphaned_total
            .fetch_add(reports.len() as u64, Ordering::Relaxed);
        if let Ok(mut buffer) = self.orphans.lock() {
            for report in reports {
                if buffer.len() == ORPHAN_BUFFER_CAP {
                    buffer.pop_front();
                }
                buffer.push_back(report);
            }
        }
    }

    /// Take all buffered orphan reports
    pub fn drain_orphans(&self) -> Vec<OrphanReport> {
        match self.orphans.lock() {
            Ok(mut buffer) => buffer.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Commands accepted by the reconciler task
pub(crate) enum ReconcilerCommand {
    /// Run an out-of-cycle reconciliation that fully drains the write log,
    /// acknowledging with the published snapshot version
    Flush { ack: oneshot::Sender<u64> },
}

/// Handle controlling the background reconciler task
pub(crate) struct ReconcilerHandle {
    command_tx: mpsc::Sender<ReconcilerCommand>,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Spawn the reconciler over the shared write log and snapshot cell
    pub(crate) fn spawn(
        config: EngineConfig,
        write_log: Arc<WriteLog>,
        cell: Arc<SnapshotCell>,
        metrics: Arc<ReconcilerMetrics>,
        segment_tx: mpsc::UnboundedSender<SegmentCommand>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(run_reconcile_loop(
            config,
            write_log,
            cell,
            metrics,
            segment_tx,
            command_rx,
            shutdown_rx,
        ));

        Self {
            command_tx,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Force an out-of-cycle reconciliation; resolves once it has published
    pub(crate) async fn flush(&self) -> Result<u64> {
        let (ack, done) = oneshot::channel();
        self.command_tx
            .send(ReconcilerCommand::Flush { ack })
            .await
            .map_err(|_| NoemaError::ShuttingDown)?;
        done.await.map_err(|_| NoemaError::ShuttingDown)
    }

    /// Stop the reconciler gracefully; a final cycle drains remaining writes
    pub(crate) async fn stop(&mut self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| NoemaError::Other(format!("reconciler task failed: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        // Dropped without `stop`: hard-stop, like a killed process
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_reconcile_loop(
    config: EngineConfig,
    write_log: Arc<WriteLog>,
    cell: Arc<SnapshotCell>,
    metrics: Arc<ReconcilerMetrics>,
    segment_tx: mpsc::UnboundedSender<SegmentCommand>,
    mut command_rx: mpsc::Receiver<ReconcilerCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut timer =
        tokio::time::interval(std::time::Duration::from_millis(config.reconcile_interval_ms));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut deferred: Vec<DeferredMutation> = Vec::new();

    info!(
        interval_ms = config.reconcile_interval_ms,
        "reconciler started"
    );

    loop {
        tokio::select! {
            _ = timer.tick() => {
                deferred = run_cycle(
                    &config, &write_log, &cell, &metrics, &segment_tx, deferred, false,
                );
            }

            Some(command) = command_rx.recv() => {
                match command {
                    ReconcilerCommand::Flush { ack } => {
                        deferred = run_cycle(
                            &config, &write_log, &cell, &metrics, &segment_tx, deferred, true,
                        );
                        let _ = ack.send(cell.current().version());
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("reconciler received shutdown signal");
                run_cycle(&config, &write_log, &cell, &metrics, &segment_tx, deferred, true);
                break;
            }
        }
    }
}

/// One reconciliation cycle. Returns the deferred set carried to the next
/// cycle. With `exhaustive` set (flush/shutdown) the write log is drained
/// completely instead of up to the per-cycle batch limit.
fn run_cycle(
    config: &EngineConfig,
    write_log: &WriteLog,
    cell: &SnapshotCell,
    metrics: &ReconcilerMetrics,
    segment_tx: &mpsc::UnboundedSender<SegmentCommand>,
    deferred: Vec<DeferredMutation>,
    exhaustive: bool,
) -> Vec<DeferredMutation> {
    let limit = if exhaustive {
        usize::MAX
    } else {
        config.drain_batch_limit
    };
    let mut incoming = write_log.drain(limit);
    if incoming.is_empty() && deferred.is_empty() {
        return deferred;
    }

    let started = Instant::now();
    let prior = cell.current();

    let mut snapshot = Arc::clone(&prior);
    let mut applied = Vec::new();
    let mut orphaned = Vec::new();
    let mut pending = deferred;

    // Settle deferrals to a fixpoint within the cycle: while a pass applies
    // something and deferred mutations remain, another pass may satisfy them.
    loop {
        let outcome = apply_batch(
            &snapshot,
            std::mem::take(&mut incoming),
            std::mem::take(&mut pending),
            config.orphan_retry_budget,
        );
        snapshot = outcome.snapshot;
        let progressed = !outcome.applied.is_empty();
        applied.extend(outcome.applied);
        orphaned.extend(outcome.orphaned);
        pending = outcome.deferred;
        if pending.is_empty() || !progressed {
            break;
        }
    }

    if snapshot.version() != prior.version() {
        cell.publish(Arc::clone(&snapshot));
    }

    if !applied.is_empty() && segment_tx.send(SegmentCommand::Persist(applied)).is_err() {
        warn!("segment writer gone, committed batch not persisted");
    }

    metrics.record_orphans(orphaned);
    metrics
        .last_reconcile_duration_ms
        .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);

    pending
}


#[cfg(test)]
mod props {
    use super::*;
    use crate::snapshot::verify_referential_integrity;
    use crate::types::{Association, AssociationKey, Concept, ConceptId};
    use chrono::Utc;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    /// Small fixed identity pool so generated mutations collide on purpose
    fn pool_id(index: usize) -> ConceptId {
        ConceptId(Uuid::from_u128(index as u128 + 1))
    }

    fn arb_mutation() -> impl Strategy<Value = Mutation> {
        let id = (0usize..6).prop_map(pool_id);
        let label = prop::sample::select(vec!["rel", "supports", "refutes"]);
        prop_oneof![
            (id.clone(), "[a-z]{1,8}").prop_map(|(id, content)| Mutation::UpsertConcept {
                concept: Concept {
                    id,
                    content,
                    attributes: BTreeMap::new(),
                    created_at: Utc::now(),
                },
            }),
            (id.clone(), id.clone(), label.clone(), 0.0f32..=1.0).prop_map(
                |(source_id, target_id, label, weight)| Mutation::CreateAssociation {
                    association: Association {
                        source_id,
                        target_id,
                        label: label.to_string(),
                        weight,
                        created_at: Utc::now(),
                    },
                }
            ),
            id.clone().prop_map(|id| Mutation::DeleteConcept { id }),
            (id.clone(), id, label).prop_map(|(source_id, target_id, label)| {
                Mutation::DeleteAssociation {
                    key: AssociationKey {
                        source_id,
                        target_id,
                        label: label.to_string(),
                    },
                }
            }),
        ]
    }

    fn mutation_sequence() -> impl Strategy<Value = Vec<SequencedMutation>> {
        prop::collection::vec(arb_mutation(), 1..40).prop_map(|mutations| {
            mutations
                .into_iter()
                .enumerate()
                .map(|(i, mutation)| SequencedMutation {
                    sequence: i as u64 + 1,
                    mutation,
                })
                .collect()
        })
    }

    fn settle(
        mut snapshot: Arc<Snapshot>,
        mut deferred: Vec<DeferredMutation>,
        budget: u32,
    ) -> Arc<Snapshot> {
        while !deferred.is_empty() {
            let outcome = apply_batch(&snapshot, Vec::new(), deferred, budget);
            snapshot = outcome.snapshot;
            deferred = outcome.deferred;
        }
        snapshot
    }

    proptest! {
        /// No published state may reference a concept that is not present
        #[test]
        fn any_mutation_sequence_yields_intact_graph(ops in mutation_sequence()) {
            let (snapshot, _) = replay(ops, 4);
            prop_assert!(verify_referential_integrity(&snapshot));
        }

        /// Cutting a stream into two cycles never changes the settled graph
        #[test]
        fn batch_boundaries_do_not_change_outcome(
            ops in mutation_sequence(),
            cut in 0usize..40,
        ) {
            let (whole, _) = replay(ops.clone(), 8);

            let cut = cut.min(ops.len());
            let (first, second) = ops.split_at(cut);
            let prior = Arc::new(Snapshot::empty());
            let one = apply_batch(&prior, first.to_vec(), Vec::new(), 8);
            let two = apply_batch(&one.snapshot, second.to_vec(), one.deferred, 8);
            let split = settle(two.snapshot, two.deferred, 8);

            prop_assert_eq!(split.concept_count(), whole.concept_count());
            prop_assert_eq!(split.association_count(), whole.association_count());
            prop_assert!(verify_referential_integrity(&split));
        }

        /// Highest-sequence upsert wins no matter the arrival order
        #[test]
        fn highest_sequence_upsert_wins(
            (contents, order) in prop::collection::vec("[a-z]{1,6}", 1..10).prop_flat_map(|c| {
                let order = Just((0..c.len()).collect::<Vec<usize>>()).prop_shuffle();
                (Just(c), order)
            }),
        ) {
            let id = pool_id(0);
            let winner = contents.last().unwrap().clone();

            let batch: Vec<SequencedMutation> = order
                .into_iter()
                .map(|i| SequencedMutation {
                    sequence: i as u64 + 1,
                    mutation: Mutation::UpsertConcept {
                        concept: Concept {
                            id,
                            content: contents[i].clone(),
                            attributes: BTreeMap::new(),
                            created_at: Utc::now(),
                        },
                    },
                })
                .collect();

            let prior = Arc::new(Snapshot::empty());
            let outcome = apply_batch(&prior, batch, Vec::new(), 4);
            prop_assert_eq!(
                &outcome.snapshot.get_concept(&id).unwrap().content,
                &winner
            );
        }
    }
}
