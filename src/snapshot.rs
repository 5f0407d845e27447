//! Immutable, versioned read views of the knowledge graph
//!
//! A [`Snapshot`] is never mutated after publication; the reconciler derives
//! the next snapshot from a clone of the prior graph and publishes it through
//! the [`SnapshotCell`]. Readers acquire the current snapshot with a single
//! atomic load plus a refcount bump, so reads cost the same whether or not
//! writers are active.
//!
//! Reclamation is purely refcount-based: the `Arc` a reader holds keeps its
//! view alive, and the view is freed the instant the last handle drops.

use crate::error::{NoemaError, Result};
use crate::types::{Association, AssociationKey, Concept, ConceptId};
use arc_swap::ArcSwap;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// The graph held inside a snapshot: concepts plus outgoing adjacency.
///
/// Alongside the visible state, the graph carries per-concept and per-edge
/// sequence watermarks. Sequence numbers are assigned before queue insertion,
/// so a mutation can arrive in a cycle after a higher-sequenced one touching
/// the same key; the watermark drops such stale writes, keeping
/// last-writer-wins exact across cycle boundaries. Watermarks survive
/// deletion so a tombstoned key cannot be resurrected by a straggler.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    concepts: HashMap<ConceptId, Concept>,
    adjacency: HashMap<ConceptId, Vec<Association>>,
    concept_seq: HashMap<ConceptId, u64>,
    edge_seq: HashMap<AssociationKey, u64>,
    delete_seq: HashMap<ConceptId, u64>,
    association_count: usize,
}

impl Graph {
    /// True if the concept is visible (present and not tombstoned)
    pub fn contains_concept(&self, id: &ConceptId) -> bool {
        self.concepts.contains_key(id)
    }

    pub fn concept_count(&self) -> usize {
        self.concepts.len()
    }

    pub fn association_count(&self) -> usize {
        self.association_count
    }

    pub fn get_concept(&self, id: &ConceptId) -> Option<&Concept> {
        self.concepts.get(id)
    }

    /// Outgoing associations of a concept, insertion-ordered
    pub fn associations_from(&self, id: &ConceptId) -> &[Association] {
        self.adjacency.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert or replace a concept. Returns false if `seq` is stale for this
    /// id (a higher-sequenced write or tombstone already landed).
    pub(crate) fn upsert_concept(&mut self, concept: Concept, seq: u64) -> bool {
        if !self.advance_concept_watermark(concept.id, seq) {
            return false;
        }
        self.concepts.insert(concept.id, concept);
        true
    }

    /// Insert an edge, collapsing onto an existing `(source, target, label)`
    /// edge by replacing its weight. Both endpoints must already be visible;
    /// the reconciler guarantees that by deferring forward references.
    pub(crate) fn insert_association(&mut self, association: Association, seq: u64) -> bool {
        if !self.advance_edge_watermark(association.key(), seq) {
            return false;
        }

        let edges = self.adjacency.entry(association.source_id).or_default();
        if let Some(existing) = edges.iter_mut().find(|e| {
            e.target_id == association.target_id && e.label == association.label
        }) {
            existing.weight = association.weight;
            existing.created_at = association.created_at;
        } else {
            edges.push(association);
            self.association_count += 1;
        }
        true
    }

    /// Tombstone a concept and every edge touching it.
    ///
    /// The delete watermark is recorded even when nothing is removed (absent
    /// concept, stale sequence): an edge sequenced before this delete must
    /// not attach to the endpoint later, no matter when it is retried.
    pub(crate) fn delete_concept(&mut self, id: ConceptId, seq: u64) -> bool {
        let tombstone = self.delete_seq.entry(id).or_insert(0);
        *tombstone = (*tombstone).max(seq);

        if !self.advance_concept_watermark(id, seq) {
            return false;
        }
        if self.concepts.remove(&id).is_none() {
            return false;
        }

        if let Some(outgoing) = self.adjacency.remove(&id) {
            self.association_count -= outgoing.len();
            for edge in &outgoing {
                self.edge_seq.insert(edge.key(), seq);
            }
        }

        // Inbound edges are found by scanning adjacency. O(E) per delete is
        // the documented clone-per-cycle baseline; an inverted index is an
        // optimization with no contract change.
        for edges in self.adjacency.values_mut() {
            let before = edges.len();
            edges.retain(|edge| {
                if edge.target_id == id {
                    self.edge_seq.insert(edge.key(), seq);
                    false
                } else {
                    true
                }
            });
            self.association_count -= before - edges.len();
        }

        true
    }

    /// Tombstone a single edge
    pub(crate) fn delete_association(&mut self, key: &AssociationKey, seq: u64) -> bool {
        if !self.advance_edge_watermark(key.clone(), seq) {
            return false;
        }
        let Some(edges) = self.adjacency.get_mut(&key.source_id) else {
            return false;
        };
        let before = edges.len();
        edges.retain(|e| !(e.target_id == key.target_id && e.label == key.label));
        let removed = before - edges.len();
        self.association_count -= removed;
        removed > 0
    }

    /// Sequence of the latest delete touching this concept (0 if never
    /// deleted). Edges sequenced at or before it are superseded.
    pub(crate) fn last_delete_seq(&self, id: &ConceptId) -> u64 {
        self.delete_seq.get(id).copied().unwrap_or(0)
    }

    fn advance_concept_watermark(&mut self, id: ConceptId, seq: u64) -> bool {
        match self.concept_seq.entry(id) {
            Entry::Occupied(mut slot) => {
                if *slot.get() >= seq {
                    return false;
                }
                slot.insert(seq);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(seq);
                true
            }
        }
    }

    fn advance_edge_watermark(&mut self, key: AssociationKey, seq: u64) -> bool {
        match self.edge_seq.entry(key) {
            Entry::Occupied(mut slot) => {
                if *slot.get() >= seq {
                    return false;
                }
                slot.insert(seq);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(seq);
                true
            }
        }
    }
}

/// An immutable, versioned point-in-time view of the whole graph
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    graph: Graph,
}

impl Snapshot {
    /// The empty snapshot a fresh engine starts from
    pub fn empty() -> Self {
        Self {
            version: 0,
            graph: Graph::default(),
        }
    }

    pub(crate) fn next(prior: &Snapshot, graph: Graph) -> Self {
        Self {
            version: prior.version + 1,
            graph,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Look up a concept in this view
    pub fn get_concept(&self, id: &ConceptId) -> Result<&Concept> {
        self.graph.get_concept(id).ok_or(NoemaError::NotFound(*id))
    }

    /// Outgoing associations of a concept, insertion-ordered
    pub fn associations_from(&self, id: &ConceptId) -> &[Association] {
        self.graph.associations_from(id)
    }

    pub fn concept_count(&self) -> usize {
        self.graph.concept_count()
    }

    pub fn association_count(&self) -> usize {
        self.graph.association_count()
    }

    /// Best-first multi-hop traversal from `start`.
    ///
    /// Returns a lazy, finite iterator of `(path, score)` pairs ordered by
    /// the caller-supplied scoring function (highest score first). Each call
    /// owns its frontier, so traversals are independent and restartable.
    /// Paths never revisit a concept. Exceeding the deadline yields a single
    /// `Err(Timeout)` and terminates the iterator; nothing else is affected.
    pub fn traverse<'a, F>(
        &'a self,
        start: ConceptId,
        options: TraverseOptions,
        score: F,
    ) -> Traversal<'a, F>
    where
        F: Fn(&TraversalPath) -> f64,
    {
        let mut frontier = BinaryHeap::new();
        if self.graph.contains_concept(&start) {
            for edge in self.graph.associations_from(&start) {
                let path = TraversalPath {
                    concepts: vec![start, edge.target_id],
                    hops: vec![edge.clone()],
                };
                let scored = score(&path);
                frontier.push(ScoredPath {
                    score: TotalF64(scored),
                    path,
                });
            }
        }

        Traversal {
            snapshot: self,
            score,
            frontier,
            options,
            emitted: 0,
            started_at: Instant::now(),
            done: false,
        }
    }
}

/// Bounds for a single traversal call
#[derive(Debug, Clone, Copy)]
pub struct TraverseOptions {
    /// Maximum path length in hops
    pub max_hops: usize,

    /// Maximum paths yielded
    pub max_results: usize,

    /// Abort the traversal past this instant
    pub deadline: Option<Instant>,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        Self {
            max_hops: 3,
            max_results: 64,
            deadline: None,
        }
    }
}

impl TraverseOptions {
    pub fn with_max_hops(max_hops: usize) -> Self {
        Self {
            max_hops,
            ..Self::default()
        }
    }
}

/// A concrete path discovered by traversal
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalPath {
    /// Visited concepts, starting concept first
    pub concepts: Vec<ConceptId>,

    /// Edges taken, one per hop
    pub hops: Vec<Association>,
}

impl TraversalPath {
    /// The concept this path ends at
    pub fn terminal(&self) -> ConceptId {
        *self.concepts.last().expect("path has at least the start")
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    fn visits(&self, id: &ConceptId) -> bool {
        self.concepts.contains(id)
    }
}

/// f64 wrapper with a total order so scores can key the frontier heap
#[derive(Debug, Clone, Copy, PartialEq)]
struct TotalF64(f64);

impl Eq for TotalF64 {}

impl PartialOrd for TotalF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TotalF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[derive(Debug)]
struct ScoredPath {
    score: TotalF64,
    path: TraversalPath,
}

impl PartialEq for ScoredPath {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for ScoredPath {}

impl PartialOrd for ScoredPath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredPath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score.cmp(&other.score)
    }
}

/// Lazy best-first traversal over one snapshot
pub struct Traversal<'a, F> {
    snapshot: &'a Snapshot,
    score: F,
    frontier: BinaryHeap<ScoredPath>,
    options: TraverseOptions,
    emitted: usize,
    started_at: Instant,
    done: bool,
}

impl<F> Traversal<'_, F>
where
    F: Fn(&TraversalPath) -> f64,
{
    fn expand(&mut self, path: &TraversalPath) {
        if path.hop_count() >= self.options.max_hops {
            return;
        }
        let tail = path.terminal();
        for edge in self.snapshot.graph.associations_from(&tail) {
            if path.visits(&edge.target_id) {
                continue;
            }
            let mut extended = path.clone();
            extended.concepts.push(edge.target_id);
            extended.hops.push(edge.clone());
            let scored = (self.score)(&extended);
            self.frontier.push(ScoredPath {
                score: TotalF64(scored),
                path: extended,
            });
        }
    }
}

impl<F> Iterator for Traversal<'_, F>
where
    F: Fn(&TraversalPath) -> f64,
{
    type Item = Result<(TraversalPath, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.emitted >= self.options.max_results {
            return None;
        }

        if let Some(deadline) = self.options.deadline {
            if Instant::now() > deadline {
                self.done = true;
                return Some(Err(NoemaError::Timeout {
                    elapsed_ms: self.started_at.elapsed().as_millis() as u64,
                }));
            }
        }

        let ScoredPath { score, path } = self.frontier.pop()?;
        self.expand(&path);
        self.emitted += 1;
        Some(Ok((path, score.0)))
    }
}

/// Publication point for the current snapshot.
///
/// Single-writer (the reconciler) / multi-reader. `current()` is an atomic
/// pointer load plus a refcount increment; no reader ever takes a lock or
/// observes a half-published view.
pub struct SnapshotCell {
    inner: ArcSwap<Snapshot>,
}

impl SnapshotCell {
    pub fn new(initial: Arc<Snapshot>) -> Self {
        Self {
            inner: ArcSwap::from(initial),
        }
    }

    /// Acquire the current snapshot. O(1), wait-free.
    pub fn current(&self) -> Arc<Snapshot> {
        self.inner.load_full()
    }

    /// Publish a new snapshot. Prior handles stay valid until dropped.
    pub(crate) fn publish(&self, next: Arc<Snapshot>) {
        debug_assert!(next.version() > self.inner.load().version());
        self.inner.store(next);
    }
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self::new(Arc::new(Snapshot::empty()))
    }
}

/// Check that every association in a graph has both endpoints present.
/// Exposed for tests and recovery assertions.
pub fn verify_referential_integrity(snapshot: &Snapshot) -> bool {
    let graph = snapshot.graph();
    let mut seen = HashSet::new();
    for (source, edges) in &graph.adjacency {
        if !graph.contains_concept(source) {
            return false;
        }
        for edge in edges {
            if !graph.contains_concept(&edge.target_id) {
                return false;
            }
            if !seen.insert((edge.source_id, edge.target_id, edge.label.clone())) {
                return false;
            }
        }
    }
    true
}
