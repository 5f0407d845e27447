//! Core data types for the Noema knowledge-graph engine
//!
//! This module defines the fundamental data structures shared across the
//! engine: concepts, associations, the mutation records carried by the write
//! log and the segment store, and the stats surfaced by the facade.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for concepts
///
/// Wraps a UUID to provide type safety and prevent mixing concept IDs with
/// other UUID-based identifiers. Identity is assigned once and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptId(pub Uuid);

impl ConceptId {
    /// Create a new random concept ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a concept ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for ConceptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in the knowledge graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Unique identifier
    pub id: ConceptId,

    /// Text payload
    pub content: String,

    /// String key/value attributes (keys unique)
    pub attributes: BTreeMap<String, String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Concept {
    /// Build a concept with a fresh id and the current timestamp
    pub fn new(content: impl Into<String>, attributes: BTreeMap<String, String>) -> Self {
        Self {
            id: ConceptId::new(),
            content: content.into(),
            attributes,
            created_at: Utc::now(),
        }
    }
}

/// A directed, labeled, weighted edge between two concepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    /// Source concept
    pub source_id: ConceptId,

    /// Target concept
    pub target_id: ConceptId,

    /// Relationship label
    pub label: String,

    /// Edge strength in [0.0, 1.0]
    pub weight: f32,

    /// When the association was created
    pub created_at: DateTime<Utc>,
}

impl Association {
    /// Key identifying a logical edge; duplicates collapse on this key
    pub fn key(&self) -> AssociationKey {
        AssociationKey {
            source_id: self.source_id,
            target_id: self.target_id,
            label: self.label.clone(),
        }
    }
}

/// Identity of a logical edge: `(source, target, label)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssociationKey {
    pub source_id: ConceptId,
    pub target_id: ConceptId,
    pub label: String,
}

impl std::fmt::Display for AssociationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.source_id, self.label, self.target_id)
    }
}

/// A single graph mutation, as queued in the write log and persisted in
/// segments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    /// Introduce a new concept
    CreateConcept { concept: Concept },

    /// Replace content/attributes of an existing concept (or create it if
    /// the id is unseen; upserts carry their own identity)
    UpsertConcept { concept: Concept },

    /// Introduce or re-weight a directed edge
    CreateAssociation { association: Association },

    /// Tombstone a concept and all edges touching it
    DeleteConcept { id: ConceptId },

    /// Tombstone a single edge
    DeleteAssociation { key: AssociationKey },
}

impl Mutation {
    /// Reject mutations that can never be applied. Called at the facade door
    /// and again by the reconciler (segments replayed from older versions may
    /// carry records the door never saw).
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Mutation::CreateAssociation { association } => {
                if !(0.0..=1.0).contains(&association.weight) || !association.weight.is_finite() {
                    return Err(format!(
                        "association weight {} outside [0,1]",
                        association.weight
                    ));
                }
                if association.label.is_empty() {
                    return Err("association label is empty".to_string());
                }
                if association.source_id == association.target_id {
                    return Err("self-referential association".to_string());
                }
                Ok(())
            }
            Mutation::CreateConcept { concept } | Mutation::UpsertConcept { concept } => {
                if concept.content.is_empty() {
                    return Err("concept content is empty".to_string());
                }
                Ok(())
            }
            Mutation::DeleteConcept { .. } | Mutation::DeleteAssociation { .. } => Ok(()),
        }
    }
}

/// A mutation plus the globally unique sequence number assigned at enqueue
/// time. Sequence order is the total order of application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedMutation {
    /// Monotonically increasing, globally unique
    pub sequence: u64,

    /// The mutation itself
    pub mutation: Mutation,
}

/// Advisory write-path pressure signal
///
/// `Degraded` means the queued-but-undrained volume crossed the soft
/// watermark. Appends still succeed; this exists for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePressure {
    Normal,
    Degraded,
}

/// Record of an association that exceeded its retry budget without both
/// endpoints materializing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanReport {
    /// The edge that could not be applied
    pub key: AssociationKey,

    /// Sequence number of the originating mutation
    pub sequence: u64,

    /// Reconciliation cycles the mutation waited before giving up
    pub cycles_waited: u32,
}

/// Engine-level statistics, cheap to gather (atomics + current snapshot)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Concepts visible in the current snapshot
    pub concept_count: usize,

    /// Associations visible in the current snapshot
    pub association_count: usize,

    /// Mutations enqueued but not yet reconciled
    pub pending_writes: usize,

    /// Version of the currently published snapshot
    pub current_snapshot_version: u64,

    /// Wall time of the most recent reconciliation cycle
    pub last_reconcile_duration_ms: u64,

    /// Associations dropped after exceeding the orphan retry budget
    pub orphaned_mutations: u64,

    /// Segments sealed since startup
    pub sealed_segments: u64,

    /// Advisory write-path pressure
    pub pressure: WritePressure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concept_id_uniqueness() {
        let id1 = ConceptId::new();
        let id2 = ConceptId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_concept_id_roundtrip() {
        let id = ConceptId::new();
        let parsed = ConceptId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_association_weight_validation() {
        let mut assoc = Association {
            source_id: ConceptId::new(),
            target_id: ConceptId::new(),
            label: "relates_to".to_string(),
            weight: 0.7,
            created_at: Utc::now(),
        };
        assert!(Mutation::CreateAssociation {
            association: assoc.clone()
        }
        .validate()
        .is_ok());

        assoc.weight = 1.5;
        assert!(Mutation::CreateAssociation {
            association: assoc.clone()
        }
        .validate()
        .is_err());

        assoc.weight = f32::NAN;
        assert!(Mutation::CreateAssociation {
            association: assoc
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_self_loop_rejected() {
        let id = ConceptId::new();
        let assoc = Association {
            source_id: id,
            target_id: id,
            label: "self".to_string(),
            weight: 0.5,
            created_at: Utc::now(),
        };
        assert!(Mutation::CreateAssociation {
            association: assoc
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_mutation_serde_roundtrip() {
        let concept = Concept::new("gravity bends light", BTreeMap::new());
        let mutation = Mutation::CreateConcept { concept };
        let record = SequencedMutation {
            sequence: 42,
            mutation,
        };

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: SequencedMutation = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
