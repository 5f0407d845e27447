//! End-to-end engine tests: concurrent ingestion, deferred associations,
//! idempotence, and snapshot isolation

mod common;

use common::{fast_config, open_engine, weight_product};
use noema_core::snapshot::verify_referential_integrity;
use noema_core::{ConcurrentMemory, EngineConfig, NoemaError, TraverseOptions, WritePressure};
use std::collections::BTreeMap;
use std::collections::HashSet;
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_no_loss_no_duplicates() {
    // Scenario: 4 writer threads, 250 concepts each, all present after flush
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    let ids: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let memory = &memory;
                scope.spawn(move || {
                    let mut ids = Vec::with_capacity(250);
                    for i in 0..250 {
                        let id = memory
                            .insert_concept(format!("writer {} concept {}", t, i), BTreeMap::new())
                            .unwrap();
                        ids.push(id);
                    }
                    ids
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    memory.flush().await.unwrap();

    let stats = memory.stats();
    assert_eq!(stats.concept_count, 1000, "no loss");
    assert_eq!(
        ids.iter().collect::<HashSet<_>>().len(),
        1000,
        "no duplicate ids"
    );
    assert_eq!(stats.pending_writes, 0);

    let snapshot = memory.snapshot();
    for id in &ids {
        assert!(snapshot.get_concept(id).is_ok());
    }

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn association_before_endpoints_resolves() {
    // Scenario: the edge is enqueued and reconciled before either endpoint
    // exists; the engine defers it and applies it once both materialize
    let dir = tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.reconcile_interval_ms = 60_000; // reconcile only on flush

    let memory = ConcurrentMemory::open(config).unwrap();

    let a = noema_core::ConceptId::new();
    let b = noema_core::ConceptId::new();
    memory.insert_association(a, b, "implies", 0.8).unwrap();
    memory.flush().await.unwrap();
    assert_eq!(memory.stats().association_count, 0, "deferred, not applied");

    memory.upsert_concept(a, "premise", BTreeMap::new()).unwrap();
    memory.upsert_concept(b, "conclusion", BTreeMap::new()).unwrap();
    memory.flush().await.unwrap();

    let paths = memory
        .traverse(a, TraverseOptions::with_max_hops(1), weight_product)
        .unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].0.terminal(), b);
    assert!(memory.drain_orphans().is_empty());

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn unresolvable_association_surfaces_as_orphan() {
    let dir = tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.orphan_retry_budget = 2;
    let memory = ConcurrentMemory::open(config).unwrap();

    let a = memory.insert_concept("real", BTreeMap::new()).unwrap();
    let ghost = noema_core::ConceptId::new();
    memory.insert_association(a, ghost, "haunts", 0.5).unwrap();

    // Keep feeding cycles so the retry budget counts down
    for i in 0..8 {
        memory
            .insert_concept(format!("filler {}", i), BTreeMap::new())
            .unwrap();
        memory.flush().await.unwrap();
    }

    let orphans = memory.drain_orphans();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].key.target_id, ghost);
    assert!(memory.stats().orphaned_mutations >= 1);
    assert_eq!(memory.stats().association_count, 0);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_associations_collapse_to_latest_weight() {
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    let a = memory.insert_concept("a", BTreeMap::new()).unwrap();
    let b = memory.insert_concept("b", BTreeMap::new()).unwrap();
    for weight in [0.1, 0.3, 0.5, 0.7, 0.9] {
        memory.insert_association(a, b, "rel", weight).unwrap();
    }
    memory.flush().await.unwrap();

    let snapshot = memory.snapshot();
    assert_eq!(snapshot.association_count(), 1);
    assert_eq!(snapshot.associations_from(&a)[0].weight, 0.9);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn upsert_last_writer_wins() {
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    let id = memory.insert_concept("v1", BTreeMap::new()).unwrap();
    memory.upsert_concept(id, "v2", BTreeMap::new()).unwrap();
    memory.upsert_concept(id, "v3", BTreeMap::new()).unwrap();
    memory.flush().await.unwrap();

    assert_eq!(memory.get_concept(&id).unwrap().content, "v3");
    assert_eq!(memory.stats().concept_count, 1);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn held_snapshot_never_reflects_later_writes() {
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    memory.insert_concept("existing", BTreeMap::new()).unwrap();
    memory.flush().await.unwrap();

    let held = memory.snapshot();
    let held_version = held.version();

    for i in 0..10 {
        memory
            .insert_concept(format!("later {}", i), BTreeMap::new())
            .unwrap();
        memory.flush().await.unwrap();
    }

    assert_eq!(held.version(), held_version);
    assert_eq!(held.concept_count(), 1);
    assert!(memory.snapshot().version() > held_version);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn every_published_snapshot_is_referentially_intact() {
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    let mut ids = Vec::new();
    for i in 0..30 {
        ids.push(
            memory
                .insert_concept(format!("n{}", i), BTreeMap::new())
                .unwrap(),
        );
    }
    for window in ids.windows(2) {
        memory
            .insert_association(window[0], window[1], "next", 0.5)
            .unwrap();
    }
    // Deleting from the middle must cascade to inbound/outbound edges
    memory.delete_concept(ids[10]).unwrap();
    memory.delete_concept(ids[20]).unwrap();
    memory.flush().await.unwrap();

    let snapshot = memory.snapshot();
    assert!(verify_referential_integrity(&snapshot));
    assert_eq!(snapshot.concept_count(), 28);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_association_leaves_endpoints() {
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    let a = memory.insert_concept("a", BTreeMap::new()).unwrap();
    let b = memory.insert_concept("b", BTreeMap::new()).unwrap();
    memory.insert_association(a, b, "rel", 0.5).unwrap();
    memory.flush().await.unwrap();
    assert_eq!(memory.stats().association_count, 1);

    memory.delete_association(a, b, "rel").unwrap();
    memory.flush().await.unwrap();

    let stats = memory.stats();
    assert_eq!(stats.association_count, 0);
    assert_eq!(stats.concept_count, 2);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn backpressure_is_advisory_only() {
    let dir = tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.write_log_soft_watermark = 10;
    config.reconcile_interval_ms = 60_000; // let the queue build up

    let memory = ConcurrentMemory::open(config).unwrap();
    for i in 0..50 {
        // Appends keep succeeding past the watermark
        memory
            .insert_concept(format!("burst {}", i), BTreeMap::new())
            .unwrap();
    }
    assert_eq!(memory.stats().pressure, WritePressure::Degraded);
    assert!(matches!(
        memory.check_capacity(),
        Err(NoemaError::Backpressure { pending }) if pending >= 50
    ));

    memory.flush().await.unwrap();
    assert_eq!(memory.stats().pressure, WritePressure::Normal);
    assert!(memory.check_capacity().is_ok());
    assert_eq!(memory.stats().concept_count, 50);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn io_failure_latches_flushes_but_reads_keep_serving() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("segments");
    let mut config = fast_config(&data_dir);
    config.reconcile_interval_ms = 60_000; // reconcile only on flush

    let memory = ConcurrentMemory::open(config).unwrap();
    let id = memory.insert_concept("survives", BTreeMap::new()).unwrap();
    memory.flush().await.unwrap();

    // Yank the disk out from under the engine
    std::fs::remove_dir_all(&data_dir).unwrap();

    memory.insert_concept("doomed", BTreeMap::new()).unwrap();
    let err = memory.flush().await.unwrap_err();
    assert!(matches!(err, NoemaError::FatalIo(_)));

    // Latched: later flushes are rejected at the door
    let err = memory.flush().await.unwrap_err();
    assert!(matches!(err, NoemaError::FatalIo(_)));

    // Reads keep serving from memory
    assert_eq!(memory.get_concept(&id).unwrap().content, "survives");
    assert!(memory.stats().concept_count >= 1);

    memory.shutdown().await.unwrap();
}

#[tokio::test]
async fn reader_miss_is_not_found() {
    let dir = tempdir().unwrap();
    let memory = open_engine(dir.path());

    let err = memory
        .get_concept(&noema_core::ConceptId::new())
        .unwrap_err();
    assert!(matches!(err, NoemaError::NotFound(_)));

    memory.shutdown().await.unwrap();
}
