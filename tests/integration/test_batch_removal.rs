//! Test: batch removal rebuilds the index and keeps every structure aligned

use crate::common::{TestStore, chunk_ids, empty_attributes, random_vectors};
use codevec::{ChunkId, ConsistencyIssue, RebuildPolicy, Settings};
use serde_json::json;

#[test]
fn test_remove_two_of_ten() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 8);
    let ids = chunk_ids("c", 10);
    store
        .add(&random_vectors(10, 8, 1), &ids, &empty_attributes(10))
        .unwrap();

    let before: Vec<(ChunkId, Vec<f32>)> = ids
        .iter()
        .filter(|id| id.as_str() != "c3" && id.as_str() != "c7")
        .map(|id| {
            let position = store.provider().position_of(id).unwrap();
            (id.clone(), store.provider().reconstruct(position).unwrap())
        })
        .collect();

    let report = store
        .remove(&["c3", "c7"], None, RebuildPolicy::BestEffort)
        .unwrap();
    assert_eq!(report.requested, 2);
    assert_eq!(report.removed, 2);
    assert!(!report.cleared);

    assert_eq!(store.len(), 8);
    let validation = store.validate().unwrap();
    assert!(validation.is_consistent, "{:?}", validation.issues);

    assert!(!store.provider().contains(&ChunkId::new("c3")));
    assert!(!store.provider().contains(&ChunkId::new("c7")));
    assert!(store.get_chunk("c3").is_none());

    for (id, vector) in before {
        let position = store.provider().position_of(&id).unwrap();
        let restored = store.provider().reconstruct(position).unwrap();
        for (a, b) in restored.iter().zip(&vector) {
            assert!((a - b).abs() < 1e-6, "{id} changed after rebuild");
        }
        assert_eq!(store.get_record(id.as_str()).unwrap().position, position);
    }
}

#[test]
fn test_remove_by_file_path_and_survive_reopen() {
    let env = TestStore::new();
    {
        let mut store = env.store("test-model", 4);
        let ids: Vec<ChunkId> = [
            "src/a.rs:1-4:function:one",
            "src/a.rs:5-9:function:two",
            "src/b.rs:1-4:function:three",
        ]
        .into_iter()
        .map(ChunkId::new)
        .collect();
        let attributes = vec![
            json!({"file_path": "src/a.rs"}).as_object().cloned().unwrap(),
            json!({"file_path": "src/a.rs"}).as_object().cloned().unwrap(),
            json!({"file_path": "src/b.rs"}).as_object().cloned().unwrap(),
        ];
        store
            .add(&random_vectors(3, 4, 2), &ids, &attributes)
            .unwrap();

        // Windows spelling of the same file
        let report = store
            .remove(&[r"src\a.rs"], None, RebuildPolicy::BestEffort)
            .unwrap();
        assert_eq!(report.removed, 2);
        store.close();
    }

    let store = env.store("test-model", 4);
    assert_eq!(store.len(), 1);
    assert!(store.validate().unwrap().is_consistent);
    assert!(store.get_chunk("src/b.rs:1-4:function:three").is_some());
}

#[test]
fn test_removing_everything_leaves_an_empty_consistent_store() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 4);
    let ids = chunk_ids("c", 3);
    store
        .add(&random_vectors(3, 4, 3), &ids, &empty_attributes(3))
        .unwrap();

    let report = store
        .remove(&["c0", "c1", "c2"], None, RebuildPolicy::FailFast)
        .unwrap();
    assert_eq!(report.removed, 3);
    assert!(store.is_empty());
    assert!(store.validate().unwrap().is_consistent);
}

#[test]
fn test_unknown_targets_change_nothing() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 4);
    store
        .add(&random_vectors(4, 4, 4), &chunk_ids("c", 4), &empty_attributes(4))
        .unwrap();

    let report = store
        .remove(&["nope"], None, RebuildPolicy::BestEffort)
        .unwrap();
    assert_eq!(report.requested, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(store.len(), 4);
}

#[test]
fn test_rebuild_crosses_index_kind_boundary() {
    let env = TestStore::new();
    let mut settings = Settings::default();
    settings.vector.ivf_threshold = 64;
    settings.vector.ivf_nlist = 4;
    let mut store = env.store_with(settings, "test-model", 8);

    let ids = chunk_ids("c", 80);
    let vectors = random_vectors(80, 8, 5);
    store.add(&vectors, &ids, &empty_attributes(80)).unwrap();
    assert!(store.provider().kind().is_partitioned());
    assert!(store.provider().is_trained());

    // Still above the threshold: partitions are retrained on the kept set
    store
        .remove(&["c0", "c1"], None, RebuildPolicy::BestEffort)
        .unwrap();
    assert!(store.provider().kind().is_partitioned());
    assert!(store.provider().is_trained());
    assert!(store.validate().unwrap().is_consistent);
    let hits = store.search(&vectors[40], 1, None).unwrap();
    assert_eq!(hits[0].chunk_id.as_str(), "c40");

    // Below the threshold: falls back to the exact index
    let drop: Vec<String> = (2..30).map(|i| format!("c{i}")).collect();
    store
        .remove(&drop, None, RebuildPolicy::BestEffort)
        .unwrap();
    assert_eq!(store.len(), 50);
    assert!(!store.provider().kind().is_partitioned());
    assert!(store.validate().unwrap().is_consistent);
    let hits = store.search(&vectors[79], 1, None).unwrap();
    assert_eq!(hits[0].chunk_id.as_str(), "c79");
}

#[test]
fn test_desync_is_detected_and_named() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 8);
    store
        .add(&random_vectors(6, 8, 6), &chunk_ids("c", 6), &empty_attributes(6))
        .unwrap();
    assert!(store.validate().unwrap().is_consistent);

    store
        .metadata()
        .update_index_id(&ChunkId::new("c4"), 42)
        .unwrap();
    store.metadata().commit();

    let report = store.validate().unwrap();
    assert!(!report.is_consistent);
    assert_eq!(
        report.issues,
        vec![ConsistencyIssue::PositionMismatch {
            chunk_id: ChunkId::new("c4"),
            actual: 4,
            recorded: 42,
        }]
    );
    assert!(report.issues[0].to_string().contains("c4"));
}

#[test]
fn test_stale_metadata_survives_removal_of_another_chunk() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 8);
    let vectors = random_vectors(10, 8, 5);
    store
        .add(&vectors, &chunk_ids("c", 10), &empty_attributes(10))
        .unwrap();

    // Vectors present, metadata stale for c5
    let stale = ChunkId::new("c5");
    assert!(store.metadata().delete(&stale).unwrap());
    store.metadata().commit();

    let report = store
        .remove(&["c3"], None, RebuildPolicy::BestEffort)
        .unwrap();
    assert!(!report.cleared, "{report:?}");
    assert_eq!(report.removed, 1);
    assert_eq!(report.stale_metadata, 1);
    assert_eq!(store.len(), 9);

    let position = store.provider().position_of(&stale).unwrap();
    assert_eq!(position, 4);
    let restored = store.provider().reconstruct(position).unwrap();
    assert!(crate::common::cosine(&restored, &vectors[5]) > 0.999);

    let validation = store.validate().unwrap();
    assert!(!validation.is_consistent);
    assert!(validation.issues.contains(&ConsistencyIssue::MissingMetadata {
        chunk_id: stale,
        position: 4,
    }));
    assert!(store.get_record("c9").is_some());
}
