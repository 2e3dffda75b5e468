//! Test: end-to-end store behaviour through the public facade
//!
//! Identifier spelling variants, the dimension gate, per-project isolation
//! and lexical drift checks.

use crate::common::{TestStore, chunk_ids, empty_attributes, random_vectors};
use codevec::indexing::LexicalDocCount;
use codevec::{
    Attributes, ChunkId, NoDevice, SearchFilter, Settings, StoreError, StoreRegistry, StoreResult,
    SyncStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

#[test]
fn test_separator_variants_resolve_to_one_record() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 4);
    let id = ChunkId::new("src/utils/io.rs:10-20:function:read_all");
    let attributes: Attributes = json!({"file_path": "src/utils/io.rs", "name": "read_all"})
        .as_object()
        .cloned()
        .unwrap();
    store
        .add(&random_vectors(1, 4, 7), &[id.clone()], &[attributes])
        .unwrap();

    let variants = [
        "src/utils/io.rs:10-20:function:read_all",
        r"src\utils\io.rs:10-20:function:read_all",
        r"src\\utils\\io.rs:10-20:function:read_all",
    ];
    for variant in variants {
        let record = store
            .get_record(variant)
            .unwrap_or_else(|| panic!("{variant} did not resolve"));
        assert_eq!(record.chunk_id, id);
        assert_eq!(record.position, 0);
    }

    // Similarity lookups accept the same spellings
    assert!(store.get_similar(variants[2], 3).unwrap().is_empty());
}

#[test]
fn test_dimension_mismatch_on_add() {
    let env = TestStore::new();
    let mut store = env.store("large-model", 768);
    store
        .add(&random_vectors(2, 768, 8), &chunk_ids("big", 2), &empty_attributes(2))
        .unwrap();

    let err = store
        .add(&random_vectors(3, 384, 9), &chunk_ids("small", 3), &empty_attributes(3))
        .unwrap_err();
    match err {
        StoreError::DimensionMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, 768);
            assert_eq!(actual, 384);
        }
        other => panic!("Expected DimensionMismatch, got {other:?}"),
    }
    assert_eq!(store.len(), 2);
    assert_eq!(store.stats().unwrap().metadata_count, 2);
}

#[test]
fn test_reopening_with_another_model_dimension_is_rejected() {
    let env = TestStore::new();
    {
        let mut store = env.store("large-model", 768);
        store
            .add(&random_vectors(1, 768, 10), &chunk_ids("c", 1), &empty_attributes(1))
            .unwrap();
    }

    let err = codevec::ChunkStore::open(
        Arc::new(Settings::default()),
        env.dir.path(),
        "small-model",
        384,
        Arc::new(NoDevice),
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("768") && message.contains("384"), "{message}");
    assert!(message.contains("large-model") && message.contains("small-model"), "{message}");
    assert_eq!(err.status_code(), "DIMENSION_MISMATCH");

    // The existing store is untouched
    let store = env.store("large-model", 768);
    assert_eq!(store.len(), 1);
}

#[test]
fn test_truncated_model_info_does_not_block_open_or_clear() {
    let env = TestStore::new();
    {
        let mut store = env.store("large-model", 8);
        store
            .add(&random_vectors(3, 8, 11), &chunk_ids("c", 3), &empty_attributes(3))
            .unwrap();
    }
    std::fs::write(env.layout().model_info_file(), r#"{"model_name": "large-mo"#).unwrap();

    let mut store = env.store("large-model", 8);
    assert_eq!(store.len(), 3);
    assert_eq!(store.model_info().dimension, 8);

    store.clear().unwrap();
    assert!(store.is_empty());
    assert!(!env.layout().index_file().exists());
}

#[test]
fn test_filtered_search_and_symbol_lookup() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 3);
    let ids = vec![
        ChunkId::new("src/parser.rs:1-40:function:parse"),
        ChunkId::new("src/parser.rs:41-60:struct:Parser"),
        ChunkId::new("tests/parser.rs:1-20:function:parse_smoke"),
    ];
    let attributes: Vec<Attributes> = [
        json!({"file_path": "src/parser.rs", "name": "parse", "language": "rust"}),
        json!({"file_path": "src/parser.rs", "name": "Parser", "language": "rust"}),
        json!({
            "file_path": "tests/parser.rs",
            "name": "parse_smoke",
            "language": "rust",
            "symbols": ["helper"],
        }),
    ]
    .into_iter()
    .map(|v| v.as_object().cloned().unwrap())
    .collect();
    let vectors = vec![
        vec![1.0, 0.0, 0.0],
        vec![0.7, 0.7, 0.0],
        vec![0.9, 0.0, 0.1],
    ];
    store.add(&vectors, &ids, &attributes).unwrap();

    let filter = SearchFilter::new().with_path_prefix("tests/");
    let hits = store.search(&[1.0, 0.0, 0.0], 2, Some(&filter)).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, ids[2]);

    let filter = SearchFilter::new().with_min_score(0.9);
    let hits = store.search(&[1.0, 0.0, 0.0], 3, Some(&filter)).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.score >= 0.9));

    assert_eq!(store.find_by_symbol("Parser").unwrap().chunk_id, ids[1]);
    assert_eq!(store.find_by_symbol("helper").unwrap().chunk_id, ids[2]);
    assert!(store.find_by_symbol("missing").is_none());
}

#[test]
fn test_registry_isolates_projects() {
    let temp_dir = TempDir::new().unwrap();
    let settings = Settings {
        index_path: temp_dir.path().to_path_buf(),
        ..Settings::default()
    };
    let registry = StoreRegistry::new(Arc::new(settings), Arc::new(NoDevice));

    let alpha = registry.get_or_open("alpha", "m", 8).unwrap();
    let beta = registry.get_or_open("beta", "m", 8).unwrap();
    alpha
        .lock()
        .add(&random_vectors(3, 8, 12), &chunk_ids("a", 3), &empty_attributes(3))
        .unwrap();
    beta
        .lock()
        .add(&random_vectors(1, 8, 13), &chunk_ids("b", 1), &empty_attributes(1))
        .unwrap();

    assert_eq!(alpha.lock().len(), 3);
    assert_eq!(beta.lock().len(), 1);
    assert!(alpha.lock().get_chunk("b0").is_none());

    registry.close_all();
    assert!(registry.is_empty());
    let reopened = registry.get_or_open("alpha", "m", 8).unwrap();
    assert_eq!(reopened.lock().len(), 3);
}

struct FixedCount(usize);

impl LexicalDocCount for FixedCount {
    fn document_count(&self) -> StoreResult<usize> {
        Ok(self.0)
    }
}

#[test]
fn test_lexical_drift_triggers_resync() {
    let env = TestStore::new();
    let mut store = env.store("test-model", 4);
    store
        .add(&random_vectors(8, 4, 14), &chunk_ids("c", 8), &empty_attributes(8))
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    store
        .sync_monitor_mut()
        .set_handler(Box::new(move |_: &SyncStatus| -> StoreResult<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    let status = store.check_sync(&FixedCount(8)).unwrap();
    assert!(!status.drifted);

    let status = store.check_sync(&FixedCount(10)).unwrap();
    assert!(status.drifted);
    assert!(status.resync_triggered);
    assert!((status.ratio - 0.2).abs() < 1e-9);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
