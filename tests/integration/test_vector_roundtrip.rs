//! Test: vectors come back out of the index the way they went in
//!
//! Covers reconstruction fidelity across dimensions and batch sizes,
//! self-search, and the out-of-range guards on the binary cache.

use crate::common::{TestStore, chunk_ids, cosine, random_vectors};
use codevec::config::VectorConfig;
use codevec::{BinaryVectorCache, StoreError};

#[test]
fn test_reconstruct_matches_input_for_all_shapes() {
    for (dimension, count) in [(8, 1), (8, 10), (64, 37), (384, 120), (768, 16)] {
        let env = TestStore::new();
        let mut provider = env.provider(dimension, VectorConfig::default());
        let vectors = random_vectors(count, dimension, dimension as u64 + count as u64);
        provider.add(&vectors, &chunk_ids("c", count)).unwrap();

        for (position, original) in vectors.iter().enumerate() {
            let restored = provider.reconstruct(position).unwrap();
            assert_eq!(restored.len(), dimension);
            let similarity = cosine(&restored, original);
            assert!(
                similarity >= 0.999,
                "dim={dimension} n={count} position={position}: cosine {similarity}"
            );
        }
    }
}

#[test]
fn test_reconstruct_through_binary_cache() {
    let env = TestStore::new();
    let config = VectorConfig {
        mmap_cache_threshold: 4,
        ..VectorConfig::default()
    };
    let mut provider = env.provider(16, config);
    let vectors = random_vectors(12, 16, 3);
    provider.add(&vectors, &chunk_ids("c", 12)).unwrap();
    provider.save().unwrap();
    assert!(provider.binary_cache_active());

    for (position, original) in vectors.iter().enumerate() {
        assert!(cosine(&provider.reconstruct(position).unwrap(), original) >= 0.999);
    }
}

#[test]
fn test_self_search_ranks_itself_first() {
    let env = TestStore::new();
    let mut provider = env.provider(32, VectorConfig::default());
    let vectors = random_vectors(50, 32, 11);
    let ids = chunk_ids("chunk-", 50);
    provider.add(&vectors, &ids).unwrap();

    for position in [0, 17, 49] {
        let hits = provider.search(&vectors[position], 3).unwrap();
        assert_eq!(hits[0].position, position);
        assert_eq!(provider.id_at(hits[0].position), Some(&ids[position]));
        assert!((hits[0].score - 1.0).abs() < 1e-4, "score {}", hits[0].score);
    }
}

#[test]
fn test_search_on_empty_index() {
    let env = TestStore::new();
    let provider = env.provider(8, VectorConfig::default());
    let err = provider.search(&[0.5; 8], 1).unwrap_err();
    assert!(matches!(err, StoreError::IndexAbsentOrEmpty));
}

#[test]
fn test_get_vector_out_of_range_is_not_found() {
    let env = TestStore::new();
    let path = env.layout().binary_cache_file();
    let mut cache = BinaryVectorCache::new(&path, 4);
    cache
        .save(&random_vectors(3, 4, 5), &chunk_ids("c", 3), None)
        .unwrap();
    assert!(cache.load().unwrap());

    assert!(cache.get_vector(2).is_some());
    assert!(cache.get_vector(3).is_none());
    assert!(cache.get_vector(usize::MAX).is_none());
    assert!(cache.get_identity_hash(3).is_none());
}

#[test]
fn test_repeated_close_never_fails() {
    let env = TestStore::new();
    let mut cache = BinaryVectorCache::new(env.layout().binary_cache_file(), 4);

    // Closing before anything was mapped
    cache.close();
    cache.close();

    cache
        .save(&random_vectors(2, 4, 9), &chunk_ids("c", 2), None)
        .unwrap();
    assert!(cache.load().unwrap());
    cache.close();
    cache.close();
    assert!(!cache.is_loaded());
    assert!(cache.get_vector(0).is_none());
}
