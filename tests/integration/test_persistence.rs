//! Test: save/load round trips and the binary cache activation threshold

use crate::common::{TestStore, chunk_ids, random_vectors};
use codevec::config::VectorConfig;
use codevec::{NoDevice, Residency, SimulatedDevice, VectorIndexProvider};
use std::sync::Arc;

fn assert_same_state(before: &VectorIndexProvider, after: &VectorIndexProvider, query: &[f32]) {
    assert_eq!(before.ids(), after.ids());
    assert_eq!(before.len(), after.len());
    assert_eq!(before.dimension(), after.dimension());
    assert_eq!(before.kind(), after.kind());
    assert_eq!(
        before.search(query, 5).unwrap(),
        after.search(query, 5).unwrap()
    );
}

#[test]
fn test_cpu_round_trip() {
    let env = TestStore::new();
    let vectors = random_vectors(40, 24, 21);
    let mut provider = env.provider(24, VectorConfig::default());
    provider.add(&vectors, &chunk_ids("c", 40)).unwrap();
    provider.save().unwrap();

    let loaded = VectorIndexProvider::load(
        env.layout(),
        Some(24),
        VectorConfig::default(),
        Arc::new(NoDevice),
    )
    .unwrap()
    .expect("saved index should load");

    assert_eq!(loaded.residency(), Residency::Cpu);
    assert_same_state(&provider, &loaded, &vectors[7]);
}

#[test]
fn test_gpu_round_trip() {
    let env = TestStore::new();
    let device = SimulatedDevice::new(1 << 20);
    let config = VectorConfig {
        prefer_gpu: true,
        ..VectorConfig::default()
    };
    let vectors = random_vectors(40, 24, 22);

    let mut provider = env.provider_on(24, config.clone(), Arc::new(device.clone()));
    assert_eq!(provider.residency(), Residency::Gpu);
    provider.add(&vectors, &chunk_ids("c", 40)).unwrap();
    provider.save().unwrap();
    assert_eq!(device.used_bytes(), 40 * 24 * 4);

    let expected_ids = provider.ids().to_vec();
    let expected_hits = provider.search(&vectors[3], 5).unwrap();
    drop(provider);
    assert_eq!(device.used_bytes(), 0);

    let loaded = VectorIndexProvider::load(env.layout(), Some(24), config, Arc::new(device.clone()))
        .unwrap()
        .expect("saved index should load");
    assert_eq!(loaded.residency(), Residency::Gpu);
    assert_eq!(loaded.ids(), expected_ids.as_slice());
    assert_eq!(loaded.search(&vectors[3], 5).unwrap(), expected_hits);
    assert_eq!(device.used_bytes(), 40 * 24 * 4);
}

#[test]
fn test_gpu_state_loads_on_cpu_only_host() {
    let env = TestStore::new();
    let config = VectorConfig {
        prefer_gpu: true,
        ..VectorConfig::default()
    };
    let vectors = random_vectors(10, 8, 23);
    let mut provider = env.provider_on(8, config.clone(), Arc::new(SimulatedDevice::new(1 << 16)));
    provider.add(&vectors, &chunk_ids("c", 10)).unwrap();
    provider.save().unwrap();

    let loaded = VectorIndexProvider::load(env.layout(), Some(8), config, Arc::new(NoDevice))
        .unwrap()
        .unwrap();
    assert_eq!(loaded.residency(), Residency::Cpu);
    assert_same_state(&provider, &loaded, &vectors[0]);
}

#[test]
fn test_mmap_cache_created_exactly_at_threshold() {
    let env = TestStore::new();
    let config = VectorConfig {
        mmap_cache_threshold: 10,
        ..VectorConfig::default()
    };
    let mut provider = env.provider(8, config);
    provider
        .add(&random_vectors(10, 8, 31), &chunk_ids("c", 10))
        .unwrap();
    provider.save().unwrap();

    assert!(env.layout().binary_cache_file().exists());
    assert!(provider.binary_cache_active());
}

#[test]
fn test_mmap_cache_absent_one_below_threshold() {
    let env = TestStore::new();
    let config = VectorConfig {
        mmap_cache_threshold: 10,
        ..VectorConfig::default()
    };
    let mut provider = env.provider(8, config);
    provider
        .add(&random_vectors(9, 8, 32), &chunk_ids("c", 9))
        .unwrap();
    provider.save().unwrap();

    assert!(!env.layout().binary_cache_file().exists());
    assert!(!provider.binary_cache_active());
}

#[test]
fn test_stale_mmap_cache_is_removed_below_threshold() {
    let env = TestStore::new();
    let config = VectorConfig {
        mmap_cache_threshold: 10,
        ..VectorConfig::default()
    };
    let mut provider = env.provider(8, config.clone());
    provider
        .add(&random_vectors(10, 8, 33), &chunk_ids("c", 10))
        .unwrap();
    provider.save().unwrap();
    assert!(env.layout().binary_cache_file().exists());
    drop(provider);

    let mut smaller = env.provider(8, config);
    smaller
        .add(&random_vectors(9, 8, 34), &chunk_ids("d", 9))
        .unwrap();
    smaller.save().unwrap();
    assert!(!env.layout().binary_cache_file().exists());
}

#[test]
fn test_mismatched_cache_is_ignored_on_load() {
    let env = TestStore::new();
    let config = VectorConfig {
        mmap_cache_threshold: 5,
        ..VectorConfig::default()
    };
    let mut provider = env.provider(8, config.clone());
    provider
        .add(&random_vectors(6, 8, 35), &chunk_ids("c", 6))
        .unwrap();
    provider.save().unwrap();
    drop(provider);

    // Rewrite the cache with fewer records than the index holds
    let mut cache = codevec::BinaryVectorCache::new(env.layout().binary_cache_file(), 8);
    cache
        .save(&random_vectors(2, 8, 36), &chunk_ids("c", 2), None)
        .unwrap();
    cache.close();

    let loaded = VectorIndexProvider::load(env.layout(), Some(8), config, Arc::new(NoDevice))
        .unwrap()
        .unwrap();
    assert_eq!(loaded.len(), 6);
    assert!(!loaded.binary_cache_active());
    assert!(loaded.reconstruct(5).is_ok());
}

/// Index file with a valid header around a hand-encoded body.
fn write_framed_index(env: &TestStore, dimension: u32, kind_tag: u32, body: &[u8], ids: &str) {
    let layout = env.layout();
    let mut bytes = b"CVIX".to_vec();
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&dimension.to_le_bytes());
    bytes.extend_from_slice(&kind_tag.to_le_bytes());
    bytes.extend_from_slice(body);
    std::fs::write(layout.index_file(), bytes).unwrap();
    std::fs::write(layout.ids_file(), ids).unwrap();
}

fn push_floats(body: &mut Vec<u8>, values: &[f32]) {
    body.push(values.len() as u8);
    for value in values {
        body.extend_from_slice(&value.to_le_bytes());
    }
}

#[test]
fn test_zero_dimension_index_is_discarded() {
    let env = TestStore::new();
    // dimension 0, Flat, four values, no partitions
    let mut body = vec![0u8, 0];
    push_floats(&mut body, &[1.0; 4]);
    body.push(0);
    write_framed_index(&env, 0, 0, &body, "[]");

    let loaded =
        VectorIndexProvider::load(env.layout(), None, VectorConfig::default(), Arc::new(NoDevice))
            .unwrap();
    assert!(loaded.is_none());
}

#[test]
fn test_index_with_mismatched_partition_lists_is_discarded() {
    let env = TestStore::new();
    // dimension 2, IvfFlat { nlist: 2 }, two rows, two centroids but one list
    let mut body = vec![2u8, 1, 2];
    push_floats(&mut body, &[1.0, 0.0, 0.0, 1.0]);
    body.push(1);
    push_floats(&mut body, &[1.0, 0.0, 0.0, 1.0]);
    body.extend_from_slice(&[1, 2, 0, 1]);
    write_framed_index(&env, 2, 1, &body, r#"["c0","c1"]"#);

    let loaded = VectorIndexProvider::load(
        env.layout(),
        Some(2),
        VectorConfig::default(),
        Arc::new(NoDevice),
    )
    .unwrap();
    assert!(loaded.is_none());

    // Opening through the store starts over with an empty index
    let store = env.store("test-model", 2);
    assert!(store.is_empty());
    assert!(store.search(&[1.0, 0.0], 1, None).is_err());
}
