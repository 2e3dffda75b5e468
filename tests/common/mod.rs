use codevec::config::VectorConfig;
use codevec::{
    Attributes, ChunkId, ChunkStore, DeviceBackend, IndexKind, NoDevice, Settings, StorageLayout,
    VectorIndexProvider,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestStore {
    pub dir: TempDir,
}

impl TestStore {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(self.dir.path())
    }

    pub fn provider(&self, dimension: usize, config: VectorConfig) -> VectorIndexProvider {
        self.provider_on(dimension, config, Arc::new(NoDevice))
    }

    pub fn provider_on(
        &self,
        dimension: usize,
        config: VectorConfig,
        device: Arc<dyn DeviceBackend>,
    ) -> VectorIndexProvider {
        VectorIndexProvider::create(self.layout(), dimension, IndexKind::Flat, config, device)
            .expect("Failed to create provider")
    }

    pub fn store(&self, model: &str, dimension: usize) -> ChunkStore {
        self.store_with(Settings::default(), model, dimension)
    }

    pub fn store_with(&self, settings: Settings, model: &str, dimension: usize) -> ChunkStore {
        ChunkStore::open(
            Arc::new(settings),
            self.dir.path(),
            model,
            dimension,
            Arc::new(NoDevice),
        )
        .expect("Failed to open store")
    }
}

/// `count` random vectors of `dimension`, reproducible per `seed`.
pub fn random_vectors(count: usize, dimension: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            (0..dimension)
                .map(|_| rng.random_range(-1.0f32..1.0))
                .collect()
        })
        .collect()
}

pub fn chunk_ids(prefix: &str, count: usize) -> Vec<ChunkId> {
    (0..count).map(|i| ChunkId::new(format!("{prefix}{i}"))).collect()
}

pub fn empty_attributes(count: usize) -> Vec<Attributes> {
    vec![Attributes::new(); count]
}

pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}
