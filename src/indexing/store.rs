//! Chunk store facade: one commit unit per ingestion batch, queries that
//! resolve attributes through the metadata store, and the maintenance
//! operations (remove, validate, save, clear).
//!
//! Within a commit unit the vector index is mutated first and metadata is
//! committed last, so an interruption leaves "vectors present, metadata
//! stale" rather than silently losing vectors.

use crate::config::Settings;
use crate::error::{StoreError, StoreResult};
use crate::indexing::consistency::{self, ConsistencyReport};
use crate::indexing::rebuild::{self, RebuildPolicy, RemovalReport, RemovalTargets};
use crate::indexing::sync::{LexicalDocCount, SyncMonitor, SyncStatus};
use crate::storage::metadata::{ChunkRecord, MetadataStore};
use crate::storage::persistence::{ModelInfo, StorageLayout};
use crate::types::{ATTR_FILE_PATH, Attributes, ChunkId, Position, normalize_path};
use crate::vector::{DeviceBackend, IndexKind, Neighbor, Residency, VectorIndexProvider};
use serde::Serialize;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Filtered searches fetch this many times `k` candidates per round.
const OVERFETCH_FACTOR: usize = 4;

/// A ranked search hit with its attributes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub score: f32,
    pub position: Position,
    pub attributes: Attributes,
}

/// Constraints applied to search hits after scoring
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Attribute values that must match exactly
    pub attributes: Attributes,
    /// Only chunks whose `file_path` starts with this prefix
    pub path_prefix: Option<String>,
    /// Drop hits scoring below this
    pub min_score: Option<f32>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.path_prefix.is_none() && self.min_score.is_none()
    }

    fn accepts(&self, chunk_id: &ChunkId, attributes: &Attributes, score: f32) -> bool {
        if self.min_score.is_some_and(|min| score < min) {
            return false;
        }
        if !self
            .attributes
            .iter()
            .all(|(key, value)| attributes.get(key) == Some(value))
        {
            return false;
        }
        match &self.path_prefix {
            None => true,
            Some(prefix) => {
                let path = attributes
                    .get(ATTR_FILE_PATH)
                    .and_then(|v| v.as_str())
                    .or_else(|| chunk_id.path());
                path.is_some_and(|p| normalize_path(p).starts_with(&normalize_path(prefix)))
            }
        }
    }
}

/// Store-wide counters for status output
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub base_path: PathBuf,
    pub model_name: String,
    pub dimension: usize,
    pub vector_count: usize,
    pub metadata_count: usize,
    pub cached_identifiers: usize,
    pub index_kind: String,
    pub trained: bool,
    pub partitions: usize,
    pub residency: Residency,
    pub device: String,
    pub binary_cache_loaded: bool,
    pub vector_bytes: usize,
}

pub struct ChunkStore {
    settings: Arc<Settings>,
    layout: StorageLayout,
    model: ModelInfo,
    provider: VectorIndexProvider,
    metadata: MetadataStore,
    sync: SyncMonitor,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore")
            .field("layout", &self.layout)
            .field("model", &self.model.model_name)
            .field("provider", &self.provider)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl ChunkStore {
    /// Open the store in `base_path` for embeddings from `model_name`.
    ///
    /// Fails with `DimensionMismatch` when the directory already holds
    /// vectors from a model of a different dimension.
    pub fn open(
        settings: Arc<Settings>,
        base_path: impl Into<PathBuf>,
        model_name: &str,
        dimension: usize,
        device: Arc<dyn DeviceBackend>,
    ) -> StoreResult<Self> {
        let layout = StorageLayout::new(base_path);
        layout.ensure_dir()?;

        let model = match ModelInfo::load(&layout)? {
            Some(stored) => {
                stored.validate(Some(model_name), dimension)?;
                if stored.model_name != model_name {
                    warn!(
                        "Store was built with '{}', opening with '{model_name}' of the same dimension",
                        stored.model_name
                    );
                }
                stored
            }
            None => ModelInfo::new(model_name, dimension),
        };

        let metadata = MetadataStore::open(
            layout.metadata_file(),
            layout.symbol_cache_file(),
            settings.symbol_cache_buckets(),
        )?;
        let kind = IndexKind::select(0, settings.vector.ivf_threshold, settings.vector.ivf_nlist);
        let provider = VectorIndexProvider::open_or_create(
            layout.clone(),
            dimension,
            kind,
            settings.vector.clone(),
            device,
        )?;

        let metadata_count = metadata.count()?;
        if metadata_count != provider.len() {
            warn!(
                "Index holds {} vectors but metadata holds {metadata_count} records; run validate or reindex",
                provider.len()
            );
        }

        let sync = SyncMonitor::new(settings.sync.clone());
        Ok(Self {
            settings,
            layout,
            model,
            provider,
            metadata,
            sync,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn model_info(&self) -> &ModelInfo {
        &self.model
    }

    pub fn provider(&self) -> &VectorIndexProvider {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut VectorIndexProvider {
        &mut self.provider
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn sync_monitor_mut(&mut self) -> &mut SyncMonitor {
        &mut self.sync
    }

    pub fn len(&self) -> usize {
        self.provider.len()
    }

    pub fn is_empty(&self) -> bool {
        self.provider.is_empty()
    }

    /// Index one batch: vectors, then metadata, then a single commit.
    pub fn add(
        &mut self,
        vectors: &[Vec<f32>],
        ids: &[ChunkId],
        attributes: &[Attributes],
    ) -> StoreResult<Range<Position>> {
        if attributes.len() != ids.len() {
            return Err(StoreError::InvalidInput(format!(
                "{} identifiers but {} attribute maps",
                ids.len(),
                attributes.len()
            )));
        }
        for vector in vectors {
            self.model.validate(None, vector.len())?;
        }

        let positions = self.provider.add(vectors, ids)?;
        for ((id, attrs), position) in ids.iter().zip(attributes).zip(positions.clone()) {
            self.metadata.set(id, position, attrs)?;
        }

        let wanted = self.provider.select_kind(self.provider.len());
        if wanted.is_partitioned() != self.provider.kind().is_partitioned() {
            self.provider.convert_kind(wanted);
        }

        if self.settings.metadata.persist_on_commit {
            self.save_index()?;
        }
        if !self.metadata.commit() {
            warn!("Metadata commit failed after adding {} chunks", ids.len());
        }
        debug!("Committed {} chunks at positions {positions:?}", ids.len());
        Ok(positions)
    }

    /// Top-`k` chunks for `query`, optionally filtered.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> StoreResult<Vec<SearchResult>> {
        let filter = filter.filter(|f| !f.is_empty());
        let Some(filter) = filter else {
            let neighbors = self.provider.search(query, k)?;
            return Ok(self.resolve(&neighbors, None, k));
        };

        let total = self.provider.len();
        let mut fetch = k.saturating_mul(OVERFETCH_FACTOR).max(k);
        loop {
            let neighbors = self.provider.search(query, fetch.min(total))?;
            let results = self.resolve(&neighbors, Some(filter), k);
            if results.len() >= k || fetch >= total {
                return Ok(results);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    fn resolve(
        &self,
        neighbors: &[Neighbor],
        filter: Option<&SearchFilter>,
        k: usize,
    ) -> Vec<SearchResult> {
        let mut results = Vec::with_capacity(k.min(neighbors.len()));
        for neighbor in neighbors {
            let Some(chunk_id) = self.provider.id_at(neighbor.position) else {
                continue;
            };
            let attributes = match self.metadata.get(chunk_id.as_str()) {
                Some(record) => record.attributes,
                None => {
                    debug!("No metadata for {chunk_id}, returning bare hit");
                    Attributes::new()
                }
            };
            if filter.is_some_and(|f| !f.accepts(chunk_id, &attributes, neighbor.score)) {
                continue;
            }
            results.push(SearchResult {
                chunk_id: chunk_id.clone(),
                score: neighbor.score,
                position: neighbor.position,
                attributes,
            });
            if results.len() == k {
                break;
            }
        }
        results
    }

    /// Attributes of any spelling of `chunk_id`.
    pub fn get_chunk(&self, chunk_id: &str) -> Option<Attributes> {
        self.metadata.get(chunk_id).map(|record| record.attributes)
    }

    pub fn get_record(&self, chunk_id: &str) -> Option<ChunkRecord> {
        self.metadata.get(chunk_id)
    }

    /// Chunk defining the bare symbol `name`.
    pub fn find_by_symbol(&self, name: &str) -> Option<ChunkRecord> {
        self.metadata.find_by_symbol(name)
    }

    fn indexed_position(&self, chunk_id: &str) -> Option<(ChunkId, Position)> {
        let canonical = match self.metadata.get(chunk_id) {
            Some(record) => record.chunk_id,
            None => ChunkId::new(chunk_id),
        };
        let position = self.provider.position_of(&canonical)?;
        Some((canonical, position))
    }

    /// The `k` chunks most similar to `chunk_id`, excluding itself.
    /// Unknown identifiers yield an empty list.
    pub fn get_similar(&self, chunk_id: &str, k: usize) -> StoreResult<Vec<SearchResult>> {
        let Some((canonical, position)) = self.indexed_position(chunk_id) else {
            debug!("get_similar: {chunk_id} is not indexed");
            return Ok(Vec::new());
        };
        let query = self.provider.reconstruct(position)?;
        let neighbors = self.provider.search(&query, k.saturating_add(1))?;
        Ok(self.without_self(&neighbors, &canonical, k))
    }

    /// `get_similar` for many identifiers with one combined query.
    pub fn get_similar_batch(
        &self,
        chunk_ids: &[&str],
        k: usize,
    ) -> StoreResult<Vec<Vec<SearchResult>>> {
        let resolved: Vec<Option<(ChunkId, Position)>> =
            chunk_ids.iter().map(|id| self.indexed_position(id)).collect();

        let mut queries = Vec::new();
        for (_, position) in resolved.iter().flatten() {
            queries.push(self.provider.reconstruct(*position)?);
        }
        if queries.is_empty() {
            return Ok(vec![Vec::new(); chunk_ids.len()]);
        }

        let mut batches = self
            .provider
            .search_batch(&queries, k.saturating_add(1))?
            .into_iter();
        Ok(resolved
            .iter()
            .map(|entry| match entry {
                Some((canonical, _)) => batches
                    .next()
                    .map(|neighbors| self.without_self(&neighbors, canonical, k))
                    .unwrap_or_default(),
                None => Vec::new(),
            })
            .collect())
    }

    fn without_self(&self, neighbors: &[Neighbor], this: &ChunkId, k: usize) -> Vec<SearchResult> {
        let mut results = self.resolve(neighbors, None, k.saturating_add(1));
        results.retain(|r| &r.chunk_id != this);
        results.truncate(k);
        results
    }

    /// Remove chunks by file path or identifier.
    pub fn remove<S: AsRef<str>>(
        &mut self,
        targets: &[S],
        project_id: Option<&str>,
        policy: RebuildPolicy,
    ) -> StoreResult<RemovalReport> {
        let targets = RemovalTargets::new(targets, project_id);
        let report = rebuild::remove_chunks(&mut self.provider, &self.metadata, &targets, policy)?;
        if (report.removed > 0 || report.cleared) && self.settings.metadata.persist_on_commit {
            self.save_index()?;
        }
        Ok(report)
    }

    /// Check every cross-structure invariant.
    pub fn validate(&self) -> StoreResult<ConsistencyReport> {
        consistency::check(&self.provider, &self.metadata)
    }

    fn save_index(&mut self) -> StoreResult<()> {
        self.provider.save()?;
        self.model.update(self.provider.len());
        self.model.save(&self.layout)
    }

    /// Persist the index, model info and metadata.
    pub fn save(&mut self) -> StoreResult<()> {
        self.save_index()?;
        if !self.metadata.commit() {
            warn!("Metadata commit failed during save");
        }
        Ok(())
    }

    /// Drop every vector and record and delete all on-disk artifacts.
    ///
    /// Device memory, the binary cache mapping and the database handle are
    /// released before any file is unlinked.
    pub fn clear(&mut self) -> StoreResult<()> {
        let kind = self.provider.select_kind(0);
        self.provider.reset(kind);
        self.metadata.close();

        self.layout.remove_all()?;
        self.metadata = MetadataStore::open(
            self.layout.metadata_file(),
            self.layout.symbol_cache_file(),
            self.settings.symbol_cache_buckets(),
        )?;
        self.model.update(0);
        info!("Cleared store at {}", self.layout.base_path().display());
        Ok(())
    }

    /// Compare the lexical document count with the vector count.
    pub fn check_sync(&self, lexical: &dyn LexicalDocCount) -> Option<SyncStatus> {
        self.sync.check(lexical, self.provider.len())
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let provider = self.provider.stats();
        Ok(StoreStats {
            base_path: self.layout.base_path().to_path_buf(),
            model_name: self.model.model_name.clone(),
            dimension: provider.dimension,
            vector_count: provider.vector_count,
            metadata_count: self.metadata.count()?,
            cached_identifiers: self.metadata.symbol_cache().len(),
            index_kind: provider.kind.to_string(),
            trained: provider.trained,
            partitions: provider.partitions,
            residency: provider.residency,
            device: provider.device,
            binary_cache_loaded: provider.binary_cache_loaded,
            vector_bytes: provider.vector_bytes,
        })
    }

    /// Release device memory, unmap caches and close the database.
    pub fn close(&mut self) {
        self.provider.close();
        self.metadata.close();
    }
}
