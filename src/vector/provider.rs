//! Vector index provider: owns the ANN structure, its dimension, device
//! residency and the position-to-identifier array.
//!
//! # Index file format
//!
//! - Header (16 bytes): magic `CVIX`, version, dimension, kind tag (u32 LE)
//! - Body: bincode encoding of the ANN structure
//!
//! The identifier array is stored beside it as JSON, one entry per position.

use crate::config::VectorConfig;
use crate::error::{StoreError, StoreResult};
use crate::storage::binary_cache::BinaryVectorCache;
use crate::storage::persistence::{StorageLayout, write_replacing};
use crate::types::{ChunkId, Position};
use crate::vector::ann::AnnIndex;
use crate::vector::device::DeviceBackend;
use crate::vector::types::{IndexKind, Neighbor, Residency, VectorDimension, normalized};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INDEX_MAGIC: &[u8; 4] = b"CVIX";
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_SIZE: usize = 16;

/// Snapshot of provider state for status reporting
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStats {
    pub vector_count: usize,
    pub dimension: usize,
    pub kind: IndexKind,
    pub trained: bool,
    pub partitions: usize,
    pub residency: Residency,
    pub device: String,
    pub binary_cache_loaded: bool,
    pub vector_bytes: usize,
}

pub struct VectorIndexProvider {
    layout: StorageLayout,
    index: AnnIndex,
    ids: Vec<ChunkId>,
    positions: HashMap<ChunkId, Position>,
    residency: Residency,
    device: Arc<dyn DeviceBackend>,
    device_bytes: usize,
    binary_cache: BinaryVectorCache,
    config: VectorConfig,
}

impl std::fmt::Debug for VectorIndexProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndexProvider")
            .field("base_path", &self.layout.base_path())
            .field("dimension", &self.index.dimension())
            .field("kind", &self.index.kind())
            .field("len", &self.ids.len())
            .field("residency", &self.residency)
            .finish()
    }
}

impl VectorIndexProvider {
    /// Allocate an empty index of `dimension` and `kind`.
    pub fn create(
        layout: StorageLayout,
        dimension: usize,
        kind: IndexKind,
        config: VectorConfig,
        device: Arc<dyn DeviceBackend>,
    ) -> StoreResult<Self> {
        let dimension = VectorDimension::new(dimension)?;
        let binary_cache = BinaryVectorCache::new(layout.binary_cache_file(), dimension.get());
        let mut provider = Self {
            layout,
            index: AnnIndex::new(dimension, kind),
            ids: Vec::new(),
            positions: HashMap::new(),
            residency: Residency::Cpu,
            device,
            device_bytes: 0,
            binary_cache,
            config,
        };
        if provider.config.prefer_gpu {
            provider.move_to_gpu();
        }
        debug!("Created {kind} index with dimension {dimension}");
        Ok(provider)
    }

    /// Load a persisted index, or create an empty one when none is usable.
    pub fn open_or_create(
        layout: StorageLayout,
        dimension: usize,
        kind: IndexKind,
        config: VectorConfig,
        device: Arc<dyn DeviceBackend>,
    ) -> StoreResult<Self> {
        match Self::load(layout.clone(), Some(dimension), config.clone(), device.clone())? {
            Some(provider) => Ok(provider),
            None => Self::create(layout, dimension, kind, config, device),
        }
    }

    pub fn dimension(&self) -> usize {
        self.index.dimension().get()
    }

    pub fn kind(&self) -> IndexKind {
        self.index.kind()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        self.index.is_trained()
    }

    /// Number of vectors held by the ANN structure itself.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Identifier array, one entry per position.
    pub fn ids(&self) -> &[ChunkId] {
        &self.ids
    }

    pub fn id_at(&self, position: Position) -> Option<&ChunkId> {
        self.ids.get(position)
    }

    pub fn position_of(&self, id: &ChunkId) -> Option<Position> {
        self.positions.get(id).copied()
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.positions.contains_key(id)
    }

    /// Whether reconstruction is currently served from the binary cache.
    pub fn binary_cache_active(&self) -> bool {
        self.binary_cache.is_loaded() && self.binary_cache.count() == self.ids.len()
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            vector_count: self.len(),
            dimension: self.dimension(),
            kind: self.kind(),
            trained: self.is_trained(),
            partitions: self.index.partition_count(),
            residency: self.residency,
            device: self.device.name().to_string(),
            binary_cache_loaded: self.binary_cache_active(),
            vector_bytes: self.index.vector_bytes(),
        }
    }

    /// Check that `vectors` and `ids` could be added, without mutating.
    pub fn validate_batch(&self, vectors: &[Vec<f32>], ids: &[ChunkId]) -> StoreResult<()> {
        if vectors.len() != ids.len() {
            return Err(StoreError::InvalidInput(format!(
                "{} vectors but {} identifiers",
                vectors.len(),
                ids.len()
            )));
        }
        self.index.dimension().validate_batch(vectors)?;

        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if self.positions.contains_key(id) || !seen.insert(id) {
                return Err(StoreError::DuplicateChunk(id.to_string()));
            }
        }
        Ok(())
    }

    /// Normalize and append `vectors`, returning the positions they occupy.
    ///
    /// Dimension, duplicate and memory checks all run before the index is
    /// touched; on error nothing has changed.
    pub fn add(&mut self, vectors: &[Vec<f32>], ids: &[ChunkId]) -> StoreResult<Range<Position>> {
        self.validate_batch(vectors, ids)?;
        let start = self.ids.len();
        if vectors.is_empty() {
            return Ok(start..start);
        }

        let reserved = self.preflight(vectors.len())?;
        let rows: Vec<Vec<f32>> = vectors.iter().map(|v| normalized(v)).collect();

        self.index.append(&rows);
        for (offset, id) in ids.iter().enumerate() {
            self.positions.insert(id.clone(), start + offset);
            self.ids.push(id.clone());
        }
        self.device_bytes += reserved;

        if let Err(e) = self.index.maybe_train() {
            warn!("IVF training failed, serving exhaustive search: {e}");
        }

        debug!("Added {} vectors, index now holds {}", rows.len(), self.ids.len());
        Ok(start..self.ids.len())
    }

    /// Memory pre-flight for `rows` more vectors. Returns the device bytes
    /// reserved, which the caller owns from then on.
    fn preflight(&mut self, rows: usize) -> StoreResult<usize> {
        let bytes = self.index.dimension().bytes_for(rows);

        if let Some(limit) = self.config.memory_limit_bytes() {
            let wanted = self.index.vector_bytes().saturating_add(bytes);
            if wanted > limit {
                return Err(StoreError::InsufficientMemory {
                    requested_bytes: bytes,
                    reason: format!("index would hold {wanted} bytes, limit is {limit}"),
                });
            }
        }

        let mut device_reserved = 0;
        if self.residency == Residency::Gpu {
            self.device
                .reserve(bytes)
                .map_err(|reason| StoreError::InsufficientMemory {
                    requested_bytes: bytes,
                    reason: format!("{} device: {reason}", self.device.name()),
                })?;
            device_reserved = bytes;
        }

        let host = self
            .index
            .try_reserve(rows)
            .and_then(|()| self.ids.try_reserve(rows));
        if let Err(e) = host {
            if device_reserved > 0 {
                self.device.release(device_reserved);
            }
            return Err(StoreError::InsufficientMemory {
                requested_bytes: bytes,
                reason: e.to_string(),
            });
        }
        Ok(device_reserved)
    }

    fn prepare_query(&self, query: &[f32]) -> StoreResult<Vec<f32>> {
        if self.is_empty() {
            return Err(StoreError::IndexAbsentOrEmpty);
        }
        self.index.dimension().validate_vector(query)?;
        Ok(normalized(query))
    }

    /// Top-`k` positions by cosine similarity.
    pub fn search(&self, query: &[f32], k: usize) -> StoreResult<Vec<Neighbor>> {
        let query = self.prepare_query(query)?;
        Ok(self.index.search(&query, k, self.config.ivf_nprobe))
    }

    /// One combined query for many vectors.
    pub fn search_batch(&self, queries: &[Vec<f32>], k: usize) -> StoreResult<Vec<Vec<Neighbor>>> {
        let prepared = queries
            .iter()
            .map(|q| self.prepare_query(q))
            .collect::<StoreResult<Vec<_>>>()?;
        let nprobe = self.config.ivf_nprobe;
        Ok(prepared
            .par_iter()
            .map(|q| self.index.search(q, k, nprobe))
            .collect())
    }

    /// Stored (unit-length) vector at `position`.
    ///
    /// Served from the binary cache when it is loaded and in step with the
    /// index, otherwise from the ANN structure.
    pub fn reconstruct(&self, position: Position) -> StoreResult<Vec<f32>> {
        if position >= self.ids.len() {
            return Err(StoreError::InvalidInput(format!(
                "position {position} is out of range for {} vectors",
                self.ids.len()
            )));
        }

        if self.binary_cache_active() {
            if let Some(vector) = self.binary_cache.get_vector(position) {
                return Ok(vector);
            }
            debug!("Binary cache miss at position {position}, using index");
        }

        self.index.reconstruct(position).ok_or_else(|| {
            StoreError::ConsistencyFault {
                issues: vec![format!(
                    "identifier array has {} entries but the index cannot reconstruct position {position}",
                    self.ids.len()
                )],
            }
        })
    }

    /// Lazily reconstruct many positions, pairing each with its outcome.
    pub fn reconstruct_iter<I>(
        &self,
        positions: I,
    ) -> impl Iterator<Item = (Position, StoreResult<Vec<f32>>)>
    where
        I: IntoIterator<Item = Position>,
    {
        positions
            .into_iter()
            .map(move |position| (position, self.reconstruct(position)))
    }

    /// Try to make the index device-resident. Returns whether it now is.
    pub fn move_to_gpu(&mut self) -> bool {
        if self.residency == Residency::Gpu {
            return true;
        }
        if !self.device.is_available() {
            debug!("No accelerator available, index stays on CPU");
            return false;
        }

        let bytes = self.index.vector_bytes();
        match self.device.reserve(bytes) {
            Ok(()) => {
                self.device_bytes = bytes;
                self.residency = Residency::Gpu;
                debug!("Moved index to {} device ({bytes} bytes)", self.device.name());
                true
            }
            Err(reason) => {
                debug!("GPU transfer failed, index stays on CPU: {reason}");
                false
            }
        }
    }

    /// Release any device copy. Always succeeds.
    pub fn move_to_cpu(&mut self) -> bool {
        if self.residency == Residency::Gpu {
            self.device.release(self.device_bytes);
            self.device_bytes = 0;
            self.residency = Residency::Cpu;
            debug!("Moved index back to CPU");
        }
        true
    }

    /// Drop every vector and identifier and release device memory. Files
    /// on disk are left alone.
    pub fn clear(&mut self) {
        self.move_to_cpu();
        self.binary_cache.close();
        self.index = AnnIndex::new(self.index.dimension(), self.index.kind());
        self.ids.clear();
        self.positions.clear();
    }

    /// Clear, then recreate empty with `kind` at the same dimension.
    pub fn reset(&mut self, kind: IndexKind) {
        self.clear();
        self.index = AnnIndex::new(self.index.dimension(), kind);
    }

    /// Discard and retrain IVF partitions over the current vectors.
    pub fn retrain(&mut self) -> bool {
        match self.index.retrain() {
            Ok(trained) => trained,
            Err(e) => {
                warn!("IVF retraining failed: {e}");
                false
            }
        }
    }

    /// Index kind the configuration asks for at `count` vectors.
    pub fn select_kind(&self, count: usize) -> IndexKind {
        IndexKind::select(count, self.config.ivf_threshold, self.config.ivf_nlist)
    }

    /// Rebuild the ANN structure as `kind`, keeping every position.
    pub fn convert_kind(&mut self, kind: IndexKind) {
        if self.index.kind() == kind {
            return;
        }
        let rows = self.index.rows();
        let mut index = AnnIndex::new(self.index.dimension(), kind);
        index.append(&rows);
        if let Err(e) = index.maybe_train() {
            warn!("IVF training failed, serving exhaustive search: {e}");
        }
        info!(
            "Converted index from {} to {kind} at {} vectors",
            self.index.kind(),
            rows.len()
        );
        self.index = index;
    }

    /// Unmap and delete the binary cache; positions it holds are stale.
    pub fn invalidate_binary_cache(&mut self) -> StoreResult<()> {
        self.binary_cache.remove_file()
    }

    pub fn config(&self) -> &VectorConfig {
        &self.config
    }

    /// Release the device and unmap the binary cache.
    pub fn close(&mut self) {
        self.move_to_cpu();
        self.binary_cache.close();
    }

    /// Persist the index, the identifier array and (above the configured
    /// threshold) the binary vector cache.
    pub fn save(&mut self) -> StoreResult<()> {
        self.layout.ensure_dir()?;
        if self.residency == Residency::Gpu {
            debug!("Serializing host copy of device-resident index");
        }

        let mut bytes = Vec::with_capacity(INDEX_HEADER_SIZE + self.index.vector_bytes());
        bytes.extend_from_slice(INDEX_MAGIC);
        bytes.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dimension() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.kind().tag().to_le_bytes());
        let body = bincode::encode_to_vec(&self.index, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(format!("Failed to encode index: {e}")))?;
        bytes.extend_from_slice(&body);
        write_replacing(&self.layout.index_file(), &bytes)?;

        let ids = serde_json::to_vec(&self.ids)
            .map_err(|e| StoreError::Serialization(format!("Failed to encode identifiers: {e}")))?;
        write_replacing(&self.layout.ids_file(), &ids)?;

        self.save_binary_cache()?;
        info!(
            "Saved {} index with {} vectors to {}",
            self.kind(),
            self.len(),
            self.layout.base_path().display()
        );
        Ok(())
    }

    fn save_binary_cache(&mut self) -> StoreResult<()> {
        if self.len() >= self.config.mmap_cache_threshold {
            self.binary_cache.save(&self.index.rows(), &self.ids, None)?;
            if !self.binary_cache.load()? {
                warn!("Binary vector cache was written but could not be mapped");
            }
        } else if self.binary_cache.exists() {
            debug!(
                "{} vectors is below the cache threshold {}, removing stale binary cache",
                self.len(),
                self.config.mmap_cache_threshold
            );
            self.binary_cache.remove_file()?;
        }
        Ok(())
    }

    /// Load a persisted index.
    ///
    /// Returns `Ok(None)` when no index exists, or when the stored one is
    /// unreadable or its dimension disagrees with `dimension_hint`; such an
    /// index is discarded with a warning rather than failing.
    pub fn load(
        layout: StorageLayout,
        dimension_hint: Option<usize>,
        config: VectorConfig,
        device: Arc<dyn DeviceBackend>,
    ) -> StoreResult<Option<Self>> {
        let index_path = layout.index_file();
        if !index_path.exists() {
            return Ok(None);
        }

        let bytes = std::fs::read(&index_path).map_err(|e| StoreError::io(&index_path, e))?;
        let index = match decode_index(&bytes) {
            Ok(index) => index,
            Err(reason) => {
                warn!("Discarding unreadable index {}: {reason}", index_path.display());
                return Ok(None);
            }
        };

        if let Some(expected) = dimension_hint {
            if index.dimension().get() != expected {
                warn!(
                    "Discarding index {}: stored dimension {} does not match expected {expected}",
                    index_path.display(),
                    index.dimension()
                );
                return Ok(None);
            }
        }

        let ids_path = layout.ids_file();
        let ids: Vec<ChunkId> = match std::fs::read(&ids_path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("Discarding index: unreadable identifier list {}: {e}", ids_path.display());
                    return Ok(None);
                }
            },
            Err(e) => {
                warn!("Discarding index: missing identifier list {}: {e}", ids_path.display());
                return Ok(None);
            }
        };

        if ids.len() != index.len() {
            warn!(
                "Discarding index: {} vectors but {} identifiers",
                index.len(),
                ids.len()
            );
            return Ok(None);
        }

        let positions = ids
            .iter()
            .enumerate()
            .map(|(position, id)| (id.clone(), position))
            .collect::<HashMap<_, _>>();
        if positions.len() != ids.len() {
            warn!("Discarding index: identifier list contains duplicates");
            return Ok(None);
        }

        let mut binary_cache =
            BinaryVectorCache::new(layout.binary_cache_file(), index.dimension().get());
        match binary_cache.load() {
            Ok(true) if binary_cache.count() != ids.len() => {
                debug!(
                    "Binary cache holds {} vectors, index holds {}; ignoring it",
                    binary_cache.count(),
                    ids.len()
                );
                binary_cache.close();
            }
            Ok(_) => {}
            Err(e) => warn!("Binary vector cache unavailable: {e}"),
        }

        let mut provider = Self {
            layout,
            index,
            ids,
            positions,
            residency: Residency::Cpu,
            device,
            device_bytes: 0,
            binary_cache,
            config,
        };
        if provider.config.prefer_gpu {
            provider.move_to_gpu();
        }

        info!(
            "Loaded {} index with {} vectors (dimension {})",
            provider.kind(),
            provider.len(),
            provider.dimension()
        );
        Ok(Some(provider))
    }
}

impl Drop for VectorIndexProvider {
    fn drop(&mut self) {
        self.close();
    }
}

/// Parse the header and body of an index file.
fn decode_index(bytes: &[u8]) -> Result<AnnIndex, String> {
    if bytes.len() < INDEX_HEADER_SIZE {
        return Err(format!("file is {} bytes, shorter than the header", bytes.len()));
    }
    if &bytes[0..4] != INDEX_MAGIC {
        return Err("bad magic bytes".to_string());
    }

    let read_u32 = |offset: usize| {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[offset..offset + 4]);
        u32::from_le_bytes(buf)
    };
    let version = read_u32(4);
    if version != INDEX_VERSION {
        return Err(format!("unsupported version {version}"));
    }
    let dimension = read_u32(8) as usize;
    let kind_tag = read_u32(12);

    let (index, _): (AnnIndex, usize) =
        bincode::decode_from_slice(&bytes[INDEX_HEADER_SIZE..], bincode::config::standard())
            .map_err(|e| format!("undecodable body: {e}"))?;

    if index.dimension().get() != dimension || index.kind().tag() != kind_tag {
        return Err(format!(
            "header says dimension {dimension}/kind {kind_tag}, body says {}/{}",
            index.dimension(),
            index.kind().tag()
        ));
    }
    index.check_structure()?;
    Ok(index)
}
