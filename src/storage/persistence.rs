//! On-disk layout of a project storage directory plus the model and project
//! info files consulted by the dimension-validation gate.

use crate::error::{StoreError, StoreResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Serialized ANN structure.
pub const INDEX_FILE: &str = "vectors.idx";
/// Ordered identifiers aligned to index positions.
pub const IDS_FILE: &str = "chunk_ids.json";
/// SQLite metadata store (WAL journal lives next to it).
pub const METADATA_FILE: &str = "metadata.db";
/// Persisted symbol hash cache.
pub const SYMBOL_CACHE_FILE: &str = "symbol_cache.bin";
/// Optional memory-mapped vector cache.
pub const BINARY_CACHE_FILE: &str = "vectors.mmap";
pub const MODEL_INFO_FILE: &str = "model_info.json";
pub const PROJECT_INFO_FILE: &str = "project_info.json";

/// Get current UTC timestamp in seconds since UNIX_EPOCH
pub fn get_utc_timestamp() -> u64 {
    Utc::now().timestamp() as u64
}

/// Paths of every artifact in one project storage directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base_path: PathBuf,
}

impl StorageLayout {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn index_file(&self) -> PathBuf {
        self.base_path.join(INDEX_FILE)
    }

    pub fn ids_file(&self) -> PathBuf {
        self.base_path.join(IDS_FILE)
    }

    pub fn metadata_file(&self) -> PathBuf {
        self.base_path.join(METADATA_FILE)
    }

    pub fn symbol_cache_file(&self) -> PathBuf {
        self.base_path.join(SYMBOL_CACHE_FILE)
    }

    pub fn binary_cache_file(&self) -> PathBuf {
        self.base_path.join(BINARY_CACHE_FILE)
    }

    pub fn model_info_file(&self) -> PathBuf {
        self.base_path.join(MODEL_INFO_FILE)
    }

    pub fn project_info_file(&self) -> PathBuf {
        self.base_path.join(PROJECT_INFO_FILE)
    }

    pub fn ensure_dir(&self) -> StoreResult<()> {
        std::fs::create_dir_all(&self.base_path).map_err(|e| StoreError::io(&self.base_path, e))
    }

    /// Every artifact, including SQLite side files.
    pub fn all_files(&self) -> Vec<PathBuf> {
        let metadata = self.metadata_file();
        let wal = PathBuf::from(format!("{}-wal", metadata.display()));
        let shm = PathBuf::from(format!("{}-shm", metadata.display()));
        vec![
            self.index_file(),
            self.ids_file(),
            metadata,
            wal,
            shm,
            self.symbol_cache_file(),
            self.binary_cache_file(),
            self.model_info_file(),
            self.project_info_file(),
        ]
    }

    /// Delete every artifact. Handles must already be closed.
    pub fn remove_all(&self) -> StoreResult<()> {
        for path in self.all_files() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(())
    }
}

static TMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Write to a sibling temp file, then rename over `path`.
pub(crate) fn write_replacing(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let sequence = TMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp{sequence}"));
    std::fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        StoreError::Serialization(format!("Failed to serialize {}: {e}", path.display()))
    })?;
    write_replacing(path, json.as_bytes())
}

/// Read an optional JSON info file. Missing and unparseable files are both
/// `None`; the latter is logged.
fn read_json_lenient<T: for<'de> Deserialize<'de>>(path: &Path) -> StoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    match read_json(path) {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::StorageCorruption { reason, .. }) => {
            warn!("Ignoring {}: {reason}", path.display());
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> StoreResult<T> {
    let json = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_str(&json).map_err(|e| StoreError::StorageCorruption {
        path: path.to_path_buf(),
        reason: format!("unparseable JSON: {e}"),
    })
}

/// Embedding model that produced the stored vectors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Name of the embedding model used
    pub model_name: String,

    /// Dimension of embeddings
    pub dimension: usize,

    /// Number of vectors stored at last save
    pub vector_count: usize,

    /// Unix timestamp when created
    pub created_at: u64,

    /// Unix timestamp when last updated
    pub updated_at: u64,

    /// Version of the info format
    pub version: u32,
}

impl ModelInfo {
    const CURRENT_VERSION: u32 = 1;

    pub fn new(model_name: impl Into<String>, dimension: usize) -> Self {
        let now = get_utc_timestamp();
        Self {
            model_name: model_name.into(),
            dimension,
            vector_count: 0,
            created_at: now,
            updated_at: now,
            version: Self::CURRENT_VERSION,
        }
    }

    pub fn update(&mut self, vector_count: usize) {
        self.vector_count = vector_count;
        self.updated_at = get_utc_timestamp();
    }

    pub fn save(&self, layout: &StorageLayout) -> StoreResult<()> {
        write_json(&layout.model_info_file(), self)
    }

    /// Load the model info, `Ok(None)` when the file is missing or
    /// unparseable. A newer format version is a hard error.
    pub fn load(layout: &StorageLayout) -> StoreResult<Option<Self>> {
        let path = layout.model_info_file();
        let Some(info) = read_json_lenient::<Self>(&path)? else {
            return Ok(None);
        };
        if info.version > Self::CURRENT_VERSION {
            return Err(StoreError::StorageCorruption {
                path,
                reason: format!(
                    "model info version {} is newer than supported version {}",
                    info.version,
                    Self::CURRENT_VERSION
                ),
            });
        }
        Ok(Some(info))
    }

    /// Shared dimension-validation gate.
    ///
    /// Fails when a caller's embedding model disagrees with what is stored,
    /// naming both dimensions and both models.
    pub fn validate(&self, model_name: Option<&str>, dimension: usize) -> StoreResult<()> {
        if self.dimension != dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: dimension,
                expected_model: Some(self.model_name.clone()),
                actual_model: model_name.map(str::to_string),
            });
        }
        Ok(())
    }
}

/// Identity of the project owning a storage directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub project_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    pub created_at: u64,
}

impl ProjectInfo {
    pub fn new(project_id: impl Into<String>, root: Option<PathBuf>) -> Self {
        Self {
            project_id: project_id.into(),
            root,
            created_at: get_utc_timestamp(),
        }
    }

    pub fn save(&self, layout: &StorageLayout) -> StoreResult<()> {
        write_json(&layout.project_info_file(), self)
    }

    pub fn load(layout: &StorageLayout) -> StoreResult<Option<Self>> {
        read_json_lenient(&layout.project_info_file())
    }
}
