/// Vector storage core for semantic code search: a persisted ANN index,
/// a SQLite metadata store, an mmap vector cache and a symbol hash cache,
/// kept consistent under batch add and remove.
pub mod config;
pub mod error;
pub mod indexing;
pub mod logging;
pub mod storage;
pub mod types;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{StoreError, StoreResult};
pub use indexing::{
    ChunkStore, ConsistencyIssue, ConsistencyReport, LexicalDocCount, RebuildPolicy,
    RemovalReport, SearchFilter, SearchResult, StoreRegistry, StoreStats, SyncMonitor, SyncStatus,
};
pub use storage::{BinaryVectorCache, ChunkRecord, MetadataStore, ModelInfo, StorageLayout};
pub use types::{Attributes, ChunkId, Position};
pub use vector::{
    DeviceBackend, IndexKind, Neighbor, NoDevice, Residency, SimulatedDevice,
    VectorIndexProvider,
};
