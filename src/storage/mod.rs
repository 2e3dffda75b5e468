//! Storage layer: metadata store, symbol hash cache, binary vector cache
//! and the on-disk layout tying them together.

pub mod binary_cache;
pub mod metadata;
pub mod persistence;
pub mod symbol_cache;

pub use binary_cache::BinaryVectorCache;
pub use metadata::{ChunkRecord, MetadataStore};
pub use persistence::{ModelInfo, ProjectInfo, StorageLayout};
pub use symbol_cache::{ConcurrentSymbolCache, SymbolHashCache, fnv1a_hash, identity_hash};
