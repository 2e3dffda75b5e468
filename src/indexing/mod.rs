//! Store-level operations built on the storage and vector layers.

pub mod consistency;
pub mod rebuild;
pub mod registry;
pub mod store;
pub mod sync;

pub use consistency::{ConsistencyIssue, ConsistencyReport};
pub use rebuild::{RebuildPolicy, RemovalReport, RemovalTargets};
pub use registry::{SharedStore, StoreRegistry};
pub use store::{ChunkStore, SearchFilter, SearchResult, StoreStats};
pub use sync::{LexicalDocCount, ResyncHandler, SyncMonitor, SyncStatus, drift_ratio};
