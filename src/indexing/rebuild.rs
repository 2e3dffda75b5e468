//! Batch removal by rebuilding the vector index without the removed chunks.
//!
//! The ANN structure has no native delete, so removal reconstructs every
//! kept vector, recreates the index in the new order and renumbers metadata
//! positions. Any failure after the index has been touched escalates to a
//! full clear: an empty store is recoverable by reindexing, a half-rebuilt
//! one is not.

use crate::error::StoreResult;
use crate::storage::metadata::MetadataStore;
use crate::types::{ATTR_FILE_PATH, ATTR_PROJECT, ChunkId, Position, normalize_path};
use crate::vector::{Residency, VectorIndexProvider};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What to do when a kept vector cannot be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RebuildPolicy {
    /// Drop the unreadable vector (and its metadata) and keep going.
    #[default]
    BestEffort,
    /// Abort before anything is mutated.
    FailFast,
}

/// Outcome of a batch removal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Number of paths or identifiers asked for.
    pub requested: usize,
    /// Chunks actually removed from the index.
    pub removed: usize,
    /// Kept chunks dropped because their vector could not be reconstructed.
    pub skipped_reconstruction: usize,
    /// Kept chunks whose vector survived but which have no metadata record.
    pub stale_metadata: usize,
    /// The store ended up fully cleared.
    pub cleared: bool,
}

/// Removal set: file paths and chunk identifiers, optionally restricted to
/// one project.
#[derive(Debug, Clone)]
pub struct RemovalTargets {
    keys: HashSet<String>,
    project_id: Option<String>,
    requested: usize,
}

impl RemovalTargets {
    pub fn new<S: AsRef<str>>(targets: &[S], project_id: Option<&str>) -> Self {
        Self {
            keys: targets.iter().map(|t| normalize_path(t.as_ref())).collect(),
            project_id: project_id.map(str::to_string),
            requested: targets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Does the chunk `id` (with its metadata, if any) fall in the set?
    fn matches(&self, id: &ChunkId, metadata: &MetadataStore) -> bool {
        let record = metadata.get(id.as_str());

        if let Some(project) = &self.project_id {
            let owner = record
                .as_ref()
                .and_then(|r| r.attribute_str(ATTR_PROJECT).map(str::to_string));
            if owner.as_deref() != Some(project.as_str()) {
                return false;
            }
        }

        if self.keys.contains(&id.normalized()) {
            return true;
        }
        let path = record
            .as_ref()
            .and_then(|r| r.attribute_str(ATTR_FILE_PATH).map(str::to_string))
            .or_else(|| id.path().map(str::to_string));
        path.is_some_and(|p| self.keys.contains(&normalize_path(&p)))
    }
}

/// Remove every chunk matching `targets`, keeping index, identifier array
/// and metadata in step.
pub fn remove_chunks(
    provider: &mut VectorIndexProvider,
    metadata: &MetadataStore,
    targets: &RemovalTargets,
    policy: RebuildPolicy,
) -> StoreResult<RemovalReport> {
    let mut report = RemovalReport {
        requested: targets.requested,
        ..RemovalReport::default()
    };
    if targets.is_empty() || provider.is_empty() {
        return Ok(report);
    }

    // Step 1: one pass over the identifier array
    let mut removed_ids = Vec::new();
    let mut kept_positions = Vec::new();
    for (position, id) in provider.ids().iter().enumerate() {
        if targets.matches(id, metadata) {
            removed_ids.push(id.clone());
        } else {
            kept_positions.push(position);
        }
    }
    if removed_ids.is_empty() {
        debug!("No indexed chunks matched {} removal targets", targets.requested);
        return Ok(report);
    }

    // Step 2: reconstruct the complement
    let mut kept_vectors = Vec::with_capacity(kept_positions.len());
    let mut kept_ids = Vec::with_capacity(kept_positions.len());
    let mut unreadable = Vec::new();
    for (position, result) in provider.reconstruct_iter(kept_positions) {
        let Some(id) = provider.id_at(position).cloned() else {
            continue;
        };
        match (result, policy) {
            (Ok(vector), _) => {
                kept_vectors.push(vector);
                kept_ids.push(id);
            }
            (Err(e), RebuildPolicy::FailFast) => {
                warn!("Aborting removal: cannot reconstruct position {position} ({id}): {e}");
                return Err(e);
            }
            (Err(e), RebuildPolicy::BestEffort) => {
                debug!("Dropping position {position} ({id}): reconstruction failed: {e}");
                unreadable.push(id);
            }
        }
    }
    report.skipped_reconstruction = unreadable.len();
    report.removed = removed_ids.len();
    removed_ids.extend(unreadable);

    if kept_vectors.is_empty() {
        info!("Removal leaves no vectors, clearing the store");
        clear_all(provider, metadata);
        report.cleared = true;
        return Ok(report);
    }

    // Steps 3-5; any failure past this point clears everything
    match rebuild(provider, metadata, &kept_vectors, &kept_ids, &removed_ids) {
        Ok(stale) => {
            report.stale_metadata = stale;
            info!(
                "Removed {} chunks ({} unreadable, {} without metadata), {} remain",
                report.removed,
                report.skipped_reconstruction,
                report.stale_metadata,
                provider.len()
            );
            Ok(report)
        }
        Err(e) => {
            warn!("Rebuild failed, clearing the store to stay consistent: {e}");
            clear_all(provider, metadata);
            report.cleared = true;
            Ok(report)
        }
    }
}

fn rebuild(
    provider: &mut VectorIndexProvider,
    metadata: &MetadataStore,
    kept_vectors: &[Vec<f32>],
    kept_ids: &[ChunkId],
    removed_ids: &[ChunkId],
) -> StoreResult<usize> {
    let was_gpu = provider.residency() == Residency::Gpu;
    let kind = provider.select_kind(kept_vectors.len());

    provider.reset(kind);
    provider.invalidate_binary_cache()?;
    provider.add(kept_vectors, kept_ids)?;
    if kind.is_partitioned() && !provider.is_trained() {
        debug!("Kept set of {} vectors is too small to train partitions yet", provider.len());
    }
    if was_gpu && !provider.move_to_gpu() {
        warn!("Could not restore GPU residency after rebuild, index stays on CPU");
    }

    for id in removed_ids {
        metadata.delete(id)?;
    }
    // Vectors without a record are stale metadata, recoverable by reindexing
    let stale = metadata.update_index_ids(
        provider
            .ids()
            .iter()
            .enumerate()
            .map(|(position, id)| (id, position as Position)),
    )?;
    for id in &stale {
        warn!("Kept chunk {id} has no metadata record; reindex it to restore attributes");
    }

    if !metadata.commit() {
        warn!("Metadata commit after rebuild reported a failure");
    }
    Ok(stale.len())
}

/// Empty both the index and the metadata store.
pub(crate) fn clear_all(provider: &mut VectorIndexProvider, metadata: &MetadataStore) {
    provider.clear();
    if let Err(e) = provider.invalidate_binary_cache() {
        debug!("Could not remove binary cache during clear: {e}");
    }
    if let Err(e) = metadata.clear() {
        warn!("Failed to clear metadata store: {e}");
    }
    metadata.commit();
}
