//! In-memory ANN structure: exact flat scan or IVF partitions.
//!
//! Vectors are stored row-major in one contiguous buffer, always unit
//! length, so inner product equals cosine similarity. The IVF variant trains
//! k-means centroids lazily once enough rows exist; until then it answers
//! with an exhaustive scan.

use crate::types::Position;
use crate::vector::clustering::{
    ClusteringError, assign_all, dot, kmeans_clustering, nearest_centroid, nearest_centroids,
};
use crate::vector::types::{IndexKind, Neighbor, VectorDimension};
use bincode::{Decode, Encode};
use rayon::prelude::*;
use std::collections::TryReserveError;
use tracing::debug;

/// Rows per partition required before IVF training kicks in.
pub const MIN_ROWS_PER_LIST: usize = 8;

/// Candidate count above which scoring runs on the rayon pool.
const PARALLEL_SEARCH_THRESHOLD: usize = 20_000;

/// Fixed seed so retraining identical data gives identical partitions.
const TRAINING_SEED: u64 = 0x5eed_c0de;

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
struct IvfPartitions {
    centroids: Vec<f32>,
    lists: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct AnnIndex {
    dimension: VectorDimension,
    kind: IndexKind,
    data: Vec<f32>,
    partitions: Option<IvfPartitions>,
}

impl AnnIndex {
    pub fn new(dimension: VectorDimension, kind: IndexKind) -> Self {
        Self {
            dimension,
            kind,
            data: Vec::new(),
            partitions: None,
        }
    }

    pub fn dimension(&self) -> VectorDimension {
        self.dimension
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dimension.get()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        self.partitions.is_some()
    }

    /// Number of trained partitions, 0 when untrained or flat.
    pub fn partition_count(&self) -> usize {
        self.partitions.as_ref().map_or(0, |p| p.lists.len())
    }

    /// Bytes held by the vector buffer.
    pub fn vector_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }

    /// Make room for `rows` more vectors without aborting on failure.
    pub fn try_reserve(&mut self, rows: usize) -> Result<(), TryReserveError> {
        self.data.try_reserve(rows.saturating_mul(self.dimension.get()))
    }

    /// Append unit-length rows. Dimensions must already be validated.
    pub fn append(&mut self, rows: &[Vec<f32>]) {
        let first = self.len();
        for row in rows {
            self.data.extend_from_slice(row);
        }

        if let Some(partitions) = self.partitions.as_mut() {
            let dim = self.dimension.get();
            for (offset, row) in rows.iter().enumerate() {
                let list = nearest_centroid(row, &partitions.centroids, dim);
                partitions.lists[list].push((first + offset) as u32);
            }
        }
    }

    /// Train IVF partitions when the kind asks for them and enough rows
    /// exist. Returns whether partitions are now in place.
    pub fn maybe_train(&mut self) -> Result<bool, ClusteringError> {
        if !self.kind.is_partitioned() || self.is_trained() {
            return Ok(self.is_trained());
        }
        let rows = self.len();
        let nlist = self.kind.effective_nlist(rows);
        if rows < nlist.saturating_mul(MIN_ROWS_PER_LIST).max(MIN_ROWS_PER_LIST) {
            return Ok(false);
        }
        self.train(nlist)?;
        Ok(true)
    }

    /// Drop any partitions and train afresh over the current rows.
    pub fn retrain(&mut self) -> Result<bool, ClusteringError> {
        self.partitions = None;
        self.maybe_train()
    }

    fn train(&mut self, nlist: usize) -> Result<(), ClusteringError> {
        let dim = self.dimension.get();
        let result = kmeans_clustering(&self.data, dim, nlist, TRAINING_SEED)?;
        let mut lists = vec![Vec::new(); result.k];
        for (position, list) in assign_all(&self.data, &result.centroids, dim)
            .into_iter()
            .enumerate()
        {
            lists[list].push(position as u32);
        }
        debug!(
            "Trained IVF index: {} partitions over {} vectors",
            result.k,
            self.len()
        );
        self.partitions = Some(IvfPartitions {
            centroids: result.centroids,
            lists,
        });
        Ok(())
    }

    /// Re-check the invariants that decoding a persisted index does not
    /// enforce. `Err` carries the first violation found.
    pub fn check_structure(&self) -> Result<(), String> {
        let dim = self.dimension.get();
        if dim == 0 {
            return Err("dimension is zero".to_string());
        }
        if self.data.len() % dim != 0 {
            return Err(format!(
                "{} stored values do not divide into rows of {dim}",
                self.data.len()
            ));
        }

        let Some(partitions) = &self.partitions else {
            return Ok(());
        };
        if !self.kind.is_partitioned() {
            return Err(format!("{} index carries IVF partitions", self.kind));
        }
        if partitions.lists.is_empty()
            || partitions.centroids.len() != partitions.lists.len().saturating_mul(dim)
        {
            return Err(format!(
                "{} centroid values for {} partitions of dimension {dim}",
                partitions.centroids.len(),
                partitions.lists.len()
            ));
        }
        let rows = self.len();
        if let Some(&position) = partitions
            .lists
            .iter()
            .flatten()
            .find(|&&position| position as usize >= rows)
        {
            return Err(format!(
                "partition entry {position} is out of range for {rows} vectors"
            ));
        }
        Ok(())
    }

    /// Copy of the stored row at `position`.
    pub fn reconstruct(&self, position: Position) -> Option<Vec<f32>> {
        self.row(position).map(<[f32]>::to_vec)
    }

    pub fn row(&self, position: Position) -> Option<&[f32]> {
        let dim = self.dimension.get();
        let start = position.checked_mul(dim)?;
        self.data.get(start..start.checked_add(dim)?)
    }

    /// Every row as an owned vector, in position order.
    pub fn rows(&self) -> Vec<Vec<f32>> {
        self.data
            .chunks_exact(self.dimension.get())
            .map(<[f32]>::to_vec)
            .collect()
    }

    /// Top-`k` rows by inner product with a unit-length `query`.
    ///
    /// Ties are broken by ascending position.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        let mut scored = match &self.partitions {
            Some(partitions) => {
                let dim = self.dimension.get();
                let probes = nearest_centroids(query, &partitions.centroids, dim, nprobe.max(1));
                let candidates: Vec<Position> = probes
                    .into_iter()
                    .flat_map(|list| partitions.lists[list].iter().map(|&p| p as Position))
                    .collect();
                self.score_positions(query, &candidates)
            }
            None => self.score_all(query),
        };

        top_k(&mut scored, k);
        scored
    }

    fn score_all(&self, query: &[f32]) -> Vec<Neighbor> {
        let dim = self.dimension.get();
        let score = |(position, row): (usize, &[f32])| Neighbor {
            position,
            score: dot(query, row),
        };
        if self.len() >= PARALLEL_SEARCH_THRESHOLD {
            self.data.par_chunks_exact(dim).enumerate().map(score).collect()
        } else {
            self.data.chunks_exact(dim).enumerate().map(score).collect()
        }
    }

    fn score_positions(&self, query: &[f32], positions: &[Position]) -> Vec<Neighbor> {
        let score = |&position: &Position| {
            self.row(position).map(|row| Neighbor {
                position,
                score: dot(query, row),
            })
        };
        if positions.len() >= PARALLEL_SEARCH_THRESHOLD {
            positions.par_iter().filter_map(score).collect()
        } else {
            positions.iter().filter_map(score).collect()
        }
    }
}

/// Keep the best `k` neighbors, sorted best first.
fn top_k(scored: &mut Vec<Neighbor>, k: usize) {
    let order = |a: &Neighbor, b: &Neighbor| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.position.cmp(&b.position))
    };
    if scored.len() > k {
        scored.select_nth_unstable_by(k - 1, order);
        scored.truncate(k);
    }
    scored.sort_by(order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::types::normalized;

    fn unit_rows(count: usize, dim: usize) -> Vec<Vec<f32>> {
        (0..count)
            .map(|i| {
                let raw: Vec<f32> = (0..dim)
                    .map(|j| ((i * 31 + j * 7) % 13) as f32 - 6.0 + (i as f32) * 0.01)
                    .collect();
                normalized(&raw)
            })
            .collect()
    }

    #[test]
    fn test_flat_search_finds_exact_row() {
        let dim = VectorDimension::new(8).unwrap();
        let mut index = AnnIndex::new(dim, IndexKind::Flat);
        let rows = unit_rows(20, 8);
        index.append(&rows);

        assert_eq!(index.len(), 20);
        let hits = index.search(&rows[7], 3, 1);
        assert_eq!(hits[0].position, 7);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_reconstruct_bounds() {
        let dim = VectorDimension::new(4).unwrap();
        let mut index = AnnIndex::new(dim, IndexKind::Flat);
        index.append(&unit_rows(2, 4));
        assert!(index.reconstruct(1).is_some());
        assert!(index.reconstruct(2).is_none());
        assert!(index.reconstruct(usize::MAX).is_none());
    }

    #[test]
    fn test_ivf_trains_lazily_and_keeps_every_row_reachable() {
        let dim = VectorDimension::new(8).unwrap();
        let mut index = AnnIndex::new(dim, IndexKind::IvfFlat { nlist: 4 });
        let rows = unit_rows(200, 8);

        index.append(&rows[..10]);
        assert!(!index.maybe_train().unwrap());

        index.append(&rows[10..]);
        assert!(index.maybe_train().unwrap());
        assert_eq!(index.partition_count(), 4);

        // Probing every partition is exact
        for (position, row) in rows.iter().enumerate().step_by(17) {
            let hits = index.search(row, 1, 4);
            assert_eq!(hits[0].position, position);
        }
    }

    #[test]
    fn test_append_after_training_assigns_partitions() {
        let dim = VectorDimension::new(8).unwrap();
        let mut index = AnnIndex::new(dim, IndexKind::IvfFlat { nlist: 2 });
        let rows = unit_rows(60, 8);
        index.append(&rows[..40]);
        assert!(index.maybe_train().unwrap());

        index.append(&rows[40..]);
        let hits = index.search(&rows[55], 1, 2);
        assert_eq!(hits[0].position, 55);
    }

    #[test]
    fn test_check_structure_rejects_inconsistent_partitions() {
        let dim = VectorDimension::new(8).unwrap();
        let mut index = AnnIndex::new(dim, IndexKind::IvfFlat { nlist: 2 });
        index.append(&unit_rows(40, 8));
        assert!(index.maybe_train().unwrap());
        assert!(index.check_structure().is_ok());

        let mut missing_list = index.clone();
        if let Some(partitions) = missing_list.partitions.as_mut() {
            partitions.lists.pop();
        }
        assert!(missing_list.check_structure().is_err());

        let mut stray_entry = index.clone();
        if let Some(partitions) = stray_entry.partitions.as_mut() {
            partitions.lists[0].push(40);
        }
        assert!(stray_entry.check_structure().is_err());

        let mut ragged = index;
        ragged.data.pop();
        assert!(ragged.check_structure().is_err());
    }

    #[test]
    fn test_top_k_is_stable_on_ties() {
        let mut scored = vec![
            Neighbor { position: 3, score: 0.5 },
            Neighbor { position: 1, score: 0.5 },
            Neighbor { position: 2, score: 0.9 },
        ];
        top_k(&mut scored, 2);
        assert_eq!(scored[0].position, 2);
        assert_eq!(scored[1].position, 1);
    }
}
