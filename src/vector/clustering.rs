//! K-means clustering used to train IVF partitions.
//!
//! Vectors arrive as one contiguous row-major buffer of unit-length rows, so
//! cosine similarity reduces to a dot product. Centroids are seeded with
//! K-means++ from a deterministic RNG: retraining the same data yields the
//! same partitions.
//!
//! # Algorithm Details
//! - Distance metric: cosine similarity
//! - Initialization: K-means++
//! - Max iterations: 25
//! - Convergence: no assignment changes, or mean centroid movement < 1e-4

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum number of Lloyd iterations.
const MAX_ITERATIONS: usize = 25;

/// Convergence tolerance for centroid updates.
const CONVERGENCE_TOLERANCE: f32 = 1e-4;

/// Epsilon for floating-point comparisons.
const EPSILON: f32 = 1e-10;

/// Training rows sampled per partition.
const SAMPLES_PER_CLUSTER: usize = 256;

/// Row count above which assignment runs on the rayon pool.
const PARALLEL_THRESHOLD: usize = 4096;

/// Result of K-means clustering operation.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansResult {
    /// Row-major centroids, `k * dimension` values.
    pub centroids: Vec<f32>,

    /// Number of centroids actually produced.
    pub k: usize,

    /// Number of iterations until convergence.
    pub iterations: usize,
}

#[derive(Error, Debug)]
pub enum ClusteringError {
    #[error("Empty vector set provided for clustering")]
    EmptyVectorSet,

    #[error("Invalid cluster count: {0}\nSuggestion: Use k between 1 and the number of vectors")]
    InvalidClusterCount(usize),

    #[error("Vector buffer length {len} is not a multiple of dimension {dimension}")]
    RaggedInput { len: usize, dimension: usize },
}

/// Dot product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vectors must have same dimension");
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Computes cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]; zero when either vector has no length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot(a, b) / (norm_a * norm_b)
    }
}

/// Index of the centroid with the highest inner product against `vector`.
pub fn nearest_centroid(vector: &[f32], centroids: &[f32], dimension: usize) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, centroid) in centroids.chunks_exact(dimension).enumerate() {
        let score = dot(vector, centroid);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}

/// Indices of the `n` centroids closest to `vector`, best first.
pub fn nearest_centroids(
    vector: &[f32],
    centroids: &[f32],
    dimension: usize,
    n: usize,
) -> Vec<usize> {
    let mut scored: Vec<(usize, f32)> = centroids
        .chunks_exact(dimension)
        .enumerate()
        .map(|(i, c)| (i, dot(vector, c)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().take(n).map(|(i, _)| i).collect()
}

/// Assign every row of `data` to its nearest centroid.
pub fn assign_all(data: &[f32], centroids: &[f32], dimension: usize) -> Vec<usize> {
    let rows = data.len() / dimension;
    if rows >= PARALLEL_THRESHOLD {
        data.par_chunks_exact(dimension)
            .map(|row| nearest_centroid(row, centroids, dimension))
            .collect()
    } else {
        data.chunks_exact(dimension)
            .map(|row| nearest_centroid(row, centroids, dimension))
            .collect()
    }
}

/// Performs K-means clustering over unit-length rows.
///
/// Large inputs are subsampled to `256 * k` rows before training. `k` is
/// reduced when the data has fewer distinct directions than requested.
#[must_use = "clustering results should be used or the computation is wasted"]
pub fn kmeans_clustering(
    data: &[f32],
    dimension: usize,
    k: usize,
    seed: u64,
) -> Result<KMeansResult, ClusteringError> {
    if dimension == 0 || data.len() % dimension != 0 {
        return Err(ClusteringError::RaggedInput {
            len: data.len(),
            dimension,
        });
    }
    let rows = data.len() / dimension;
    if rows == 0 {
        return Err(ClusteringError::EmptyVectorSet);
    }
    if k == 0 || k > rows {
        return Err(ClusteringError::InvalidClusterCount(k));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let sample = sample_rows(data, dimension, k * SAMPLES_PER_CLUSTER, &mut rng);
    let sample_rows = sample.len() / dimension;

    let mut centroids = initialize_centroids_kmeans_plus_plus(&sample, dimension, k, &mut rng);
    let k = centroids.len() / dimension;
    let mut assignments = vec![usize::MAX; sample_rows];
    let mut iterations = 0;

    loop {
        iterations += 1;

        let new_assignments = assign_all(&sample, &centroids, dimension);
        let converged = new_assignments == assignments;
        assignments = new_assignments;
        if converged || iterations >= MAX_ITERATIONS {
            break;
        }

        let new_centroids = update_centroids(&sample, dimension, &assignments, k, &mut rng);
        let movement = centroid_movement(&centroids, &new_centroids, dimension);
        centroids = new_centroids;
        if movement < CONVERGENCE_TOLERANCE {
            break;
        }
    }

    if iterations >= MAX_ITERATIONS {
        warn!("K-means did not fully converge after {MAX_ITERATIONS} iterations");
    }
    debug!("K-means trained {k} partitions on {sample_rows} rows in {iterations} iterations");

    Ok(KMeansResult {
        centroids,
        k,
        iterations,
    })
}

/// Uniform sample of at most `limit` rows, copied into a new buffer.
fn sample_rows(data: &[f32], dimension: usize, limit: usize, rng: &mut StdRng) -> Vec<f32> {
    let rows = data.len() / dimension;
    if rows <= limit {
        return data.to_vec();
    }
    let mut picked = rand::seq::index::sample(rng, rows, limit).into_vec();
    picked.sort_unstable();
    let mut out = Vec::with_capacity(limit * dimension);
    for row in picked {
        out.extend_from_slice(&data[row * dimension..(row + 1) * dimension]);
    }
    out
}

/// Recompute each centroid as the normalized mean of its rows.
fn update_centroids(
    data: &[f32],
    dimension: usize,
    assignments: &[usize],
    k: usize,
    rng: &mut StdRng,
) -> Vec<f32> {
    let rows = data.len() / dimension;
    let mut sums = vec![0.0f32; k * dimension];
    let mut sizes = vec![0usize; k];

    for (row, &cluster) in data.chunks_exact(dimension).zip(assignments) {
        let target = &mut sums[cluster * dimension..(cluster + 1) * dimension];
        for (acc, value) in target.iter_mut().zip(row) {
            *acc += value;
        }
        sizes[cluster] += 1;
    }

    for (cluster, centroid) in sums.chunks_exact_mut(dimension).enumerate() {
        if sizes[cluster] == 0 {
            // Empty cluster: reseed from a random row
            let row = rng.random_range(0..rows);
            centroid.copy_from_slice(&data[row * dimension..(row + 1) * dimension]);
        }
        normalize_in_place(centroid);
    }
    sums
}

/// K-means++ seeding: each new centroid is drawn with probability
/// proportional to its squared cosine distance from the chosen set.
fn initialize_centroids_kmeans_plus_plus(
    data: &[f32],
    dimension: usize,
    k: usize,
    rng: &mut StdRng,
) -> Vec<f32> {
    let rows = data.len() / dimension;
    let row = |i: usize| &data[i * dimension..(i + 1) * dimension];

    let mut centroids = Vec::with_capacity(k * dimension);
    let first = rng.random_range(0..rows);
    centroids.extend_from_slice(row(first));
    normalize_in_place(&mut centroids[..dimension]);

    let mut min_distances: Vec<f32> = (0..rows)
        .map(|i| squared_cosine_distance(row(i), &centroids[..dimension]))
        .collect();

    while centroids.len() / dimension < k {
        let total: f32 = min_distances.iter().sum();
        if total < EPSILON {
            // Remaining rows coincide with existing centroids
            break;
        }

        let target = rng.random::<f32>() * total;
        let mut cumulative = 0.0;
        let mut chosen = rows - 1;
        for (i, &distance) in min_distances.iter().enumerate() {
            cumulative += distance;
            if cumulative >= target {
                chosen = i;
                break;
            }
        }

        let start = centroids.len();
        centroids.extend_from_slice(row(chosen));
        normalize_in_place(&mut centroids[start..]);
        let newest = &centroids[start..];
        for (i, current) in min_distances.iter_mut().enumerate() {
            *current = current.min(squared_cosine_distance(row(i), newest));
        }
    }

    centroids
}

fn squared_cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let distance = (1.0 - cosine_similarity(a, b)).max(0.0);
    distance * distance
}

/// Mean cosine distance moved by each centroid.
fn centroid_movement(old: &[f32], new: &[f32], dimension: usize) -> f32 {
    let k = old.len() / dimension;
    old.chunks_exact(dimension)
        .zip(new.chunks_exact(dimension))
        .map(|(a, b)| 1.0 - cosine_similarity(a, b))
        .sum::<f32>()
        / k as f32
}

fn normalize_in_place(vector: &mut [f32]) {
    let norm = dot(vector, vector).sqrt();
    if norm > EPSILON {
        vector.iter_mut().for_each(|v| *v /= norm);
    }
}
