pub(super) mod convert;
pub(super) mod kmeans;
pub(super) mod lloyd;
pub(super) mod utils;

use std::collections::{BTreeMap, HashMap};

use ndarray::Array2;
use tracing::info;

use crate::AppResult;
use crate::embed::EmbeddingMatrix;
use crate::error::AppError;

pub use kmeans::{DEFAULT_K, DEFAULT_MAX_ITER, DEFAULT_N_INIT, DEFAULT_SEED, DEFAULT_TOLERANCE};

/// One cluster id per embedding row, in row order. Every id is below `k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVector {
    labels: Vec<usize>,
    k: usize,
    seed: u64,
}

impl LabelVector {
    /// Validate and wrap `labels`.
    pub fn new(labels: Vec<usize>, k: usize, seed: u64) -> Result<Self, String> {
        if k == 0 {
            return Err("cluster count k must be at least 1".to_string());
        }
        if let Some((i, l)) = labels.iter().enumerate().find(|(_, l)| **l >= k) {
            return Err(format!("label {l} at index {i} is outside [0, {k})"));
        }
        Ok(Self { labels, k, seed })
    }

    /// Label vector for a run that had nothing to cluster.
    pub fn empty(k: usize, seed: u64) -> Result<Self, String> {
        Self::new(Vec::new(), k, seed)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.labels
    }
}

/// Trait for partitioning embeddings into `k` groups.
pub trait Clusterer: Send + Sync {
    /// Return one label in `[0, k)` per row of `embeddings`.
    fn cluster(&self, embeddings: &Array2<f64>, k: usize, seed: u64) -> AppResult<Vec<usize>>;
}

/// Lloyd K-Means with k-means++ seeding.
#[derive(Debug, Clone)]
pub struct KMeansClusterer {
    pub n_init: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for KMeansClusterer {
    fn default() -> Self {
        Self {
            n_init: DEFAULT_N_INIT,
            max_iterations: DEFAULT_MAX_ITER,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

impl Clusterer for KMeansClusterer {
    fn cluster(&self, embeddings: &Array2<f64>, k: usize, seed: u64) -> AppResult<Vec<usize>> {
        let mut kmeans = kmeans::KMeans::new(k);
        kmeans
            .set_seed(seed)
            .set_n_init(self.n_init)
            .set_max_iterations(self.max_iterations)
            .set_tolerance(self.tolerance)
            .fit(embeddings)?;
        info!(
            "K-Means finished after {} iterations, inertia {:.4}",
            kmeans.n_iter().unwrap_or_default(),
            kmeans.inertia().unwrap_or_default()
        );
        Ok(kmeans.labels().map(|l| l.to_vec()).unwrap_or_default())
    }
}

/// Renumber ids in order of first appearance, so row 0 is always in cluster 0.
fn canonicalize(labels: &[usize]) -> Vec<usize> {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    labels
        .iter()
        .map(|&l| {
            let next = mapping.len();
            *mapping.entry(l).or_insert(next)
        })
        .collect()
}

/// Cluster `matrix` into `k` groups.
///
/// Fails with [`AppError::InsufficientSamples`] when the matrix has fewer than `k`
/// rows, including the empty matrix; callers persist [`LabelVector::empty`] instead.
#[tracing::instrument(name = "Clustering embeddings", level = "info", skip(clusterer, matrix), fields(rows = matrix.len()))]
pub fn fit<C: Clusterer + ?Sized>(
    clusterer: &C,
    matrix: &EmbeddingMatrix,
    k: usize,
    seed: u64,
) -> AppResult<LabelVector> {
    if k == 0 {
        return Err(AppError::InvalidInput(
            "cluster count must be at least 1".to_string(),
        ));
    }
    if matrix.len() < k {
        return Err(AppError::InsufficientSamples {
            samples: matrix.len(),
            k,
        });
    }
    let x = convert::embeddings_to_ndarray(matrix);
    let raw = clusterer.cluster(&x, k, seed)?;
    if raw.len() != matrix.len() {
        return Err(AppError::SchemaMismatch(format!(
            "clusterer returned {} labels for {} rows",
            raw.len(),
            matrix.len()
        )));
    }
    let labels = LabelVector::new(canonicalize(&raw), k, seed).map_err(AppError::SchemaMismatch)?;
    for (cluster, count) in cluster_sizes(labels.as_slice()) {
        info!("Cluster {cluster}: {count} items");
    }
    Ok(labels)
}

/// Number of items per cluster id, ascending by id.
pub fn cluster_sizes(labels: &[usize]) -> BTreeMap<usize, usize> {
    let mut sizes = BTreeMap::new();
    for &l in labels {
        *sizes.entry(l).or_insert(0) += 1;
    }
    sizes
}
