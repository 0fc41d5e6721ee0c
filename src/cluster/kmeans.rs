use std::collections::HashSet;

use ndarray::prelude::*;
use ndarray_rand::rand::rngs::StdRng;
use ndarray_rand::rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::AppResult;
use crate::cluster::{lloyd, utils};
use crate::error::AppError;

pub static DEFAULT_K: usize = 4;
pub static DEFAULT_SEED: u64 = 42;
pub static DEFAULT_N_INIT: usize = 1;
pub static DEFAULT_MAX_ITER: usize = 300;
pub static DEFAULT_TOLERANCE: f64 = 1e-4;

/// Greedy k-means++ seeding.
///
/// The first center is drawn uniformly; every later one is the best of
/// `n_local_trials` candidates sampled proportionally to their squared distance
/// from the nearest center chosen so far.
fn kmeans_plus_plus<R: Rng>(
    x: &Array2<f64>, // x = (n_samples, n_features)
    n_clusters: usize,
    x_squared_norms: &Array1<f64>, // x_squared_norms = (n_samples,)
    rng: &mut R,
    n_local_trials: Option<usize>,
) -> Array2<f64> {
    let n_samples = x.nrows();
    let n_local_trials = n_local_trials.unwrap_or(2 + (n_clusters as f64).ln() as usize);
    let mut centers: Array2<f64> = Array2::<f64>::zeros((n_clusters, x.ncols()));

    let center_id = rng.random_range(0..n_samples);
    centers.row_mut(0).assign(&x.row(center_id));
    // closest_dist_sq = (n_samples,)
    let mut closest_dist_sq: Array1<f64> = utils::euclidean_distances(
        &x.slice(s![center_id..center_id + 1, ..]).to_owned(),
        x,
        None,
        Some(x_squared_norms),
        true,
    )
    .row(0)
    .to_owned();
    let mut current_pot = closest_dist_sq.sum();

    for c in 1..n_clusters {
        let rand_vals =
            Array1::from_shape_fn(n_local_trials, |_| rng.random::<f64>() * current_pot);
        let candidate_ids: Vec<usize> = utils::searchsorted_cumsum(&closest_dist_sq, &rand_vals)
            .into_iter()
            .map(|id| id.min(n_samples - 1))
            .collect();

        // distance_to_candidates = (n_local_trials, n_samples)
        let mut distance_to_candidates = utils::euclidean_distances(
            &x.select(Axis(0), &candidate_ids),
            x,
            None,
            Some(x_squared_norms),
            true,
        );
        for mut row in distance_to_candidates.axis_iter_mut(Axis(0)) {
            row.zip_mut_with(&closest_dist_sq, |dist, &closest| {
                if closest < *dist {
                    *dist = closest;
                }
            });
        }
        let candidates_pot = distance_to_candidates.sum_axis(Axis(1)); // (n_local_trials,)
        let best = candidates_pot
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(idx, _)| idx)
            .unwrap_or(0);

        current_pot = candidates_pot[best];
        closest_dist_sq = distance_to_candidates.row(best).to_owned();
        centers.row_mut(c).assign(&x.row(candidate_ids[best]));
    }
    centers
}

/// Seeded K-Means. Identical data, `k` and seed always produce identical labels.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub k: usize,
    pub seed: u64,
    pub n_init: usize,
    pub max_iterations: usize,
    pub tolerance: f64,
    cluster_centers: Option<Array2<f64>>,
    labels: Option<Array1<usize>>,
    inertia: Option<f64>,
    n_iter: Option<usize>,
}

impl Default for KMeans {
    fn default() -> Self {
        KMeans {
            k: DEFAULT_K,
            seed: DEFAULT_SEED,
            n_init: DEFAULT_N_INIT,
            max_iterations: DEFAULT_MAX_ITER,
            tolerance: DEFAULT_TOLERANCE,
            cluster_centers: None,
            labels: None,
            inertia: None,
            n_iter: None,
        }
    }
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        KMeans {
            k,
            ..Default::default()
        }
    }

    pub fn set_seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn set_n_init(&mut self, n_init: usize) -> &mut Self {
        self.n_init = n_init;
        self
    }

    pub fn set_max_iterations(&mut self, max_iterations: usize) -> &mut Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn set_tolerance(&mut self, tolerance: f64) -> &mut Self {
        self.tolerance = tolerance;
        self
    }

    pub fn labels(&self) -> Option<&Array1<usize>> {
        self.labels.as_ref()
    }

    #[cfg(test)]
    pub fn cluster_centers(&self) -> Option<&Array2<f64>> {
        self.cluster_centers.as_ref()
    }

    pub fn inertia(&self) -> Option<f64> {
        self.inertia
    }

    pub fn n_iter(&self) -> Option<usize> {
        self.n_iter
    }

    /// Fit on `x` = (n_samples, n_features).
    ///
    /// Fails with [`AppError::InsufficientSamples`] when `n_samples < k`.
    pub fn fit(&mut self, x: &Array2<f64>) -> AppResult<&mut Self> {
        if self.k == 0 {
            return Err(AppError::InvalidInput(
                "cluster count must be at least 1".to_string(),
            ));
        }
        if x.nrows() < self.k {
            return Err(AppError::InsufficientSamples {
                samples: x.nrows(),
                k: self.k,
            });
        }

        let x_mean: Array1<f64> = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::<f64>::zeros(x.ncols())); // (n_features,)
        let x = x - &x_mean;
        let x_squared_norms = utils::row_norms(&x, true); // (n_samples,)
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut best: Option<(Array1<usize>, f64, Array2<f64>, usize)> = None;
        for run in 0..self.n_init.max(1) {
            let centers_init =
                kmeans_plus_plus(&x, self.k, &x_squared_norms, &mut rng, None); // (k, n_features)
            let (labels, inertia, centers, n_iter) = lloyd::kmeans_single_lloyd(
                &x,
                &centers_init,
                self.max_iterations,
                self.tolerance,
            );
            debug!("Run {run}: inertia {inertia:.6} after {n_iter} iterations");
            if best.as_ref().is_none_or(|(_, bi, _, _)| inertia < *bi) {
                best = Some((labels, inertia, centers, n_iter));
            }
        }

        if let Some((labels, inertia, mut centers, n_iter)) = best {
            let distinct_clusters = labels.iter().collect::<HashSet<_>>().len();
            if distinct_clusters < self.k {
                warn!(
                    "Number of distinct clusters ({}) found smaller than n_clusters ({}). Possibly due to duplicate points in the embeddings.",
                    distinct_clusters, self.k
                );
            }
            centers += &x_mean;
            self.cluster_centers = Some(centers);
            self.labels = Some(labels);
            self.inertia = Some(inertia);
            self.n_iter = Some(n_iter);
        }
        Ok(self)
    }
}
