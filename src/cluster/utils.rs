use ndarray::prelude::*;
use ndarray::{OwnedRepr, RemoveAxis};

/// Per-row L2 norms (or squared norms) of `x`.
pub fn row_norms<D>(
    x: &ArrayBase<OwnedRepr<f64>, D>,
    squared: bool,
) -> ArrayBase<OwnedRepr<f64>, D::Smaller>
where
    D: Dimension + RemoveAxis,
{
    let prod: ArrayBase<OwnedRepr<f64>, D> = x * x;
    let sum: ArrayBase<OwnedRepr<f64>, D::Smaller> = prod.sum_axis(Axis(1));
    if squared { sum } else { sum.sqrt() }
}

/// Pairwise distances between the rows of `a` and the rows of `b`.
///
/// Uses `|a|^2 - 2ab + |b|^2`; pass precomputed squared norms to skip recomputing them.
pub fn euclidean_distances(
    a: &Array2<f64>,                      // a = (n_a, n_features)
    b: &Array2<f64>,                      // b = (n_b, n_features)
    a_norm_squared: Option<&Array1<f64>>, // a_norm_squared = (n_a,)
    b_norm_squared: Option<&Array1<f64>>, // b_norm_squared = (n_b,)
    squared: bool,
) -> Array2<f64> {
    let aa: Array1<f64> = a_norm_squared
        .cloned()
        .unwrap_or_else(|| row_norms(a, true));
    let bb: Array1<f64> = b_norm_squared
        .cloned()
        .unwrap_or_else(|| row_norms(b, true));

    let mut distances: Array2<f64> = -2.0 * a.dot(&b.t()); // (n_a, n_b)
    distances += &aa.insert_axis(Axis(1)); // (n_a, 1) broadcast
    distances += &bb.insert_axis(Axis(0)); // (1, n_b) broadcast
    distances.mapv_inplace(|d| if d > 0.0 { d } else { 0.0 });
    if !squared {
        distances.mapv_inplace(f64::sqrt);
    }
    distances
}

/// Equivalent to `np.searchsorted(np.cumsum(weights), rand_vals)` (left side).
pub fn searchsorted_cumsum(weights: &Array1<f64>, rand_vals: &Array1<f64>) -> Vec<usize> {
    let mut acc = 0.0;
    let cumsum: Vec<f64> = weights
        .iter()
        .map(|w| {
            acc += w;
            acc
        })
        .collect();
    rand_vals
        .iter()
        .map(|&rv| cumsum.partition_point(|&c| c < rv))
        .collect()
}
