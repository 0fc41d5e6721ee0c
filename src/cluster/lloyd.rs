use ndarray::prelude::*;

use crate::cluster::utils::row_norms;

static CHUNK_SIZE: usize = 256;

/// Sum of squared distances of every sample to its assigned center.
fn inertia_dense(
    x: &Array2<f64>,        // x = (n_samples, n_features)
    centers: &Array2<f64>,  // centers = (n_clusters, n_features)
    labels: &Array1<usize>, // labels = (n_samples,)
) -> f64 {
    labels
        .iter()
        .enumerate()
        .map(|(i, &label)| {
            let diff = &x.row(i) - &centers.row(label);
            diff.mapv(|v| v * v).sum()
        })
        .sum()
}

/// Index of the smallest value; ties go to the lowest index.
fn argmin(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::INFINITY), |(best, best_d), (j, &d)| {
            if d < best_d { (j, d) } else { (best, best_d) }
        })
        .0
}

/// Assign one chunk of samples and accumulate their per-cluster sums.
fn update_chunk_dense(
    x_chunk: ArrayView2<f64>,            // x_chunk = (chunk_size, n_features)
    centers_old: &Array2<f64>,           // centers_old = (n_clusters, n_features)
    centers_squared_norms: &Array1<f64>, // centers_squared_norms = (n_clusters,)
    update_centers: bool,
) -> (Array1<usize>, Array2<f64>, Array1<f64>) {
    let n_samples = x_chunk.nrows();
    let n_clusters = centers_old.nrows();

    // |x|^2 is constant per row and does not change the argmin, so it is left out.
    // pairwise = (chunk_size, n_clusters)
    let mut pairwise = x_chunk.dot(&centers_old.t());
    pairwise.mapv_inplace(|v| -2.0 * v);
    pairwise += &centers_squared_norms.view().insert_axis(Axis(0));

    let mut labels_chunk = Array1::<usize>::zeros(n_samples);
    let mut sums_chunk = Array2::<f64>::zeros((n_clusters, x_chunk.ncols()));
    let mut counts_chunk = Array1::<f64>::zeros(n_clusters);

    for (i, distances_row) in pairwise.axis_iter(Axis(0)).enumerate() {
        let label = argmin(distances_row);
        labels_chunk[i] = label;
        if update_centers {
            counts_chunk[label] += 1.0;
            let mut sum = sums_chunk.row_mut(label);
            sum += &x_chunk.row(i);
        }
    }

    (labels_chunk, sums_chunk, counts_chunk)
}

/// Single Lloyd iteration split into chunks to limit temporary allocations.
/// Returns (centers_new, counts, labels, center_shift).
pub fn lloyd_iter_chunked_dense(
    x: &Array2<f64>,           // x = (n_samples, n_features)
    centers_old: &Array2<f64>, // centers_old = (n_clusters, n_features)
    update_centers: bool,
) -> (Array2<f64>, Array1<f64>, Array1<usize>, Array1<f64>) {
    let n_samples = x.nrows();
    let (n_clusters, n_features) = centers_old.dim();

    let centers_squared_norms = row_norms(centers_old, true);
    let mut sums = Array2::<f64>::zeros((n_clusters, n_features));
    let mut counts = Array1::<f64>::zeros(n_clusters);
    let mut labels = Array1::<usize>::zeros(n_samples);

    let mut start = 0;
    while start < n_samples {
        let end = (start + CHUNK_SIZE).min(n_samples);
        let (labels_chunk, sums_chunk, counts_chunk) = update_chunk_dense(
            x.slice(s![start..end, ..]),
            centers_old,
            &centers_squared_norms,
            update_centers,
        );
        labels.slice_mut(s![start..end]).assign(&labels_chunk);
        if update_centers {
            sums += &sums_chunk;
            counts += &counts_chunk;
        }
        start = end;
    }

    if !update_centers {
        return (
            centers_old.clone(),
            counts,
            labels,
            Array1::<f64>::zeros(n_clusters),
        );
    }

    let mut centers_new = sums;
    for (cluster, mut center) in centers_new.axis_iter_mut(Axis(0)).enumerate() {
        if counts[cluster] > 0.0 {
            center /= counts[cluster];
        } else {
            // empty cluster keeps its previous center
            center.assign(&centers_old.row(cluster));
        }
    }
    let diff = centers_old - &centers_new; // (n_clusters, n_features)
    let center_shift = row_norms(&diff, false); // (n_clusters,)

    (centers_new, counts, labels, center_shift)
}

/// Run a single K-Means using Lloyd's algorithm.
/// Returns (labels, inertia, centers, n_iter).
pub fn kmeans_single_lloyd(
    x: &Array2<f64>,            // x = (n_samples, n_features)
    centers_init: &Array2<f64>, // centers_init = (n_clusters, n_features)
    max_iter: usize,
    tol: f64,
) -> (Array1<usize>, f64, Array2<f64>, usize) {
    let n_samples = x.nrows();

    let mut centers = centers_init.clone();
    let mut labels = Array1::<usize>::zeros(n_samples);
    let mut labels_old = Array1::<usize>::from_elem(n_samples, usize::MAX);
    let mut strict_convergence = false;
    let mut iterations = 0;

    for i in 0..max_iter {
        let (centers_new, _counts, new_labels, center_shift) =
            lloyd_iter_chunked_dense(x, &centers, true);

        iterations = i + 1;

        if new_labels == labels_old {
            centers = centers_new;
            labels = new_labels;
            strict_convergence = true;
            break;
        }

        let center_shift_tot: f64 = center_shift.iter().map(|v| v * v).sum();

        centers = centers_new;
        labels = new_labels.clone();
        labels_old = new_labels;

        if center_shift_tot <= tol {
            break;
        }
    }

    if !strict_convergence {
        // labels must reflect the final centers
        let (_, _, refreshed_labels, _) = lloyd_iter_chunked_dense(x, &centers, false);
        labels = refreshed_labels;
    }

    let inertia = inertia_dense(x, &centers, &labels);

    (labels, inertia, centers, iterations)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn assert_all_close_2d(actual: &Array2<f64>, expected: &Array2<f64>, tol: f64) {
        assert_eq!(actual.dim(), expected.dim(), "2D shapes differ");
        for ((idx, a), e) in actual.indexed_iter().zip(expected.iter()) {
            assert!((a - e).abs() <= tol, "expected {e}, got {a} at {idx:?}, tol {tol}");
        }
    }

    #[test]
    fn kmeans_lloyd_matches_two_cluster_example() {
        let x = array![
            [1.0, 2.0],
            [1.0, 4.0],
            [1.0, 0.0],
            [10.0, 2.0],
            [10.0, 4.0],
            [10.0, 0.0]
        ]; // x = (6, 2)
        let centers_init = array![[1.0, 2.0], [10.0, 2.0]]; // (2, 2)

        let (labels, inertia, centers, n_iter) = kmeans_single_lloyd(&x, &centers_init, 20, 1e-6);

        assert!(n_iter > 0);
        assert_eq!(labels.to_vec(), vec![0, 0, 0, 1, 1, 1]);
        assert_all_close_2d(&centers, &array![[1.0, 2.0], [10.0, 2.0]], 1e-8);
        assert!((inertia - 16.0).abs() < 1e-8, "inertia={inertia}");
    }

    #[test]
    fn centers_move_to_cluster_means() {
        let x = array![[0.0], [2.0], [10.0]]; // x = (3, 1)
        let centers_init = array![[0.0], [10.0]]; // (2, 1)

        let (labels, inertia, centers, _) = kmeans_single_lloyd(&x, &centers_init, 20, 1e-8);

        assert_eq!(labels.to_vec(), vec![0, 0, 1]);
        assert_all_close_2d(&centers, &array![[1.0], [10.0]], 1e-8);
        assert!((inertia - 2.0).abs() < 1e-8, "inertia={inertia}");
    }

    #[test]
    fn lloyd_iter_labels_without_updating_centers() {
        let x = array![[0.0], [9.0], [10.0], [11.0]]; // (4, 1)
        let centers_old = array![[0.0], [10.0]]; // (2, 1)

        let (centers_new, counts, labels, center_shift) =
            lloyd_iter_chunked_dense(&x, &centers_old, false);

        assert_eq!(labels.to_vec(), vec![0, 1, 1, 1]);
        assert_eq!(centers_new, centers_old);
        assert!(counts.iter().all(|w| *w == 0.0));
        assert!(center_shift.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn empty_cluster_keeps_its_center() {
        let x = array![[0.0], [1.0]];
        let centers_old = array![[0.5], [100.0]];

        let (centers_new, counts, labels, _) = lloyd_iter_chunked_dense(&x, &centers_old, true);

        assert_eq!(labels.to_vec(), vec![0, 0]);
        assert_eq!(counts.to_vec(), vec![2.0, 0.0]);
        assert_eq!(centers_new, array![[0.5], [100.0]]);
    }

    #[test]
    fn chunked_iteration_handles_multiple_chunks() {
        // 270 samples force two chunks when CHUNK_SIZE=256.
        let mut data = Vec::with_capacity(270);
        data.extend(vec![0.0; 135]);
        data.extend(vec![10.0; 135]);
        let x = Array2::from_shape_vec((270, 1), data).unwrap(); // x = (270, 1)
        let centers_init = array![[0.0], [10.0]]; // (2, 1)

        let (labels, _inertia, centers, _) = kmeans_single_lloyd(&x, &centers_init, 30, 1e-8);

        assert_all_close_2d(&centers, &array![[0.0], [10.0]], 1e-8);
        let count_cluster0 = labels.iter().filter(|&&l| l == 0).count();
        let count_cluster1 = labels.iter().filter(|&&l| l == 1).count();
        assert_eq!((count_cluster0, count_cluster1), (135, 135));
    }
}
