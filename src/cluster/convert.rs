use ndarray::prelude::*;
use tracing::trace;

use crate::embed::EmbeddingMatrix;

/// Widen the persisted `f32` rows into the `f64` matrix the clusterer works on.
pub fn embeddings_to_ndarray(matrix: &EmbeddingMatrix) -> Array2<f64> {
    let mut arr: Array2<f64> = Array2::<f64>::zeros((matrix.len(), matrix.dim()));
    trace!("Initialized ndarray with shape: {:?}", arr.dim());
    for (mut row, src) in arr.axis_iter_mut(Axis(0)).zip(matrix.rows()) {
        for (val, &v) in row.iter_mut().zip(src) {
            *val = v as f64;
        }
    }
    arr
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn converts_embeddings_to_f64_ndarray() {
        let matrix =
            EmbeddingMatrix::from_rows(vec![vec![1.0_f32, 2.5_f32], vec![3.75_f32, -4.0_f32]])
                .unwrap();

        let arr = embeddings_to_ndarray(&matrix);

        assert_eq!(arr, array![[1.0_f64, 2.5_f64], [3.75_f64, -4.0_f64]]);
    }

    #[test]
    fn empty_matrix_gives_empty_array() {
        let arr = embeddings_to_ndarray(&EmbeddingMatrix::empty());
        assert_eq!(arr.dim(), (0, 0));
    }
}
