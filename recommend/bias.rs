//! # Average-Based Bias
//!
//! Captures how far the whole matrix, each row, and each column sit from zero so the
//! factorizer only has to learn the interaction structure left over.
//!
//! Averages divide by the full row or column length. Unobserved cells (stored as
//! zero) therefore pull the averages down on sparse inputs; this matches the
//! reference behaviour of the engine and is kept deliberately.

use crate::matrix::RatingMatrix;
use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};

/// Global, per-row, and per-column offsets of a rating matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bias {
    /// Mean over every cell.
    pub average: f64,
    /// `row_average[i] - average`, one entry per row.
    pub row_bias: Array1<f64>,
    /// `col_average[j] - average`, one entry per column.
    pub col_bias: Array1<f64>,
}

impl Bias {
    /// The additive correction for cell `(row, col)`.
    pub fn offset(&self, row: usize, col: usize) -> f64 {
        self.average + self.row_bias[row] + self.col_bias[col]
    }

    /// True when this bias was computed for a matrix of the given shape.
    pub fn matches_shape(&self, rows: usize, cols: usize) -> bool {
        self.row_bias.len() == rows && self.col_bias.len() == cols
    }
}

/// Computes the global, row and column bias of `input`.
pub fn compute_bias(input: &RatingMatrix) -> Bias {
    let (rows, cols) = input.dim();

    let average = input.sum() / (rows * cols) as f64;
    let row_average = input.sum_axis(Axis(1)) / cols as f64;
    let col_average = input.sum_axis(Axis(0)) / rows as f64;

    log::debug!(
        "Computed bias for {}x{} matrix: global average {:.6}",
        rows,
        cols,
        average
    );

    Bias {
        average,
        row_bias: row_average - average,
        col_bias: col_average - average,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn sparse_input() -> RatingMatrix {
        RatingMatrix::new(array![
            [1.0, 2.0, 3.0, 0.0],
            [4.0, 0.0, 5.0, 6.0],
            [7.0, 8.0, 0.0, 9.0]
        ])
        .unwrap()
    }

    #[test]
    fn constant_matrix_has_no_row_or_column_bias() {
        let input = RatingMatrix::new(Array2::from_elem((3, 2), 2.0)).unwrap();
        let bias = compute_bias(&input);

        assert_abs_diff_eq!(bias.average, 2.0, epsilon = 1e-12);
        assert_eq!(bias.row_bias.len(), 3);
        assert_eq!(bias.col_bias.len(), 2);
        for &value in bias.row_bias.iter().chain(bias.col_bias.iter()) {
            assert_abs_diff_eq!(value, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn sparse_matrix_bias_counts_unobserved_cells() {
        let bias = compute_bias(&sparse_input());

        assert_abs_diff_eq!(bias.average, 3.75, epsilon = 1e-12);
        let expected_rows = [-2.25, 0.0, 2.25];
        let expected_cols = [0.25, -5.0 / 12.0, -13.0 / 12.0, 1.25];
        for (actual, expected) in bias.row_bias.iter().zip(expected_rows) {
            assert_abs_diff_eq!(*actual, expected, epsilon = 1e-12);
        }
        for (actual, expected) in bias.col_bias.iter().zip(expected_cols) {
            assert_abs_diff_eq!(*actual, expected, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(bias.col_bias[1], -0.42, epsilon = 5e-3);
        assert_abs_diff_eq!(bias.col_bias[2], -1.08, epsilon = 5e-3);
    }

    #[test]
    fn offset_sums_all_three_terms() {
        let bias = compute_bias(&sparse_input());
        assert_abs_diff_eq!(bias.offset(2, 3), 3.75 + 2.25 + 1.25, epsilon = 1e-12);
        assert!(bias.matches_shape(3, 4));
        assert!(!bias.matches_shape(4, 3));
    }
}
