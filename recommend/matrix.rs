use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatrixError {
    #[error("A rating matrix needs at least one row and one column, but got {rows}x{cols}.")]
    Empty { rows: usize, cols: usize },
    #[error("Row {row} has {found} values, but the first row has {expected}. Rows must all be the same length.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Cell ({row}, {col}) holds the non-finite value {value}. Ratings must be finite numbers.")]
    NonFinite { row: usize, col: usize, value: f64 },
}

/// Which cells of a rating matrix carry an observation.
///
/// A stored value of exactly `0.0` means "never rated", not "rated zero". The mask is
/// the single place that convention is evaluated; bias, error and recommendation
/// code ask the mask instead of comparing against zero themselves.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservedMask(Array2<bool>);

impl ObservedMask {
    pub fn from_values(values: ArrayView2<'_, f64>) -> Self {
        Self(values.mapv(|v| v != 0.0))
    }

    pub fn is_observed(&self, row: usize, col: usize) -> bool {
        self.0[[row, col]]
    }

    pub fn row(&self, row: usize) -> ArrayView1<'_, bool> {
        self.0.row(row)
    }

    /// Number of observed cells.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|&&observed| observed).count()
    }

    pub fn as_view(&self) -> ArrayView2<'_, bool> {
        self.0.view()
    }
}

/// A validated, immutable N x M rating matrix (rows are entities, columns are items).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Array2<f64>", into = "Array2<f64>")]
pub struct RatingMatrix {
    values: Array2<f64>,
    observed: ObservedMask,
}

impl RatingMatrix {
    pub fn new(values: Array2<f64>) -> Result<Self, MatrixError> {
        let (rows, cols) = values.dim();
        if rows == 0 || cols == 0 {
            return Err(MatrixError::Empty { rows, cols });
        }
        if let Some(((row, col), &value)) = values.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(MatrixError::NonFinite { row, col, value });
        }

        let observed = ObservedMask::from_values(values.view());
        Ok(Self { values, observed })
    }

    /// Builds a matrix from row vectors, rejecting ragged input.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MatrixError> {
        let num_rows = rows.len();
        let num_cols = rows.first().map_or(0, Vec::len);
        if num_rows == 0 || num_cols == 0 {
            return Err(MatrixError::Empty {
                rows: num_rows,
                cols: num_cols,
            });
        }
        if let Some((row, found)) = rows
            .iter()
            .map(Vec::len)
            .enumerate()
            .find(|&(_, len)| len != num_cols)
        {
            return Err(MatrixError::RaggedRow {
                row,
                expected: num_cols,
                found,
            });
        }

        Self::new(Array2::from_shape_fn((num_rows, num_cols), |(i, j)| {
            rows[i][j]
        }))
    }

    pub fn observed(&self) -> &ObservedMask {
        &self.observed
    }

    pub fn as_view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.values
    }
}

impl Deref for RatingMatrix {
    type Target = Array2<f64>;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl TryFrom<Array2<f64>> for RatingMatrix {
    type Error = MatrixError;

    fn try_from(values: Array2<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<RatingMatrix> for Array2<f64> {
    fn from(matrix: RatingMatrix) -> Self {
        matrix.values
    }
}
