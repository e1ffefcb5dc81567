//! # Ratings Loader
//!
//! Reads a tab-separated ratings table into a validated [`RatingMatrix`].
//!
//! With labels, the first line holds a corner cell followed by one label per item, and
//! every following line starts with the entity label. Cells are separated by tabs
//! (written `\t` below) and every row carries one cell per item, even when it is empty:
//!
//! ```text
//! user\tRed\tBlue\tGreen
//! John\t1\t2\t
//! Sue\t4\t\t5
//! ```
//!
//! Empty cells and explicit zeros both mean "not rated".

use crate::matrix::{MatrixError, RatingMatrix};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// A loaded ratings table.
#[derive(Debug)]
pub struct RatingsTable {
    pub ratings: RatingMatrix,
    pub row_labels: Option<Vec<String>>,
    pub col_labels: Option<Vec<String>>,
}

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Malformed tab-separated input: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Line {line}, column {column}: '{value}' is not a number.")]
    InvalidNumber {
        line: u64,
        column: usize,
        value: String,
    },
    #[error("The header names {labels} items, but the first data row has {values} ratings.")]
    HeaderWidthMismatch { labels: usize, values: usize },
    #[error("The ratings do not form a valid matrix: {0}")]
    MatrixError(#[from] MatrixError),
}

/// Loads a ratings table from disk.
pub fn load_ratings(path: impl AsRef<Path>, has_labels: bool) -> Result<RatingsTable, DataError> {
    let path = path.as_ref();
    let table = read_ratings(File::open(path)?, has_labels)?;
    let (rows, cols) = table.ratings.dim();
    log::info!(
        "Loaded {}x{} ratings ({} observed) from {}",
        rows,
        cols,
        table.ratings.observed().count(),
        path.display()
    );
    Ok(table)
}

/// Parses a ratings table from any reader.
pub fn read_ratings<R: Read>(reader: R, has_labels: bool) -> Result<RatingsTable, DataError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_labels)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let col_labels = if has_labels {
        let headers = csv_reader.headers()?;
        Some(headers.iter().skip(1).map(str::to_string).collect::<Vec<_>>())
    } else {
        None
    };

    let mut row_labels = Vec::new();
    let mut rows = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let line = record.position().map_or(0, |position| position.line());

        let mut fields = record.iter();
        if has_labels {
            row_labels.push(fields.next().unwrap_or_default().to_string());
        }
        let values = fields
            .enumerate()
            .map(|(column, field)| parse_cell(field, line, column))
            .collect::<Result<Vec<f64>, _>>()?;
        rows.push(values);
    }

    if let (Some(labels), Some(first)) = (&col_labels, rows.first()) {
        if labels.len() != first.len() {
            return Err(DataError::HeaderWidthMismatch {
                labels: labels.len(),
                values: first.len(),
            });
        }
    }

    Ok(RatingsTable {
        ratings: RatingMatrix::from_rows(rows)?,
        row_labels: has_labels.then_some(row_labels),
        col_labels,
    })
}

fn parse_cell(field: &str, line: u64, column: usize) -> Result<f64, DataError> {
    if field.is_empty() {
        return Ok(0.0);
    }
    field.parse::<f64>().map_err(|_| DataError::InvalidNumber {
        line,
        column,
        value: field.to_string(),
    })
}
