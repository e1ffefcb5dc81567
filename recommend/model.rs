use crate::bias::Bias;
use crate::factorize::{FactorizationConfig, StopReason};
use crate::matrix::RatingMatrix;
use ahash::AHashMap;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Query Keys ---

/// Identifies the entity (row) a query is about.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RowKey {
    /// Zero-based row index.
    Index(usize),
    /// A row label, resolved to the first row carrying it.
    Label(String),
}

impl RowKey {
    pub fn by_index(index: usize) -> Self {
        Self::Index(index)
    }

    pub fn by_label(label: impl Into<String>) -> Self {
        Self::Label(label.into())
    }
}

impl From<usize> for RowKey {
    fn from(index: usize) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for RowKey {
    fn from(label: &str) -> Self {
        Self::Label(label.to_string())
    }
}

impl From<String> for RowKey {
    fn from(label: String) -> Self {
        Self::Label(label)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "#{index}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// Identifies an item (column) in query results: its label when column labels are
/// configured, otherwise its index.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Index(usize),
    Label(String),
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// One item of a ranking together with its estimated score.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedItem {
    pub item: ItemKey,
    pub score: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelAxis {
    Rows,
    Columns,
}

impl fmt::Display for LabelAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rows => "row",
            Self::Columns => "column",
        })
    }
}

/// Label names for one axis plus a first-occurrence lookup table.
#[derive(Clone, Debug)]
struct Labels {
    names: Vec<String>,
    first_index: AHashMap<String, usize>,
}

impl Labels {
    fn new(names: Vec<String>) -> Self {
        let mut first_index = AHashMap::with_capacity(names.len());
        for (index, name) in names.iter().enumerate() {
            first_index.entry(name.clone()).or_insert(index);
        }
        Self { names, first_index }
    }

    fn position(&self, label: &str) -> Option<usize> {
        self.first_index.get(label).copied()
    }
}

// --- Public Data Structures ---

/// How a model was trained. Stored with the model so a saved file documents itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub iterations: usize,
    pub total_error: f64,
    pub stop_reason: StopReason,
    pub config: FactorizationConfig,
    /// The bias removed before factorization and added back afterwards, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias: Option<Bias>,
}

/// A trained recommender: the original ratings, the dense estimate, and optional
/// labels for both axes.
#[derive(Clone, Debug)]
pub struct RecommendationModel {
    input: RatingMatrix,
    estimated: Array2<f64>,
    row_labels: Option<Labels>,
    col_labels: Option<Labels>,
    summary: Option<TrainingSummary>,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Expected {expected} {axis} labels to match the rating matrix, but got {found}.")]
    LabelCountMismatch {
        axis: LabelAxis,
        expected: usize,
        found: usize,
    },
    #[error(
        "The estimate is {found_rows}x{found_cols}, but the input ratings are {expected_rows}x{expected_cols}."
    )]
    EstimateShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },
    #[error("Row index {index} is out of range for a model with {rows} rows.")]
    RowIndexOutOfRange { index: usize, rows: usize },
    #[error("Column index {index} is out of range for a model with {cols} columns.")]
    ColumnIndexOutOfRange { index: usize, cols: usize },
    #[error("No {axis} is labelled '{label}'.")]
    UnknownLabel { axis: LabelAxis, label: String },
    #[error("Cannot look up {axis} label '{label}': this model has no {axis} labels.")]
    LabelsNotConfigured { axis: LabelAxis, label: String },
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl ModelError {
    /// True for lookup misses, which callers may recover from by asking again.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RowIndexOutOfRange { .. }
                | Self::ColumnIndexOutOfRange { .. }
                | Self::UnknownLabel { .. }
                | Self::LabelsNotConfigured { .. }
        )
    }
}

/// On-disk layout of a model file.
#[derive(Serialize, Deserialize)]
struct StoredModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    row_labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    col_labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<TrainingSummary>,
    input: RatingMatrix,
    estimated: Array2<f64>,
}

impl RecommendationModel {
    /// Assembles a model, checking that the estimate and labels fit the input shape.
    pub fn new(
        input: RatingMatrix,
        estimated: Array2<f64>,
        row_labels: Option<Vec<String>>,
        col_labels: Option<Vec<String>>,
    ) -> Result<Self, ModelError> {
        check_estimate_shape(&input, &estimated)?;
        check_label_counts(&input, row_labels.as_deref(), col_labels.as_deref())?;

        Ok(Self {
            input,
            estimated,
            row_labels: row_labels.map(Labels::new),
            col_labels: col_labels.map(Labels::new),
            summary: None,
        })
    }

    pub fn with_summary(mut self, summary: TrainingSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn input(&self) -> &RatingMatrix {
        &self.input
    }

    pub fn estimated(&self) -> &Array2<f64> {
        &self.estimated
    }

    pub fn row_labels(&self) -> Option<&[String]> {
        self.row_labels.as_ref().map(|labels| labels.names.as_slice())
    }

    pub fn col_labels(&self) -> Option<&[String]> {
        self.col_labels.as_ref().map(|labels| labels.names.as_slice())
    }

    pub fn summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }

    /// Replaces the estimate, e.g. with hand-written scores in tests.
    pub fn set_estimated(&mut self, estimated: Array2<f64>) -> Result<(), ModelError> {
        check_estimate_shape(&self.input, &estimated)?;
        self.estimated = estimated;
        Ok(())
    }

    /// Resolves a row key to a row index.
    pub fn resolve_row(&self, key: &RowKey) -> Result<usize, ModelError> {
        let rows = self.input.nrows();
        match key {
            RowKey::Index(index) if *index < rows => Ok(*index),
            RowKey::Index(index) => Err(ModelError::RowIndexOutOfRange {
                index: *index,
                rows,
            }),
            RowKey::Label(label) => lookup(self.row_labels.as_ref(), LabelAxis::Rows, label),
        }
    }

    /// Resolves an item key back to a column index.
    pub fn resolve_column(&self, key: &ItemKey) -> Result<usize, ModelError> {
        let cols = self.input.ncols();
        match key {
            ItemKey::Index(index) if *index < cols => Ok(*index),
            ItemKey::Index(index) => Err(ModelError::ColumnIndexOutOfRange {
                index: *index,
                cols,
            }),
            ItemKey::Label(label) => lookup(self.col_labels.as_ref(), LabelAxis::Columns, label),
        }
    }

    /// Every item for the given row, highest estimated score first.
    ///
    /// Equal scores keep ascending column order.
    pub fn rank_all_items(&self, key: impl Into<RowKey>) -> Result<Vec<RankedItem>, ModelError> {
        let row = self.resolve_row(&key.into())?;
        Ok(self.rank_row(row))
    }

    /// Items the row has never rated, highest estimated score first.
    pub fn recommendations(&self, key: impl Into<RowKey>) -> Result<Vec<RankedItem>, ModelError> {
        let row = self.resolve_row(&key.into())?;
        self.unrated_in_row(row)
    }

    /// The first `count` entries of [`recommendations`](Self::recommendations).
    pub fn top_recommendations(
        &self,
        key: impl Into<RowKey>,
        count: usize,
    ) -> Result<Vec<RankedItem>, ModelError> {
        let mut items = self.recommendations(key)?;
        items.truncate(count);
        Ok(items)
    }

    /// Recommendations for every row, in row order.
    pub fn recommendations_for_all_rows(&self) -> Result<Vec<Vec<RankedItem>>, ModelError> {
        (0..self.input.nrows())
            .into_par_iter()
            .map(|row| self.unrated_in_row(row))
            .collect()
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let stored = StoredModel {
            row_labels: self.row_labels().map(<[String]>::to_vec),
            col_labels: self.col_labels().map(<[String]>::to_vec),
            summary: self.summary.clone(),
            input: self.input.clone(),
            estimated: self.estimated.clone(),
        };
        let toml_string = toml::to_string_pretty(&stored)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a model from a TOML file, re-validating every shape and label invariant.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let stored: StoredModel = toml::from_str(&toml_string)?;
        let model = Self::new(
            stored.input,
            stored.estimated,
            stored.row_labels,
            stored.col_labels,
        )?;
        Ok(match stored.summary {
            Some(summary) => model.with_summary(summary),
            None => model,
        })
    }

    fn item_key(&self, col: usize) -> ItemKey {
        match &self.col_labels {
            Some(labels) => ItemKey::Label(labels.names[col].clone()),
            None => ItemKey::Index(col),
        }
    }

    fn rank_row(&self, row: usize) -> Vec<RankedItem> {
        let mut ranked: Vec<RankedItem> = self
            .estimated
            .row(row)
            .iter()
            .enumerate()
            .map(|(col, &score)| RankedItem {
                item: self.item_key(col),
                score,
            })
            .collect();
        // Stable sort: ties stay in column order.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    fn unrated_in_row(&self, row: usize) -> Result<Vec<RankedItem>, ModelError> {
        let observed = self.input.observed();
        let mut unrated = Vec::new();
        for ranked in self.rank_row(row) {
            let col = self.resolve_column(&ranked.item)?;
            if !observed.is_observed(row, col) {
                unrated.push(ranked);
            }
        }
        Ok(unrated)
    }
}

fn check_estimate_shape(input: &RatingMatrix, estimated: &Array2<f64>) -> Result<(), ModelError> {
    let (expected_rows, expected_cols) = input.dim();
    let (found_rows, found_cols) = estimated.dim();
    if (expected_rows, expected_cols) != (found_rows, found_cols) {
        return Err(ModelError::EstimateShapeMismatch {
            expected_rows,
            expected_cols,
            found_rows,
            found_cols,
        });
    }
    Ok(())
}

/// Checks label counts against the input shape without building lookup tables.
pub(crate) fn check_label_counts(
    input: &RatingMatrix,
    row_labels: Option<&[String]>,
    col_labels: Option<&[String]>,
) -> Result<(), ModelError> {
    let (rows, cols) = input.dim();
    for (labels, axis, expected) in [
        (row_labels, LabelAxis::Rows, rows),
        (col_labels, LabelAxis::Columns, cols),
    ] {
        if let Some(labels) = labels {
            if labels.len() != expected {
                return Err(ModelError::LabelCountMismatch {
                    axis,
                    expected,
                    found: labels.len(),
                });
            }
        }
    }
    Ok(())
}

fn lookup(labels: Option<&Labels>, axis: LabelAxis, label: &str) -> Result<usize, ModelError> {
    let labels = labels.ok_or_else(|| ModelError::LabelsNotConfigured {
        axis,
        label: label.to_string(),
    })?;
    labels.position(label).ok_or_else(|| ModelError::UnknownLabel {
        axis,
        label: label.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn labels(names: &[&str]) -> Option<Vec<String>> {
        Some(names.iter().map(|name| name.to_string()).collect())
    }

    fn small_model(
        row_labels: Option<Vec<String>>,
        col_labels: Option<Vec<String>>,
    ) -> RecommendationModel {
        let input = RatingMatrix::new(array![
            [1.0, 2.0, 3.0, 0.0],
            [4.0, 0.0, 5.0, 6.0],
            [7.0, 8.0, 0.0, 9.0]
        ])
        .unwrap();
        let estimated = array![
            [1.0, 2.0, 3.0, 0.5],
            [4.0, 0.5, 5.0, 6.0],
            [7.0, 8.0, 0.5, 9.0]
        ];
        RecommendationModel::new(input, estimated, row_labels, col_labels).unwrap()
    }

    fn wide_model(
        row_labels: Option<Vec<String>>,
        col_labels: Option<Vec<String>>,
    ) -> RecommendationModel {
        let input = RatingMatrix::new(array![
            [1.0, 2.0, 3.0, 0.0, 2.0, 5.0, 0.0, 1.0],
            [4.0, 0.0, 5.0, 6.0, 3.0, 1.0, 0.0, 0.0],
            [7.0, 8.0, 0.0, 9.0, 0.0, 2.0, 0.0, 2.0]
        ])
        .unwrap();
        let estimated = array![
            [1.0, 2.0, 3.0, 0.5, 2.0, 5.0, 0.9, 1.0],
            [4.0, 0.2, 5.0, 6.0, 3.0, 1.0, 0.8, 0.1],
            [7.0, 8.0, 0.4, 9.0, 0.5, 2.0, 0.2, 2.0]
        ];
        RecommendationModel::new(input, estimated, row_labels, col_labels).unwrap()
    }

    fn item_names(items: &[RankedItem]) -> Vec<String> {
        items.iter().map(|ranked| ranked.item.to_string()).collect()
    }

    #[test]
    fn rank_all_items_with_labels() {
        let model = small_model(
            labels(&["John", "Sue", "Joe"]),
            labels(&["Red", "Blue", "Green", "Purple"]),
        );
        let sue = model.rank_all_items("Sue").unwrap();

        assert_eq!(item_names(&sue), vec!["Purple", "Green", "Red", "Blue"]);
        assert_eq!(sue[0].score, 6.0);
    }

    #[test]
    fn rank_all_items_without_labels() {
        let model = small_model(None, None);
        let ranked = model.rank_all_items(2).unwrap();

        let indices: Vec<ItemKey> = ranked.into_iter().map(|ranked| ranked.item).collect();
        assert_eq!(
            indices,
            vec![
                ItemKey::Index(3),
                ItemKey::Index(1),
                ItemKey::Index(0),
                ItemKey::Index(2)
            ]
        );
    }

    #[test]
    fn label_and_index_address_the_same_row() {
        let labelled = small_model(labels(&["John", "Sue", "Joe"]), None);
        let plain = small_model(None, None);

        assert_eq!(
            labelled.rank_all_items(RowKey::by_label("Sue")).unwrap(),
            plain.rank_all_items(RowKey::by_index(1)).unwrap()
        );
    }

    #[test]
    fn recommendations_with_labels() {
        let model = wide_model(
            labels(&["John", "Sue", "Joe"]),
            labels(&["Red", "Blue", "Green", "Purple", "Brown", "Black", "White", "Gray"]),
        );
        let joe = model.recommendations("Joe").unwrap();
        assert_eq!(item_names(&joe), vec!["Brown", "Green", "White"]);
    }

    #[test]
    fn recommendations_without_labels() {
        let model = wide_model(None, None);
        let row_one = model.recommendations(1).unwrap();
        assert_eq!(item_names(&row_one), vec!["6", "1", "7"]);
    }

    #[test]
    fn recommendations_skip_rated_items_regardless_of_score() {
        let model = wide_model(None, None);
        for row in 0..3 {
            let recommended = model.recommendations(row).unwrap();
            for ranked in &recommended {
                let col = model.resolve_column(&ranked.item).unwrap();
                assert_eq!(model.input()[[row, col]], 0.0);
            }
            for pair in recommended.windows(2) {
                assert!(pair[0].score >= pair[1].score);
            }
        }
    }

    #[test]
    fn top_recommendations_truncates() {
        let model = wide_model(None, None);
        let top = model.top_recommendations(1, 2).unwrap();
        assert_eq!(item_names(&top), vec!["6", "1"]);
    }

    #[test]
    fn all_rows_match_single_row_queries() {
        let model = wide_model(None, None);
        let all = model.recommendations_for_all_rows().unwrap();
        assert_eq!(all.len(), 3);
        for (row, items) in all.iter().enumerate() {
            assert_eq!(items, &model.recommendations(row).unwrap());
        }
    }

    #[test]
    fn ties_keep_column_order() {
        let input = RatingMatrix::new(array![[0.0, 0.0, 0.0]]).unwrap();
        let model =
            RecommendationModel::new(input, array![[1.0, 2.0, 1.0]], None, None).unwrap();
        assert_eq!(item_names(&model.rank_all_items(0).unwrap()), vec!["1", "0", "2"]);
    }

    #[test]
    fn lookup_misses_are_explicit() {
        let model = small_model(labels(&["John", "Sue", "Joe"]), None);

        let err = model.rank_all_items("Nobody").unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, ModelError::UnknownLabel { axis: LabelAxis::Rows, .. }));

        let err = model.recommendations(7).unwrap_err();
        assert!(matches!(err, ModelError::RowIndexOutOfRange { index: 7, rows: 3 }));

        let unlabelled = small_model(None, None);
        assert!(matches!(
            unlabelled.rank_all_items("Sue").unwrap_err(),
            ModelError::LabelsNotConfigured { .. }
        ));
    }

    #[test]
    fn duplicate_labels_resolve_to_first_match() {
        let model = small_model(labels(&["Sue", "Sue", "Joe"]), None);
        assert_eq!(model.resolve_row(&RowKey::by_label("Sue")).unwrap(), 0);
    }

    #[test]
    fn duplicate_column_labels_filter_by_first_column() {
        let input = RatingMatrix::new(array![[1.0, 0.0, 0.0]]).unwrap();
        let model = RecommendationModel::new(
            input,
            array![[1.0, 5.0, 2.0]],
            None,
            labels(&["A", "A", "B"]),
        )
        .unwrap();

        let recommended = model.recommendations(0).unwrap();
        assert_eq!(item_names(&recommended), vec!["B"]);
        assert_eq!(recommended[0].score, 2.0);
    }

    #[test]
    fn mismatched_labels_are_rejected() {
        let input = RatingMatrix::new(Array2::from_elem((2, 2), 1.0)).unwrap();
        let err = RecommendationModel::new(
            input,
            Array2::from_elem((2, 2), 1.0),
            labels(&["only one"]),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ModelError::LabelCountMismatch {
                axis: LabelAxis::Rows,
                expected: 2,
                found: 1
            }
        ));
        assert!(!err.is_not_found());
    }

    #[test]
    fn set_estimated_checks_shape() {
        let mut model = small_model(None, None);
        assert!(matches!(
            model.set_estimated(Array2::zeros((2, 2))),
            Err(ModelError::EstimateShapeMismatch { .. })
        ));
        model.set_estimated(Array2::from_elem((3, 4), 1.0)).unwrap();
        assert_eq!(model.estimated()[[0, 0]], 1.0);
    }
}
