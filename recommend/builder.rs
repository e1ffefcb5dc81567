// recommend/builder.rs

//! # Model Construction
//!
//! Orchestrates a complete training run:
//!
//! 1.  Optionally extract the global/row/column bias from the ratings.
//! 2.  Factorize the (bias-adjusted) ratings by gradient descent.
//! 3.  Add the bias back onto every cell of the estimate.
//! 4.  Wrap the input, the estimate, and the labels in a [`RecommendationModel`].
//!
//! Label counts and hyperparameters are checked before any training work starts.

use crate::bias::{Bias, compute_bias};
use crate::factorize::{
    Factorization, FactorizationConfig, TrainingError, train_with_observer,
};
use crate::matrix::RatingMatrix;
use crate::model::{ModelError, RecommendationModel, TrainingSummary, check_label_counts};
use crate::progress::{BuildStage, NoopTrainingProgress, TrainingObserver};
use ndarray::{Array2, Zip};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("Training failed: {0}")]
    Training(#[from] TrainingError),
    #[error("Could not assemble the model: {0}")]
    Model(#[from] ModelError),
}

/// Whether and how bias is removed before factorization.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BiasCorrection {
    /// Factorize the raw ratings.
    #[default]
    Disabled,
    /// Compute the bias from the ratings being trained on.
    Computed,
    /// Use a bias the caller already has.
    Supplied(Bias),
}

/// Configures and runs a training pipeline.
#[derive(Clone, Debug, Default)]
pub struct ModelBuilder {
    config: FactorizationConfig,
    bias: BiasCorrection,
    row_labels: Option<Vec<String>>,
    col_labels: Option<Vec<String>>,
}

impl ModelBuilder {
    pub fn new(config: FactorizationConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn bias(mut self, bias: BiasCorrection) -> Self {
        self.bias = bias;
        self
    }

    pub fn row_labels(mut self, labels: Option<Vec<String>>) -> Self {
        self.row_labels = labels;
        self
    }

    pub fn col_labels(mut self, labels: Option<Vec<String>>) -> Self {
        self.col_labels = labels;
        self
    }

    pub fn build(self, input: RatingMatrix) -> Result<RecommendationModel, BuildError> {
        self.build_with_observer(input, &mut NoopTrainingProgress)
    }

    pub fn build_with_observer<O>(
        self,
        input: RatingMatrix,
        observer: &mut O,
    ) -> Result<RecommendationModel, BuildError>
    where
        O: TrainingObserver + ?Sized,
    {
        check_label_counts(&input, self.row_labels.as_deref(), self.col_labels.as_deref())?;
        self.config.validate()?;

        let bias = match self.bias {
            BiasCorrection::Disabled => None,
            BiasCorrection::Computed => {
                observer.on_stage(BuildStage::Bias);
                Some(compute_bias(&input))
            }
            BiasCorrection::Supplied(bias) => Some(bias),
        };
        log::info!(
            "Building model ({} bias correction).",
            if bias.is_some() { "with" } else { "without" }
        );

        observer.on_stage(BuildStage::Factorization);
        let Factorization {
            estimate,
            iterations,
            total_error,
            stop_reason,
        } = train_with_observer(&input, bias.as_ref(), &self.config, observer)?;

        let estimated = match &bias {
            Some(bias) => {
                observer.on_stage(BuildStage::Recomposition);
                apply_bias(&estimate, bias)?
            }
            None => estimate,
        };

        let summary = TrainingSummary {
            config: self.config,
            iterations,
            total_error,
            stop_reason,
            bias,
        };
        let model = RecommendationModel::new(input, estimated, self.row_labels, self.col_labels)?;
        Ok(model.with_summary(summary))
    }
}

/// Trains a model on the raw ratings, without bias correction.
pub fn build_model(
    input: RatingMatrix,
    row_labels: Option<Vec<String>>,
    col_labels: Option<Vec<String>>,
    config: &FactorizationConfig,
) -> Result<RecommendationModel, BuildError> {
    ModelBuilder::new(*config)
        .row_labels(row_labels)
        .col_labels(col_labels)
        .build(input)
}

/// Trains a model with bias correction. When `bias` is `None` it is computed from
/// `input`.
pub fn build_model_with_bias(
    input: RatingMatrix,
    bias: Option<Bias>,
    row_labels: Option<Vec<String>>,
    col_labels: Option<Vec<String>>,
    config: &FactorizationConfig,
) -> Result<RecommendationModel, BuildError> {
    let correction = match bias {
        Some(bias) => BiasCorrection::Supplied(bias),
        None => BiasCorrection::Computed,
    };
    ModelBuilder::new(*config)
        .bias(correction)
        .row_labels(row_labels)
        .col_labels(col_labels)
        .build(input)
}

/// Adds `bias.offset(i, j)` to every cell of `estimate`, observed or not.
pub fn apply_bias(estimate: &Array2<f64>, bias: &Bias) -> Result<Array2<f64>, TrainingError> {
    let (rows, cols) = estimate.dim();
    if !bias.matches_shape(rows, cols) {
        return Err(TrainingError::BiasShapeMismatch {
            expected_rows: rows,
            expected_cols: cols,
            found_rows: bias.row_bias.len(),
            found_cols: bias.col_bias.len(),
        });
    }

    let mut composed = estimate.clone();
    Zip::indexed(&mut composed).par_for_each(|(i, j), value| *value += bias.offset(i, j));
    Ok(composed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factorize::{StopReason, calculate_error, total_error};
    use crate::progress::ErrorHistory;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sparse_input() -> RatingMatrix {
        RatingMatrix::new(array![
            [1.0, 2.0, 3.0, 0.0],
            [4.0, 0.0, 5.0, 6.0],
            [7.0, 8.0, 0.0, 9.0]
        ])
        .unwrap()
    }

    fn quick_config() -> FactorizationConfig {
        FactorizationConfig {
            k: 2,
            steps: 200,
            alpha: 0.01,
            seed: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn apply_bias_touches_every_cell() {
        let input = sparse_input();
        let bias = compute_bias(&input);
        let composed = apply_bias(&Array2::zeros((3, 4)), &bias).unwrap();

        for ((i, j), &value) in composed.indexed_iter() {
            assert_abs_diff_eq!(value, bias.offset(i, j), epsilon = 1e-12);
        }
        assert_abs_diff_eq!(composed[[0, 3]], 3.75 - 2.25 + 1.25, epsilon = 1e-12);
    }

    #[test]
    fn apply_bias_rejects_mismatched_shape() {
        let bias = compute_bias(&sparse_input());
        assert!(matches!(
            apply_bias(&Array2::zeros((4, 3)), &bias),
            Err(TrainingError::BiasShapeMismatch { .. })
        ));
    }

    #[test]
    fn label_mismatch_fails_before_training() {
        let mut history = ErrorHistory::default();
        let err = ModelBuilder::new(quick_config())
            .row_labels(Some(vec!["a".to_string()]))
            .build_with_observer(sparse_input(), &mut history)
            .unwrap_err();

        assert!(matches!(err, BuildError::Model(ModelError::LabelCountMismatch { .. })));
        assert!(history.stages.is_empty());
        assert!(history.errors.is_empty());
    }

    #[test]
    fn invalid_config_fails_before_training() {
        let config = FactorizationConfig {
            beta: -1.0,
            ..quick_config()
        };
        assert!(matches!(
            build_model(sparse_input(), None, None, &config),
            Err(BuildError::Training(TrainingError::InvalidRegularization { .. }))
        ));
    }

    #[test]
    fn computed_bias_runs_every_stage_and_is_recorded() {
        let mut history = ErrorHistory::default();
        let model = ModelBuilder::new(quick_config())
            .bias(BiasCorrection::Computed)
            .build_with_observer(sparse_input(), &mut history)
            .unwrap();

        assert_eq!(
            history.stages,
            vec![BuildStage::Bias, BuildStage::Factorization, BuildStage::Recomposition]
        );
        let summary = model.summary().unwrap();
        assert_eq!(summary.bias, Some(compute_bias(&sparse_input())));
        assert_eq!(summary.iterations, history.errors.len());
    }

    #[test]
    fn supplied_bias_is_used_as_given() {
        let input = sparse_input();
        let bias = Bias {
            average: 1.0,
            row_bias: array![0.0, 0.0, 0.0],
            col_bias: array![0.0, 0.0, 0.0, 0.0],
        };
        let model =
            build_model_with_bias(input, Some(bias.clone()), None, None, &quick_config()).unwrap();
        assert_eq!(model.summary().unwrap().bias, Some(bias));
    }

    #[test]
    fn estimate_without_bias_is_the_raw_product() {
        let config = quick_config();
        let fit = crate::factorize::train(&sparse_input(), None, &config).unwrap();
        let model = build_model(sparse_input(), None, None, &config).unwrap();

        assert_eq!(model.estimated(), &fit.estimate);
        assert!(model.summary().unwrap().bias.is_none());
    }

    #[test]
    fn dense_input_round_trips_to_near_zero_error() {
        let input = RatingMatrix::new(array![
            [1.0, 2.0, 1.0, 2.0],
            [2.0, 4.0, 2.0, 4.0],
            [3.0, 6.0, 3.0, 6.0]
        ])
        .unwrap();
        let config = FactorizationConfig {
            k: 2,
            steps: 20_000,
            alpha: 0.01,
            max_error: 1e-4,
            seed: Some(1),
            ..Default::default()
        };
        let model = build_model(input, None, None, &config).unwrap();

        let residual = total_error(calculate_error(model.estimated().view(), model.input()).view());
        assert!(residual < 1e-3, "residual error {}", residual);
        assert_eq!(model.summary().unwrap().stop_reason, StopReason::Converged);
    }
}
