// recommend/factorize.rs

//! # Gradient-Descent Matrix Factorization
//!
//! Learns two factor matrices `P` (N x k) and `Q` (k x M) whose product approximates
//! the observed cells of a rating matrix. Each step:
//!
//! 1.  Forms the current estimate `P.dot(Q)`.
//! 2.  Builds the error matrix on observed cells only. Unobserved cells contribute
//!     nothing to the loss or the gradients.
//! 3.  Walks the observed cells in row-major order and nudges the matching row of `P`
//!     and column of `Q` along the regularized gradient.
//! 4.  Stops early once the total squared error falls under `max_error`.
//!
//! The update loop is sequential: later cells see the writes of earlier
//! cells within the same step, so a fixed seed reproduces a run bit for bit. Any
//! parallel rewrite of that loop changes the update order and therefore the numbers.

use crate::bias::Bias;
use crate::matrix::{MatrixError, RatingMatrix};
use crate::progress::{NoopTrainingProgress, TrainingObserver};
use ndarray::{Array2, ArrayView2, Zip};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_LATENT_FEATURES: usize = 5;
pub const DEFAULT_STEPS: usize = 5000;
pub const DEFAULT_ALPHA: f64 = 0.0005;
pub const DEFAULT_BETA: f64 = 0.0007;
pub const DEFAULT_MAX_ERROR: f64 = 0.0005;

/// Matrices with at least this many cells build their error matrix on the rayon pool.
const PARALLEL_CELL_THRESHOLD: usize = 1 << 14;

/// How often, in steps, the running error is written to the debug log.
const LOG_INTERVAL: usize = 100;

/// Hyperparameters for one factorization run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FactorizationConfig {
    /// Number of latent features. Must be at least 1.
    pub k: usize,
    /// Maximum number of descent steps.
    pub steps: usize,
    /// Learning rate. Must be positive.
    pub alpha: f64,
    /// L2 regularization strength. Must be non-negative.
    pub beta: f64,
    /// Training stops as soon as the total squared error drops below this value.
    pub max_error: f64,
    /// Seed for the random factor initialization. `None` draws from OS entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for FactorizationConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_LATENT_FEATURES,
            steps: DEFAULT_STEPS,
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            max_error: DEFAULT_MAX_ERROR,
            seed: None,
        }
    }
}

impl FactorizationConfig {
    /// Rejects hyperparameters that make the descent meaningless.
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.k < 1 {
            return Err(TrainingError::InvalidLatentFeatures { k: self.k });
        }
        if !(self.alpha > 0.0 && self.alpha.is_finite()) {
            return Err(TrainingError::InvalidLearningRate { alpha: self.alpha });
        }
        if !(self.beta >= 0.0 && self.beta.is_finite()) {
            return Err(TrainingError::InvalidRegularization { beta: self.beta });
        }
        if self.max_error.is_nan() {
            return Err(TrainingError::InvalidErrorThreshold {
                max_error: self.max_error,
            });
        }
        Ok(())
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("The number of latent features must be at least 1, but got {k}.")]
    InvalidLatentFeatures { k: usize },

    #[error("The learning rate must be a positive finite number, but got {alpha}.")]
    InvalidLearningRate { alpha: f64 },

    #[error("The regularization coefficient must be a non-negative finite number, but got {beta}.")]
    InvalidRegularization { beta: f64 },

    #[error("The early-stop error threshold must be a number, but got {max_error}.")]
    InvalidErrorThreshold { max_error: f64 },

    #[error(
        "The supplied bias covers a {found_rows}x{found_cols} matrix, but the input is {expected_rows}x{expected_cols}."
    )]
    BiasShapeMismatch {
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },

    #[error("The bias-adjusted input is not a valid rating matrix: {0}")]
    Matrix(#[from] MatrixError),
}

/// Why the descent loop ended. Both outcomes are successful terminal states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Total error fell under `max_error` before the step budget ran out.
    Converged,
    /// Every step in the budget was used.
    StepsExhausted,
}

impl StopReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::StepsExhausted => "step budget exhausted",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// The outcome of a training run.
#[derive(Clone, Debug)]
pub struct Factorization {
    /// `P.dot(Q)`, without any bias added back.
    pub estimate: Array2<f64>,
    /// Number of descent steps that ran.
    pub iterations: usize,
    /// Squared error of `estimate` on the observed (bias-adjusted) cells.
    pub total_error: f64,
    pub stop_reason: StopReason,
}

/// Trains a factorization of `input`, optionally after removing `bias`.
pub fn train(
    input: &RatingMatrix,
    bias: Option<&Bias>,
    config: &FactorizationConfig,
) -> Result<Factorization, TrainingError> {
    train_with_observer(input, bias, config, &mut NoopTrainingProgress)
}

/// Same as [`train`], reporting each step to `observer`.
pub fn train_with_observer<O>(
    input: &RatingMatrix,
    bias: Option<&Bias>,
    config: &FactorizationConfig,
    observer: &mut O,
) -> Result<Factorization, TrainingError>
where
    O: TrainingObserver + ?Sized,
{
    config.validate()?;

    let adjusted = match bias {
        Some(bias) => adjust_for_bias(input, bias)?,
        None => input.clone(),
    };
    let (rows, cols) = adjusted.dim();

    log::info!(
        "Starting factorization of {}x{} matrix ({} observed cells) with k={}, up to {} steps.",
        rows,
        cols,
        adjusted.observed().count(),
        config.k,
        config.steps
    );

    let mut rng = config.rng();
    let mut p = random_matrix(rows, config.k, &mut rng);
    let mut q = random_matrix(config.k, cols, &mut rng);

    observer.on_start(config.steps);

    let mut stop_reason = StopReason::StepsExhausted;
    let mut iterations = 0;
    for step in 0..config.steps {
        let estimate = p.dot(&q);
        let error = calculate_error(estimate.view(), &adjusted);

        descend(&mut p, &mut q, error.view(), config.alpha, config.beta);

        let step_error = total_error(error.view());
        iterations = step + 1;
        observer.on_step(step, step_error);

        if step % LOG_INTERVAL == 0 {
            log::debug!("Step {}: total squared error {:.6e}", step, step_error);
        }

        if step_error < config.max_error {
            stop_reason = StopReason::Converged;
            break;
        }
    }

    let estimate = p.dot(&q);
    let final_error = total_error(calculate_error(estimate.view(), &adjusted).view());

    if !final_error.is_finite() {
        log::warn!(
            "Factorization ended with a non-finite error ({}). The learning rate {} is likely too large.",
            final_error,
            config.alpha
        );
    }
    log::info!(
        "Factorization finished after {} steps ({:?}), total squared error {:.6e}",
        iterations,
        stop_reason,
        final_error
    );
    observer.on_finish(stop_reason, iterations);

    Ok(Factorization {
        estimate,
        iterations,
        total_error: final_error,
        stop_reason,
    })
}

/// Subtracts `bias.offset(i, j)` from every observed cell of `input`.
///
/// Unobserved cells stay zero. A cell whose rating equals its offset exactly becomes
/// zero as well and is treated as unobserved from then on.
pub fn adjust_for_bias(input: &RatingMatrix, bias: &Bias) -> Result<RatingMatrix, TrainingError> {
    let (rows, cols) = input.dim();
    if !bias.matches_shape(rows, cols) {
        return Err(TrainingError::BiasShapeMismatch {
            expected_rows: rows,
            expected_cols: cols,
            found_rows: bias.row_bias.len(),
            found_cols: bias.col_bias.len(),
        });
    }

    let observed = input.observed();
    let adjusted = Array2::from_shape_fn((rows, cols), |(i, j)| {
        if observed.is_observed(i, j) {
            input[[i, j]] - bias.offset(i, j)
        } else {
            0.0
        }
    });
    Ok(RatingMatrix::new(adjusted)?)
}

/// Observed-minus-estimated on the cells `input` observes, zero everywhere else.
pub fn calculate_error(estimate: ArrayView2<'_, f64>, input: &RatingMatrix) -> Array2<f64> {
    let residual = |&est: &f64, &actual: &f64, &observed: &bool| {
        if observed { actual - est } else { 0.0 }
    };
    let zip = Zip::from(estimate)
        .and(input.as_view())
        .and(input.observed().as_view());

    if input.len() >= PARALLEL_CELL_THRESHOLD {
        zip.par_map_collect(residual)
    } else {
        zip.map_collect(residual)
    }
}

/// Sum of squared entries of an error matrix.
pub fn total_error(error: ArrayView2<'_, f64>) -> f64 {
    error.iter().map(|&e| e * e).sum()
}

/// A `rows x cols` matrix of independent draws from `[0, 1)`.
pub fn random_matrix<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.sample(Standard))
}

/// One pass of regularized updates over every cell with a non-zero error.
///
/// For a given `(i, j, f)` both writes are computed from the values read before
/// either is applied; across cells, updates land in row-major order.
fn descend(
    p: &mut Array2<f64>,
    q: &mut Array2<f64>,
    error: ArrayView2<'_, f64>,
    alpha: f64,
    beta: f64,
) {
    let features = p.ncols();
    for ((i, j), &e) in error.indexed_iter() {
        if e == 0.0 {
            continue;
        }
        for f in 0..features {
            let p_if = p[[i, f]];
            let q_fj = q[[f, j]];
            p[[i, f]] = p_if + alpha * (e * q_fj - beta * p_if);
            q[[f, j]] = q_fj + alpha * (e * p_if - beta * q_fj);
        }
    }
}
