use crate::factorize::StopReason;
use std::fmt;

/// Stages reported while building a model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuildStage {
    Bias,
    Factorization,
    Recomposition,
}

impl BuildStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Bias => "bias extraction",
            Self::Factorization => "gradient descent",
            Self::Recomposition => "bias re-composition",
        }
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while training.
///
/// Every hook has an empty default so implementors only override what they display.
pub trait TrainingObserver {
    fn on_stage(&mut self, stage: BuildStage) {
        let _ = stage;
    }
    fn on_start(&mut self, max_steps: usize) {
        let _ = max_steps;
    }
    /// Called after each completed step with the squared error measured in that step.
    fn on_step(&mut self, step: usize, total_error: f64) {
        let _ = (step, total_error);
    }
    fn on_finish(&mut self, reason: StopReason, iterations: usize) {
        let _ = (reason, iterations);
    }
}

#[derive(Default)]
pub struct NoopTrainingProgress;

impl TrainingObserver for NoopTrainingProgress {}

/// Records every per-step error; handy for inspecting convergence curves.
#[derive(Debug, Default, Clone)]
pub struct ErrorHistory {
    pub errors: Vec<f64>,
    pub stages: Vec<BuildStage>,
    pub finished: Option<(StopReason, usize)>,
}

impl TrainingObserver for ErrorHistory {
    fn on_stage(&mut self, stage: BuildStage) {
        self.stages.push(stage);
    }

    fn on_start(&mut self, max_steps: usize) {
        self.errors.reserve(max_steps.min(1 << 16));
    }

    fn on_step(&mut self, step: usize, total_error: f64) {
        let _ = step;
        self.errors.push(total_error);
    }

    fn on_finish(&mut self, reason: StopReason, iterations: usize) {
        self.finished = Some((reason, iterations));
    }
}
