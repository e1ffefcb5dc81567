#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod bias;
pub mod builder;
pub mod config;
pub mod data;
pub mod factorize;
pub mod matrix;
pub mod model;
pub mod progress;

pub use bias::{Bias, compute_bias};
pub use builder::{BuildError, apply_bias, build_model, build_model_with_bias};
pub use factorize::{Factorization, FactorizationConfig, StopReason, TrainingError, train};
pub use matrix::{MatrixError, ObservedMask, RatingMatrix};
pub use model::{ItemKey, ModelError, RankedItem, RecommendationModel, RowKey};
