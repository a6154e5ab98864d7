//! Whole-genome ridge regression over a block-reduced feature matrix.
//!
//! The reduced matrix arrives partitioned by `(header_block, sample_block,
//! header, label)`; fitting accumulates per-block normal equations, sums them
//! across sample blocks, solves the regularized system for a grid of alphas,
//! and selects the best alpha per label by mean out-of-fold R^2. Prediction
//! reassembles the block-partitioned partial sums into a dense sample-by-label
//! table, with a leave-one-chromosome-out variant for downstream association
//! work.

pub mod error;
pub mod logging;
pub mod types;

pub mod df_utils;
pub mod engine;
pub mod parallel;
pub mod schema;
pub mod telemetry;

pub mod apply;
pub mod cv;
pub mod loco;
pub mod normal_eqn;
pub mod regression;
pub mod solver;

pub use error::WgrError;
pub use regression::RidgeRegression;
pub use types::{AlphaSet, LabelFrame, RidgeConfig, SampleBlockMap};
