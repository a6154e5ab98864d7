use polars::prelude::PolarsError;
use thiserror::Error;

/// Fatal error taxonomy for the ridge pipeline. Stage functions return
/// `anyhow::Result` and raise these at the point of detection.
#[derive(Debug, Error)]
pub enum WgrError {
    #[error("model has not been fit; call fit before transform")]
    NotFitted,

    #[error("inconsistent input: {0}")]
    Consistency(String),

    #[error("normal equations not positive definite for label {label} at alpha {alpha}")]
    Numerical { label: String, alpha: String },

    #[error("join gap between block matrix and model: {0}")]
    JoinGap(String),

    #[error("dataframe error: {0}")]
    Polars(#[from] PolarsError),
}

pub type Result<T> = std::result::Result<T, WgrError>;
