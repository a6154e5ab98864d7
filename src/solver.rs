//! Regularized solve of the reduced normal equations: one coefficient row per
//! (header, label, alpha), covariate columns unpenalized.

use anyhow::Result;
use ndarray::Array1;
use ndarray_linalg::{FactorizeC, SolveC, UPLO};
use polars::prelude::*;

use crate::df_utils::{f64_column, str_column};
use crate::engine::GroupKey;
use crate::error::WgrError;
use crate::normal_eqn::NormalEqnSystem;
use crate::schema::{ALPHA, COEFFICIENT, HEADER, HEADER_BLOCK, LABEL};
use crate::types::AlphaSet;

/// Solves `(A + D_alpha) beta = b` by Cholesky factorization. Regularization
/// makes the system positive definite for any alpha > 0; a factorization
/// failure is therefore a data or configuration defect and is fatal.
pub fn ridge_solve(
    system: &NormalEqnSystem,
    alpha: f64,
    label: &str,
    alpha_name: &str,
) -> Result<Array1<f64>> {
    let numerical = || WgrError::Numerical {
        label: label.to_string(),
        alpha: alpha_name.to_string(),
    };
    let penalized = system.penalized(alpha);
    let factor = penalized
        .factorizec(UPLO::Lower)
        .map_err(|_| numerical())?;
    let beta = factor.solvec(&system.b).map_err(|_| numerical())?;
    if beta.iter().any(|v| !v.is_finite()) {
        return Err(numerical().into());
    }
    Ok(beta)
}

/// Solve stage: one (sample_block = "all", label) group of fully reduced
/// statistics, solved for every alpha in the grid.
pub fn solve_normal_eqn(key: &GroupKey, group: &DataFrame, alphas: &AlphaSet) -> Result<DataFrame> {
    let label = key.get(1);
    let system = NormalEqnSystem::from_rows(group)?;
    let p = system.width();

    let mut header_blocks = Vec::with_capacity(p * alphas.len());
    let mut headers = Vec::with_capacity(p * alphas.len());
    let mut labels = Vec::with_capacity(p * alphas.len());
    let mut alpha_names = Vec::with_capacity(p * alphas.len());
    let mut coefficients = Vec::with_capacity(p * alphas.len());
    for (alpha_name, alpha) in alphas.iter() {
        let beta = ridge_solve(&system, alpha, label, alpha_name)?;
        for idx in 0..p {
            header_blocks.push(system.header_blocks[idx].clone());
            headers.push(system.headers[idx].clone());
            labels.push(label.to_string());
            alpha_names.push(alpha_name.to_string());
            coefficients.push(beta[idx]);
        }
    }

    Ok(DataFrame::new(vec![
        str_column(HEADER_BLOCK, header_blocks),
        str_column(HEADER, headers),
        str_column(LABEL, labels),
        str_column(ALPHA, alpha_names),
        f64_column(COEFFICIENT, coefficients),
    ])?)
}
