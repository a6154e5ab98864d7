//! Out-of-fold scoring and alpha selection. Each sample block is scored with
//! coefficients solved from the accumulated normal equations minus that
//! block's own contribution, so no block ever scores itself.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use ndarray::Array1;
use polars::prelude::*;

use crate::df_utils::{f64_at, f64_col, f64_column, str_at, str_col, str_column};
use crate::engine::{GroupKey, group_apply};
use crate::error::WgrError;
use crate::normal_eqn::{NormalEqnSystem, assemble_block};
use crate::schema::{ALPHA, LABEL, SAMPLE_BLOCK, SCORE, block_score_schema};
use crate::solver::ridge_solve;
use crate::types::{AlphaSet, LabelFrame, SampleBlockMap};

/// Parses accumulator rows into one linear system per key pattern value.
fn systems_by_key(
    accumulated: &DataFrame,
    key_pattern: &[&str],
) -> Result<HashMap<Vec<String>, NormalEqnSystem>> {
    let keys: Vec<PlSmallStr> = key_pattern.iter().map(|k| (*k).into()).collect();
    let mut out = HashMap::new();
    for group in accumulated.partition_by(keys, true)? {
        let mut key = Vec::with_capacity(key_pattern.len());
        for name in key_pattern {
            key.push(str_at(str_col(&group, name)?, 0, name)?.to_string());
        }
        out.insert(key, NormalEqnSystem::from_rows(&group)?);
    }
    Ok(out)
}

/// Out-of-sample R^2 of one block, SS_tot centered within the block.
fn r_squared(y: &Array1<f64>, y_hat: &Array1<f64>) -> Result<f64> {
    let mean = y.mean().unwrap_or(0.0);
    let ss_tot: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return Err(
            WgrError::Consistency("label is constant within a sample block".into()).into(),
        );
    }
    let ss_res: f64 = y
        .iter()
        .zip(y_hat.iter())
        .map(|(v, p)| (v - p).powi(2))
        .sum();
    Ok(1.0 - ss_res / ss_tot)
}

/// Scores one (sample_block, label) group of the reduced matrix against the
/// held-out solve for every alpha.
#[allow(clippy::too_many_arguments)]
pub fn score_models(
    key: &GroupKey,
    group: &DataFrame,
    std_labels: &LabelFrame,
    sample_blocks: &SampleBlockMap,
    std_covariates: &LabelFrame,
    alphas: &AlphaSet,
    totals: &HashMap<Vec<String>, NormalEqnSystem>,
    partials: &HashMap<Vec<String>, NormalEqnSystem>,
) -> Result<DataFrame> {
    let sample_block = key.get(0);
    let label = key.get(1);
    let sample_list = sample_blocks.samples(sample_block)?;
    let assembled = assemble_block(group, sample_list, std_covariates)?;
    let y = std_labels.column_rows(label, sample_list)?;

    let total = totals.get(&vec![label.to_string()]).ok_or_else(|| {
        WgrError::Consistency(format!("no accumulated normal equations for label {label}"))
    })?;
    let partial = partials
        .get(&vec![sample_block.to_string(), label.to_string()])
        .ok_or_else(|| {
            WgrError::Consistency(format!(
                "no partial normal equations for sample block {sample_block}, label {label}"
            ))
        })?;
    if assembled.headers != total.headers {
        return Err(WgrError::Consistency(format!(
            "matrix headers for sample block {sample_block} do not match the reduced system"
        ))
        .into());
    }
    let held_out = total.minus(partial)?;

    let mut alpha_names = Vec::with_capacity(alphas.len());
    let mut scores = Vec::with_capacity(alphas.len());
    for (alpha_name, alpha) in alphas.iter() {
        let beta = ridge_solve(&held_out, alpha, label, alpha_name)?;
        let y_hat = assembled.x.dot(&beta);
        alpha_names.push(alpha_name.to_string());
        scores.push(r_squared(&y, &y_hat)?);
    }

    let n = alpha_names.len();
    Ok(DataFrame::new(vec![
        str_column(SAMPLE_BLOCK, vec![sample_block.to_string(); n]),
        str_column(LABEL, vec![label.to_string(); n]),
        str_column(ALPHA, alpha_names),
        f64_column(SCORE, scores),
    ])?)
}

/// Runs out-of-fold scoring over every (sample_block, label) group and
/// aggregates mean score per (label, alpha). Every pair must be scored by
/// every sample block; a shortfall means matrix and accumulator rows diverged.
#[allow(clippy::too_many_arguments)]
pub fn cross_validation(
    reduced_block_df: &DataFrame,
    map_df: &DataFrame,
    reduce_df: &DataFrame,
    std_labels: &LabelFrame,
    sample_blocks: &SampleBlockMap,
    std_covariates: &LabelFrame,
    alphas: &AlphaSet,
    cores: Option<usize>,
) -> Result<DataFrame> {
    let totals = systems_by_key(reduce_df, &[LABEL])?;
    let partials = systems_by_key(map_df, &[SAMPLE_BLOCK, LABEL])?;

    let block_scores = group_apply(
        reduced_block_df,
        &[SAMPLE_BLOCK, LABEL],
        &block_score_schema(),
        cores,
        |key, group| {
            score_models(
                key,
                group,
                std_labels,
                sample_blocks,
                std_covariates,
                alphas,
                &totals,
                &partials,
            )
        },
    )?;

    let labels = str_col(&block_scores, LABEL)?;
    let alpha_col = str_col(&block_scores, ALPHA)?;
    let scores = f64_col(&block_scores, SCORE)?;
    let mut by_pair: BTreeMap<(String, String), (f64, usize)> = BTreeMap::new();
    for idx in 0..block_scores.height() {
        let pair = (
            str_at(labels, idx, LABEL)?.to_string(),
            str_at(alpha_col, idx, ALPHA)?.to_string(),
        );
        let entry = by_pair.entry(pair).or_insert((0.0, 0));
        entry.0 += f64_at(scores, idx, SCORE)?;
        entry.1 += 1;
    }

    let n_blocks = sample_blocks.len();
    let mut label_out = Vec::with_capacity(by_pair.len());
    let mut alpha_out = Vec::with_capacity(by_pair.len());
    let mut score_out = Vec::with_capacity(by_pair.len());
    for ((label, alpha), (sum, count)) in by_pair {
        if count != n_blocks {
            return Err(WgrError::JoinGap(format!(
                "label {label} alpha {alpha} was scored by {count} of {n_blocks} sample blocks"
            ))
            .into());
        }
        label_out.push(label);
        alpha_out.push(alpha);
        score_out.push(sum / count as f64);
    }

    Ok(DataFrame::new(vec![
        str_column(LABEL, label_out),
        str_column(ALPHA, alpha_out),
        f64_column(SCORE, score_out),
    ])?)
}

/// Per-label winning alpha: maximal mean score, ties broken by ascending
/// alpha value. Independent of cross-validation row order.
pub fn best_alphas(cv_df: &DataFrame, alphas: &AlphaSet) -> Result<BTreeMap<String, String>> {
    let labels = str_col(cv_df, LABEL)?;
    let alpha_col = str_col(cv_df, ALPHA)?;
    let scores = f64_col(cv_df, SCORE)?;

    let mut best: BTreeMap<String, (String, f64, f64)> = BTreeMap::new();
    for idx in 0..cv_df.height() {
        let label = str_at(labels, idx, LABEL)?;
        let alpha_name = str_at(alpha_col, idx, ALPHA)?;
        let alpha_value = alphas.value(alpha_name)?;
        let score = f64_at(scores, idx, SCORE)?;
        match best.get(label) {
            Some((incumbent_name, incumbent_score, incumbent_value)) => {
                let better = score > *incumbent_score
                    || (score == *incumbent_score && alpha_value < *incumbent_value)
                    || (score == *incumbent_score
                        && alpha_value == *incumbent_value
                        && alpha_name < incumbent_name.as_str());
                if better {
                    best.insert(
                        label.to_string(),
                        (alpha_name.to_string(), score, alpha_value),
                    );
                }
            }
            None => {
                best.insert(
                    label.to_string(),
                    (alpha_name.to_string(), score, alpha_value),
                );
            }
        }
    }
    Ok(best
        .into_iter()
        .map(|(label, (alpha, _, _))| (label, alpha))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn r_squared_is_one_for_exact_predictions() {
        let y = array![1.0, -1.0, 0.5];
        assert_abs_diff_eq!(r_squared(&y, &y).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn r_squared_rejects_constant_block() {
        let y = array![1.0, 1.0];
        assert!(r_squared(&y, &y).is_err());
    }

    fn cv_frame(rows: &[(&str, &str, f64)]) -> DataFrame {
        DataFrame::new(vec![
            str_column(LABEL, rows.iter().map(|r| r.0.to_string()).collect()),
            str_column(ALPHA, rows.iter().map(|r| r.1.to_string()).collect()),
            f64_column(SCORE, rows.iter().map(|r| r.2).collect()),
        ])
        .unwrap()
    }

    #[test]
    fn best_alpha_picks_max_score() {
        let alphas = AlphaSet::from_values(&[0.1, 1.0]).unwrap();
        let cv = cv_frame(&[
            ("y1", "alpha_0", 0.2),
            ("y1", "alpha_1", 0.6),
            ("y2", "alpha_0", 0.9),
            ("y2", "alpha_1", 0.1),
        ]);
        let best = best_alphas(&cv, &alphas).unwrap();
        assert_eq!(best["y1"], "alpha_1");
        assert_eq!(best["y2"], "alpha_0");
    }

    #[test]
    fn best_alpha_ties_break_to_smaller_value_regardless_of_row_order() {
        let alphas = AlphaSet::from_values(&[1.0, 0.1]).unwrap();
        let forward = cv_frame(&[("y", "alpha_0", 0.5), ("y", "alpha_1", 0.5)]);
        let reversed = cv_frame(&[("y", "alpha_1", 0.5), ("y", "alpha_0", 0.5)]);
        // alpha_1 has the smaller value here.
        assert_eq!(best_alphas(&forward, &alphas).unwrap()["y"], "alpha_1");
        assert_eq!(best_alphas(&reversed, &alphas).unwrap()["y"], "alpha_1");
    }

    #[test]
    fn cv_schema_matches_declared() {
        let cv = cv_frame(&[("y", "alpha_0", 0.5)]);
        crate::schema::check_schema(&cv, &crate::schema::cv_schema(), "cv").unwrap();
    }
}
