//! Applies selected-alpha coefficients back to the reduced matrix and
//! flattens the block-partitioned partial predictions into a dense
//! sample-by-label table.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use ndarray::{Array1, Array2};
use polars::prelude::*;

use crate::df_utils::{
    f64_at, f64_col, f64_column, list_col, list_f64_at, list_f64_column, str_at, str_col,
    str_column,
};
use crate::engine::{GroupKey, group_apply};
use crate::error::WgrError;
use crate::normal_eqn::assemble_block;
use crate::schema::{
    ALPHA, COEFFICIENT, COVARIATE_BLOCK, HEADER, LABEL, SAMPLE_BLOCK, SAMPLE_ID, VALUES,
    blocked_prediction_schema,
};
use crate::types::{LabelFrame, SampleBlockMap};

/// Coefficients at each label's winning alpha, keyed by (header, label).
pub struct ModelLookup {
    coefficients: HashMap<(String, String), f64>,
    labels: Vec<String>,
}

impl ModelLookup {
    /// Restricts the model table to the winning alpha per label. Never mixes
    /// alphas within one label.
    pub fn from_model(model_df: &DataFrame, best: &BTreeMap<String, String>) -> Result<Self> {
        let headers = str_col(model_df, HEADER)?;
        let labels = str_col(model_df, LABEL)?;
        let alpha_col = str_col(model_df, ALPHA)?;
        let coefficients = f64_col(model_df, COEFFICIENT)?;

        let mut out = HashMap::new();
        for idx in 0..model_df.height() {
            let label = str_at(labels, idx, LABEL)?;
            let Some(winner) = best.get(label) else {
                return Err(WgrError::Consistency(format!(
                    "model table contains label {label} absent from the cross-validation table"
                ))
                .into());
            };
            if str_at(alpha_col, idx, ALPHA)? != winner {
                continue;
            }
            let header = str_at(headers, idx, HEADER)?;
            if out
                .insert(
                    (header.to_string(), label.to_string()),
                    f64_at(coefficients, idx, COEFFICIENT)?,
                )
                .is_some()
            {
                return Err(WgrError::Consistency(format!(
                    "duplicate model row for header {header}, label {label}"
                ))
                .into());
            }
        }
        Ok(Self {
            coefficients: out,
            labels: best.keys().cloned().collect(),
        })
    }

    pub fn get(&self, header: &str, label: &str) -> Option<f64> {
        self.coefficients
            .get(&(header.to_string(), label.to_string()))
            .copied()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// A lookup with every header matching `exclude` removed; used by LOCO,
    /// which filters rather than mutates the model table.
    pub fn filtered<F>(&self, exclude: F) -> Self
    where
        F: Fn(&str) -> bool,
    {
        Self {
            coefficients: self
                .coefficients
                .iter()
                .filter(|((header, _), _)| !exclude(header))
                .map(|(key, value)| (key.clone(), *value))
                .collect(),
            labels: self.labels.clone(),
        }
    }
}

/// Applies one label's selected coefficients to one (sample_block, label)
/// group. With `allow_partial_model` (LOCO), headers missing from the lookup
/// contribute zero; otherwise a missing header is a join gap.
pub fn apply_model(
    key: &GroupKey,
    group: &DataFrame,
    sample_blocks: &SampleBlockMap,
    std_covariates: &LabelFrame,
    lookup: &ModelLookup,
    allow_partial_model: bool,
) -> Result<DataFrame> {
    let sample_block = key.get(0);
    let label = key.get(1);
    let sample_list = sample_blocks.samples(sample_block)?;
    let assembled = assemble_block(group, sample_list, std_covariates)?;

    let mut beta = Array1::zeros(assembled.width());
    for (idx, header) in assembled.headers.iter().enumerate() {
        match lookup.get(header, label) {
            Some(coefficient) => beta[idx] = coefficient,
            None if allow_partial_model && assembled.header_blocks[idx] != COVARIATE_BLOCK => {}
            None => {
                return Err(WgrError::JoinGap(format!(
                    "no model coefficient for header {header}, label {label}"
                ))
                .into());
            }
        }
    }
    let y_hat = assembled.x.dot(&beta);

    Ok(DataFrame::new(vec![
        str_column(SAMPLE_BLOCK, vec![sample_block.to_string()]),
        str_column(LABEL, vec![label.to_string()]),
        list_f64_column(VALUES, &[y_hat.to_vec()]),
    ])?)
}

/// Transform stage over the whole matrix: blocked partial predictions, one
/// row per (sample_block, label). Labels selected by cross-validation must
/// all be predicted, whichever join side dropped rows.
pub fn apply_model_df(
    reduced_block_df: &DataFrame,
    lookup: &ModelLookup,
    sample_blocks: &SampleBlockMap,
    std_covariates: &LabelFrame,
    cores: Option<usize>,
    allow_partial_model: bool,
) -> Result<DataFrame> {
    let blocked = group_apply(
        reduced_block_df,
        &[SAMPLE_BLOCK, LABEL],
        &blocked_prediction_schema(),
        cores,
        |key, group| {
            apply_model(
                key,
                group,
                sample_blocks,
                std_covariates,
                lookup,
                allow_partial_model,
            )
        },
    )?;

    let predicted: HashSet<String> = {
        let labels = str_col(&blocked, LABEL)?;
        (0..blocked.height())
            .map(|idx| str_at(labels, idx, LABEL).map(|s| s.to_string()))
            .collect::<Result<_>>()?
    };
    for label in lookup.labels() {
        if !predicted.contains(label) {
            return Err(WgrError::JoinGap(format!(
                "label {label} has model rows but no matrix rows to predict from"
            ))
            .into());
        }
    }
    Ok(blocked)
}

/// Reassembles blocked partial predictions into a dense table: `sample_id`
/// plus one column per label, rows in label-table sample order.
pub fn flatten_predictions(
    blocked_df: &DataFrame,
    sample_blocks: &SampleBlockMap,
    labels: &LabelFrame,
) -> Result<DataFrame> {
    let n = labels.n_samples();
    let label_names = labels.names();
    let label_index: HashMap<&str, usize> = label_names
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();
    let sample_index: HashMap<&str, usize> = labels
        .sample_ids()
        .iter()
        .enumerate()
        .map(|(idx, id)| (id.as_str(), idx))
        .collect();

    let block_col = str_col(blocked_df, SAMPLE_BLOCK)?;
    let label_col = str_col(blocked_df, LABEL)?;
    let values_col = list_col(blocked_df, VALUES)?;

    let mut dense: Array2<f64> = Array2::zeros((n, label_names.len()));
    let mut seen: HashSet<(String, String)> = HashSet::new();
    for idx in 0..blocked_df.height() {
        let sample_block = str_at(block_col, idx, SAMPLE_BLOCK)?;
        let label = str_at(label_col, idx, LABEL)?;
        let col = *label_index.get(label).ok_or_else(|| {
            WgrError::Consistency(format!("prediction for unknown label {label}"))
        })?;
        if !seen.insert((sample_block.to_string(), label.to_string())) {
            return Err(WgrError::Consistency(format!(
                "duplicate prediction row for sample block {sample_block}, label {label}"
            ))
            .into());
        }
        let sample_list = sample_blocks.samples(sample_block)?;
        let values = list_f64_at(values_col, idx, VALUES)?;
        if values.len() != sample_list.len() {
            return Err(WgrError::Consistency(format!(
                "prediction length {} does not match sample block {sample_block} size {}",
                values.len(),
                sample_list.len()
            ))
            .into());
        }
        for (value, id) in values.into_iter().zip(sample_list) {
            let row = *sample_index.get(id.as_str()).ok_or_else(|| {
                WgrError::Consistency(format!("predicted sample {id} absent from label table"))
            })?;
            dense[[row, col]] = value;
        }
    }

    let expected = sample_blocks.len() * label_names.len();
    if seen.len() != expected {
        return Err(WgrError::JoinGap(format!(
            "expected {expected} blocked prediction rows, got {}",
            seen.len()
        ))
        .into());
    }

    let mut columns = Vec::with_capacity(label_names.len() + 1);
    columns.push(str_column(SAMPLE_ID, labels.sample_ids().to_vec()));
    for (col, name) in label_names.iter().enumerate() {
        columns.push(f64_column(name, dense.column(col).to_vec()));
    }
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::collections::BTreeMap;

    fn lookup(entries: &[(&str, &str, f64)], labels: &[&str]) -> ModelLookup {
        ModelLookup {
            coefficients: entries
                .iter()
                .map(|(h, l, c)| ((h.to_string(), l.to_string()), *c))
                .collect(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn label_frame() -> LabelFrame {
        LabelFrame::new(
            vec!["s1".into(), "s2".into()],
            vec!["y".into()],
            array![[1.0], [-1.0]],
        )
        .unwrap()
    }

    fn block_map() -> SampleBlockMap {
        let mut map = BTreeMap::new();
        map.insert("b0".to_string(), vec!["s1".to_string(), "s2".to_string()]);
        SampleBlockMap::new(map).unwrap()
    }

    fn blocked(values: Vec<f64>) -> DataFrame {
        DataFrame::new(vec![
            str_column(SAMPLE_BLOCK, vec!["b0".into()]),
            str_column(LABEL, vec!["y".into()]),
            list_f64_column(VALUES, &[values]),
        ])
        .unwrap()
    }

    #[test]
    fn flatten_restores_label_table_order() {
        let df = flatten_predictions(&blocked(vec![0.25, -0.5]), &block_map(), &label_frame())
            .unwrap();
        let ids: Vec<&str> = str_col(&df, SAMPLE_ID)
            .unwrap()
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(ids, vec!["s1", "s2"]);
        let y: Vec<f64> = f64_col(&df, "y").unwrap().into_no_null_iter().collect();
        assert_eq!(y, vec![0.25, -0.5]);
    }

    #[test]
    fn flatten_detects_missing_block_rows() {
        let mut map = BTreeMap::new();
        map.insert("b0".to_string(), vec!["s1".to_string()]);
        map.insert("b1".to_string(), vec!["s2".to_string()]);
        let blocks = SampleBlockMap::new(map).unwrap();
        let df = DataFrame::new(vec![
            str_column(SAMPLE_BLOCK, vec!["b0".into()]),
            str_column(LABEL, vec!["y".into()]),
            list_f64_column(VALUES, &[vec![0.25]]),
        ])
        .unwrap();
        let err = flatten_predictions(&df, &blocks, &label_frame()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WgrError>(),
            Some(WgrError::JoinGap(_))
        ));
    }

    #[test]
    fn missing_header_is_a_join_gap_unless_partial() {
        use crate::df_utils::i64_column;
        use crate::schema::{HEADER_BLOCK, SORT_KEY};
        let group = DataFrame::new(vec![
            str_column(HEADER_BLOCK, vec!["chr_1".into()]),
            str_column(SAMPLE_BLOCK, vec!["b0".into()]),
            str_column(HEADER, vec!["chr_1_block_0".into()]),
            str_column(LABEL, vec!["y".into()]),
            i64_column(SORT_KEY, vec![0]),
            list_f64_column(VALUES, &[vec![1.0, 2.0]]),
        ])
        .unwrap();
        let cov = LabelFrame::empty(vec!["s1".into(), "s2".into()]).unwrap();
        let empty = lookup(&[], &["y"]);

        let strict = apply_model_df(&group, &empty, &block_map(), &cov, None, false);
        assert!(strict.is_err());

        let partial = apply_model_df(&group, &empty, &block_map(), &cov, None, true).unwrap();
        let values = list_f64_at(list_col(&partial, VALUES).unwrap(), 0, VALUES).unwrap();
        assert_eq!(values, vec![0.0, 0.0]);
    }
}
