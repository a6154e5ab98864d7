use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use ndarray::{Array1, Array2, ArrayView1, s};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::df_utils::str_col;
use crate::error::WgrError;
use crate::schema::{HEADER, SAMPLE_ID};

/// Heritability grid the default alphas are derived from, as in the original
/// whole-genome-regression implementation.
const DEFAULT_HERITABILITY_GRID: [f64; 5] = [0.99, 0.75, 0.50, 0.25, 0.01];

/// Options for [`crate::regression::RidgeRegression`]. This is the plain-data
/// configuration that may travel to workers; dataframe handles never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeConfig {
    /// Prepend an all-ones intercept column to the covariates.
    pub add_intercept: bool,
    /// Ridge penalties; empty means derive the default grid from the matrix.
    pub alphas: Vec<f64>,
    /// Upper bound on worker threads for grouped stages.
    pub cores: Option<usize>,
}

impl Default for RidgeConfig {
    fn default() -> Self {
        Self {
            add_intercept: true,
            alphas: Vec::new(),
            cores: None,
        }
    }
}

/// A dense sample-by-column numeric table with a stable sample order.
/// Used for both labels and covariates.
#[derive(Debug, Clone)]
pub struct LabelFrame {
    sample_ids: Vec<String>,
    names: Vec<String>,
    data: Array2<f64>,
    index: HashMap<String, usize>,
}

impl LabelFrame {
    pub fn new(sample_ids: Vec<String>, names: Vec<String>, data: Array2<f64>) -> Result<Self> {
        if data.nrows() != sample_ids.len() || data.ncols() != names.len() {
            return Err(WgrError::Consistency(format!(
                "frame shape {:?} does not match {} samples x {} columns",
                data.dim(),
                sample_ids.len(),
                names.len()
            ))
            .into());
        }
        let mut index = HashMap::with_capacity(sample_ids.len());
        for (row, id) in sample_ids.iter().enumerate() {
            if index.insert(id.clone(), row).is_some() {
                return Err(WgrError::Consistency(format!("duplicate sample ID {id}")).into());
            }
        }
        Ok(Self {
            sample_ids,
            names,
            data,
            index,
        })
    }

    /// Builds a frame from a dataframe with a `sample_id` column; every other
    /// column is cast to f64.
    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        let ids_ca = str_col(df, SAMPLE_ID)?;
        let mut sample_ids = Vec::with_capacity(df.height());
        for idx in 0..df.height() {
            let id = ids_ca
                .get(idx)
                .ok_or_else(|| WgrError::Consistency(format!("null sample_id at row {idx}")))?;
            sample_ids.push(id.to_string());
        }

        let mut names = Vec::new();
        let mut data = Array2::zeros((df.height(), df.width().saturating_sub(1)));
        let mut col = 0usize;
        for column in df.get_columns() {
            let name = column.name().as_str();
            if name == SAMPLE_ID {
                continue;
            }
            let series = column.as_materialized_series();
            let casted;
            let values = if series.dtype() == &DataType::Float64 {
                series.f64()?
            } else {
                casted = series
                    .cast(&DataType::Float64)
                    .with_context(|| format!("cast column {name} to f64"))?;
                casted.f64()?
            };
            for idx in 0..df.height() {
                let value = values.get(idx).ok_or_else(|| {
                    WgrError::Consistency(format!("null value in column {name} at row {idx}"))
                })?;
                if !value.is_finite() {
                    return Err(WgrError::Consistency(format!(
                        "non-finite value in column {name} at row {idx}"
                    ))
                    .into());
                }
                data[[idx, col]] = value;
            }
            names.push(name.to_string());
            col += 1;
        }
        Self::new(sample_ids, names, data)
    }

    /// A frame with the given sample order and no columns.
    pub fn empty(sample_ids: Vec<String>) -> Result<Self> {
        let n = sample_ids.len();
        Self::new(sample_ids, Vec::new(), Array2::zeros((n, 0)))
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_cols(&self) -> usize {
        self.names.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        let col = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| WgrError::Consistency(format!("unknown column {name}")))?;
        Ok(self.data.column(col))
    }

    fn row_of(&self, sample_id: &str) -> Result<usize> {
        self.index
            .get(sample_id)
            .copied()
            .ok_or_else(|| WgrError::Consistency(format!("unknown sample ID {sample_id}")).into())
    }

    /// Rows for the given samples, in the given order.
    pub fn rows(&self, sample_ids: &[String]) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((sample_ids.len(), self.n_cols()));
        for (row, id) in sample_ids.iter().enumerate() {
            let src = self.row_of(id)?;
            out.slice_mut(s![row, ..]).assign(&self.data.row(src));
        }
        Ok(out)
    }

    /// One column restricted to the given samples, in the given order.
    pub fn column_rows(&self, name: &str, sample_ids: &[String]) -> Result<Array1<f64>> {
        let column = self.column(name)?;
        let mut out = Array1::zeros(sample_ids.len());
        for (row, id) in sample_ids.iter().enumerate() {
            out[row] = column[self.row_of(id)?];
        }
        Ok(out)
    }

    /// Mean 0 / sd 1 per column (sd with ddof = 1). Constant columns are a
    /// fatal consistency error.
    pub fn standardized(&self) -> Result<Self> {
        let n = self.n_samples();
        if n < 2 {
            return Err(
                WgrError::Consistency("standardization requires at least 2 samples".into()).into(),
            );
        }
        let mut data = self.data.clone();
        for (col, name) in self.names.iter().enumerate() {
            let mean = self.data.column(col).mean().unwrap_or(0.0);
            let var = self
                .data
                .column(col)
                .iter()
                .map(|v| (v - mean).powi(2))
                .sum::<f64>()
                / (n as f64 - 1.0);
            let sd = var.sqrt();
            if !(sd.is_finite() && sd > 0.0) {
                return Err(
                    WgrError::Consistency(format!("column {name} has zero variance")).into(),
                );
            }
            data.column_mut(col).mapv_inplace(|v| (v - mean) / sd);
        }
        Self::new(self.sample_ids.clone(), self.names.clone(), data)
    }

    fn is_standardized(&self) -> bool {
        let n = self.n_samples() as f64;
        self.names.iter().enumerate().all(|(col, _)| {
            let mean = self.data.column(col).mean().unwrap_or(0.0);
            let var = self
                .data
                .column(col)
                .iter()
                .map(|v| (v - mean).powi(2))
                .sum::<f64>()
                / (n - 1.0);
            mean.abs() < 1e-9 && (var - 1.0).abs() < 1e-9
        })
    }
}

/// Standardizes quantitative labels, warning when the caller did not supply
/// them pre-standardized. Returns the standardized frame.
pub fn prepare_labels(labels: &LabelFrame) -> Result<LabelFrame> {
    if labels.n_cols() == 0 {
        return Err(WgrError::Consistency("label table has no label columns".into()).into());
    }
    if !labels.is_standardized() {
        tracing::warn!("Label columns are not standardized; standardizing internally");
    }
    labels.standardized()
}

/// Standardizes covariates, reindexed to the label table's sample order, and
/// prepends an unstandardized all-ones intercept column when requested.
pub fn prepare_covariates(
    covariates: Option<&LabelFrame>,
    labels: &LabelFrame,
    add_intercept: bool,
) -> Result<LabelFrame> {
    let base = match covariates {
        Some(cov) if cov.n_cols() > 0 => {
            if cov.names().iter().any(|n| n == "intercept") && add_intercept {
                return Err(WgrError::Consistency(
                    "covariate named intercept collides with add_intercept".into(),
                )
                .into());
            }
            let aligned = LabelFrame::new(
                labels.sample_ids().to_vec(),
                cov.names().to_vec(),
                cov.rows(labels.sample_ids())?,
            )?;
            aligned.standardized()?
        }
        _ => LabelFrame::empty(labels.sample_ids().to_vec())?,
    };
    if !add_intercept {
        return Ok(base);
    }
    let n = base.n_samples();
    let mut names = Vec::with_capacity(base.n_cols() + 1);
    names.push("intercept".to_string());
    names.extend(base.names().iter().cloned());
    let mut data = Array2::ones((n, base.n_cols() + 1));
    data.slice_mut(s![.., 1..]).assign(base.data());
    LabelFrame::new(base.sample_ids().to_vec(), names, data)
}

/// Mapping from sample-block ID to its ordered sample list. Iteration order is
/// the block ID sort order, which keeps every downstream table deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBlockMap {
    blocks: BTreeMap<String, Vec<String>>,
}

impl SampleBlockMap {
    pub fn new(blocks: BTreeMap<String, Vec<String>>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(WgrError::Consistency("sample-block map is empty".into()).into());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        for (block, samples) in &blocks {
            if samples.is_empty() {
                return Err(WgrError::Consistency(format!("sample block {block} is empty")).into());
            }
            for id in samples {
                if !seen.insert(id.as_str()) {
                    return Err(WgrError::Consistency(format!(
                        "sample ID {id} appears in more than one sample block"
                    ))
                    .into());
                }
            }
        }
        Ok(Self { blocks })
    }

    /// Every label-table sample must sit in exactly one block and vice versa.
    pub fn validate_against(&self, labels: &LabelFrame) -> Result<()> {
        let label_ids: HashSet<&str> = labels.sample_ids().iter().map(String::as_str).collect();
        let mut covered = 0usize;
        for (block, samples) in &self.blocks {
            for id in samples {
                if !label_ids.contains(id.as_str()) {
                    return Err(WgrError::Consistency(format!(
                        "sample block {block} contains sample {id} absent from the label table"
                    ))
                    .into());
                }
                covered += 1;
            }
        }
        if covered != label_ids.len() {
            return Err(WgrError::Consistency(format!(
                "sample blocks cover {covered} samples but the label table has {}",
                label_ids.len()
            ))
            .into());
        }
        Ok(())
    }

    pub fn samples(&self, block: &str) -> Result<&[String]> {
        self.blocks
            .get(block)
            .map(Vec::as_slice)
            .ok_or_else(|| WgrError::Consistency(format!("unknown sample block {block}")).into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Ordered named ridge penalties. Order is fixed at construction and drives
/// every per-alpha loop, so results are reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlphaSet {
    entries: Vec<(String, f64)>,
}

impl AlphaSet {
    pub fn from_values(values: &[f64]) -> Result<Self> {
        let named = values
            .iter()
            .enumerate()
            .map(|(idx, value)| (format!("alpha_{idx}"), *value))
            .collect();
        Self::from_named(named)
    }

    pub fn from_named(entries: Vec<(String, f64)>) -> Result<Self> {
        if entries.is_empty() {
            return Err(WgrError::Consistency("alpha set is empty".into()).into());
        }
        let mut names: HashSet<&str> = HashSet::new();
        for (name, value) in &entries {
            if !(value.is_finite() && *value > 0.0) {
                return Err(WgrError::Consistency(format!(
                    "alpha {name} must be positive and finite, got {value}"
                ))
                .into());
            }
            if !names.insert(name.as_str()) {
                return Err(WgrError::Consistency(format!("duplicate alpha name {name}")).into());
            }
        }
        Ok(Self { entries })
    }

    /// Default grid spanning several orders of magnitude: with `h` distinct
    /// headers in the reduced matrix, alphas are `h / v` over the
    /// heritability grid.
    pub fn generate(reduced_block_df: &DataFrame) -> Result<Self> {
        let headers = str_col(reduced_block_df, HEADER)?;
        let distinct: HashSet<&str> = headers.into_iter().flatten().collect();
        if distinct.is_empty() {
            return Err(
                WgrError::Consistency("cannot derive alphas from an empty matrix".into()).into(),
            );
        }
        let h = distinct.len() as f64;
        let values: Vec<f64> = DEFAULT_HERITABILITY_GRID.iter().map(|v| h / v).collect();
        Self::from_values(&values)
    }

    pub fn value(&self, name: &str) -> Result<f64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| WgrError::Consistency(format!("unknown alpha {name}")).into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
