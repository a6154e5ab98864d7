//! Normal-equation accumulation over the reduced block matrix: the map stage
//! turns one (sample_block, label) group into per-column rows of X^T X and
//! X^T y, and the reduce stage sums those rows across sample blocks.

use anyhow::Result;
use ndarray::{Array1, Array2};
use polars::prelude::*;

use crate::df_utils::{
    f64_at, f64_col, f64_column, i64_at, i64_col, i64_column, list_col, list_f64_at,
    list_f64_column, str_at, str_col, str_column,
};
use crate::engine::GroupKey;
use crate::error::WgrError;
use crate::schema::{
    ALL_SAMPLE_BLOCKS, COVARIATE_BLOCK, HEADER, HEADER_BLOCK, LABEL, SAMPLE_BLOCK, SORT_KEY,
    VALUES, XTX, XTY,
};
use crate::types::{LabelFrame, SampleBlockMap};

/// One (sample_block, label) group of the reduced matrix, assembled into a
/// dense design matrix with covariate columns first.
pub struct AssembledBlock {
    pub header_blocks: Vec<String>,
    pub headers: Vec<String>,
    pub sort_keys: Vec<i64>,
    /// n_samples x (n_covariates + n_features)
    pub x: Array2<f64>,
}

impl AssembledBlock {
    pub fn width(&self) -> usize {
        self.headers.len()
    }
}

/// Covariate columns sort ahead of every feature column.
fn covariate_sort_key(idx: usize, n_cov: usize) -> i64 {
    idx as i64 - n_cov as i64
}

pub fn assemble_block(
    group: &DataFrame,
    sample_list: &[String],
    covariates: &LabelFrame,
) -> Result<AssembledBlock> {
    let header_blocks = str_col(group, HEADER_BLOCK)?;
    let headers = str_col(group, HEADER)?;
    let sort_keys = i64_col(group, SORT_KEY)?;
    let values = list_col(group, VALUES)?;

    let n = sample_list.len();
    let mut rows: Vec<(i64, String, String, Vec<f64>)> = Vec::with_capacity(group.height());
    for idx in 0..group.height() {
        let header = str_at(headers, idx, HEADER)?;
        let row_values = list_f64_at(values, idx, VALUES)?;
        if row_values.len() != n {
            return Err(WgrError::Consistency(format!(
                "header {header} carries {} values but its sample block lists {n} samples",
                row_values.len()
            ))
            .into());
        }
        rows.push((
            i64_at(sort_keys, idx, SORT_KEY)?,
            header.to_string(),
            str_at(header_blocks, idx, HEADER_BLOCK)?.to_string(),
            row_values,
        ));
    }
    rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    for pair in rows.windows(2) {
        if pair[0].1 == pair[1].1 {
            return Err(WgrError::Consistency(format!(
                "duplicate header {} within one matrix group",
                pair[0].1
            ))
            .into());
        }
    }

    let n_cov = covariates.n_cols();
    let p = n_cov + rows.len();
    let mut header_blocks_out = Vec::with_capacity(p);
    let mut headers_out = Vec::with_capacity(p);
    let mut sort_keys_out = Vec::with_capacity(p);
    let mut x = Array2::zeros((n, p));

    let cov_rows = covariates.rows(sample_list)?;
    for (idx, name) in covariates.names().iter().enumerate() {
        header_blocks_out.push(COVARIATE_BLOCK.to_string());
        headers_out.push(name.clone());
        sort_keys_out.push(covariate_sort_key(idx, n_cov));
        x.column_mut(idx).assign(&cov_rows.column(idx));
    }
    for (offset, (sort_key, header, header_block, row_values)) in rows.into_iter().enumerate() {
        if sort_key < 0 {
            return Err(WgrError::Consistency(format!(
                "header {header} has negative sort_key {sort_key}"
            ))
            .into());
        }
        header_blocks_out.push(header_block);
        headers_out.push(header);
        sort_keys_out.push(sort_key);
        for (row, value) in row_values.into_iter().enumerate() {
            x[[row, n_cov + offset]] = value;
        }
    }

    Ok(AssembledBlock {
        header_blocks: header_blocks_out,
        headers: headers_out,
        sort_keys: sort_keys_out,
        x,
    })
}

/// Map stage: partial X^T X / X^T y contribution of one (sample_block, label)
/// group. Pure in its inputs, so groups run in parallel.
pub fn map_normal_eqn(
    key: &GroupKey,
    group: &DataFrame,
    std_labels: &LabelFrame,
    sample_blocks: &SampleBlockMap,
    std_covariates: &LabelFrame,
) -> Result<DataFrame> {
    let sample_block = key.get(0);
    let label = key.get(1);
    let sample_list = sample_blocks.samples(sample_block)?;
    let assembled = assemble_block(group, sample_list, std_covariates)?;
    let y = std_labels.column_rows(label, sample_list)?;

    let xtx = assembled.x.t().dot(&assembled.x);
    let xty = assembled.x.t().dot(&y);

    let p = assembled.width();
    let xtx_rows: Vec<Vec<f64>> = (0..p).map(|i| xtx.row(i).to_vec()).collect();
    Ok(DataFrame::new(vec![
        str_column(HEADER_BLOCK, assembled.header_blocks.clone()),
        str_column(SAMPLE_BLOCK, vec![sample_block.to_string(); p]),
        str_column(LABEL, vec![label.to_string(); p]),
        str_column(HEADER, assembled.headers.clone()),
        i64_column(SORT_KEY, assembled.sort_keys.clone()),
        list_f64_column(XTX, &xtx_rows),
        f64_column(XTY, xty.to_vec()),
    ])?)
}

/// Reduce stage: sums the partial contributions of one
/// (header_block, header, label) key across sample blocks. Plain elementwise
/// addition, so arrival order only perturbs the result at floating-point
/// summation level.
pub fn reduce_normal_eqn(key: &GroupKey, group: &DataFrame) -> Result<DataFrame> {
    let header_block = key.get(0);
    let header = key.get(1);
    let label = key.get(2);

    let sort_keys = i64_col(group, SORT_KEY)?;
    let xtx = list_col(group, XTX)?;
    let xty = f64_col(group, XTY)?;

    let sort_key = i64_at(sort_keys, 0, SORT_KEY)?;
    let mut xtx_sum = list_f64_at(xtx, 0, XTX)?;
    let mut xty_sum = f64_at(xty, 0, XTY)?;
    for idx in 1..group.height() {
        if i64_at(sort_keys, idx, SORT_KEY)? != sort_key {
            return Err(WgrError::Consistency(format!(
                "header {header} has conflicting sort keys across sample blocks"
            ))
            .into());
        }
        let row = list_f64_at(xtx, idx, XTX)?;
        if row.len() != xtx_sum.len() {
            return Err(WgrError::Consistency(format!(
                "header {header} has xtx width {} in one block and {} in another",
                row.len(),
                xtx_sum.len()
            ))
            .into());
        }
        for (acc, value) in xtx_sum.iter_mut().zip(row) {
            *acc += value;
        }
        xty_sum += f64_at(xty, idx, XTY)?;
    }

    Ok(DataFrame::new(vec![
        str_column(HEADER_BLOCK, vec![header_block.to_string()]),
        str_column(SAMPLE_BLOCK, vec![ALL_SAMPLE_BLOCKS.to_string()]),
        str_column(LABEL, vec![label.to_string()]),
        str_column(HEADER, vec![header.to_string()]),
        i64_column(SORT_KEY, vec![sort_key]),
        list_f64_column(XTX, &[xtx_sum]),
        f64_column(XTY, vec![xty_sum]),
    ])?)
}

/// Accumulator rows of one label parsed back into an ordered linear system.
pub struct NormalEqnSystem {
    pub header_blocks: Vec<String>,
    pub headers: Vec<String>,
    pub a: Array2<f64>,
    pub b: Array1<f64>,
}

impl NormalEqnSystem {
    pub fn from_rows(group: &DataFrame) -> Result<Self> {
        let header_blocks = str_col(group, HEADER_BLOCK)?;
        let headers = str_col(group, HEADER)?;
        let sort_keys = i64_col(group, SORT_KEY)?;
        let xtx = list_col(group, XTX)?;
        let xty = f64_col(group, XTY)?;

        let p = group.height();
        let mut rows: Vec<(i64, String, String, Vec<f64>, f64)> = Vec::with_capacity(p);
        for idx in 0..p {
            rows.push((
                i64_at(sort_keys, idx, SORT_KEY)?,
                str_at(headers, idx, HEADER)?.to_string(),
                str_at(header_blocks, idx, HEADER_BLOCK)?.to_string(),
                list_f64_at(xtx, idx, XTX)?,
                f64_at(xty, idx, XTY)?,
            ));
        }
        rows.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));

        let mut a = Array2::zeros((p, p));
        let mut b = Array1::zeros(p);
        let mut header_blocks_out = Vec::with_capacity(p);
        let mut headers_out = Vec::with_capacity(p);
        for (row, (_, header, header_block, xtx_row, xty_value)) in rows.into_iter().enumerate() {
            if xtx_row.len() != p {
                return Err(WgrError::Consistency(format!(
                    "header {header} carries an xtx row of width {} in a {p}-column system",
                    xtx_row.len()
                ))
                .into());
            }
            for (col, value) in xtx_row.into_iter().enumerate() {
                a[[row, col]] = value;
            }
            b[row] = xty_value;
            header_blocks_out.push(header_block);
            headers_out.push(header);
        }
        Ok(Self {
            header_blocks: header_blocks_out,
            headers: headers_out,
            a,
            b,
        })
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }

    /// Subtracts one sample block's partial contribution, yielding the
    /// held-out system used for out-of-fold scoring.
    pub fn minus(&self, block: &NormalEqnSystem) -> Result<NormalEqnSystem> {
        if self.headers != block.headers {
            return Err(WgrError::Consistency(
                "held-out block's headers do not match the accumulated system".into(),
            )
            .into());
        }
        Ok(NormalEqnSystem {
            header_blocks: self.header_blocks.clone(),
            headers: self.headers.clone(),
            a: &self.a - &block.a,
            b: &self.b - &block.b,
        })
    }

    /// `A + D_alpha`, with the penalty applied to feature columns only.
    pub fn penalized(&self, alpha: f64) -> Array2<f64> {
        let mut out = self.a.clone();
        for (idx, header_block) in self.header_blocks.iter().enumerate() {
            if header_block != COVARIATE_BLOCK {
                out[[idx, idx]] += alpha;
            }
        }
        out
    }
}
