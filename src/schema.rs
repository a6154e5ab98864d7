use anyhow::Result;
use polars::prelude::*;

use crate::error::WgrError;

// Key columns shared across the pipeline tables.
pub const HEADER_BLOCK: &str = "header_block";
pub const SAMPLE_BLOCK: &str = "sample_block";
pub const HEADER: &str = "header";
pub const LABEL: &str = "label";
pub const SORT_KEY: &str = "sort_key";
pub const VALUES: &str = "values";
pub const XTX: &str = "xtx";
pub const XTY: &str = "xty";
pub const ALPHA: &str = "alpha";
pub const COEFFICIENT: &str = "coefficient";
pub const SCORE: &str = "score";
pub const SAMPLE_ID: &str = "sample_id";
pub const CONTIG: &str = "contig";

/// Header block under which covariate and intercept coefficients are kept.
/// Never matches a chromosome header pattern, so LOCO filters leave it alone.
pub const COVARIATE_BLOCK: &str = "covariates";

/// Sample-block sentinel on reducer output: statistics summed over all blocks.
pub const ALL_SAMPLE_BLOCKS: &str = "all";

/// Input reduced block matrix: one row per (header_block, sample_block,
/// header, label), `values` holding that block's samples in map order.
pub fn reduced_matrix_schema() -> Schema {
    Schema::from_iter([
        (HEADER_BLOCK.into(), DataType::String),
        (SAMPLE_BLOCK.into(), DataType::String),
        (HEADER.into(), DataType::String),
        (LABEL.into(), DataType::String),
        (SORT_KEY.into(), DataType::Int64),
        (VALUES.into(), DataType::List(Box::new(DataType::Float64))),
    ])
}

/// Accumulator output: one row per assembled design column, carrying that
/// column's row of X^T X and its X^T y entry.
pub fn normal_eqn_schema() -> Schema {
    Schema::from_iter([
        (HEADER_BLOCK.into(), DataType::String),
        (SAMPLE_BLOCK.into(), DataType::String),
        (LABEL.into(), DataType::String),
        (HEADER.into(), DataType::String),
        (SORT_KEY.into(), DataType::Int64),
        (XTX.into(), DataType::List(Box::new(DataType::Float64))),
        (XTY.into(), DataType::Float64),
    ])
}

/// Solver output: one coefficient per (header, label, alpha).
pub fn model_schema() -> Schema {
    Schema::from_iter([
        (HEADER_BLOCK.into(), DataType::String),
        (HEADER.into(), DataType::String),
        (LABEL.into(), DataType::String),
        (ALPHA.into(), DataType::String),
        (COEFFICIENT.into(), DataType::Float64),
    ])
}

/// Per-block out-of-fold scores before aggregation.
pub fn block_score_schema() -> Schema {
    Schema::from_iter([
        (SAMPLE_BLOCK.into(), DataType::String),
        (LABEL.into(), DataType::String),
        (ALPHA.into(), DataType::String),
        (SCORE.into(), DataType::Float64),
    ])
}

/// Aggregated cross-validation table: mean out-of-fold score per (label, alpha).
pub fn cv_schema() -> Schema {
    Schema::from_iter([
        (LABEL.into(), DataType::String),
        (ALPHA.into(), DataType::String),
        (SCORE.into(), DataType::Float64),
    ])
}

/// Block-partitioned partial predictions before flattening.
pub fn blocked_prediction_schema() -> Schema {
    Schema::from_iter([
        (SAMPLE_BLOCK.into(), DataType::String),
        (LABEL.into(), DataType::String),
        (VALUES.into(), DataType::List(Box::new(DataType::Float64))),
    ])
}

/// Checks that `df` carries every column of `schema` with the declared dtype.
pub fn check_schema(df: &DataFrame, schema: &Schema, what: &str) -> Result<()> {
    for (name, dtype) in schema.iter() {
        let column = df.column(name.as_str()).map_err(|_| {
            WgrError::Consistency(format!("{what} frame is missing column {name}"))
        })?;
        if column.dtype() != dtype {
            return Err(WgrError::Consistency(format!(
                "{what} frame column {name} has dtype {} (expected {dtype})",
                column.dtype()
            ))
            .into());
        }
    }
    Ok(())
}
