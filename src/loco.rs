//! Leave-one-chromosome-out support: chromosome identifiers are embedded in
//! header names under the convention `chr_<chromosome>_(alpha|block)`.

use std::collections::BTreeSet;

use anyhow::Result;
use polars::prelude::*;

use crate::df_utils::str_col;
use crate::error::WgrError;
use crate::schema::HEADER;

/// Chromosome identifier of a header following the naming convention, or
/// `None` for headers outside it (covariates, intercept).
pub fn chromosome_of(header: &str) -> Option<&str> {
    let rest = header.strip_prefix("chr_")?;
    let end = ["_block", "_alpha"]
        .iter()
        .filter_map(|tag| rest.find(tag))
        .min()?;
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

/// Sorts numerically when every identifier parses as an integer (so contig 2
/// precedes contig 10), lexicographically otherwise.
pub fn sort_chromosomes(mut chromosomes: Vec<String>) -> Vec<String> {
    let numeric: Option<Vec<u64>> = chromosomes.iter().map(|c| c.parse().ok()).collect();
    match numeric {
        Some(_) => chromosomes.sort_by_key(|c| c.parse::<u64>().unwrap_or(u64::MAX)),
        None => chromosomes.sort(),
    }
    chromosomes
}

/// Distinct chromosomes named by the model table's headers, sorted.
pub fn infer_chromosomes(model_df: &DataFrame) -> Result<Vec<String>> {
    let headers = str_col(model_df, HEADER)?;
    let distinct: BTreeSet<String> = headers
        .into_iter()
        .flatten()
        .filter_map(chromosome_of)
        .map(str::to_string)
        .collect();
    if distinct.is_empty() {
        return Err(WgrError::Consistency(
            "no chromosome identifiers found in model headers; expected chr_<c>_(alpha|block)"
                .into(),
        )
        .into());
    }
    Ok(sort_chromosomes(distinct.into_iter().collect()))
}
