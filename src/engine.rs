//! The slice of a distributed dataframe engine this crate consumes: group a
//! table by an ordered key pattern, apply a pure function to each group's
//! materialized rows, and reassemble a table with a declared schema. Groups
//! share no mutable state, so they fan out over a rayon pool.

use anyhow::Result;
use polars::prelude::*;
use rayon::prelude::*;

use crate::df_utils::{str_at, str_col, vstack_all};
use crate::error::WgrError;
use crate::parallel::{collect_results, resolve_threads, run_in_pool};
use crate::schema::check_schema;

/// Key values of one group, in key-pattern order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    values: Vec<String>,
}

impl GroupKey {
    fn from_group(group: &DataFrame, key_pattern: &[&str]) -> Result<Self> {
        if group.height() == 0 {
            return Err(WgrError::Consistency("empty group in grouped apply".into()).into());
        }
        let mut values = Vec::with_capacity(key_pattern.len());
        for key in key_pattern {
            values.push(str_at(str_col(group, key)?, 0, key)?.to_string());
        }
        Ok(Self { values })
    }

    pub fn get(&self, idx: usize) -> &str {
        &self.values[idx]
    }
}

/// Partitions `df` by `key_pattern`, applies `f` to every group in parallel,
/// checks each produced frame against `out_schema` and vstacks the results.
/// Group order is not significant; callers that need a deterministic row order
/// sort downstream.
pub fn group_apply<F>(
    df: &DataFrame,
    key_pattern: &[&str],
    out_schema: &Schema,
    cores: Option<usize>,
    f: F,
) -> Result<DataFrame>
where
    F: Fn(&GroupKey, &DataFrame) -> Result<DataFrame> + Sync,
{
    let keys: Vec<PlSmallStr> = key_pattern.iter().map(|k| (*k).into()).collect();
    let groups = df.partition_by(keys, true)?;
    let threads = resolve_threads(cores, groups.len());
    let results = run_in_pool(threads, "grouped apply pool", || {
        groups
            .par_iter()
            .map(|group| {
                let key = GroupKey::from_group(group, key_pattern)?;
                let out = f(&key, group)?;
                check_schema(&out, out_schema, "grouped apply output")?;
                Ok(out)
            })
            .collect::<Vec<Result<DataFrame>>>()
    })?;
    vstack_all(collect_results(results)?, out_schema)
}
