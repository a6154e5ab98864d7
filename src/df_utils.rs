use anyhow::Result;
use polars::prelude::*;

use crate::error::WgrError;

pub fn str_col<'a>(df: &'a DataFrame, name: &str) -> Result<&'a StringChunked> {
    let series = df.column(name)?.as_materialized_series();
    Ok(series.str()?)
}

pub fn f64_col<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Float64Chunked> {
    let series = df.column(name)?.as_materialized_series();
    Ok(series.f64()?)
}

pub fn i64_col<'a>(df: &'a DataFrame, name: &str) -> Result<&'a Int64Chunked> {
    let series = df.column(name)?.as_materialized_series();
    Ok(series.i64()?)
}

pub fn list_col<'a>(df: &'a DataFrame, name: &str) -> Result<&'a ListChunked> {
    let series = df.column(name)?.as_materialized_series();
    Ok(series.list()?)
}

pub fn str_at<'a>(ca: &'a StringChunked, idx: usize, name: &str) -> Result<&'a str> {
    ca.get(idx)
        .ok_or_else(|| WgrError::Consistency(format!("null {name} at row {idx}")).into())
}

pub fn f64_at(ca: &Float64Chunked, idx: usize, name: &str) -> Result<f64> {
    ca.get(idx)
        .ok_or_else(|| WgrError::Consistency(format!("null {name} at row {idx}")).into())
}

pub fn i64_at(ca: &Int64Chunked, idx: usize, name: &str) -> Result<i64> {
    ca.get(idx)
        .ok_or_else(|| WgrError::Consistency(format!("null {name} at row {idx}")).into())
}

pub fn list_f64_at(ca: &ListChunked, idx: usize, name: &str) -> Result<Vec<f64>> {
    let series = ca
        .get_as_series(idx)
        .ok_or_else(|| WgrError::Consistency(format!("null {name} at row {idx}")))?;
    if series.null_count() > 0 {
        return Err(WgrError::Consistency(format!("null value inside {name} at row {idx}")).into());
    }
    Ok(series.f64()?.into_no_null_iter().collect())
}

pub fn str_column(name: &str, values: Vec<String>) -> Column {
    Series::new(name.into(), values).into()
}

pub fn f64_column(name: &str, values: Vec<f64>) -> Column {
    Series::new(name.into(), values).into()
}

pub fn i64_column(name: &str, values: Vec<i64>) -> Column {
    Series::new(name.into(), values).into()
}

pub fn list_f64_column(name: &str, rows: &[Vec<f64>]) -> Column {
    let value_capacity: usize = rows.iter().map(|row| row.len()).sum();
    let mut builder = ListPrimitiveChunkedBuilder::<Float64Type>::new(
        name.into(),
        rows.len(),
        value_capacity,
        DataType::Float64,
    );
    for row in rows {
        builder.append_slice(row);
    }
    builder.finish().into_series().into()
}

pub fn vstack_all(frames: Vec<DataFrame>, empty_schema: &Schema) -> Result<DataFrame> {
    let mut frames = frames.into_iter();
    let Some(mut acc) = frames.next() else {
        return Ok(DataFrame::empty_with_schema(empty_schema));
    };
    for frame in frames {
        acc.vstack_mut(&frame)?;
    }
    Ok(acc)
}
