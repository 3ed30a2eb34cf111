use anyhow::{Context, Result};
use polars::prelude::*;

use crate::error::PhenoplierError;

pub fn require_columns(df: &DataFrame, cols: &[&str], table: &str) -> Result<()> {
    for col in cols {
        if df.column(col).is_err() {
            return Err(PhenoplierError::MissingColumn(format!(
                "mandatory column '{col}' not present in {table}"
            ))
            .into());
        }
    }
    Ok(())
}

pub fn string_column(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    let column = df.column(name)?.cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or("").to_string())
        .collect())
}

/// Float view of a column; nulls become NaN.
pub fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let column = df
        .column(name)?
        .cast(&DataType::Float64)
        .with_context(|| format!("column {name} is not numeric"))?;
    Ok(column
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect())
}

pub fn filter_missing(mut df: DataFrame, col: &str) -> Result<(DataFrame, usize)> {
    if df.column(col).is_err() {
        return Ok((df, 0));
    }
    let before = df.height();
    let column = df.column(col)?;
    let mask = match column.dtype() {
        DataType::Float64 => column.is_not_null() & column.f64()?.is_not_nan(),
        _ => column.is_not_null(),
    };
    df = df.filter(&mask)?;
    let removed = before.saturating_sub(df.height());
    Ok((df, removed))
}
