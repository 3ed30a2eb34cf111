//! Table, labeled-matrix and list files. Inputs ending in `.gz` or `.bz2`
//! are decompressed on the fly; outputs ending in `.gz` are compressed.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use ndarray::Array2;
use polars::prelude::*;
use tempfile::NamedTempFile;

use crate::error::PhenoplierError;
use crate::matrix::LabeledMatrix;
use crate::types::MatrixDtype;

/// Header of the label column in matrix files.
pub const MATRIX_INDEX_COLUMN: &str = "gene";

/// Cell values read as missing.
const MISSING_TOKENS: [&str; 4] = ["", "NA", "NaN", "."];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Plain,
    Gzip,
    Bzip2,
}

impl Codec {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(e) if e.eq_ignore_ascii_case("gz") => Codec::Gzip,
            Some(e) if e.eq_ignore_ascii_case("bz2") => Codec::Bzip2,
            _ => Codec::Plain,
        }
    }
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>> {
    if !path.exists() {
        return Err(PhenoplierError::Resource(format!(
            "File does not exist: {}",
            path.display()
        ))
        .into());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    Ok(match Codec::of(path) {
        Codec::Plain => Box::new(BufReader::new(file)),
        Codec::Gzip => Box::new(BufReader::new(GzDecoder::new(file))),
        Codec::Bzip2 => Box::new(BufReader::new(BzDecoder::new(file))),
    })
}

/// Tab and comma are taken from the header line; anything else is read as
/// whitespace-separated.
fn sniff_separator(header: &str) -> Option<u8> {
    [b'\t', b','].into_iter().find(|&c| header.contains(c as char))
}

pub fn read_table(path: &Path) -> Result<DataFrame> {
    read_table_with(path, true)
}

/// Reads a delimited table with a header. Without type inference every
/// column stays a string.
pub fn read_table_with(path: &Path, infer_types: bool) -> Result<DataFrame> {
    let mut input = open_input(path)?;
    let mut header = String::new();
    input
        .read_line(&mut header)
        .with_context(|| format!("read header of {}", path.display()))?;
    if header.trim().is_empty() {
        return Err(PhenoplierError::InvalidInput(format!(
            "Table {} has no header",
            path.display()
        ))
        .into());
    }

    let Some(separator) = sniff_separator(&header) else {
        return read_whitespace_table(&header, input)
            .with_context(|| format!("read {}", path.display()));
    };

    // polars reads from a path, so compressed input goes through a temp file.
    let decompressed = match Codec::of(path) {
        Codec::Plain => None,
        _ => {
            let mut tmp = NamedTempFile::new()?;
            tmp.write_all(header.as_bytes())?;
            std::io::copy(&mut input, &mut tmp)
                .with_context(|| format!("decompress {}", path.display()))?;
            tmp.flush()?;
            Some(tmp)
        }
    };
    let source = decompressed.as_ref().map_or(path, |t| t.path());

    let null_values = MISSING_TOKENS.iter().map(|t| (*t).into()).collect();
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(if infer_types { 10_000 } else { 0 }))
        .with_parse_options(
            CsvParseOptions::default()
                .with_separator(separator)
                .with_null_values(Some(NullValues::AllColumns(null_values)))
                .with_missing_is_null(true),
        )
        .try_into_reader_with_file_path(Some(source.to_path_buf()))?
        .finish()
        .with_context(|| format!("read {}", path.display()))
}

/// String-typed frame from a whitespace-separated table; short rows are
/// padded with missing values.
fn read_whitespace_table(header: &str, rows: impl BufRead) -> Result<DataFrame> {
    let names: Vec<&str> = header.split_whitespace().collect();
    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); names.len()];
    for line in rows.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        for column in cells.iter_mut() {
            let value = fields
                .next()
                .filter(|v| !MISSING_TOKENS.iter().any(|m| m.eq_ignore_ascii_case(v)));
            column.push(value.map(str::to_string));
        }
    }
    let columns: Vec<Column> = names
        .iter()
        .zip(cells)
        .map(|(name, values)| Column::new((*name).into(), values))
        .collect();
    Ok(DataFrame::new(columns)?)
}

fn create_writer(path: &Path) -> Result<Box<dyn Write>> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let out = BufWriter::new(file);
    Ok(match Codec::of(path) {
        Codec::Gzip => Box::new(GzEncoder::new(out, flate2::Compression::default())),
        _ => Box::new(out),
    })
}

/// Reads a square matrix whose first column holds the row labels and whose
/// header holds the same labels in the same order.
pub fn read_labeled_matrix(path: &Path) -> Result<LabeledMatrix> {
    let df = read_table_with(path, false)?;
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let (index_name, col_labels) = names.split_first().ok_or_else(|| {
        PhenoplierError::InvalidInput(format!("Empty matrix file {}", path.display()))
    })?;
    let row_labels: Vec<String> = df
        .column(index_name)?
        .str()?
        .into_iter()
        .map(|v| v.unwrap_or("").to_string())
        .collect();
    if row_labels != col_labels {
        return Err(PhenoplierError::InvalidInput(format!(
            "Row and column labels differ in matrix file {}",
            path.display()
        ))
        .into());
    }

    let n = row_labels.len();
    let mut data = Array2::<f64>::zeros((n, n));
    for (j, name) in col_labels.iter().enumerate() {
        let col = df.column(name)?.cast(&DataType::Float64)?;
        for (i, v) in col.f64()?.into_iter().enumerate() {
            data[(i, j)] = v.unwrap_or(f64::NAN);
        }
    }
    LabeledMatrix::new(row_labels, data)
}

pub fn write_labeled_matrix(matrix: &LabeledMatrix, path: &Path, dtype: MatrixDtype) -> Result<()> {
    let mut out = create_writer(path)?;
    write!(out, "{MATRIX_INDEX_COLUMN}")?;
    for label in matrix.labels() {
        write!(out, "\t{label}")?;
    }
    writeln!(out)?;
    for (label, row) in matrix.labels().iter().zip(matrix.data().rows()) {
        write!(out, "{label}")?;
        for v in row {
            write!(out, "\t{}", dtype.format_value(*v))?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// One value per line.
pub fn write_vector<T: std::fmt::Display>(values: &[T], path: &Path) -> Result<()> {
    let mut out = create_writer(path)?;
    for v in values {
        writeln!(out, "{v}")?;
    }
    out.flush()?;
    Ok(())
}

/// Non-empty trimmed lines of a list file.
pub fn read_string_vector(path: &Path) -> Result<Vec<String>> {
    let mut values = Vec::new();
    for line in open_input(path)?.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        let value = line.trim();
        if !value.is_empty() {
            values.push(value.to_string());
        }
    }
    Ok(values)
}

/// TSV with missing values written as `NA`.
pub fn write_dataframe(df: &DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut df = df.clone();
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b'\t')
        .with_null_value("NA".to_string())
        .finish(&mut df)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
