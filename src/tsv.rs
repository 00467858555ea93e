// tsv.rs
//
// Tab-separated table helpers shared by every loader and writer.

use crate::error::{BenchError, Result};
use ndarray::Array2;
use std::path::Path;

/// Headed table of raw string cells, row-major.
#[derive(Debug, Clone)]
pub struct StringTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl StringTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Parses one cell. Empty cells and the usual missing-value markers are NaN.
pub fn parse_cell(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    match trimmed {
        "" | "n/a" | "NA" | "NaN" | "nan" => Some(f64::NAN),
        _ => trimmed.parse::<f64>().ok(),
    }
}

pub fn format_cell(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn tsv_reader(path: &Path, has_headers: bool) -> Result<csv::Reader<std::fs::File>> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_headers)
        .flexible(false)
        .from_path(path)?)
}

pub fn read_string_table(path: &Path) -> Result<StringTable> {
    let mut reader = tsv_reader(path, true)?;
    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(StringTable { headers, rows })
}

/// Reads a headed numeric table into column vectors.
/// Returns `(column names, columns, row count)`.
pub fn read_numeric_columns(path: &Path) -> Result<(Vec<String>, Vec<Vec<f64>>, usize)> {
    let table = read_string_table(path)?;
    let mut columns = vec![Vec::with_capacity(table.rows.len()); table.headers.len()];
    for (row_idx, row) in table.rows.iter().enumerate() {
        for (col_idx, cell) in row.iter().enumerate() {
            let value = parse_cell(cell).ok_or_else(|| BenchError::MalformedTable {
                path: path.to_path_buf(),
                reason: format!(
                    "non-numeric value '{}' in column '{}' at row {}",
                    cell,
                    table.headers[col_idx],
                    row_idx + 1
                ),
            })?;
            columns[col_idx].push(value);
        }
    }
    let n_rows = table.rows.len();
    Ok((table.headers, columns, n_rows))
}

/// Reads a headerless numeric matrix (rows x columns).
pub fn read_headerless_matrix(path: &Path) -> Result<Array2<f64>> {
    let mut reader = tsv_reader(path, false)?;
    let mut values = Vec::new();
    let mut n_cols = 0usize;
    let mut n_rows = 0usize;
    for record in reader.records() {
        let record = record?;
        if n_rows == 0 {
            n_cols = record.len();
        }
        for cell in record.iter() {
            values.push(parse_cell(cell).ok_or_else(|| BenchError::MalformedTable {
                path: path.to_path_buf(),
                reason: format!("non-numeric value '{}' at row {}", cell, n_rows + 1),
            })?);
        }
        n_rows += 1;
    }
    Array2::from_shape_vec((n_rows, n_cols), values).map_err(|e| BenchError::MalformedTable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

pub fn tsv_writer<W: std::io::Write>(inner: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_writer(inner)
}
