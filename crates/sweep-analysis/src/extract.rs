//! Structured artifacts written by successful jobs.
//!
//! The emission table is whitespace delimited with a header whose line
//! labels span several tokens (`#depth H  1 4861.32A O  3 5006.84A`). The
//! continuum table is tab delimited with a short fixed header.

use std::collections::BTreeMap;
use sweep_core::config::ContinuumConfig;
use thiserror::Error;

pub const DEPTH_COLUMN: &str = "depth";

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("artifact has no header line")]
    MissingHeader,
    #[error("artifact has no data rows")]
    NoRows,
    #[error("line {line}: expected {expected} values, found {found}")]
    ColumnCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: column {column}: not a number: {value}")]
    Value {
        line: usize,
        column: String,
        value: String,
    },
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn row_map(&self, row: usize) -> Option<BTreeMap<String, f64>> {
        let values = self.rows.get(row)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(values.iter().copied())
                .collect(),
        )
    }
}

/// Merges multi-token line labels. The first token names the depth column;
/// after that a label ends on a token containing a decimal point (its
/// wavelength), unless that token opens the label. Tokens left over at the
/// end form one last label.
pub fn regroup_emission_header(header: &str) -> Result<Vec<String>, ExtractError> {
    let mut tokens = header.split_whitespace();
    let first = tokens.next().ok_or(ExtractError::MissingHeader)?;
    let mut columns = vec![first.trim_start_matches('#').to_string()];
    let mut buffer: Vec<&str> = Vec::new();
    for token in tokens {
        if buffer.is_empty() {
            buffer.push(token);
        } else if token.contains('.') {
            buffer.push(token);
            columns.push(buffer.join("_"));
            buffer.clear();
        } else {
            buffer.push(token);
        }
    }
    if !buffer.is_empty() {
        columns.push(buffer.join("_"));
    }
    let mut seen = std::collections::BTreeSet::new();
    for c in &columns {
        if !seen.insert(c.as_str()) {
            return Err(ExtractError::DuplicateColumn(c.clone()));
        }
    }
    Ok(columns)
}

pub fn parse_emission_table(text: &str) -> Result<Table, ExtractError> {
    let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let (_, header) = lines.next().ok_or(ExtractError::MissingHeader)?;
    if !header.trim_start().starts_with('#') {
        return Err(ExtractError::MissingHeader);
    }
    let columns = regroup_emission_header(header)?;
    let mut rows = Vec::new();
    for (lineno, line) in lines {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != columns.len() {
            return Err(ExtractError::ColumnCount {
                line: lineno + 1,
                expected: columns.len(),
                found: tokens.len(),
            });
        }
        let row = tokens
            .iter()
            .zip(&columns)
            .map(|(t, c)| parse_value(t, c, lineno + 1))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(ExtractError::NoRows);
    }
    Ok(Table { columns, rows })
}

/// The row at maximum depth: the outermost zone, i.e. the emergent
/// emission. Ties keep the first such row; rows with a non-finite depth are
/// never selected.
pub fn emergent_row(table: &Table) -> Result<BTreeMap<String, f64>, ExtractError> {
    let depth = table.column_index(DEPTH_COLUMN).unwrap_or(0);
    let mut best: Option<(usize, f64)> = None;
    for (i, row) in table.rows.iter().enumerate() {
        let d = row[depth];
        if !d.is_finite() {
            continue;
        }
        match best {
            Some((_, b)) if d <= b => {}
            _ => best = Some((i, d)),
        }
    }
    let (index, _) = best.ok_or(ExtractError::NoRows)?;
    table.row_map(index).ok_or(ExtractError::NoRows)
}

/// Continuum table with configured renames applied and dropped columns
/// removed. Dropped columns may hold free text and are never parsed.
pub fn parse_continuum_table(text: &str, config: &ContinuumConfig) -> Result<Table, ExtractError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());
    let (_, header) = lines.next().ok_or(ExtractError::MissingHeader)?;
    if !header.trim_start().starts_with('#') {
        return Err(ExtractError::MissingHeader);
    }
    let raw_columns: Vec<&str> = header.trim_end_matches('\r').split('\t').collect();
    let kept: Vec<(usize, String)> = raw_columns
        .iter()
        .enumerate()
        .filter_map(|(i, raw)| config.column_name(raw).map(|name| (i, name)))
        .collect();
    let mut seen = std::collections::BTreeSet::new();
    for (_, name) in &kept {
        if !seen.insert(name.as_str()) {
            return Err(ExtractError::DuplicateColumn(name.clone()));
        }
    }
    let needed = kept.iter().map(|(i, _)| i + 1).max().unwrap_or(0);

    let mut rows = Vec::new();
    for (lineno, line) in lines {
        if line.trim_start().starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
        if fields.len() < needed {
            return Err(ExtractError::ColumnCount {
                line: lineno + 1,
                expected: raw_columns.len(),
                found: fields.len(),
            });
        }
        let row = kept
            .iter()
            .map(|(i, name)| parse_value(fields[*i], name, lineno + 1))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(ExtractError::NoRows);
    }
    Ok(Table {
        columns: kept.into_iter().map(|(_, name)| name).collect(),
        rows,
    })
}

fn parse_value(token: &str, column: &str, line: usize) -> Result<f64, ExtractError> {
    token.trim().parse::<f64>().map_err(|_| ExtractError::Value {
        line,
        column: column.to_string(),
        value: token.to_string(),
    })
}
