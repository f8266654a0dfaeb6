//! Parameter matrix: one row per job, in index order.
//!
//! Reads NumPy `.npy` files (float64/float32, C or Fortran order) and plain
//! text matrices (whitespace or comma separated, `#` comments).

use crate::identity::{hash_vector, hash_vector_f32, HashAlgorithm, HashId};
use std::fs;
use std::path::Path;
use thiserror::Error;

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("failed to read parameter matrix {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid npy file: {0}")]
    Npy(String),
    #[error("line {line}: {message}")]
    Text { line: usize, message: String },
    #[error("row {row} has {found} columns, expected {expected}")]
    Ragged {
        row: usize,
        found: usize,
        expected: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterMatrix {
    width: usize,
    rows: Vec<Vec<f64>>,
    /// Values were stored as `f32`; IDs are computed from their `f32` digits.
    single_precision: bool,
}

impl ParameterMatrix {
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, MatrixError> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        for (row, values) in rows.iter().enumerate() {
            if values.len() != width {
                return Err(MatrixError::Ragged {
                    row,
                    found: values.len(),
                    expected: width,
                });
            }
        }
        Ok(Self {
            width,
            rows,
            single_precision: false,
        })
    }

    pub fn load(path: &Path) -> Result<Self, MatrixError> {
        let bytes = fs::read(path).map_err(|e| MatrixError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if bytes.starts_with(NPY_MAGIC) {
            parse_npy(&bytes)
        } else {
            let text = String::from_utf8(bytes).map_err(|e| MatrixError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            parse_text(&text)
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(|r| r.as_slice())
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        self.rows.iter().map(|r| r.as_slice())
    }

    pub fn is_single_precision(&self) -> bool {
        self.single_precision
    }

    /// Hash ID of every row, in row order.
    pub fn hash_ids(&self, algorithm: HashAlgorithm) -> Vec<HashId> {
        self.rows
            .iter()
            .map(|r| {
                if self.single_precision {
                    // Narrowing is exact: these values were widened from f32.
                    let narrow: Vec<f32> = r.iter().map(|v| *v as f32).collect();
                    hash_vector_f32(&narrow, algorithm)
                } else {
                    hash_vector(r, algorithm)
                }
            })
            .collect()
    }
}

fn parse_text(text: &str) -> Result<ParameterMatrix, MatrixError> {
    let mut rows = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<f64>().map_err(|_| MatrixError::Text {
                    line: lineno + 1,
                    message: format!("not a number: {}", t),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(row);
    }
    ParameterMatrix::from_rows(rows)
}

fn parse_npy(bytes: &[u8]) -> Result<ParameterMatrix, MatrixError> {
    if bytes.len() < 10 {
        return Err(MatrixError::Npy("truncated preamble".to_string()));
    }
    let major = bytes[6];
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(MatrixError::Npy("truncated preamble".to_string()));
            }
            (
                u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
                12,
            )
        }
        v => return Err(MatrixError::Npy(format!("unsupported version {}", v))),
    };
    let data_start = header_start + header_len;
    if bytes.len() < data_start {
        return Err(MatrixError::Npy("truncated header".to_string()));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_start])
        .map_err(|_| MatrixError::Npy("header is not text".to_string()))?;

    let descr = header_value(header, "descr")
        .map(|v| v.trim_matches(|c| c == '\'' || c == '"').to_string())
        .ok_or_else(|| MatrixError::Npy("missing descr".to_string()))?;
    let fortran = header_value(header, "fortran_order")
        .map(|v| v.starts_with("True"))
        .unwrap_or(false);
    let shape = parse_shape(header)?;

    let (big_endian, size) = match descr.as_str() {
        "<f8" | "=f8" => (false, 8),
        ">f8" => (true, 8),
        "<f4" | "=f4" => (false, 4),
        ">f4" => (true, 4),
        other => return Err(MatrixError::Npy(format!("unsupported dtype {}", other))),
    };
    let (n_rows, n_cols) = match shape.as_slice() {
        [n] => (*n, 1),
        [n, m] => (*n, *m),
        _ => return Err(MatrixError::Npy(format!("expected 1-D or 2-D shape, got {:?}", shape))),
    };

    let data = &bytes[data_start..];
    let count = n_rows * n_cols;
    if data.len() < count * size {
        return Err(MatrixError::Npy(format!(
            "expected {} values, found {} bytes of data",
            count,
            data.len()
        )));
    }
    let flat: Vec<f64> = data[..count * size]
        .chunks_exact(size)
        .map(|chunk| match (size, big_endian) {
            (8, false) => f64::from_le_bytes(chunk.try_into().unwrap_or([0; 8])),
            (8, true) => f64::from_be_bytes(chunk.try_into().unwrap_or([0; 8])),
            (_, false) => f32::from_le_bytes(chunk.try_into().unwrap_or([0; 4])) as f64,
            (_, true) => f32::from_be_bytes(chunk.try_into().unwrap_or([0; 4])) as f64,
        })
        .collect();

    let rows = (0..n_rows)
        .map(|r| {
            (0..n_cols)
                .map(|c| {
                    if fortran {
                        flat[c * n_rows + r]
                    } else {
                        flat[r * n_cols + c]
                    }
                })
                .collect()
        })
        .collect();
    let mut matrix = ParameterMatrix::from_rows(rows)?;
    matrix.single_precision = size == 4;
    Ok(matrix)
}

/// Raw text following `'key':` in a npy header dict, up to the next comma
/// outside parentheses.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{}':", key);
    let start = header.find(&needle)? + needle.len();
    let rest = header[start..].trim_start();
    let mut depth = 0usize;
    for (i, c) in rest.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' | '}' if depth == 0 => return Some(rest[..i].trim()),
            _ => {}
        }
    }
    Some(rest.trim())
}

fn parse_shape(header: &str) -> Result<Vec<usize>, MatrixError> {
    let raw = header_value(header, "shape").ok_or_else(|| MatrixError::Npy("missing shape".to_string()))?;
    raw.trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.trim_end_matches('L')
                .parse::<usize>()
                .map_err(|_| MatrixError::Npy(format!("bad shape entry {}", t)))
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn encode_npy_f64(rows: &[Vec<f64>]) -> Vec<u8> {
    let n = rows.len();
    let m = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}), }}",
        n, m
    );
    while (10 + header.len() + 1) % 64 != 0 {
        header.push(' ');
    }
    header.push('\n');
    let mut out = Vec::new();
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for row in rows {
        for v in row {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}
