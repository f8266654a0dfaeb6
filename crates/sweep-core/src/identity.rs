//! Content-derived job identity.
//!
//! A job's ID is a digest of digests: every scalar of the parameter vector is
//! rendered to its decimal string and hashed on its own, the hex digests are
//! concatenated in vector order, and the concatenation is hashed once more.
//! IDs therefore depend only on the printed values, never on a job's folder
//! or row position.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// 128-bit digest; matches IDs of datasets produced by earlier tooling.
    #[default]
    Md5,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    fn hex_digest(self, bytes: &[u8]) -> String {
        match self {
            Self::Md5 => hex::encode(Md5::digest(bytes)),
            Self::Sha256 => hex::encode(Sha256::digest(bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashId(String);

impl HashId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn hash_vector(values: &[f64], algorithm: HashAlgorithm) -> HashId {
    hash_rendered(values.iter().map(|v| format_scalar(*v)), algorithm)
}

/// Same scheme for vectors stored in single precision. Each scalar is
/// rendered with the shortest digits that round-trip through `f32`.
pub fn hash_vector_f32(values: &[f32], algorithm: HashAlgorithm) -> HashId {
    hash_rendered(values.iter().map(|v| format_scalar_f32(*v)), algorithm)
}

fn hash_rendered(scalars: impl Iterator<Item = String>, algorithm: HashAlgorithm) -> HashId {
    let merged: String = scalars
        .map(|s| algorithm.hex_digest(s.as_bytes()))
        .collect();
    HashId(algorithm.hex_digest(merged.as_bytes()))
}

/// Renders a scalar as the shortest round-trip decimal string.
///
/// Fixed notation (always with a fractional part) is used while the decimal
/// exponent lies in `[-4, 16)`, scientific notation with a signed two-digit
/// exponent otherwise: `1.0`, `0.30103`, `1e-05`, `1.5e+16`.
pub fn format_scalar(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    render_scientific(&format!("{:e}", value))
}

/// `format_scalar` for single-precision values: `0.30103f32` renders as
/// `0.30103`, not as the digits of its widened `f64`.
pub fn format_scalar_f32(value: f32) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    render_scientific(&format!("{:e}", value))
}

/// Rewrites Rust's shortest `{:e}` output into the fixed/scientific layout.
fn render_scientific(sci: &str) -> String {
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci, 0),
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if (-4..16).contains(&exponent) {
        if exponent >= 0 {
            let point = exponent as usize + 1;
            let (int_part, frac_part) = if digits.len() > point {
                (digits[..point].to_string(), digits[point..].to_string())
            } else {
                (format!("{:0<width$}", digits, width = point), "0".to_string())
            };
            format!("{}{}.{}", sign, int_part, frac_part)
        } else {
            let zeros = "0".repeat((-exponent - 1) as usize);
            format!("{}0.{}{}", sign, zeros, digits)
        }
    } else {
        let (lead, rest) = digits.split_at(1);
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        if rest.is_empty() {
            format!("{}{}e{}{:02}", sign, lead, exp_sign, exponent.abs())
        } else {
            format!("{}{}.{}e{}{:02}", sign, lead, rest, exp_sign, exponent.abs())
        }
    }
}
