//! Parses Kubernetes resource quantities (`500m`, `4Gi`, `1.5`, `2e3`) into
//! exact decimals.

use bigdecimal::{BigDecimal, Zero};
use std::str::FromStr;
use thiserror::Error;

/// Bytes in one mebibyte.
pub const MIB: u64 = 1 << 20;

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(&str, i32); 10] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct QuantityError(pub String);

pub fn parse(q: &str) -> Result<BigDecimal, QuantityError> {
    let invalid = || QuantityError(q.to_string());

    let s = q.trim();
    let split = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '+' || c == '-'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if !number.chars().any(|c| c.is_ascii_digit()) || number.matches('.').count() > 1 {
        return Err(invalid());
    }
    let number = number.strip_prefix('+').unwrap_or(number);

    if let Some((_, shift)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        let base = BigDecimal::from_str(number).map_err(|_| invalid())?;
        return Ok(base * BigDecimal::from(1u64 << shift));
    }

    let exp = match DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        Some((_, exp)) => *exp,
        None => parse_exponent(suffix).ok_or_else(invalid)?,
    };
    BigDecimal::from_str(&format!("{number}e{exp}")).map_err(|_| invalid())
}

/// Parses a `k8s_openapi` quantity, treating a missing value as zero.
pub fn parse_or_zero(
    q: Option<&k8s_openapi::apimachinery::pkg::api::resource::Quantity>,
) -> Result<BigDecimal, QuantityError> {
    match q {
        Some(q) => parse(&q.0),
        None => Ok(BigDecimal::zero()),
    }
}

fn parse_exponent(suffix: &str) -> Option<i32> {
    let digits = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Renders a byte count with the largest binary suffix that divides it
/// exactly, e.g. `4Gi`, `4264Mi` or `1000`.
pub fn format_binary(bytes: &BigDecimal) -> String {
    for (sfx, shift) in BINARY_SUFFIXES.iter().rev() {
        let unit = BigDecimal::from(1u64 << shift);
        let units = bytes / &unit;
        if !units.is_zero() && units.is_integer() {
            return format!("{}{}", units.with_scale(0), sfx);
        }
    }
    if bytes.is_integer() {
        return bytes.with_scale(0).to_string();
    }
    bytes.to_string()
}
