//! Canonical text form of a cell, shared by both sides of a comparison.
//!
//! Both stores are read into [`Cell`]s and rendered here with the column's
//! target type, so a value written by the migrator produces the same string
//! whichever side it was read from.

use md5::{Digest, Md5};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::core::schema::TargetType;
use crate::core::{flag, temporal};

use super::scanner::Cell;

/// Rendering of SQL NULL.
pub const NULL_SENTINEL: &str = "\\N";

/// Separator between values of one row.
pub const DELIMITER: &str = "|";

/// Render one cell.
pub fn normalize(cell: &Cell, kind: TargetType) -> String {
    match cell {
        Cell::Null => NULL_SENTINEL.to_string(),
        other => escape(&render(other, kind)),
    }
}

fn render(cell: &Cell, kind: TargetType) -> String {
    match kind {
        TargetType::Boolean => truthy(cell).to_string(),
        TargetType::Integer => integer(cell)
            .map(|v| v.to_string())
            .unwrap_or_else(|| literal(cell)),
        TargetType::Double => double(cell).map(shortest).unwrap_or_else(|| literal(cell)),
        TargetType::Numeric => decimal(cell).map(two_places).unwrap_or_else(|| literal(cell)),
        TargetType::Date => match cell {
            Cell::Text(s) => temporal::parse_date(s).map(|d| temporal::format_date(&d)),
            Cell::Integer(v) => temporal::from_unix_seconds(*v).map(|t| temporal::format_date(&t.date())),
            Cell::Real(v) => temporal::from_julian_day(*v).map(|t| temporal::format_date(&t.date())),
            _ => None,
        }
        .unwrap_or_else(|| literal(cell)),
        TargetType::Timestamp => match cell {
            Cell::Text(s) => temporal::parse_timestamp(s),
            Cell::Integer(v) => temporal::from_unix_seconds(*v),
            Cell::Real(v) => temporal::from_julian_day(*v),
            _ => None,
        }
        .map(|t| temporal::format_timestamp(&t))
        .unwrap_or_else(|| literal(cell)),
        TargetType::Json => match cell {
            Cell::Text(s) => serde_json::from_str::<serde_json::Value>(s)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| s.clone()),
            other => literal(other),
        },
        TargetType::Bytes => match cell {
            Cell::Bytes(b) => hex::encode(b),
            Cell::Text(s) => hex::encode(s.as_bytes()),
            other => hex::encode(literal(other).as_bytes()),
        },
        TargetType::Text => literal(cell),
    }
}

/// Shares its word set with the migrator's coercion, so a stored flag reads
/// back the same on both sides.
fn truthy(cell: &Cell) -> bool {
    let flag = match cell {
        Cell::Null => None,
        Cell::Integer(v) => flag::from_integer(*v),
        Cell::Real(v) => flag::from_real(*v),
        Cell::Text(s) => flag::from_text(s),
        Cell::Bytes(b) => std::str::from_utf8(b).ok().and_then(flag::from_text),
    };
    flag == Some(true)
}

fn integer(cell: &Cell) -> Option<i64> {
    match cell {
        Cell::Integer(v) => Some(*v),
        Cell::Real(v) if v.fract() == 0.0 => Decimal::from_f64(*v).and_then(|d| d.to_i64()),
        Cell::Text(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<Decimal>()
                    .ok()
                    .filter(|d| d.fract().is_zero())
                    .and_then(|d| d.to_i64())
            })
        }
        _ => None,
    }
}

fn double(cell: &Cell) -> Option<f64> {
    match cell {
        Cell::Integer(v) => Some(*v as f64),
        Cell::Real(v) => Some(*v),
        Cell::Text(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Shortest round-trip form in scientific notation, so both engines' text
/// renderings of one `f64` agree.
fn shortest(v: f64) -> String {
    if v == 0.0 {
        return "0e0".to_string();
    }
    format!("{:e}", v)
}

fn decimal(cell: &Cell) -> Option<Decimal> {
    match cell {
        Cell::Integer(v) => Some(Decimal::from(*v)),
        Cell::Real(v) => Decimal::from_f64(*v),
        Cell::Text(s) => {
            let s = s.trim();
            s.parse::<Decimal>()
                .ok()
                .or_else(|| Decimal::from_scientific(s).ok())
                .or_else(|| s.parse::<f64>().ok().and_then(Decimal::from_f64))
        }
        _ => None,
    }
}

fn two_places(d: Decimal) -> String {
    let rounded = d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.2}", rounded)
}

/// Plain string conversion, matching how the migrator renders into text
/// columns.
fn literal(cell: &Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Integer(v) => v.to_string(),
        Cell::Real(v) => v.to_string(),
        Cell::Text(s) => s.clone(),
        Cell::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => s.to_string(),
            Err(_) => format!("\\x{}", hex::encode(b)),
        },
    }
}

fn escape(value: &str) -> String {
    if !value.contains(['\\', '|']) {
        return value.to_string();
    }
    value.replace('\\', "\\\\").replace('|', "\\|")
}

/// MD5 of one normalised row, as lowercase hex.
pub fn row_digest(values: &[String]) -> String {
    hex::encode(Md5::digest(values.join(DELIMITER).as_bytes()))
}

/// Order-sensitive fold of row digests.
#[derive(Default)]
pub struct FoldedDigest {
    hasher: Md5,
    rows: u64,
}

impl FoldedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalise a row and fold its digest in.
    pub fn push_row(&mut self, cells: &[Cell], kinds: &[TargetType]) {
        let values: Vec<String> = cells
            .iter()
            .zip(kinds)
            .map(|(cell, kind)| normalize(cell, *kind))
            .collect();
        self.hasher.update(row_digest(&values).as_bytes());
        self.rows += 1;
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}
