//! Type mapping between SQLite and PostgreSQL.

use crate::core::schema::TargetType;

/// Declared-type prefixes and the storage class they map to.
const SQLITE_PREFIXES: &[(&str, TargetType)] = &[
    ("UNSIGNED BIG INT", TargetType::Integer),
    ("MEDIUMINT", TargetType::Integer),
    ("SMALLINT", TargetType::Integer),
    ("TINYINT", TargetType::Integer),
    ("INTEGER", TargetType::Integer),
    ("BIGINT", TargetType::Integer),
    ("INT2", TargetType::Integer),
    ("INT8", TargetType::Integer),
    ("INT", TargetType::Integer),
    ("DOUBLE PRECISION", TargetType::Double),
    ("DOUBLE", TargetType::Double),
    ("FLOAT", TargetType::Double),
    ("REAL", TargetType::Double),
    ("NUMERIC", TargetType::Numeric),
    ("DECIMAL", TargetType::Numeric),
    ("BOOLEAN", TargetType::Boolean),
    ("BOOL", TargetType::Boolean),
    ("DATETIME", TargetType::Timestamp),
    ("TIMESTAMP", TargetType::Timestamp),
    ("DATE", TargetType::Date),
    ("NVARCHAR", TargetType::Text),
    ("VARCHAR", TargetType::Text),
    ("NCHAR", TargetType::Text),
    ("CHAR", TargetType::Text),
    ("CLOB", TargetType::Text),
    ("TEXT", TargetType::Text),
    ("STRING", TargetType::Text),
    ("BLOB", TargetType::Bytes),
    ("JSON", TargetType::Json),
];

/// Normalize a declared SQLite type: upper-case, drop any parenthesised
/// length or precision, collapse whitespace.
pub fn normalize_type_name(declared: &str) -> String {
    let base = match declared.find('(') {
        Some(idx) => &declared[..idx],
        None => declared,
    };
    base.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Map a declared SQLite column type to a PostgreSQL storage class.
///
/// Total and deterministic: the longest matching prefix wins (`DATETIME`
/// over `DATE`, `INTEGER` over `INT`) and anything unrecognized, including
/// the empty declaration SQLite allows, falls back to `Text`.
pub fn sqlite_to_target(declared: &str) -> TargetType {
    let name = normalize_type_name(declared);
    SQLITE_PREFIXES
        .iter()
        .filter(|(prefix, _)| name.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, target)| *target)
        .unwrap_or(TargetType::Text)
}

/// Map a PostgreSQL `information_schema` data type to a storage class.
pub fn pg_to_target(data_type: &str) -> TargetType {
    match data_type.to_lowercase().as_str() {
        "smallint" | "integer" | "bigint" => TargetType::Integer,
        "real" | "double precision" => TargetType::Double,
        "numeric" | "decimal" | "money" => TargetType::Numeric,
        "boolean" => TargetType::Boolean,
        "date" => TargetType::Date,
        "timestamp without time zone" | "timestamp with time zone" => TargetType::Timestamp,
        "bytea" => TargetType::Bytes,
        "json" | "jsonb" => TargetType::Json,
        _ => TargetType::Text,
    }
}
