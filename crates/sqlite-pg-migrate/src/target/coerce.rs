//! Storage-format coercion of source values to PostgreSQL parameter types.
//!
//! Only representation changes happen here (integer flags to booleans, text
//! timestamps to timestamps, widening between numeric classes). Values are
//! never rewritten for business reasons.

use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tokio_postgres::types::Type;
use uuid::Uuid;

use crate::core::{flag, temporal};
use crate::core::value::SqlValue;

/// Coerce a value into the exact variant expected for `ty`.
///
/// # Errors
///
/// Returns a message describing the value and the target type when no
/// lossless conversion exists.
pub fn coerce(value: &SqlValue, ty: &Type) -> std::result::Result<SqlValue, String> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }

    let coerced = match *ty {
        Type::BOOL => to_bool(value).map(SqlValue::Bool),
        Type::INT2 => to_i64(value)
            .and_then(|v| i16::try_from(v).ok())
            .map(SqlValue::I16),
        Type::INT4 => to_i64(value)
            .and_then(|v| i32::try_from(v).ok())
            .map(SqlValue::I32),
        Type::INT8 => to_i64(value).map(SqlValue::I64),
        Type::FLOAT4 => to_f64(value).map(|v| SqlValue::F32(v as f32)),
        Type::FLOAT8 => to_f64(value).map(SqlValue::F64),
        Type::NUMERIC => to_decimal(value).map(SqlValue::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Some(SqlValue::Text(to_text(value)))
        }
        Type::BYTEA => match value {
            SqlValue::Bytes(b) => Some(SqlValue::Bytes(b.clone())),
            SqlValue::Text(s) => Some(SqlValue::Bytes(s.as_bytes().to_vec())),
            _ => None,
        },
        Type::DATE => match value {
            SqlValue::Text(s) => temporal::parse_date(s),
            SqlValue::I64(v) => temporal::from_unix_seconds(*v).map(|dt| dt.date()),
            SqlValue::F64(v) => temporal::from_julian_day(*v).map(|dt| dt.date()),
            SqlValue::Date(d) => Some(*d),
            SqlValue::Timestamp(ts) => Some(ts.date()),
            _ => None,
        }
        .map(SqlValue::Date),
        Type::TIME => match value {
            SqlValue::Text(s) => temporal::parse_time(s),
            SqlValue::Time(t) => Some(*t),
            _ => None,
        }
        .map(SqlValue::Time),
        Type::TIMESTAMP => to_timestamp(value).map(SqlValue::Timestamp),
        Type::TIMESTAMPTZ => match value {
            SqlValue::Text(s) => temporal::parse_instant(s),
            SqlValue::TimestampTz(ts) => Some(*ts),
            other => to_timestamp(other).map(|n| n.and_utc()),
        }
        .map(SqlValue::TimestampTz),
        Type::JSON | Type::JSONB => match value {
            SqlValue::Text(s) => serde_json::from_str(s).ok(),
            SqlValue::I64(v) => Some(serde_json::Value::from(*v)),
            SqlValue::F64(v) => Some(serde_json::Value::from(*v)),
            SqlValue::Bool(v) => Some(serde_json::Value::from(*v)),
            SqlValue::Json(v) => Some(v.clone()),
            _ => None,
        }
        .map(SqlValue::Json),
        Type::UUID => match value {
            SqlValue::Text(s) => Uuid::parse_str(s.trim()).ok(),
            SqlValue::Bytes(b) => Uuid::from_slice(b).ok(),
            SqlValue::Uuid(u) => Some(*u),
            _ => None,
        }
        .map(SqlValue::Uuid),
        _ => {
            return Err(format!("unsupported target type {}", ty.name()));
        }
    };

    coerced.ok_or_else(|| {
        format!(
            "cannot store {} value {} in a {} column",
            value.kind(),
            preview(value),
            ty.name()
        )
    })
}

/// Interpret a flag value. Numbers must be exactly 0 or 1.
fn to_bool(value: &SqlValue) -> Option<bool> {
    match value {
        SqlValue::Bool(b) => Some(*b),
        SqlValue::I64(v) => flag::from_integer(*v),
        SqlValue::I32(v) => flag::from_integer(i64::from(*v)),
        SqlValue::I16(v) => flag::from_integer(i64::from(*v)),
        SqlValue::F64(v) => flag::from_real(*v),
        SqlValue::Text(s) => flag::from_text(s),
        _ => None,
    }
}

fn to_i64(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::I64(v) => Some(*v),
        SqlValue::I32(v) => Some(i64::from(*v)),
        SqlValue::I16(v) => Some(i64::from(*v)),
        SqlValue::Bool(b) => Some(i64::from(*b)),
        SqlValue::F64(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
        SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
        SqlValue::Text(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn to_f64(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::F64(v) => Some(*v),
        SqlValue::F32(v) => Some(f64::from(*v)),
        SqlValue::I64(v) => Some(*v as f64),
        SqlValue::I32(v) => Some(f64::from(*v)),
        SqlValue::I16(v) => Some(f64::from(*v)),
        SqlValue::Decimal(d) => d.to_f64(),
        SqlValue::Text(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn to_decimal(value: &SqlValue) -> Option<Decimal> {
    match value {
        SqlValue::Decimal(d) => Some(*d),
        SqlValue::I64(v) => Some(Decimal::from(*v)),
        SqlValue::I32(v) => Some(Decimal::from(*v)),
        SqlValue::I16(v) => Some(Decimal::from(*v)),
        SqlValue::F64(v) => Decimal::from_f64(*v),
        SqlValue::F32(v) => Decimal::from_f32(*v),
        SqlValue::Text(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .ok()
                .or_else(|| Decimal::from_scientific(s).ok())
        }
        _ => None,
    }
}

fn to_timestamp(value: &SqlValue) -> Option<chrono::NaiveDateTime> {
    match value {
        SqlValue::Text(s) => temporal::parse_timestamp(s),
        SqlValue::I64(v) => temporal::from_unix_seconds(*v),
        SqlValue::F64(v) => temporal::from_julian_day(*v),
        SqlValue::Timestamp(ts) => Some(*ts),
        SqlValue::TimestampTz(ts) => Some(ts.naive_utc()),
        SqlValue::Date(d) => d.and_hms_opt(0, 0, 0),
        _ => None,
    }
}

/// Text rendering used when the target column is textual.
fn to_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => String::new(),
        SqlValue::Bool(v) => v.to_string(),
        SqlValue::I16(v) => v.to_string(),
        SqlValue::I32(v) => v.to_string(),
        SqlValue::I64(v) => v.to_string(),
        SqlValue::F32(v) => v.to_string(),
        SqlValue::F64(v) => v.to_string(),
        SqlValue::Decimal(v) => v.to_string(),
        SqlValue::Text(v) => v.clone(),
        SqlValue::Bytes(v) => match std::str::from_utf8(v) {
            Ok(s) => s.to_string(),
            Err(_) => format!("\\x{}", hex::encode(v)),
        },
        SqlValue::Uuid(v) => v.to_string(),
        SqlValue::Date(v) => temporal::format_date(v),
        SqlValue::Time(v) => v.to_string(),
        SqlValue::Timestamp(v) => temporal::format_timestamp(v),
        SqlValue::TimestampTz(v) => v.to_rfc3339(),
        SqlValue::Json(v) => v.to_string(),
    }
}

fn preview(value: &SqlValue) -> String {
    let text = to_text(value);
    if text.chars().count() > 40 {
        format!("{:?}...", text.chars().take(40).collect::<String>())
    } else {
        format!("{:?}", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_integer_flags_become_booleans() {
        assert_eq!(coerce(&SqlValue::I64(1), &Type::BOOL), Ok(SqlValue::Bool(true)));
        assert_eq!(coerce(&SqlValue::I64(0), &Type::BOOL), Ok(SqlValue::Bool(false)));
        assert_eq!(
            coerce(&SqlValue::Text("Yes".into()), &Type::BOOL),
            Ok(SqlValue::Bool(true))
        );
        assert!(coerce(&SqlValue::Text("maybe".into()), &Type::BOOL).is_err());
        assert!(coerce(&SqlValue::Text("on".into()), &Type::BOOL).is_err());
        assert!(coerce(&SqlValue::I64(2), &Type::BOOL).is_err());
        assert!(coerce(&SqlValue::F64(0.5), &Type::BOOL).is_err());
    }

    #[test]
    fn test_integer_narrowing_checks_range() {
        assert_eq!(coerce(&SqlValue::I64(42), &Type::INT4), Ok(SqlValue::I32(42)));
        assert!(coerce(&SqlValue::I64(i64::MAX), &Type::INT4).is_err());
        assert_eq!(coerce(&SqlValue::Text(" 7 ".into()), &Type::INT8), Ok(SqlValue::I64(7)));
        assert!(coerce(&SqlValue::F64(2.5), &Type::INT8).is_err());
        assert_eq!(coerce(&SqlValue::F64(3.0), &Type::INT8), Ok(SqlValue::I64(3)));
    }

    #[test]
    fn test_numeric_widening() {
        assert_eq!(
            coerce(&SqlValue::F64(19.99), &Type::NUMERIC),
            Ok(SqlValue::Decimal(Decimal::from_str("19.99").unwrap()))
        );
        assert_eq!(coerce(&SqlValue::I64(5), &Type::FLOAT8), Ok(SqlValue::F64(5.0)));
        assert_eq!(
            coerce(&SqlValue::Text("12.50".into()), &Type::NUMERIC),
            Ok(SqlValue::Decimal(Decimal::from_str("12.50").unwrap()))
        );
    }

    #[test]
    fn test_text_timestamps() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(
            coerce(&SqlValue::Text("2024-01-02 03:04:05".into()), &Type::TIMESTAMP),
            Ok(SqlValue::Timestamp(expected))
        );
        assert_eq!(
            coerce(&SqlValue::Text("2024-01-02 03:04:05".into()), &Type::TIMESTAMPTZ),
            Ok(SqlValue::TimestampTz(expected.and_utc()))
        );
        assert_eq!(
            coerce(&SqlValue::Text("2024-01-02".into()), &Type::DATE),
            Ok(SqlValue::Date(expected.date()))
        );
    }

    #[test]
    fn test_anything_to_text() {
        assert_eq!(coerce(&SqlValue::I64(9), &Type::TEXT), Ok(SqlValue::Text("9".into())));
        assert_eq!(
            coerce(&SqlValue::Bytes(vec![0xff, 0x00]), &Type::TEXT),
            Ok(SqlValue::Text("\\xff00".into()))
        );
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(coerce(&SqlValue::Null, &Type::INT4), Ok(SqlValue::Null));
        assert_eq!(coerce(&SqlValue::Null, &Type::POINT), Ok(SqlValue::Null));
    }

    #[test]
    fn test_json_and_bytes() {
        assert_eq!(
            coerce(&SqlValue::Text("{\"a\":1}".into()), &Type::JSONB),
            Ok(SqlValue::Json(serde_json::json!({"a": 1})))
        );
        assert!(coerce(&SqlValue::Text("{broken".into()), &Type::JSONB).is_err());
        assert_eq!(
            coerce(&SqlValue::Bytes(vec![1, 2]), &Type::BYTEA),
            Ok(SqlValue::Bytes(vec![1, 2]))
        );
    }

    #[test]
    fn test_unsupported_type() {
        assert!(coerce(&SqlValue::Text("(1,2)".into()), &Type::POINT).is_err());
    }
}
