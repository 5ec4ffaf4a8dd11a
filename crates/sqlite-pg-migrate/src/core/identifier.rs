//! Identifier validation and quoting.
//!
//! Table, column and schema names cannot be bound as statement parameters, so
//! every identifier that reaches dynamic SQL goes through this module. Names
//! are validated (non-empty, no null bytes, bounded length) and then quoted
//! with the engine's quoting rules.

use crate::error::{MigrateError, Result};

/// PostgreSQL truncates identifiers longer than 63 bytes.
const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Validate an identifier for security issues.
///
/// # Errors
///
/// Returns `MigrateError::Config` for empty, oversized or null-byte names.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// ```ignore
/// assert_eq!(quote_pg("users")?, "\"users\"");
/// assert_eq!(quote_pg("table\"name")?, "\"table\"\"name\"");
/// ```
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(quote_unchecked(name))
}

/// Qualify a PostgreSQL table name with its schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Quote a SQLite identifier.
///
/// SQLite accepts the same double-quote syntax. Source names are not length
/// checked since SQLite places no limit on them.
pub fn quote_sqlite(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "Invalid SQLite identifier: {:?}",
            name
        )));
    }
    Ok(quote_unchecked(name))
}

fn quote_unchecked(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_normal() {
        assert!(validate_identifier("order_items").is_ok());
        assert!(validate_identifier("Users2").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_null_byte() {
        assert!(validate_identifier("users\0; DROP TABLE x").is_err());
    }

    #[test]
    fn test_validate_identifier_rejects_too_long() {
        let name = "a".repeat(64);
        assert!(validate_identifier(&name).is_err());
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn test_quote_pg_escapes_double_quote() {
        assert_eq!(quote_pg("users").unwrap(), "\"users\"");
        assert_eq!(quote_pg("ta\"ble").unwrap(), "\"ta\"\"ble\"");
    }

    #[test]
    fn test_quote_pg_sql_injection_safely_quoted() {
        let quoted = quote_pg("x\"; DROP TABLE users; --").unwrap();
        assert_eq!(quoted, "\"x\"\"; DROP TABLE users; --\"");
    }

    #[test]
    fn test_qualify_pg() {
        assert_eq!(
            qualify_pg("public", "orders").unwrap(),
            "\"public\".\"orders\""
        );
    }

    #[test]
    fn test_quote_sqlite_allows_long_names() {
        let name = "b".repeat(100);
        assert!(quote_sqlite(&name).is_ok());
        assert!(quote_sqlite("").is_err());
    }
}
