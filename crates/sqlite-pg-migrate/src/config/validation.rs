//! Configuration validation.

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if let Some(path) = &config.source.path {
        if path.as_os_str().is_empty() {
            return Err(MigrateError::Config("source.path cannot be empty".into()));
        }
    }

    if let Some(dsn) = &config.target.dsn {
        if dsn.trim().is_empty() {
            return Err(MigrateError::Config("target.dsn cannot be empty".into()));
        }
    }
    validate_identifier(&config.target.schema)?;

    if let Some(admin) = &config.admin {
        if admin.dsn.trim().is_empty() {
            return Err(MigrateError::Config("admin.dsn is required".into()));
        }
        validate_identifier(&admin.database)?;
        if let Some(owner) = &admin.owner {
            validate_identifier(owner)?;
        }
    }

    if config.migration.workers == 0 {
        return Err(MigrateError::Config(
            "migration.workers must be at least 1".into(),
        ));
    }
    if config.migration.batch_size == 0 {
        return Err(MigrateError::Config(
            "migration.batch_size must be at least 1".into(),
        ));
    }
    if let Some(0) = config.target.max_connections {
        return Err(MigrateError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }

    for rule in &config.migration.consolidation {
        validate_identifier(&rule.table)?;
        validate_identifier(&rule.pk_column)?;
        validate_identifier(&rule.unique_index)?;
        if rule.key_columns.is_empty() {
            return Err(MigrateError::Config(format!(
                "consolidation rule for {} needs at least one key column",
                rule.table
            )));
        }
        for col in rule
            .key_columns
            .iter()
            .chain(rule.quantity_column.iter())
            .chain(rule.price_column.iter())
            .chain(rule.total_column.iter())
        {
            validate_identifier(col)?;
        }
        if rule.total_column.is_some()
            && (rule.quantity_column.is_none() || rule.price_column.is_none())
        {
            return Err(MigrateError::Config(format!(
                "consolidation rule for {}: total_column requires quantity_column and price_column",
                rule.table
            )));
        }
    }

    Ok(())
}
