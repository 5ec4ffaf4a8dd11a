//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::redact_dsn;

/// Root configuration structure.
///
/// Every section has defaults so the CLI can run without a config file and
/// fill the connection details from its positional arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Source database configuration (SQLite file).
    #[serde(default)]
    pub source: SourceConfig,

    /// Target database configuration (PostgreSQL).
    #[serde(default)]
    pub target: TargetConfig,

    /// Administrative connection used to create the target database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminConfig>,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Where timestamped artifacts are written.
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
}

/// Source database (SQLite) configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Path to the SQLite database file.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Connection string, key/value (`host=... dbname=...`) or URL form.
    #[serde(default)]
    pub dsn: Option<String>,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Maximum PostgreSQL connections. Derived from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            schema: default_public_schema(),
            max_connections: None,
        }
    }
}

impl fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConfig")
            .field("dsn", &self.dsn.as_deref().map(redact_dsn))
            .field("schema", &self.schema)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Administrative connection for database provisioning.
#[derive(Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Connection string to a maintenance database (usually `postgres`).
    pub dsn: String,

    /// Name of the database to ensure.
    pub database: String,

    /// Owner role for a newly created database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl fmt::Debug for AdminConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminConfig")
            .field("dsn", &redact_dsn(&self.dsn))
            .field("database", &self.database)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Transaction boundary used while copying rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    /// One transaction per table.
    #[default]
    Table,
    /// One transaction per batch.
    Batch,
}

impl std::str::FromStr for TransactionScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(TransactionScope::Table),
            "batch" => Ok(TransactionScope::Batch),
            other => Err(format!(
                "invalid transaction scope '{}', expected 'table' or 'batch'",
                other
            )),
        }
    }
}

/// A duplicate-merge rule for a table that gains a uniqueness constraint in
/// the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationRule {
    /// Table holding the duplicates.
    pub table: String,

    /// Columns that must be unique after consolidation.
    pub key_columns: Vec<String>,

    /// Surrogate key used to pick the keeper row (lowest wins).
    #[serde(default = "default_pk_column")]
    pub pk_column: String,

    /// Column summed across a duplicate group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_column: Option<String>,

    /// Per-unit price column; the group maximum becomes canonical.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_column: Option<String>,

    /// Line total recomputed as quantity times price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_column: Option<String>,

    /// Unique index created once the table is consolidated.
    pub unique_index: String,
}

/// Migration behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per batch (default: 1000).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Tables copied concurrently within one dependency level (default: 1).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Transaction boundary for the copy (default: table).
    #[serde(default)]
    pub transaction_scope: TransactionScope,

    /// Ordering used to break foreign-key cycles and to order tables when the
    /// source declares no foreign keys.
    #[serde(default = "default_table_priority")]
    pub table_priority: Vec<String>,

    /// DDL script applied before the copy during startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_file: Option<PathBuf>,

    /// Constraint script applied after consolidation during startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints_file: Option<PathBuf>,

    /// Duplicate-merge rules.
    #[serde(default = "default_consolidation_rules")]
    pub consolidation: Vec<ConsolidationRule>,

    /// Create each rule's unique index after merging (default: true).
    #[serde(default = "default_true")]
    pub create_unique_indexes: bool,

    /// Run the integrity verifier at the end of startup (default: true).
    #[serde(default = "default_true")]
    pub verify_after_migrate: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: default_workers(),
            transaction_scope: TransactionScope::default(),
            table_priority: default_table_priority(),
            schema_file: None,
            constraints_file: None,
            consolidation: default_consolidation_rules(),
            create_unique_indexes: true,
            verify_after_migrate: true,
        }
    }
}

/// Artifact output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactsConfig {
    /// Root directory; `analysis/` and `migrations/` are created below it.
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

impl TargetConfig {
    /// Get the pool size, derived from the worker count when unset.
    pub fn get_max_connections(&self, workers: usize) -> usize {
        self.max_connections.unwrap_or(workers + 2)
    }
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_pk_column() -> String {
    "id".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_table_priority() -> Vec<String> {
    [
        "categories",
        "users",
        "slippers",
        "slipper_images",
        "carts",
        "cart_items",
        "orders",
        "order_items",
        "payments",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Rules for the line-item tables that gain uniqueness in the target.
pub fn default_consolidation_rules() -> Vec<ConsolidationRule> {
    vec![
        ConsolidationRule {
            table: "order_items".to_string(),
            key_columns: vec!["order_id".to_string(), "slipper_id".to_string()],
            pk_column: default_pk_column(),
            quantity_column: Some("quantity".to_string()),
            price_column: Some("unit_price".to_string()),
            total_column: Some("total_price".to_string()),
            unique_index: "uq_order_items_order_slipper".to_string(),
        },
        ConsolidationRule {
            table: "cart_items".to_string(),
            key_columns: vec!["cart_id".to_string(), "slipper_id".to_string()],
            pk_column: default_pk_column(),
            quantity_column: Some("quantity".to_string()),
            price_column: None,
            total_column: None,
            unique_index: "uq_cart_items_cart_slipper".to_string(),
        },
    ]
}
