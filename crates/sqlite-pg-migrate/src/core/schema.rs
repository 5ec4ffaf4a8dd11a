//! Schema and metadata types for tables, columns, indexes, and constraints.
//!
//! Descriptors are built once by the introspector and then shared read-only
//! by the planner, the DDL generator, the migrator and the verifier. Only
//! their JSON projection outlives a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// PostgreSQL storage class a source column is translated to.
///
/// Resolved once at introspection time so every later stage (DDL, copy
/// coercion, verification) agrees on the same interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Integer,
    Double,
    Numeric,
    Boolean,
    Date,
    Timestamp,
    Text,
    Json,
    Bytes,
}

impl TargetType {
    /// PostgreSQL type name used in generated DDL.
    pub fn pg_type(&self) -> &'static str {
        match self {
            TargetType::Integer => "BIGINT",
            TargetType::Double => "DOUBLE PRECISION",
            TargetType::Numeric => "NUMERIC",
            TargetType::Boolean => "BOOLEAN",
            TargetType::Date => "DATE",
            TargetType::Timestamp => "TIMESTAMP",
            TargetType::Text => "TEXT",
            TargetType::Json => "JSONB",
            TargetType::Bytes => "BYTEA",
        }
    }

    /// Whether values of this type are compared as text.
    pub fn is_textual(&self) -> bool {
        matches!(self, TargetType::Text | TargetType::Json)
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pg_type())
    }
}

/// Kind of catalog object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Table,
    View,
}

/// Table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,

    /// Table or view.
    #[serde(rename = "type")]
    pub kind: TableKind,

    /// Original `CREATE` statement as stored in the source catalog.
    pub create_sql: Option<String>,

    /// Column definitions in declaration order.
    pub columns: Vec<Column>,

    /// Primary key column names in key order.
    pub primary_key: Vec<String>,

    /// Foreign key constraints.
    pub foreign_keys: Vec<ForeignKey>,

    /// Indexes, excluding the implicit primary key index.
    pub indexes: Vec<Index>,

    /// Observed row count, `-1` when it could not be read.
    #[serde(rename = "count")]
    pub row_count: i64,
}

impl Table {
    /// Create an empty table descriptor.
    pub fn new(name: impl Into<String>, kind: TableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            create_sql: None,
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
            row_count: 0,
        }
    }

    /// Whether rows of this object are copied.
    pub fn is_migratable(&self) -> bool {
        self.kind == TableKind::Table
    }

    /// Find a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// The single integer primary key column, if the table has exactly one.
    pub fn integer_pk(&self) -> Option<&Column> {
        match self.primary_key.as_slice() {
            [pk] => self
                .column(pk)
                .filter(|c| c.target_type == TargetType::Integer),
            _ => None,
        }
    }

    /// Tables this table references, excluding itself.
    pub fn referenced_tables(&self) -> BTreeSet<&str> {
        self.foreign_keys
            .iter()
            .map(|fk| fk.ref_table.as_str())
            .filter(|t| *t != self.name)
            .collect()
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,

    /// Declared source type, verbatim (may be empty in SQLite).
    pub source_type: String,

    /// Mapped PostgreSQL storage class.
    pub target_type: TargetType,

    /// Whether NULL is allowed.
    pub is_nullable: bool,

    /// Default expression as written in the source.
    pub default: Option<String>,

    /// 1-based position in the primary key, 0 when not part of it.
    pub pk_position: i32,
}

impl Column {
    /// Whether this column is part of the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.pk_position > 0
    }
}

/// Foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint id within the owning table.
    pub id: i64,

    /// Owning columns.
    pub columns: Vec<String>,

    /// Referenced table.
    pub ref_table: String,

    /// Referenced columns (empty means the referenced primary key).
    pub ref_columns: Vec<String>,

    /// ON DELETE action.
    pub on_delete: String,

    /// ON UPDATE action.
    pub on_update: String,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,

    /// Whether the index is unique.
    pub is_unique: bool,

    /// Indexed columns in order.
    pub columns: Vec<String>,

    /// How the index was created: `c` explicit, `u` unique constraint, `pk`.
    pub origin: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, target_type: TargetType, pk_position: i32) -> Column {
        Column {
            name: name.to_string(),
            source_type: String::new(),
            target_type,
            is_nullable: pk_position == 0,
            default: None,
            pk_position,
        }
    }

    #[test]
    fn test_integer_pk() {
        let mut table = Table::new("users", TableKind::Table);
        table.columns = vec![column("id", TargetType::Integer, 1)];
        table.primary_key = vec!["id".to_string()];
        assert_eq!(table.integer_pk().map(|c| c.name.as_str()), Some("id"));

        table.columns[0].target_type = TargetType::Text;
        assert!(table.integer_pk().is_none());
    }

    #[test]
    fn test_composite_pk_has_no_integer_pk() {
        let mut table = Table::new("pairs", TableKind::Table);
        table.columns = vec![
            column("a", TargetType::Integer, 1),
            column("b", TargetType::Integer, 2),
        ];
        table.primary_key = vec!["a".to_string(), "b".to_string()];
        assert!(table.integer_pk().is_none());
    }

    #[test]
    fn test_referenced_tables_skips_self() {
        let mut table = Table::new("categories", TableKind::Table);
        table.foreign_keys = vec![
            ForeignKey {
                id: 0,
                columns: vec!["parent_id".to_string()],
                ref_table: "categories".to_string(),
                ref_columns: vec!["id".to_string()],
                on_delete: "SET NULL".to_string(),
                on_update: "NO ACTION".to_string(),
            },
            ForeignKey {
                id: 1,
                columns: vec!["owner_id".to_string()],
                ref_table: "users".to_string(),
                ref_columns: vec![],
                on_delete: "CASCADE".to_string(),
                on_update: "NO ACTION".to_string(),
            },
        ];
        let refs: Vec<&str> = table.referenced_tables().into_iter().collect();
        assert_eq!(refs, vec!["users"]);
    }

    #[test]
    fn test_views_are_not_migratable() {
        assert!(!Table::new("v_totals", TableKind::View).is_migratable());
        assert!(Table::new("orders", TableKind::Table).is_migratable());
    }
}
