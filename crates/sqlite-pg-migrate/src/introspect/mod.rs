//! Source schema introspection.
//!
//! Reads the SQLite catalog into [`Table`] descriptors, orders them into a
//! [`MigrationPlan`] and renders the analysis report and the PostgreSQL DDL.
//! Nothing here writes to the target.

pub mod ddl;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConsolidationRule;
use crate::core::schema::{Column, ForeignKey, Index, Table, TableKind};
use crate::core::traits::SourceReader;
use crate::error::{MigrateError, Result};
use crate::plan::MigrationPlan;
use crate::source::{CatalogObject, ColumnInfo, ForeignKeyInfo, IndexInfo, SqliteReader};
use crate::typemap::sqlite_to_target;

/// Reads table descriptors out of a SQLite source.
pub struct SchemaIntrospector<'a> {
    reader: &'a SqliteReader,
}

impl<'a> SchemaIntrospector<'a> {
    /// Create an introspector over an open source.
    pub fn new(reader: &'a SqliteReader) -> Self {
        Self { reader }
    }

    /// Describe every user table and view.
    ///
    /// Only a failure to list the catalog is fatal. Problems with a single
    /// table are logged and degrade that table's descriptor.
    pub async fn introspect(&self) -> Result<Vec<Table>> {
        let objects = self
            .reader
            .list_objects()
            .await
            .map_err(|e| MigrateError::SchemaIntrospection(e.to_string()))?;

        let mut tables = Vec::with_capacity(objects.len());
        for object in objects {
            tables.push(self.describe(object).await);
        }
        Ok(tables)
    }

    async fn describe(&self, object: CatalogObject) -> Table {
        let kind = if object.object_type == "view" {
            TableKind::View
        } else {
            TableKind::Table
        };
        let mut table = Table::new(object.name, kind);
        table.create_sql = object.sql;

        if kind == TableKind::View {
            debug!("{}: view recorded, not migrated", table.name);
            return table;
        }

        match self.reader.table_info(&table.name).await {
            Ok(info) => apply_columns(&mut table, info),
            Err(e) => warn!("{}: could not read columns: {}", table.name, e),
        }
        match self.reader.index_list(&table.name).await {
            Ok(info) => table.indexes = build_indexes(info),
            Err(e) => warn!("{}: could not read indexes: {}", table.name, e),
        }
        match self.reader.foreign_key_list(&table.name).await {
            Ok(info) => table.foreign_keys = build_foreign_keys(info),
            Err(e) => warn!("{}: could not read foreign keys: {}", table.name, e),
        }
        table.row_count = match self.reader.row_count(&table.name).await {
            Ok(count) => count,
            Err(e) => {
                warn!("{}: could not count rows: {}", table.name, e);
                -1
            }
        };

        table
    }
}

fn apply_columns(table: &mut Table, mut info: Vec<ColumnInfo>) {
    info.sort_by_key(|c| c.cid);

    let mut pk: Vec<(i64, String)> = info
        .iter()
        .filter(|c| c.pk > 0)
        .map(|c| (c.pk, c.name.clone()))
        .collect();
    pk.sort();
    table.primary_key = pk.into_iter().map(|(_, name)| name).collect();

    table.columns = info
        .into_iter()
        .map(|c| Column {
            target_type: sqlite_to_target(&c.declared_type),
            // Primary keys are never nullable in the target, whatever SQLite allowed.
            is_nullable: !c.not_null && c.pk == 0,
            default: c.default,
            pk_position: c.pk as i32,
            source_type: c.declared_type,
            name: c.name,
        })
        .collect();
}

fn build_indexes(info: Vec<IndexInfo>) -> Vec<Index> {
    info.into_iter()
        .filter(|i| i.origin != "pk")
        .map(|i| Index {
            name: i.name,
            is_unique: i.unique,
            columns: i.columns,
            origin: i.origin,
        })
        .collect()
}

fn build_foreign_keys(info: Vec<ForeignKeyInfo>) -> Vec<ForeignKey> {
    let mut grouped: BTreeMap<i64, Vec<ForeignKeyInfo>> = BTreeMap::new();
    for row in info {
        grouped.entry(row.id).or_default().push(row);
    }

    grouped
        .into_iter()
        .filter_map(|(id, mut rows)| {
            rows.sort_by_key(|r| r.seq);
            let first = rows.first()?.clone();
            let ref_columns: Option<Vec<String>> = rows.iter().map(|r| r.to.clone()).collect();
            Some(ForeignKey {
                id,
                columns: rows.iter().map(|r| r.from.clone()).collect(),
                ref_table: first.table,
                ref_columns: ref_columns.unwrap_or_default(),
                on_delete: first.on_delete,
                on_update: first.on_update,
            })
        })
        .collect()
}

/// Introspected schema plus its copy order.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Tables and views in catalog (name) order.
    pub tables: Vec<Table>,

    /// Copy order for the migratable tables.
    pub plan: MigrationPlan,
}

impl Analysis {
    /// Introspect a source and plan the copy.
    pub async fn run(reader: &SqliteReader, priority: &[String]) -> Result<Self> {
        let tables = SchemaIntrospector::new(reader).introspect().await?;
        let plan = MigrationPlan::build(&tables, priority);
        info!(
            "Introspected {} objects, {} tables planned",
            tables.len(),
            plan.len()
        );
        Ok(Self { tables, plan })
    }

    /// Find a table descriptor by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Migratable tables in plan order.
    pub fn planned_tables(&self) -> Vec<&Table> {
        let by_name: HashMap<&str, &Table> =
            self.tables.iter().map(|t| (t.name.as_str(), t)).collect();
        self.plan
            .order()
            .iter()
            .filter_map(|name| by_name.get(name.as_str()).copied())
            .collect()
    }

    /// Render `CREATE TABLE` statements in plan order.
    pub fn schema_sql(&self, schema: &str) -> Result<String> {
        ddl::schema_sql(&self.planned_tables(), schema)
    }

    /// Render the post-migration index and foreign key script.
    pub fn constraints_sql(&self, schema: &str, rules: &[ConsolidationRule]) -> Result<String> {
        ddl::constraints_sql(&self.planned_tables(), schema, rules)
    }

    /// Build the JSON analysis report.
    pub fn report(&self, run_id: &str, database: &Path) -> AnalysisReport {
        AnalysisReport {
            run_id: run_id.to_string(),
            database: database.display().to_string(),
            generated_at: Utc::now(),
            plan: self.plan.order().to_vec(),
            cycles: self.plan.cycles().to_vec(),
            tables: self
                .tables
                .iter()
                .map(|t| (t.name.clone(), t.clone()))
                .collect(),
        }
    }
}

/// Persisted projection of an analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Run correlation id.
    pub run_id: String,

    /// Source file path.
    pub database: String,

    /// When the report was produced.
    pub generated_at: DateTime<Utc>,

    /// Copy order.
    pub plan: Vec<String>,

    /// Foreign-key cycles that were broken by priority.
    pub cycles: Vec<Vec<String>>,

    /// Descriptors keyed by table name.
    pub tables: BTreeMap<String, Table>,
}
