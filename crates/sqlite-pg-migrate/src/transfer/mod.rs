//! Row copy from the source store into a prepared target schema.
//!
//! The copy runs only against an empty target: if any planned table already
//! holds rows the whole migration is skipped, which makes restarting a failed
//! or completed run safe. Tables are copied in plan order; with more than one
//! worker, tables on the same dependency level are copied concurrently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn, Instrument};

use crate::config::{Config, TransactionScope};
use crate::core::schema::Table;
use crate::core::traits::{ReadOptions, SourceReader, TargetWriter, WriteJob};
use crate::error::{MigrateError, Result};
use crate::introspect::Analysis;
use crate::run::RunContext;

/// Reason recorded when the emptiness gate skips a run.
pub const SKIP_NOT_EMPTY: &str = "not empty";

/// Copy settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Target schema.
    pub schema: String,
    /// Rows per batch.
    pub batch_size: usize,
    /// Tables copied concurrently within a dependency level.
    pub workers: usize,
    /// Transaction boundary.
    pub scope: TransactionScope,
}

impl TransferConfig {
    /// Derive copy settings from the run configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            schema: config.target.schema.clone(),
            batch_size: config.migration.batch_size,
            workers: config.migration.workers,
            scope: config.migration.transaction_scope,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            batch_size: 1000,
            workers: 1,
            scope: TransactionScope::Table,
        }
    }
}

/// Final state of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Completed,
    Skipped,
}

/// Copy statistics for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableTransfer {
    pub table: String,
    pub rows: u64,
    pub duration_ms: u64,
    /// Source columns with no counterpart in the target.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_columns: Vec<String>,
}

/// Outcome of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub status: MigrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Tables found non-empty by the gate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_empty_tables: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tables: Vec<TableTransfer>,
    pub total_rows: u64,
}

impl MigrationReport {
    /// Whether the emptiness gate skipped the run.
    pub fn is_skipped(&self) -> bool {
        self.status == MigrationStatus::Skipped
    }
}

/// One prepared table copy.
#[derive(Debug, Clone)]
struct CopyTask {
    read: ReadOptions,
    write: WriteJob,
    skipped_columns: Vec<String>,
}

/// Copies every planned table from the source into the target.
pub struct DataMigrator {
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    config: TransferConfig,
}

impl DataMigrator {
    /// Create a migrator over a source reader and a target writer.
    pub fn new(
        source: Arc<dyn SourceReader>,
        target: Arc<dyn TargetWriter>,
        config: TransferConfig,
    ) -> Self {
        Self {
            source,
            target,
            config,
        }
    }

    /// Run the migration for every table in the analysis plan.
    pub async fn run(&self, analysis: &Analysis, ctx: &RunContext) -> Result<MigrationReport> {
        self.run_inner(analysis, ctx)
            .instrument(ctx.stage("migrate"))
            .await
    }

    async fn run_inner(&self, analysis: &Analysis, ctx: &RunContext) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let tables = analysis.planned_tables();

        let tasks = self.prepare(&tables).await?;

        let non_empty = self.non_empty_tables(&tables).await?;
        if !non_empty.is_empty() {
            info!(tables = ?non_empty, "skipped: not empty");
            return Ok(MigrationReport {
                run_id: ctx.run_id().to_string(),
                status: MigrationStatus::Skipped,
                reason: Some(SKIP_NOT_EMPTY.to_string()),
                non_empty_tables: non_empty,
                started_at,
                duration_ms: start.elapsed().as_millis() as u64,
                tables: Vec::new(),
                total_rows: 0,
            });
        }

        info!(
            "Copying {} tables (workers: {}, scope: {:?}, batch size: {})",
            tasks.len(),
            self.config.workers,
            self.config.scope,
            self.config.batch_size
        );

        let results = if self.config.workers <= 1 {
            let mut results = Vec::with_capacity(tasks.len());
            for task in tasks {
                results.push(copy_table(self.source.clone(), self.target.clone(), task).await?);
            }
            results
        } else {
            self.copy_by_level(analysis, tasks).await?
        };

        let total_rows = results.iter().map(|t| t.rows).sum();
        info!("Migration completed: {} rows", total_rows);

        Ok(MigrationReport {
            run_id: ctx.run_id().to_string(),
            status: MigrationStatus::Completed,
            reason: None,
            non_empty_tables: Vec::new(),
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            tables: results,
            total_rows,
        })
    }

    /// Resolve copied columns for every table, failing on a missing table.
    async fn prepare(&self, tables: &[&Table]) -> Result<Vec<CopyTask>> {
        let mut tasks = Vec::with_capacity(tables.len());

        for table in tables {
            let target_columns = self
                .target
                .table_columns(&self.config.schema, &table.name)
                .await?
                .ok_or_else(|| {
                    MigrateError::transfer(
                        &table.name,
                        format!("table does not exist in schema {}", self.config.schema),
                    )
                })?;
            let present: HashSet<&str> = target_columns.iter().map(|c| c.name.as_str()).collect();

            let (columns, skipped): (Vec<String>, Vec<String>) = table
                .column_names()
                .into_iter()
                .partition(|c| present.contains(c.as_str()));
            if !skipped.is_empty() {
                warn!(
                    "{}: columns missing in target, not copied: {}",
                    table.name,
                    skipped.join(", ")
                );
            }
            if columns.is_empty() {
                return Err(MigrateError::transfer(
                    &table.name,
                    "no source column exists in the target table",
                ));
            }

            let order_by = table
                .primary_key
                .iter()
                .filter(|pk| columns.contains(pk))
                .cloned()
                .collect::<Vec<_>>();
            let order_by = if order_by.len() == table.primary_key.len() {
                order_by
            } else {
                Vec::new()
            };

            tasks.push(CopyTask {
                read: ReadOptions {
                    table: table.name.clone(),
                    columns: columns.clone(),
                    order_by,
                    batch_size: self.config.batch_size,
                },
                write: WriteJob {
                    schema: self.config.schema.clone(),
                    table: table.name.clone(),
                    columns,
                    scope: self.config.scope,
                },
                skipped_columns: skipped,
            });
        }

        Ok(tasks)
    }

    /// Planned tables that already hold rows in the target.
    async fn non_empty_tables(&self, tables: &[&Table]) -> Result<Vec<String>> {
        let mut non_empty = Vec::new();
        for table in tables {
            if self.target.has_rows(&self.config.schema, &table.name).await? {
                debug!("{}: target already holds rows", table.name);
                non_empty.push(table.name.clone());
            }
        }
        Ok(non_empty)
    }

    /// Copy level by level; tables within a level run concurrently.
    async fn copy_by_level(
        &self,
        analysis: &Analysis,
        tasks: Vec<CopyTask>,
    ) -> Result<Vec<TableTransfer>> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut remaining = tasks;
        let mut results = Vec::with_capacity(remaining.len());

        for level in analysis.plan.levels() {
            let (current, rest): (Vec<_>, Vec<_>) = remaining
                .into_iter()
                .partition(|t| level.contains(&t.write.table));
            remaining = rest;

            let mut handles = Vec::with_capacity(current.len());
            for task in current {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| MigrateError::transfer(&task.write.table, e.to_string()))?;
                let table = task.write.table.clone();
                let source = self.source.clone();
                let target = self.target.clone();
                let handle = tokio::spawn(
                    async move {
                        let result = copy_table(source, target, task).await;
                        drop(permit);
                        result
                    }
                    .in_current_span(),
                );
                handles.push((table, handle));
            }

            let mut first_error = None;
            for (table, handle) in handles {
                match handle.await {
                    Ok(Ok(stats)) => results.push(stats),
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        first_error.get_or_insert(MigrateError::transfer(
                            &table,
                            format!("copy task panicked: {}", e),
                        ));
                    }
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        // Tables outside every level cannot occur with a consistent plan.
        for task in remaining {
            results.push(copy_table(self.source.clone(), self.target.clone(), task).await?);
        }

        Ok(results)
    }
}

async fn copy_table(
    source: Arc<dyn SourceReader>,
    target: Arc<dyn TargetWriter>,
    task: CopyTask,
) -> Result<TableTransfer> {
    let start = Instant::now();
    let table = task.write.table.clone();
    info!("{}: copying", table);

    let batches = source.read_table(task.read);
    let rows = target.write_table(task.write, batches).await?;

    let duration_ms = start.elapsed().as_millis() as u64;
    info!("{}: {} rows in {} ms", table, rows, duration_ms);

    Ok(TableTransfer {
        table,
        rows,
        duration_ms,
        skipped_columns: task.skipped_columns,
    })
}
