//! Integrity verification between the source file and the target schema.
//!
//! Every planned table is scanned on both sides in the same order, each cell
//! is normalised by the column's target type, rows are hashed and the row
//! hashes folded into one digest per side. A table matches when row counts
//! and folded digests agree.

pub mod normalize;
pub mod scanner;

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

use crate::core::schema::{Table, TargetType};
use crate::core::traits::{TargetColumn, TargetWriter};
use crate::error::{MigrateError, Result};
use crate::introspect::Analysis;
use crate::run::RunContext;
use crate::typemap::pg_to_target;

pub use normalize::{normalize, row_digest, FoldedDigest, NULL_SENTINEL};
pub use scanner::{Cell, PgScanner, RowScanner, ScanSpec, SqliteScanner};

/// Checksum comparison for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableChecksum {
    pub table: String,
    /// Ordering key used on both sides.
    pub order_by: Vec<String>,
    pub columns: Vec<String>,
    pub source_rows: u64,
    pub target_rows: u64,
    pub source_digest: Option<String>,
    pub target_digest: Option<String>,
    #[serde(rename = "match")]
    pub matches: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Verification outcome for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub schema: String,
    pub tables: Vec<TableChecksum>,
    pub matched: usize,
    pub mismatched: usize,
    pub errors: usize,
}

impl IntegrityReport {
    /// Whether every table matched.
    pub fn all_match(&self) -> bool {
        self.mismatched == 0 && self.errors == 0
    }

    /// Error to surface when mismatches must fail the run.
    pub fn ensure_match(&self) -> Result<()> {
        if self.all_match() {
            Ok(())
        } else {
            Err(MigrateError::VerificationMismatch(self.mismatched + self.errors))
        }
    }
}

/// Compares the source and target row by row through digests.
pub struct IntegrityVerifier<'a> {
    source: &'a dyn RowScanner,
    target: &'a dyn RowScanner,
    catalog: &'a dyn TargetWriter,
    schema: String,
}

impl<'a> IntegrityVerifier<'a> {
    /// `catalog` supplies the target column types.
    pub fn new(
        source: &'a dyn RowScanner,
        target: &'a dyn RowScanner,
        catalog: &'a dyn TargetWriter,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            catalog,
            schema: schema.into(),
        }
    }

    /// Verify every planned table. Table-level failures are recorded and the
    /// remaining tables are still checked.
    pub async fn verify(&self, analysis: &Analysis, ctx: &RunContext) -> IntegrityReport {
        async {
            let mut tables = Vec::new();
            for table in analysis.planned_tables() {
                let start = Instant::now();
                let mut checksum = match self.verify_table(table).await {
                    Ok(checksum) => checksum,
                    Err(e) => {
                        warn!("{}: verification failed: {}", table.name, e);
                        failed(table, e)
                    }
                };
                checksum.duration_ms = start.elapsed().as_millis() as u64;

                if checksum.matches {
                    debug!("{}: match ({} rows)", table.name, checksum.source_rows);
                } else if checksum.error.is_none() {
                    warn!(
                        "{}: MISMATCH (source {} rows, target {} rows)",
                        table.name, checksum.source_rows, checksum.target_rows
                    );
                }
                tables.push(checksum);
            }

            let errors = tables.iter().filter(|t| t.error.is_some()).count();
            let matched = tables.iter().filter(|t| t.matches).count();
            let mismatched = tables.len() - matched - errors;
            info!(
                "Verification: {} matched, {} mismatched, {} errors",
                matched, mismatched, errors
            );

            IntegrityReport {
                run_id: ctx.run_id().to_string(),
                generated_at: Utc::now(),
                schema: self.schema.clone(),
                tables,
                matched,
                mismatched,
                errors,
            }
        }
        .instrument(ctx.stage("verify"))
        .await
    }

    async fn verify_table(&self, table: &Table) -> Result<TableChecksum> {
        let target_columns = self
            .catalog
            .table_columns(&self.schema, &table.name)
            .await?
            .ok_or_else(|| {
                MigrateError::SchemaIntrospection(format!(
                    "table {} does not exist in schema {}",
                    table.name, self.schema
                ))
            })?;
        let (spec, kinds) = scan_plan(table, &target_columns);
        if spec.columns.is_empty() {
            return Err(MigrateError::SchemaIntrospection(format!(
                "table {} shares no columns with the target",
                table.name
            )));
        }

        let mut source_digest = FoldedDigest::new();
        self.source
            .scan(&spec, &mut |cells: Vec<Cell>| source_digest.push_row(&cells, &kinds))
            .await?;

        let mut target_digest = FoldedDigest::new();
        self.target
            .scan(&spec, &mut |cells: Vec<Cell>| target_digest.push_row(&cells, &kinds))
            .await?;

        let source_rows = source_digest.rows();
        let target_rows = target_digest.rows();
        let source_digest = source_digest.finish();
        let target_digest = target_digest.finish();

        Ok(TableChecksum {
            table: table.name.clone(),
            order_by: order_label(&spec),
            columns: spec.columns,
            source_rows,
            target_rows,
            matches: source_rows == target_rows && source_digest == target_digest,
            source_digest: Some(source_digest),
            target_digest: Some(target_digest),
            duration_ms: 0,
            error: None,
        })
    }
}

/// Columns, target types and ordering for one table.
///
/// Columns are taken in source order and limited to those present in the
/// target. The primary key orders the scan when all of its columns are
/// compared; otherwise each side falls back to its row id.
fn scan_plan(table: &Table, target_columns: &[TargetColumn]) -> (ScanSpec, Vec<TargetType>) {
    let by_name: HashMap<&str, &str> = target_columns
        .iter()
        .map(|c| (c.name.as_str(), c.data_type.as_str()))
        .collect();

    let mut columns = Vec::new();
    let mut pg_types = Vec::new();
    let mut kinds = Vec::new();
    for column in &table.columns {
        match by_name.get(column.name.as_str()) {
            Some(data_type) => {
                columns.push(column.name.clone());
                pg_types.push(data_type.to_string());
                kinds.push(column_kind(data_type, column.target_type));
            }
            None => warn!("{}.{}: not in target, not compared", table.name, column.name),
        }
    }

    let order_by = if !table.primary_key.is_empty()
        && table.primary_key.iter().all(|pk| columns.contains(pk))
    {
        table.primary_key.clone()
    } else {
        Vec::new()
    };

    (
        ScanSpec {
            table: table.name.clone(),
            columns,
            pg_types,
            order_by,
        },
        kinds,
    )
}

fn column_kind(data_type: &str, source: TargetType) -> TargetType {
    match data_type {
        "USER-DEFINED" | "ARRAY" => source,
        other => pg_to_target(other),
    }
}

fn order_label(spec: &ScanSpec) -> Vec<String> {
    if spec.order_by.is_empty() {
        vec!["rowid/ctid".to_string()]
    } else {
        spec.order_by.clone()
    }
}

fn failed(table: &Table, error: MigrateError) -> TableChecksum {
    TableChecksum {
        table: table.name.clone(),
        order_by: Vec::new(),
        columns: Vec::new(),
        source_rows: 0,
        target_rows: 0,
        source_digest: None,
        target_digest: None,
        matches: false,
        duration_ms: 0,
        error: Some(error.to_string()),
    }
}
