//! Stage composition.
//!
//! Each CLI command maps onto one of the stage functions here; the startup
//! hook ([`Pipeline::run_startup`]) chains them in order:
//!
//! 1. Introspect the source and write the analysis artifacts
//! 2. Provision the target database (when an admin DSN is configured)
//! 3. Apply the configured schema script
//! 4. Copy rows, consolidate duplicates, reconcile sequences
//! 5. Apply the configured constraints script
//! 6. Verify (when enabled)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, Instrument};

use crate::apply::{apply_sql_file, ApplyReport};
use crate::artifacts::ArtifactWriter;
use crate::config::Config;
use crate::consolidate::{ConsolidationReport, DuplicateConsolidator};
use crate::error::{MigrateError, Result};
use crate::introspect::{ddl, Analysis};
use crate::provision::{resolve_owner, DatabaseProvisioner, ProvisionOutcome};
use crate::run::RunContext;
use crate::sequences::{SequenceReconciler, SequenceReport};
use crate::source::SqliteReader;
use crate::target::PgTarget;
use crate::transfer::{DataMigrator, MigrationReport, TransferConfig};
use crate::verify::{IntegrityReport, IntegrityVerifier, PgScanner, SqliteScanner};

/// Subdirectory for reports.
pub const ANALYSIS_DIR: &str = "analysis";

/// Subdirectory for generated SQL.
pub const MIGRATIONS_DIR: &str = "migrations";

/// Files written by [`analyze`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisArtifacts {
    pub report: PathBuf,
    pub schema_sql: PathBuf,
    pub constraints_sql: PathBuf,
}

/// Introspect the source and write the report and DDL files. Never touches
/// the target.
pub async fn analyze(
    config: &Config,
    ctx: &RunContext,
) -> Result<(SqliteReader, Analysis, AnalysisArtifacts)> {
    let (reader, analysis) = introspect(config, ctx).await?;
    let writer = config.artifact_writer();
    let artifacts = write_analysis(&writer, &analysis, config, config.source_path()?, ctx)?;
    Ok((reader, analysis, artifacts))
}

/// Open the source and plan the copy, without writing anything.
pub async fn introspect(config: &Config, ctx: &RunContext) -> Result<(SqliteReader, Analysis)> {
    let reader = SqliteReader::open(config.source_path()?).await?;
    let analysis = Analysis::run(&reader, &config.migration.table_priority)
        .instrument(ctx.stage("introspect"))
        .await?;
    Ok((reader, analysis))
}

fn write_analysis(
    writer: &ArtifactWriter,
    analysis: &Analysis,
    config: &Config,
    source_path: &Path,
    ctx: &RunContext,
) -> Result<AnalysisArtifacts> {
    let schema = &config.target.schema;
    let header = ddl::header(&source_path.display().to_string(), ctx.run_id());

    let report = writer.write_json(
        ANALYSIS_DIR,
        "sqlite_analysis",
        &analysis.report(ctx.run_id(), source_path),
    )?;
    let schema_sql = writer.write_text(
        MIGRATIONS_DIR,
        "pg_schema",
        "sql",
        &format!("{}{}", header, analysis.schema_sql(schema)?),
    )?;
    let constraints_sql = writer.write_text(
        MIGRATIONS_DIR,
        "pg_constraints",
        "sql",
        &format!(
            "{}{}",
            header,
            analysis.constraints_sql(schema, &config.migration.consolidation)?
        ),
    )?;

    Ok(AnalysisArtifacts {
        report,
        schema_sql,
        constraints_sql,
    })
}

/// Connect to the configured target.
pub async fn connect_target(config: &Config) -> Result<PgTarget> {
    PgTarget::connect(
        config.target_dsn()?,
        config.target.get_max_connections(config.migration.workers),
    )
    .await
}

/// Results of the copy and its follow-up repairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateOutcome {
    pub migration: MigrationReport,
    pub consolidation: ConsolidationReport,
    pub sequences: SequenceReport,
}

/// Copy rows, then consolidate duplicates and reconcile sequences.
///
/// Consolidation and reconciliation also run when the emptiness gate skipped
/// the copy; both are idempotent.
pub async fn migrate_stages(
    reader: &SqliteReader,
    target: &PgTarget,
    analysis: &Analysis,
    config: &Config,
    ctx: &RunContext,
) -> Result<MigrateOutcome> {
    let migrator = DataMigrator::new(
        Arc::new(reader.clone()),
        Arc::new(target.clone()),
        TransferConfig::from_config(config),
    );
    let migration = migrator.run(analysis, ctx).await?;

    let consolidation = consolidate_stage(target, config, ctx).await?;
    let sequences = SequenceReconciler::new(target, &config.target.schema)
        .run(ctx)
        .await?;

    Ok(MigrateOutcome {
        migration,
        consolidation,
        sequences,
    })
}

/// Apply the configured consolidation rules.
pub async fn consolidate_stage(
    target: &PgTarget,
    config: &Config,
    ctx: &RunContext,
) -> Result<ConsolidationReport> {
    DuplicateConsolidator::new(
        target,
        &config.target.schema,
        config.migration.create_unique_indexes,
    )
    .run(&config.migration.consolidation, ctx)
    .await
}

/// Compare source and target and write the integrity report.
pub async fn verify_stage(
    reader: &SqliteReader,
    target: &PgTarget,
    analysis: &Analysis,
    config: &Config,
    ctx: &RunContext,
) -> Result<(IntegrityReport, PathBuf)> {
    let source = SqliteScanner::new(reader.pool().clone());
    let scanner = PgScanner::new(target, &config.target.schema);
    let report = IntegrityVerifier::new(&source, &scanner, target, &config.target.schema)
        .verify(analysis, ctx)
        .await;
    let path = config
        .artifact_writer()
        .write_json(ANALYSIS_DIR, "integrity_report", &report)?;
    Ok((report, path))
}

/// Persisted record of a command that ended in an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub run_id: String,
    pub command: String,
    pub status: String,
    pub error: String,
    pub exit_code: u8,
    pub failed_at: DateTime<Utc>,
}

/// Write a failure artifact for `command`.
pub fn write_failure(
    writer: &ArtifactWriter,
    command: &str,
    ctx: &RunContext,
    err: &MigrateError,
) -> Result<PathBuf> {
    let report = FailureReport {
        run_id: ctx.run_id().to_string(),
        command: command.to_string(),
        status: "failed".to_string(),
        error: err.to_string(),
        exit_code: err.exit_code(),
        failed_at: Utc::now(),
    };
    writer.write_json(ANALYSIS_DIR, &format!("{}_failure", command.replace('-', "_")), &report)
}

/// Result of the startup hook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub config_hash: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisArtifacts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision: Option<ProvisionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_apply: Option<ApplyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints_apply: Option<ApplyReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<IntegrityReport>,
}

impl PipelineReport {
    fn new(run_id: &str, config_hash: String) -> Self {
        Self {
            run_id: run_id.to_string(),
            config_hash,
            status: "running".to_string(),
            started_at: Utc::now(),
            completed_at: None,
            duration_seconds: 0.0,
            error: None,
            analysis: None,
            provision: None,
            schema_apply: None,
            migrate: None,
            constraints_apply: None,
            verification: None,
        }
    }
}

/// Startup hook: runs every stage once, in order.
pub struct Pipeline {
    config: Config,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the whole pipeline. The report is written even when a stage fails.
    pub async fn run_startup(&self, ctx: &RunContext) -> Result<(PipelineReport, PathBuf)> {
        let mut report = PipelineReport::new(ctx.run_id(), self.config.hash());
        info!("Starting pipeline run: {}", ctx.run_id());

        let result = self.run_stages(&mut report, ctx).instrument(ctx.span().clone()).await;

        let completed_at = Utc::now();
        report.duration_seconds =
            (completed_at - report.started_at).num_milliseconds() as f64 / 1000.0;
        report.completed_at = Some(completed_at);
        report.status = match &result {
            Ok(()) => "completed".to_string(),
            Err(e) => {
                error!("Pipeline failed: {}", e);
                report.error = Some(e.to_string());
                "failed".to_string()
            }
        };

        let path = self
            .config
            .artifact_writer()
            .write_json("", "pipeline_report", &report)?;
        result.map(|()| (report, path))
    }

    async fn run_stages(&self, report: &mut PipelineReport, ctx: &RunContext) -> Result<()> {
        let config = &self.config;

        info!("Phase 1: Introspecting source");
        let (reader, analysis, artifacts) = analyze(config, ctx).await?;
        report.analysis = Some(artifacts);

        if let Some(admin) = &config.admin {
            info!("Phase 2: Provisioning target database");
            let owner = resolve_owner(admin.owner.as_deref(), config.target.dsn.as_deref());
            let outcome = DatabaseProvisioner::new(&admin.dsn)
                .ensure(&admin.database, owner.as_deref())
                .instrument(ctx.stage("provision"))
                .await?;
            report.provision = Some(outcome);
        }

        let target = connect_target(config).await?;

        if let Some(path) = &config.migration.schema_file {
            info!("Phase 3: Applying schema {}", path.display());
            let applied = apply_sql_file(&target, path, ctx.run_id())
                .instrument(ctx.stage("apply_schema"))
                .await?;
            report.schema_apply = Some(applied);
        }

        info!("Phase 4: Migrating data");
        report.migrate = Some(migrate_stages(&reader, &target, &analysis, config, ctx).await?);

        if let Some(path) = &config.migration.constraints_file {
            info!("Phase 5: Applying constraints {}", path.display());
            let applied = apply_sql_file(&target, path, ctx.run_id())
                .instrument(ctx.stage("apply_constraints"))
                .await?;
            report.constraints_apply = Some(applied);
        }

        if config.migration.verify_after_migrate {
            info!("Phase 6: Verifying");
            let (verification, _) = verify_stage(&reader, &target, &analysis, config, ctx).await?;
            report.verification = Some(verification);
        }

        Ok(())
    }
}
