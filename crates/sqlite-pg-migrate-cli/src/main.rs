//! sqlite-pg-migrate CLI - SQLite to PostgreSQL migration.

use clap::{Parser, Subcommand};
use serde_json::json;
use sqlite_pg_migrate::apply::apply_sql_file;
use sqlite_pg_migrate::config::AdminConfig;
use sqlite_pg_migrate::pipeline::{self, ANALYSIS_DIR};
use sqlite_pg_migrate::provision::resolve_owner;
use sqlite_pg_migrate::sequences::SequenceStatus;
use sqlite_pg_migrate::{
    Config, DatabaseProvisioner, MigrateError, Pipeline, PgTarget,
    ProvisionOutcome, RunContext, SequenceReconciler, TransactionScope,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, Instrument, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser)]
#[command(name = "sqlite-pg-migrate")]
#[command(about = "SQLite to PostgreSQL schema translation, data migration and verification")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Root directory for timestamped artifacts
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Introspect a SQLite file and write the analysis report and DDL
    Analyze {
        /// Path to the SQLite database
        source_path: PathBuf,
    },

    /// Create the target database if it does not exist
    CreateDb {
        /// Connection string for a maintenance database
        admin_dsn: String,

        /// Database to create
        db_name: String,

        /// Owner role for the new database
        #[arg(long)]
        owner: Option<String>,
    },

    /// Execute an SQL file against the target
    ApplySql {
        /// Target connection string
        target_dsn: String,

        /// SQL script to execute
        sql_file: PathBuf,
    },

    /// Copy data, consolidate duplicates and reset sequences
    Migrate {
        /// Path to the SQLite database
        source_path: PathBuf,

        /// Target connection string
        target_dsn: String,

        /// Rows per batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Tables copied concurrently within a dependency level
        #[arg(long)]
        workers: Option<usize>,

        /// Transaction boundary: table or batch
        #[arg(long)]
        transaction_scope: Option<TransactionScope>,
    },

    /// Compare source and target through per-table checksums
    Verify {
        /// Path to the SQLite database
        source_path: PathBuf,

        /// Target connection string
        target_dsn: String,

        /// Exit with an error when any table differs
        #[arg(long)]
        strict: bool,
    },

    /// Merge duplicate line items and create their unique indexes
    Consolidate {
        /// Target connection string (default: config file, then DATABASE_URL)
        target_dsn: Option<String>,
    },

    /// Move serial sequences past the copied ids
    ResetSequences {
        /// Target connection string (default: config file, then DATABASE_URL)
        target_dsn: Option<String>,
    },

    /// Run the full pipeline from the configuration file
    Startup,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Analyze { .. } => "analyze",
            Commands::CreateDb { .. } => "create-db",
            Commands::ApplySql { .. } => "apply-sql",
            Commands::Migrate { .. } => "migrate",
            Commands::Verify { .. } => "verify",
            Commands::Consolidate { .. } => "consolidate",
            Commands::ResetSequences { .. } => "reset-sequences",
            Commands::Startup => "startup",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(MigrateError::Config)?;

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::default(),
    };
    if let Some(dir) = &cli.artifacts_dir {
        config.artifacts.dir = dir.clone();
    }
    config.apply_env();

    let command = cli.command.name();
    let ctx = RunContext::new(command);
    let writer = config.artifact_writer();

    let result = execute(cli.command, config, cli.output_json, &ctx)
        .instrument(ctx.span().clone())
        .await;

    if let Err(e) = &result {
        // A verification mismatch already has its report on disk.
        if !matches!(e, MigrateError::VerificationMismatch(_)) {
            if let Err(write_err) = pipeline::write_failure(&writer, command, &ctx, e) {
                eprintln!("Could not write failure report: {}", write_err);
            }
        }
    }
    result
}

async fn execute(
    command: Commands,
    mut config: Config,
    output_json: bool,
    ctx: &RunContext,
) -> Result<(), MigrateError> {
    match command {
        Commands::Analyze { source_path } => {
            config.source.path = Some(source_path);
            config.validate()?;

            let (_, analysis, artifacts) = pipeline::analyze(&config, ctx).await?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&artifacts)?);
            } else {
                println!("\nAnalysis completed!");
                println!("  Run ID: {}", ctx.run_id());
                println!("  Tables: {}", analysis.plan.len());
                println!("  Copy order: {}", analysis.plan.order().join(" -> "));
                for cycle in analysis.plan.cycles() {
                    println!("  FK cycle broken by priority: {}", cycle.join(", "));
                }
                println!("  Report: {}", artifacts.report.display());
                println!("  Schema DDL: {}", artifacts.schema_sql.display());
                println!("  Constraints: {}", artifacts.constraints_sql.display());
            }
        }

        Commands::CreateDb {
            admin_dsn,
            db_name,
            owner,
        } => {
            config.admin = Some(AdminConfig {
                dsn: admin_dsn,
                database: db_name,
                owner,
            });
            config.validate()?;
            let Some(admin) = &config.admin else {
                return Err(MigrateError::Config("admin connection missing".into()));
            };

            let owner = resolve_owner(admin.owner.as_deref(), config.target.dsn.as_deref());
            let outcome = DatabaseProvisioner::new(&admin.dsn)
                .ensure(&admin.database, owner.as_deref())
                .await?;
            let report = json!({
                "run_id": ctx.run_id(),
                "database": admin.database,
                "owner": owner,
                "outcome": outcome,
            });
            let path = config
                .artifact_writer()
                .write_json(ANALYSIS_DIR, "provision_report", &report)?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let status = match &outcome {
                    ProvisionOutcome::Created => "created".to_string(),
                    ProvisionOutcome::AlreadyExists => "already exists".to_string(),
                    ProvisionOutcome::Skipped { reason } => format!("skipped ({})", reason),
                };
                println!("\nDatabase {}: {}", admin.database, status);
                println!("  Run ID: {}", ctx.run_id());
                println!("  Report: {}", path.display());
            }
        }

        Commands::ApplySql {
            target_dsn,
            sql_file,
        } => {
            config.target.dsn = Some(target_dsn);
            config.validate()?;

            let target = PgTarget::connect(config.target_dsn()?, 1).await?;
            let report = apply_sql_file(&target, &sql_file, ctx.run_id()).await?;
            let path = config
                .artifact_writer()
                .write_json(ANALYSIS_DIR, "apply_report", &report)?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nApplied {}", report.file);
                println!("  Run ID: {}", ctx.run_id());
                println!("  Duration: {:.2}s", report.duration_ms as f64 / 1000.0);
                println!("  Report: {}", path.display());
            }
        }

        Commands::Migrate {
            source_path,
            target_dsn,
            batch_size,
            workers,
            transaction_scope,
        } => {
            config.source.path = Some(source_path);
            config.target.dsn = Some(target_dsn);
            if let Some(n) = batch_size {
                config.migration.batch_size = n;
            }
            if let Some(w) = workers {
                config.migration.workers = w;
            }
            if let Some(scope) = transaction_scope {
                config.migration.transaction_scope = scope;
            }
            config.validate()?;

            let (reader, analysis) = pipeline::introspect(&config, ctx).await?;
            let target = pipeline::connect_target(&config).await?;
            let outcome = pipeline::migrate_stages(&reader, &target, &analysis, &config, ctx).await?;
            let path = config
                .artifact_writer()
                .write_json(ANALYSIS_DIR, "migration_report", &outcome)?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                let migration = &outcome.migration;
                if migration.is_skipped() {
                    println!("\nMigration skipped: target not empty");
                } else {
                    println!("\nMigration completed!");
                }
                println!("  Run ID: {}", ctx.run_id());
                println!("  Duration: {:.2}s", migration.duration_ms as f64 / 1000.0);
                println!("  Tables: {}", migration.tables.len());
                println!("  Rows: {}", migration.total_rows);
                println!(
                    "  Duplicates removed: {}",
                    outcome.consolidation.rows_deleted()
                );
                println!(
                    "  Sequences advanced: {}",
                    outcome.sequences.count(SequenceStatus::Advanced)
                );
                println!("  Report: {}", path.display());
            }
        }

        Commands::Verify {
            source_path,
            target_dsn,
            strict,
        } => {
            config.source.path = Some(source_path);
            config.target.dsn = Some(target_dsn);
            config.validate()?;

            let (reader, analysis) = pipeline::introspect(&config, ctx).await?;
            let target = pipeline::connect_target(&config).await?;
            let (report, path) =
                pipeline::verify_stage(&reader, &target, &analysis, &config, ctx).await?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nVerification Summary:");
                for table in &report.tables {
                    let status = match (&table.error, table.matches) {
                        (Some(err), _) => format!("✗ Error: {}", err),
                        (None, true) => "✓ Match".to_string(),
                        (None, false) => "✗ Differs".to_string(),
                    };
                    println!(
                        "  {} {} (source: {}, target: {})",
                        status, table.table, table.source_rows, table.target_rows
                    );
                }
                println!("  Run ID: {}", ctx.run_id());
                println!("  Tables matched: {}", report.matched);
                println!("  Tables with differences: {}", report.mismatched);
                println!("  Errors: {}", report.errors);
                println!("  Report: {}", path.display());
            }

            if strict {
                report.ensure_match()?;
            }
        }

        Commands::Consolidate { target_dsn } => {
            if target_dsn.is_some() {
                config.target.dsn = target_dsn;
            }
            config.validate()?;

            let target = pipeline::connect_target(&config).await?;
            let report = pipeline::consolidate_stage(&target, &config, ctx).await?;
            let path = config
                .artifact_writer()
                .write_json(ANALYSIS_DIR, "consolidation_report", &report)?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nConsolidation completed!");
                for rule in &report.rules {
                    println!(
                        "  {}: {:?}, {} groups merged, {} rows deleted",
                        rule.table, rule.status, rule.groups_merged, rule.rows_deleted
                    );
                }
                println!("  Run ID: {}", ctx.run_id());
                println!("  Report: {}", path.display());
            }
        }

        Commands::ResetSequences { target_dsn } => {
            if target_dsn.is_some() {
                config.target.dsn = target_dsn;
            }
            config.validate()?;

            let target = pipeline::connect_target(&config).await?;
            let report = SequenceReconciler::new(&target, &config.target.schema)
                .run(ctx)
                .await?;
            let path = config
                .artifact_writer()
                .write_json(ANALYSIS_DIR, "sequence_report", &report)?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nSequence reset completed!");
                println!("  Run ID: {}", ctx.run_id());
                println!("  Advanced: {}", report.count(SequenceStatus::Advanced));
                println!("  Unchanged: {}", report.count(SequenceStatus::Unchanged));
                println!("  Empty: {}", report.count(SequenceStatus::SkippedEmpty));
                println!("  Failed: {}", report.count(SequenceStatus::Failed));
                println!("  Report: {}", path.display());
            }
        }

        Commands::Startup => {
            config.validate()?;
            let (report, path) = Pipeline::new(config).run_startup(ctx).await?;

            if output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nStartup pipeline {}!", report.status);
                println!("  Run ID: {}", report.run_id);
                println!("  Duration: {:.2}s", report.duration_seconds);
                if let Some(outcome) = &report.migrate {
                    println!("  Rows: {}", outcome.migration.total_rows);
                }
                if let Some(verification) = &report.verification {
                    println!(
                        "  Verification: {} matched, {} differ",
                        verification.matched, verification.mismatched
                    );
                }
                println!("  Report: {}", path.display());
            }
        }
    }

    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("invalid verbosity '{}'", other)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("invalid log format '{}', expected text or json", other)),
    }

    Ok(())
}

