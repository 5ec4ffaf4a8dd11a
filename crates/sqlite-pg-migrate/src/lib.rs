//! # sqlite-pg-migrate
//!
//! Moves an application's SQLite database into PostgreSQL.
//!
//! The library covers the whole path from a SQLite file to a verified
//! PostgreSQL schema:
//!
//! - **Introspection** of tables, columns, keys and indexes, with a
//!   foreign-key ordered copy plan and generated PostgreSQL DDL
//! - **Provisioning** of the target database
//! - **Data migration** in batches, guarded by an emptiness check so a run can
//!   be repeated safely
//! - **Duplicate consolidation** ahead of new unique indexes
//! - **Sequence reconciliation** after explicit ids were copied
//! - **Integrity verification** through per-table folded row digests
//!
//! Every stage writes a timestamped JSON artifact; nothing is overwritten.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sqlite_pg_migrate::{Config, Pipeline, RunContext};
//!
//! #[tokio::main]
//! async fn main() -> sqlite_pg_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let ctx = RunContext::new("startup");
//!     let (report, path) = Pipeline::new(config).run_startup(&ctx).await?;
//!     println!("{} -> {}", report.status, path.display());
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod artifacts;
pub mod config;
pub mod consolidate;
pub mod core;
pub mod error;
pub mod introspect;
pub mod pipeline;
pub mod plan;
pub mod provision;
pub mod run;
pub mod sequences;
pub mod source;
pub mod target;
pub mod transfer;
pub mod typemap;
pub mod verify;

// Re-exports for convenient access
pub use artifacts::ArtifactWriter;
pub use config::{Config, ConsolidationRule, MigrationConfig, SourceConfig, TargetConfig, TransactionScope};
pub use consolidate::{ConsolidationReport, DuplicateConsolidator};
pub use error::{MigrateError, Result};
pub use introspect::{Analysis, SchemaIntrospector};
pub use pipeline::{MigrateOutcome, Pipeline, PipelineReport};
pub use plan::MigrationPlan;
pub use provision::{DatabaseProvisioner, ProvisionOutcome};
pub use run::RunContext;
pub use sequences::{SequenceReconciler, SequenceReport};
pub use source::SqliteReader;
pub use target::PgTarget;
pub use transfer::{DataMigrator, MigrationReport, MigrationStatus};
pub use verify::{IntegrityReport, IntegrityVerifier};
