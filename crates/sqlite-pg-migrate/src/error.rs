//! Error type shared by every stage, with the CLI exit code for each kind.

use thiserror::Error;

/// Everything that can stop a command.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Invalid or incomplete configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite source connection or query error
    #[error("Source database error: {0}")]
    Source(#[from] sqlx::Error),

    /// PostgreSQL target connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Pool checkout or pool construction failed
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// The source file could not be introspected at all
    #[error("Schema introspection failed: {0}")]
    SchemaIntrospection(String),

    /// Target database could not be provisioned
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// Row copy failed for a table
    #[error("Transfer failed for table {table}: {message}")]
    Transfer { table: String, message: String },

    /// Duplicate consolidation failed for a specific table
    #[error("Consolidation failed for table {table}: {message}")]
    Consolidation { table: String, message: String },

    /// A sequence could not be reconciled
    #[error("Sequence reset failed for {sequence}: {message}")]
    SequenceReset { sequence: String, message: String },

    /// Verification found tables whose contents differ
    #[error("Verification mismatch in {0} table(s)")]
    VerificationMismatch(usize),

    /// Reading a script or writing an artifact failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed config file
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Report serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrateError {
    /// Pool error tagged with the step that needed a connection.
    pub fn pool(message: impl std::fmt::Display, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    pub fn transfer(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transfer {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn consolidation(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Consolidation {
            table: table.into(),
            message: message.into(),
        }
    }

    pub fn sequence(sequence: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::SequenceReset {
            sequence: sequence.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 1,
            MigrateError::Source(_) | MigrateError::Target(_) | MigrateError::Pool { .. } => 2,
            MigrateError::SchemaIntrospection(_) => 3,
            MigrateError::Transfer { .. } => 4,
            MigrateError::Consolidation { .. } => 5,
            MigrateError::VerificationMismatch(_) => 6,
            MigrateError::Io(_) => 7,
            MigrateError::Provisioning(_)
            | MigrateError::SequenceReset { .. }
            | MigrateError::Json(_) => 8,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigrateError>;
