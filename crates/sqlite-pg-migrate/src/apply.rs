//! Apply an SQL script to the target.

use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::Result;
use crate::target::PgTarget;

/// Record of an applied script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub run_id: String,
    pub file: String,
    /// SHA-256 of the script contents.
    pub sha256: String,
    pub bytes: usize,
    pub applied_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Execute every statement in `path` with the simple query protocol.
///
/// The script runs as sent: statements outside an explicit transaction
/// commit one by one.
pub async fn apply_sql_file(target: &PgTarget, path: &Path, run_id: &str) -> Result<ApplyReport> {
    let sql = std::fs::read_to_string(path)?;
    let start = Instant::now();

    target.batch_execute(&sql).await?;

    let report = ApplyReport {
        run_id: run_id.to_string(),
        file: path.display().to_string(),
        sha256: hex::encode(Sha256::digest(sql.as_bytes())),
        bytes: sql.len(),
        applied_at: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!("Applied {} ({} bytes)", report.file, report.bytes);
    Ok(report)
}
