//! Core traits at the seams between the engine and the two databases.
//!
//! - [`SourceReader`]: streams rows out of the source store
//! - [`TargetWriter`]: inspects the target and writes rows into it
//!
//! The migrator only talks to these traits, so it can be driven against an
//! in-memory target in tests.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TransactionScope;
use crate::error::Result;

use super::value::Batch;

/// Options for reading rows from a table.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Table name.
    pub table: String,
    /// Columns to read, in output order.
    pub columns: Vec<String>,
    /// Columns defining a stable row order (empty means engine row id).
    pub order_by: Vec<String>,
    /// Number of rows per batch.
    pub batch_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            table: String::new(),
            columns: Vec::new(),
            order_by: Vec::new(),
            batch_size: 1000,
        }
    }
}

/// Read data from a source database.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Count the rows of a table.
    async fn row_count(&self, table: &str) -> Result<i64>;

    /// Start streaming rows from a table.
    ///
    /// The reader spawns a background task that fills the channel, so a slow
    /// writer applies backpressure instead of buffering the table in memory.
    /// The final batch has `is_last` set; an error ends the stream.
    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>>;
}

/// A column as it exists in the target catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetColumn {
    /// Column name.
    pub name: String,
    /// `information_schema.columns.data_type`.
    pub data_type: String,
}

/// Everything a writer needs to copy one table.
#[derive(Debug, Clone)]
pub struct WriteJob {
    /// Target schema.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Columns written, matching the order of values in each row.
    pub columns: Vec<String>,
    /// Transaction boundary.
    pub scope: TransactionScope,
}

/// Write data to a target database.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Columns of a target table, or `None` when the table does not exist.
    async fn table_columns(&self, schema: &str, table: &str) -> Result<Option<Vec<TargetColumn>>>;

    /// Whether a target table holds at least one row.
    async fn has_rows(&self, schema: &str, table: &str) -> Result<bool>;

    /// Drain the batch stream into the target table, returning rows written.
    ///
    /// A failed batch rolls back the open transaction and ends the copy with
    /// an error.
    async fn write_table(&self, job: WriteJob, batches: mpsc::Receiver<Result<Batch>>)
        -> Result<u64>;
}
