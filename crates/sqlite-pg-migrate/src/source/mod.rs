//! SQLite source reader.
//!
//! Opens the source file read-only through an SQLx pool, exposes the catalog
//! queries the introspector needs and streams table rows in batches.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::identifier::quote_sqlite;
use crate::core::traits::{ReadOptions, SourceReader};
use crate::core::value::{Batch, SqlValue};
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Batches buffered between the reader task and the writer.
const CHANNEL_CAPACITY: usize = 4;

/// A catalog object listed in `sqlite_master`.
#[derive(Debug, Clone)]
pub struct CatalogObject {
    pub name: String,
    pub object_type: String,
    pub sql: Option<String>,
}

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    pub pk: i64,
}

/// One row of `PRAGMA index_list` joined with its `PRAGMA index_info`.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub origin: String,
    pub columns: Vec<String>,
}

/// One row of `PRAGMA foreign_key_list`.
#[derive(Debug, Clone)]
pub struct ForeignKeyInfo {
    pub id: i64,
    pub seq: i64,
    pub table: String,
    pub from: String,
    pub to: Option<String>,
    pub on_update: String,
    pub on_delete: String,
}

/// SQLite source reader.
#[derive(Clone)]
pub struct SqliteReader {
    pool: SqlitePool,
}

impl SqliteReader {
    /// Open a SQLite file read-only.
    ///
    /// A missing file is reported as an introspection failure rather than
    /// silently creating an empty database.
    pub async fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MigrateError::SchemaIntrospection(format!(
                "source database not found: {}",
                path.display()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| MigrateError::pool(e, "opening SQLite source"))?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| MigrateError::SchemaIntrospection(format!("{}: {}", path.display(), e)))?;

        info!("Opened SQLite source: {}", path.display());

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// List user tables and views, skipping SQLite's internal objects.
    pub async fn list_objects(&self) -> Result<Vec<CatalogObject>> {
        let rows: Vec<SqliteRow> = sqlx::query(
            "SELECT name, type, sql FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(CatalogObject {
                    name: row.try_get("name")?,
                    object_type: row.try_get("type")?,
                    sql: row.try_get("sql")?,
                })
            })
            .collect()
    }

    /// Load column definitions.
    pub async fn table_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let query = format!("PRAGMA table_info({})", quote_sqlite(table)?);
        let rows: Vec<SqliteRow> = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(ColumnInfo {
                    cid: row.try_get("cid")?,
                    name: row.try_get("name")?,
                    declared_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
                    not_null: row.try_get::<i64, _>("notnull")? != 0,
                    default: row.try_get("dflt_value")?,
                    pk: row.try_get("pk")?,
                })
            })
            .collect()
    }

    /// Load index definitions with their column lists.
    pub async fn index_list(&self, table: &str) -> Result<Vec<IndexInfo>> {
        let query = format!("PRAGMA index_list({})", quote_sqlite(table)?);
        let rows: Vec<SqliteRow> = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let info_query = format!("PRAGMA index_info({})", quote_sqlite(&name)?);
            let info_rows: Vec<SqliteRow> =
                sqlx::query(&info_query).fetch_all(&self.pool).await?;

            // Expression columns have no name and cannot be recreated here.
            let columns: Vec<String> = info_rows
                .iter()
                .map(|r| r.try_get::<Option<String>, _>("name"))
                .collect::<std::result::Result<Vec<_>, _>>()?
                .into_iter()
                .flatten()
                .collect();

            indexes.push(IndexInfo {
                name,
                unique: row.try_get::<i64, _>("unique")? != 0,
                origin: row.try_get("origin")?,
                columns,
            });
        }
        Ok(indexes)
    }

    /// Load foreign key rows, one per column pair.
    pub async fn foreign_key_list(&self, table: &str) -> Result<Vec<ForeignKeyInfo>> {
        let query = format!("PRAGMA foreign_key_list({})", quote_sqlite(table)?);
        let rows: Vec<SqliteRow> = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                Ok(ForeignKeyInfo {
                    id: row.try_get("id")?,
                    seq: row.try_get("seq")?,
                    table: row.try_get("table")?,
                    from: row.try_get("from")?,
                    to: row.try_get("to")?,
                    on_update: row.try_get("on_update")?,
                    on_delete: row.try_get("on_delete")?,
                })
            })
            .collect()
    }

    /// Build the ordered SELECT used for streaming a table.
    pub fn select_sql(opts: &ReadOptions) -> Result<String> {
        let col_list = opts
            .columns
            .iter()
            .map(|c| quote_sqlite(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let order = if opts.order_by.is_empty() {
            "rowid".to_string()
        } else {
            opts.order_by
                .iter()
                .map(|c| quote_sqlite(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        Ok(format!(
            "SELECT {} FROM {} ORDER BY {}",
            col_list,
            quote_sqlite(&opts.table)?,
            order
        ))
    }

    /// Convert a row by the storage class of each value.
    ///
    /// SQLite's declared types are advisory, so the runtime class is the only
    /// reliable guide to what a cell holds.
    pub fn row_to_values(row: &SqliteRow) -> Result<Vec<SqlValue>> {
        (0..row.len())
            .map(|i| {
                let raw = row.try_get_raw(i)?;
                if raw.is_null() {
                    return Ok(SqlValue::Null);
                }
                let class = raw.type_info().name().to_string();
                let value = match class.as_str() {
                    "INTEGER" => SqlValue::I64(row.try_get_unchecked::<i64, _>(i)?),
                    "REAL" => SqlValue::F64(row.try_get_unchecked::<f64, _>(i)?),
                    "BLOB" => SqlValue::Bytes(row.try_get_unchecked::<Vec<u8>, _>(i)?),
                    _ => SqlValue::Text(row.try_get_unchecked::<String, _>(i)?),
                };
                Ok(value)
            })
            .collect()
    }

    async fn read_table_impl(
        pool: SqlitePool,
        opts: ReadOptions,
        tx: mpsc::Sender<Result<Batch>>,
    ) -> Result<()> {
        let sql = Self::select_sql(&opts)?;
        debug!("{}: {}", opts.table, sql);

        let batch_size = opts.batch_size.max(1);
        let mut rows = sqlx::query(&sql).fetch(&pool);
        let mut buffer = Vec::with_capacity(batch_size);

        while let Some(row) = rows.try_next().await? {
            buffer.push(Self::row_to_values(&row)?);
            if buffer.len() >= batch_size {
                let batch = Batch::new(std::mem::take(&mut buffer), false);
                if tx.send(Ok(batch)).await.is_err() {
                    // Receiver dropped, the writer has given up on this table.
                    return Ok(());
                }
            }
        }

        let _ = tx.send(Ok(Batch::new(buffer, true))).await;
        Ok(())
    }
}

#[async_trait]
impl SourceReader for SqliteReader {
    async fn row_count(&self, table: &str) -> Result<i64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_sqlite(table)?);
        let count: i64 = sqlx::query_scalar(&query).fetch_one(&self.pool).await?;
        Ok(count)
    }

    fn read_table(&self, opts: ReadOptions) -> mpsc::Receiver<Result<Batch>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let result = Self::read_table_impl(pool, opts, tx.clone()).await;
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
        });

        rx
    }
}
