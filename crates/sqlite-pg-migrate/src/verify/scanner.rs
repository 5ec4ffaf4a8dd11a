//! Ordered table scans for verification.
//!
//! Each store gets its own SQL and decoding; nothing here goes through the
//! migrator's reader or writer.

use async_trait::async_trait;
use futures::{pin_mut, TryStreamExt};
use sqlx::sqlite::SqlitePool;
use sqlx::{Row, TypeInfo, ValueRef};
use tokio_postgres::types::{ToSql, Type};

use crate::core::identifier::{qualify_pg, quote_pg, quote_sqlite};
use crate::error::Result;
use crate::target::PgTarget;

/// A scanned value in one of SQLite's storage classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// What to scan from one table.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub table: String,
    pub columns: Vec<String>,
    /// Target catalog type per column (`information_schema` `data_type`).
    pub pg_types: Vec<String>,
    /// Ordering columns; empty means the engine row id.
    pub order_by: Vec<String>,
}

/// Streams the rows of a table, in order, into a callback.
#[async_trait]
pub trait RowScanner: Send + Sync {
    /// Scan the table, returning the number of rows seen.
    async fn scan(&self, spec: &ScanSpec, sink: &mut (dyn FnMut(Vec<Cell>) + Send)) -> Result<u64>;
}

/// Scans the source file.
pub struct SqliteScanner {
    pool: SqlitePool,
}

impl SqliteScanner {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn sql(spec: &ScanSpec) -> Result<String> {
        let cols = spec
            .columns
            .iter()
            .map(|c| quote_sqlite(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let order = if spec.order_by.is_empty() {
            "rowid".to_string()
        } else {
            spec.order_by
                .iter()
                .map(|c| quote_sqlite(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };
        Ok(format!(
            "SELECT {} FROM {} ORDER BY {}",
            cols,
            quote_sqlite(&spec.table)?,
            order
        ))
    }
}

#[async_trait]
impl RowScanner for SqliteScanner {
    async fn scan(&self, spec: &ScanSpec, sink: &mut (dyn FnMut(Vec<Cell>) + Send)) -> Result<u64> {
        let sql = Self::sql(spec)?;
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut seen = 0u64;

        while let Some(row) = rows.try_next().await? {
            let mut cells = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                let raw = row.try_get_raw(i)?;
                let cell = if raw.is_null() {
                    Cell::Null
                } else {
                    match raw.type_info().name() {
                        "INTEGER" => Cell::Integer(row.try_get_unchecked(i)?),
                        "REAL" => Cell::Real(row.try_get_unchecked(i)?),
                        "BLOB" => Cell::Bytes(row.try_get_unchecked(i)?),
                        _ => Cell::Text(row.try_get_unchecked(i)?),
                    }
                };
                cells.push(cell);
            }
            sink(cells);
            seen += 1;
        }

        Ok(seen)
    }
}

/// Scans the target schema.
pub struct PgScanner<'a> {
    target: &'a PgTarget,
    schema: String,
}

impl<'a> PgScanner<'a> {
    pub fn new(target: &'a PgTarget, schema: impl Into<String>) -> Self {
        Self {
            target,
            schema: schema.into(),
        }
    }

    /// Every column is read as text except bytea; timestamptz is shifted to
    /// UTC first. Text ordering columns use byte order to match SQLite.
    fn sql(schema: &str, spec: &ScanSpec) -> Result<String> {
        let mut select = Vec::with_capacity(spec.columns.len());
        for (name, pg_type) in spec.columns.iter().zip(&spec.pg_types) {
            let col = quote_pg(name)?;
            select.push(match pg_type.as_str() {
                "bytea" => col,
                "timestamp with time zone" => format!("({} AT TIME ZONE 'UTC')::text", col),
                _ => format!("{}::text", col),
            });
        }

        let order = if spec.order_by.is_empty() {
            "ctid".to_string()
        } else {
            let mut keys = Vec::with_capacity(spec.order_by.len());
            for key in &spec.order_by {
                let textual = spec
                    .columns
                    .iter()
                    .position(|c| c == key)
                    .and_then(|i| spec.pg_types.get(i))
                    .map(|t| matches!(t.as_str(), "text" | "character varying" | "character"))
                    .unwrap_or(false);
                let col = quote_pg(key)?;
                keys.push(if textual {
                    format!("{} COLLATE \"C\"", col)
                } else {
                    col
                });
            }
            keys.join(", ")
        };

        Ok(format!(
            "SELECT {} FROM {} ORDER BY {}",
            select.join(", "),
            qualify_pg(schema, &spec.table)?,
            order
        ))
    }
}

#[async_trait]
impl RowScanner for PgScanner<'_> {
    async fn scan(&self, spec: &ScanSpec, sink: &mut (dyn FnMut(Vec<Cell>) + Send)) -> Result<u64> {
        let sql = Self::sql(&self.schema, spec)?;
        let client = self.target.client().await?;
        let stream = client
            .query_raw(sql.as_str(), std::iter::empty::<&(dyn ToSql + Sync)>())
            .await?;
        pin_mut!(stream);

        let mut seen = 0u64;
        while let Some(row) = stream.try_next().await? {
            let mut cells = Vec::with_capacity(row.len());
            for (i, column) in row.columns().iter().enumerate() {
                let cell = if *column.type_() == Type::BYTEA {
                    row.try_get::<_, Option<Vec<u8>>>(i)?.map(Cell::Bytes)
                } else {
                    row.try_get::<_, Option<String>>(i)?.map(Cell::Text)
                };
                cells.push(cell.unwrap_or(Cell::Null));
            }
            sink(cells);
            seen += 1;
        }

        Ok(seen)
    }
}
