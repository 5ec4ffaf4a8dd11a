//! PostgreSQL target.
//!
//! Pooled connections through deadpool-postgres, catalog lookups used by the
//! migrator and the verifier, and the batched `INSERT` writer.

pub mod coerce;
pub mod tls;

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Transaction};
use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Config as PgConfig;
use tracing::{debug, info};

use crate::config::{redact_dsn, TransactionScope};
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::traits::{TargetColumn, TargetWriter, WriteJob};
use crate::core::value::{Batch, SqlValue};
use crate::error::{MigrateError, Result};

pub use tls::SslMode;

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// PostgreSQL's limit on bind parameters in one statement.
const MAX_BIND_PARAMS: usize = 65_535;

/// Pooled PostgreSQL connection.
#[derive(Clone)]
pub struct PgTarget {
    pool: Pool,
}

impl PgTarget {
    /// Connect to a PostgreSQL DSN and verify the connection.
    pub async fn connect(dsn: &str, max_conns: usize) -> Result<Self> {
        let (stripped, ssl_mode) = tls::split_ssl_mode(dsn)?;
        let mut pg_config: PgConfig = stripped
            .parse()
            .map_err(|e| MigrateError::Config(format!("invalid DSN {}: {}", redact_dsn(dsn), e)))?;

        pg_config.ssl_mode(ssl_mode.wire_mode());
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        if pg_config.get_connect_timeout().is_none() {
            pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);
        }

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let pool = match tls::connector(ssl_mode)? {
            None => {
                let mgr = Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns.max(1))
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?
            }
            Some(tls_connector) => {
                let mgr = Manager::from_config(pg_config, tls_connector, mgr_config);
                Pool::builder(mgr)
                    .max_size(max_conns.max(1))
                    .build()
                    .map_err(|e| MigrateError::pool(e, "creating PostgreSQL pool"))?
            }
        };

        let client = pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "testing PostgreSQL connection"))?;
        client.simple_query("SELECT 1").await?;

        info!("Connected to PostgreSQL: {}", redact_dsn(dsn));

        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Check out a pooled connection.
    pub async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, "acquiring PostgreSQL connection"))
    }

    /// Run a script of one or more statements with the simple query protocol.
    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        let client = self.client().await?;
        client.batch_execute(sql).await?;
        Ok(())
    }

    /// Insert rows through a cached multi-row statement, returning the count.
    async fn insert_rows(
        tx: &Transaction<'_>,
        job: &WriteJob,
        insert_prefix: &str,
        rows: &[Vec<SqlValue>],
    ) -> Result<u64> {
        let ncols = job.columns.len();
        let rows_per_stmt = (MAX_BIND_PARAMS / ncols.max(1)).max(1);
        let mut written = 0u64;

        for chunk in rows.chunks(rows_per_stmt) {
            let sql = build_insert_sql(insert_prefix, ncols, chunk.len());
            let stmt = tx
                .prepare_cached(&sql)
                .await
                .map_err(|e| MigrateError::transfer(&job.table, e.to_string()))?;
            let types = stmt.params();

            let mut params: Vec<SqlValue> = Vec::with_capacity(chunk.len() * ncols);
            for (r, row) in chunk.iter().enumerate() {
                if row.len() != ncols {
                    return Err(MigrateError::transfer(
                        &job.table,
                        format!("row has {} values, expected {}", row.len(), ncols),
                    ));
                }
                for (c, value) in row.iter().enumerate() {
                    let coerced = coerce::coerce(value, &types[r * ncols + c]).map_err(|e| {
                        MigrateError::transfer(&job.table, format!("column {}: {}", job.columns[c], e))
                    })?;
                    params.push(coerced);
                }
            }

            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            written += tx
                .execute(&stmt, &refs)
                .await
                .map_err(|e| MigrateError::transfer(&job.table, e.to_string()))?;
        }

        Ok(written)
    }
}

/// Build `INSERT ... VALUES ($1, $2), ($3, $4)` for `rows` rows.
pub fn build_insert_sql(prefix: &str, ncols: usize, rows: usize) -> String {
    let mut sql = String::with_capacity(prefix.len() + rows * ncols * 6);
    sql.push_str(prefix);
    for r in 0..rows {
        if r > 0 {
            sql.push_str(", ");
        }
        sql.push('(');
        for c in 0..ncols {
            if c > 0 {
                sql.push_str(", ");
            }
            sql.push('$');
            sql.push_str(&(r * ncols + c + 1).to_string());
        }
        sql.push(')');
    }
    sql
}

fn insert_prefix(job: &WriteJob) -> Result<String> {
    let cols = job
        .columns
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?
        .join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ",
        qualify_pg(&job.schema, &job.table)?,
        cols
    ))
}

/// Receive the next batch, mapping stream errors onto the table.
async fn next_batch(
    batches: &mut mpsc::Receiver<Result<Batch>>,
    table: &str,
) -> Result<Option<Batch>> {
    match batches.recv().await {
        Some(Ok(batch)) => Ok(Some(batch)),
        Some(Err(e)) => Err(MigrateError::transfer(table, format!("reading source: {}", e))),
        None => Ok(None),
    }
}

#[async_trait]
impl TargetWriter for PgTarget {
    async fn table_columns(&self, schema: &str, table: &str) -> Result<Option<Vec<TargetColumn>>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT column_name::text, data_type::text FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.iter()
                .map(|r| TargetColumn {
                    name: r.get(0),
                    data_type: r.get(1),
                })
                .collect(),
        ))
    }

    async fn has_rows(&self, schema: &str, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let sql = format!("SELECT EXISTS (SELECT 1 FROM {})", qualify_pg(schema, table)?);
        let row = client.query_one(&sql, &[]).await?;
        Ok(row.get(0))
    }

    async fn write_table(
        &self,
        job: WriteJob,
        mut batches: mpsc::Receiver<Result<Batch>>,
    ) -> Result<u64> {
        let prefix = insert_prefix(&job)?;
        let mut client = self.client().await?;
        let mut total = 0u64;

        match job.scope {
            TransactionScope::Table => {
                let tx = client.transaction().await?;
                while let Some(batch) = next_batch(&mut batches, &job.table).await? {
                    total += Self::insert_rows(&tx, &job, &prefix, &batch.rows).await?;
                    debug!("{}: {} rows written", job.table, total);
                    if batch.is_last {
                        break;
                    }
                }
                tx.commit().await?;
            }
            TransactionScope::Batch => {
                while let Some(batch) = next_batch(&mut batches, &job.table).await? {
                    if !batch.is_empty() {
                        let tx = client.transaction().await?;
                        total += Self::insert_rows(&tx, &job, &prefix, &batch.rows).await?;
                        tx.commit().await?;
                        debug!("{}: {} rows committed", job.table, total);
                    }
                    if batch.is_last {
                        break;
                    }
                }
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_insert_sql() {
        let sql = build_insert_sql("INSERT INTO t (a, b) VALUES ", 2, 2);
        assert_eq!(sql, "INSERT INTO t (a, b) VALUES ($1, $2), ($3, $4)");
    }

    #[test]
    fn test_insert_prefix_quotes_identifiers() {
        let job = WriteJob {
            schema: "public".to_string(),
            table: "order_items".to_string(),
            columns: vec!["id".to_string(), "unit_price".to_string()],
            scope: TransactionScope::Table,
        };
        assert_eq!(
            insert_prefix(&job).unwrap(),
            "INSERT INTO \"public\".\"order_items\" (\"id\", \"unit_price\") VALUES "
        );
    }

    #[test]
    fn test_bind_param_cap() {
        let ncols = 9;
        let rows_per_stmt = MAX_BIND_PARAMS / ncols;
        assert!(rows_per_stmt * ncols <= MAX_BIND_PARAMS);
        assert!((rows_per_stmt + 1) * ncols > MAX_BIND_PARAMS);
    }
}
