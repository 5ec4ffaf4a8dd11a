//! Sequence reconciliation.
//!
//! Rows copied with explicit ids leave serial sequences at their start value.
//! Each sequence behind a `nextval` default or identity column is moved past
//! the column's current maximum. Sequences only ever move forward.

use deadpool_postgres::Object;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};

use crate::core::identifier::{qualify_pg, quote_pg};
use crate::error::{MigrateError, Result};
use crate::run::RunContext;
use crate::target::PgTarget;

const SERIAL_COLUMNS_SQL: &str = "\
SELECT c.table_name::text, c.column_name::text, c.column_default::text,
       pg_get_serial_sequence(quote_ident(c.table_schema) || '.' || quote_ident(c.table_name),
                              c.column_name)::text
FROM information_schema.columns c
JOIN information_schema.tables t
  ON t.table_schema = c.table_schema AND t.table_name = c.table_name
WHERE c.table_schema = $1
  AND t.table_type = 'BASE TABLE'
  AND (c.column_default LIKE 'nextval%' OR c.is_identity = 'YES')
ORDER BY c.table_name, c.column_name";

/// What reconciliation does with one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceAction {
    /// The column holds no values.
    SkipEmpty,
    /// The next value is already past the maximum.
    Unchanged,
    /// `setval(seq, max, true)`.
    Advance(i64),
}

/// Decide how to move a sequence given the column maximum and its state.
pub fn decide(max: Option<i64>, last_value: i64, is_called: bool) -> SequenceAction {
    let Some(max) = max else {
        return SequenceAction::SkipEmpty;
    };
    let next = if is_called {
        last_value.saturating_add(1)
    } else {
        last_value
    };
    if next > max {
        SequenceAction::Unchanged
    } else {
        SequenceAction::Advance(max)
    }
}

/// Result for one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Advanced,
    Unchanged,
    SkippedEmpty,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceOutcome {
    pub table: String,
    pub column: String,
    pub sequence: Option<String>,
    pub status: SequenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    /// Value `nextval` returns after reconciliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    pub run_id: String,
    pub sequences: Vec<SequenceOutcome>,
}

impl SequenceReport {
    /// Number of sequences with the given status.
    pub fn count(&self, status: SequenceStatus) -> usize {
        self.sequences.iter().filter(|s| s.status == status).count()
    }
}

/// A serial or identity column found in the target catalog.
#[derive(Debug, Clone)]
struct SerialColumn {
    table: String,
    column: String,
    default: Option<String>,
    sequence: Option<String>,
}

/// Aligns sequences with the data copied into the target schema.
pub struct SequenceReconciler<'a> {
    target: &'a PgTarget,
    schema: String,
}

impl<'a> SequenceReconciler<'a> {
    pub fn new(target: &'a PgTarget, schema: impl Into<String>) -> Self {
        Self {
            target,
            schema: schema.into(),
        }
    }

    /// Reconcile every sequence in the schema.
    ///
    /// Listing the sequences must succeed; after that each sequence is handled
    /// on its own and a failure is recorded without stopping the others.
    pub async fn run(&self, ctx: &RunContext) -> Result<SequenceReport> {
        async {
            let columns = self.serial_columns().await?;
            info!("Reconciling {} sequences", columns.len());

            let mut outcomes = Vec::with_capacity(columns.len());
            for col in columns {
                let outcome = match self.reconcile(&col).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("{}.{}: {}", col.table, col.column, e);
                        SequenceOutcome {
                            table: col.table,
                            column: col.column,
                            sequence: col.sequence,
                            status: SequenceStatus::Failed,
                            max_value: None,
                            next_value: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                outcomes.push(outcome);
            }

            Ok(SequenceReport {
                run_id: ctx.run_id().to_string(),
                sequences: outcomes,
            })
        }
        .instrument(ctx.stage("reset_sequences"))
        .await
    }

    async fn serial_columns(&self) -> Result<Vec<SerialColumn>> {
        let client = self.target.client().await?;
        Ok(client
            .query(SERIAL_COLUMNS_SQL, &[&self.schema])
            .await?
            .iter()
            .map(|row| SerialColumn {
                table: row.get(0),
                column: row.get(1),
                default: row.get(2),
                sequence: row.get(3),
            })
            .collect())
    }

    async fn reconcile(&self, col: &SerialColumn) -> Result<SequenceOutcome> {
        let sequence = col
            .sequence
            .clone()
            .or_else(|| col.default.as_deref().and_then(sequence_from_default))
            .ok_or_else(|| MigrateError::sequence(&col.column, "no backing sequence"))?;
        let seq_err = |e: tokio_postgres::Error| MigrateError::sequence(&sequence, e.to_string());

        let client = self.target.client().await?;

        let max_sql = format!(
            "SELECT MAX({})::bigint FROM {}",
            quote_pg(&col.column)?,
            qualify_pg(&self.schema, &col.table)?
        );
        let max: Option<i64> = client.query_one(&max_sql, &[]).await.map_err(seq_err)?.get(0);

        let (last_value, is_called) = read_sequence_state(&client, &sequence).await?;

        let (status, next_value) = match decide(max, last_value, is_called) {
            SequenceAction::SkipEmpty => {
                info!("{}.{}: empty, {} left as is", col.table, col.column, sequence);
                (SequenceStatus::SkippedEmpty, None)
            }
            SequenceAction::Unchanged => {
                let next = if is_called { last_value + 1 } else { last_value };
                (SequenceStatus::Unchanged, Some(next))
            }
            SequenceAction::Advance(value) => {
                client
                    .query_one("SELECT setval($1::text::regclass, $2, true)", &[&sequence, &value])
                    .await
                    .map_err(seq_err)?;
                info!("{}: advanced to {}", sequence, value);
                (SequenceStatus::Advanced, Some(value + 1))
            }
        };

        Ok(SequenceOutcome {
            table: col.table.clone(),
            column: col.column.clone(),
            sequence: Some(sequence),
            status,
            max_value: max,
            next_value,
            error: None,
        })
    }
}

async fn read_sequence_state(client: &Object, sequence: &str) -> Result<(i64, bool)> {
    // The name comes from the catalog, already quoted and qualified.
    let row = client
        .query_one(&format!("SELECT last_value, is_called FROM {}", sequence), &[])
        .await
        .map_err(|e| MigrateError::sequence(sequence, e.to_string()))?;
    Ok((row.get(0), row.get(1)))
}

/// Extract the sequence name from a `nextval('name'::regclass)` default.
fn sequence_from_default(default: &str) -> Option<String> {
    let rest = default.strip_prefix("nextval('")?;
    let end = rest.find("'::regclass").or_else(|| rest.find('\''))?;
    Some(rest[..end].replace("''", "'"))
}
