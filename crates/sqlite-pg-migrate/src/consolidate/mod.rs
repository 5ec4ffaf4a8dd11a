//! Duplicate line-item consolidation.
//!
//! The source store allows several rows per logical key (for example the same
//! slipper twice in one order). Before the target's unique index can be
//! created those rows are merged into the row with the lowest primary key:
//! quantities are summed, the highest observed unit price wins, and the line
//! total is recomputed. The price rule is a data-repair heuristic.

use std::collections::HashSet;
use std::time::Instant;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_postgres::types::ToSql;
use tracing::{debug, info, Instrument};

use crate::config::ConsolidationRule;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::traits::TargetWriter;
use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};
use crate::introspect::ddl::unique_index_sql;
use crate::run::RunContext;
use crate::target::PgTarget;

/// A row as seen by the consolidator.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub pk: i64,
    /// Key values rendered as text; `None` for NULL.
    pub key: Vec<Option<String>>,
    pub quantity: Option<i64>,
    pub price: Option<Decimal>,
}

/// The update applied to one duplicate group.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    /// Row that survives.
    pub keeper: i64,
    pub quantity: Option<i64>,
    pub price: Option<Decimal>,
    pub total: Option<Decimal>,
    /// Rows folded into the keeper.
    pub delete_ids: Vec<i64>,
}

/// Group rows by key and compute one merge per duplicate group.
///
/// Rows with a NULL key component never collide under a unique index and are
/// left alone. Merges come out in keeper order. A summed quantity or total
/// that overflows is a consolidation error.
pub fn plan_merges(rows: &[ItemRow], rule: &ConsolidationRule) -> Result<Vec<Merge>> {
    let mut sorted: Vec<&ItemRow> = rows.iter().filter(|r| r.key.iter().all(Option::is_some)).collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key).then(a.pk.cmp(&b.pk)));

    let mut merges = Vec::new();
    for group in sorted.chunk_by(|a, b| a.key == b.key) {
        if group.len() < 2 {
            continue;
        }
        let keeper = group[0];

        let quantity = match rule.quantity_column {
            Some(_) => Some(
                group
                    .iter()
                    .try_fold(0i64, |acc, r| acc.checked_add(r.quantity.unwrap_or(0)))
                    .ok_or_else(|| {
                        MigrateError::consolidation(
                            &rule.table,
                            format!("quantity sum overflows for keeper {}", keeper.pk),
                        )
                    })?,
            ),
            None => None,
        };
        let price = rule
            .price_column
            .as_ref()
            .and_then(|_| group.iter().filter_map(|r| r.price).max());
        let total = match (&rule.total_column, quantity, price) {
            (Some(_), Some(q), Some(p)) => {
                Some(Decimal::from(q).checked_mul(p).ok_or_else(|| {
                    MigrateError::consolidation(
                        &rule.table,
                        format!("line total overflows for keeper {}", keeper.pk),
                    )
                })?)
            }
            _ => None,
        };

        merges.push(Merge {
            keeper: keeper.pk,
            quantity,
            price,
            total,
            delete_ids: group[1..].iter().map(|r| r.pk).collect(),
        });
    }

    merges.sort_by_key(|m| m.keeper);
    Ok(merges)
}

/// What happened to one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Applied,
    Skipped,
}

/// Outcome of one consolidation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub table: String,
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub groups_merged: usize,
    pub rows_deleted: u64,
    pub index_created: bool,
    pub duration_ms: u64,
}

/// Outcome of all rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub run_id: String,
    pub rules: Vec<RuleOutcome>,
}

impl ConsolidationReport {
    /// Total rows removed across rules.
    pub fn rows_deleted(&self) -> u64 {
        self.rules.iter().map(|r| r.rows_deleted).sum()
    }
}

/// Applies consolidation rules to the target.
pub struct DuplicateConsolidator<'a> {
    target: &'a PgTarget,
    schema: String,
    create_indexes: bool,
}

impl<'a> DuplicateConsolidator<'a> {
    pub fn new(target: &'a PgTarget, schema: impl Into<String>, create_indexes: bool) -> Self {
        Self {
            target,
            schema: schema.into(),
            create_indexes,
        }
    }

    /// Apply every rule in order. The first failing rule aborts the stage.
    pub async fn run(&self, rules: &[ConsolidationRule], ctx: &RunContext) -> Result<ConsolidationReport> {
        async {
            let mut outcomes = Vec::with_capacity(rules.len());
            for rule in rules {
                outcomes.push(self.apply_rule(rule).await?);
            }
            Ok(ConsolidationReport {
                run_id: ctx.run_id().to_string(),
                rules: outcomes,
            })
        }
        .instrument(ctx.stage("consolidate"))
        .await
    }

    async fn apply_rule(&self, rule: &ConsolidationRule) -> Result<RuleOutcome> {
        let start = Instant::now();

        let Some(columns) = self.target.table_columns(&self.schema, &rule.table).await? else {
            info!("{}: table not present, consolidation skipped", rule.table);
            return Ok(RuleOutcome {
                table: rule.table.clone(),
                status: RuleStatus::Skipped,
                reason: Some("table not present".to_string()),
                groups_merged: 0,
                rows_deleted: 0,
                index_created: false,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        };

        let present: HashSet<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let missing: Vec<&str> = rule_columns(rule)
            .filter(|c| !present.contains(c))
            .collect();
        if !missing.is_empty() {
            return Err(MigrateError::consolidation(
                &rule.table,
                format!("missing columns: {}", missing.join(", ")),
            ));
        }

        let rows = self
            .load_rows(rule)
            .await
            .map_err(|e| MigrateError::consolidation(&rule.table, e.to_string()))?;
        let merges = plan_merges(&rows, rule)?;
        debug!("{}: {} rows, {} duplicate groups", rule.table, rows.len(), merges.len());

        let rows_deleted = self
            .apply_merges(rule, &merges)
            .await
            .map_err(|e| MigrateError::consolidation(&rule.table, e.to_string()))?;

        let mut index_created = false;
        if self.create_indexes {
            let sql = unique_index_sql(rule, &self.schema)?;
            self.target
                .batch_execute(&sql)
                .await
                .map_err(|e| MigrateError::consolidation(&rule.table, format!("{}: {}", sql, e)))?;
            index_created = true;
        }

        info!(
            "{}: merged {} groups, deleted {} rows",
            rule.table,
            merges.len(),
            rows_deleted
        );

        Ok(RuleOutcome {
            table: rule.table.clone(),
            status: RuleStatus::Applied,
            reason: None,
            groups_merged: merges.len(),
            rows_deleted,
            index_created,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn load_rows(&self, rule: &ConsolidationRule) -> Result<Vec<ItemRow>> {
        let mut select = vec![format!("{}::bigint", quote_pg(&rule.pk_column)?)];
        for key in &rule.key_columns {
            select.push(format!("{}::text", quote_pg(key)?));
        }
        select.push(match &rule.quantity_column {
            Some(q) => format!("{}::bigint", quote_pg(q)?),
            None => "NULL::bigint".to_string(),
        });
        select.push(match &rule.price_column {
            Some(p) => format!("{}::numeric", quote_pg(p)?),
            None => "NULL::numeric".to_string(),
        });

        let sql = format!(
            "SELECT {} FROM {}",
            select.join(", "),
            qualify_pg(&self.schema, &rule.table)?
        );
        let client = self.target.client().await?;
        let nkeys = rule.key_columns.len();

        Ok(client
            .query(&sql, &[])
            .await?
            .iter()
            .map(|row| ItemRow {
                pk: row.get(0),
                key: (0..nkeys).map(|i| row.get(1 + i)).collect(),
                quantity: row.get(1 + nkeys),
                price: row.get(2 + nkeys),
            })
            .collect())
    }

    /// Apply merges in a single transaction; returns rows deleted.
    async fn apply_merges(&self, rule: &ConsolidationRule, merges: &[Merge]) -> Result<u64> {
        if merges.is_empty() {
            return Ok(0);
        }

        let table = qualify_pg(&self.schema, &rule.table)?;
        let pk = quote_pg(&rule.pk_column)?;
        let mut client = self.target.client().await?;
        let tx = client.transaction().await?;

        let delete_sql = format!("DELETE FROM {} WHERE {} = ANY($1::bigint[])", table, pk);
        let mut deleted = 0u64;

        for merge in merges {
            let mut sets = Vec::new();
            let mut params: Vec<SqlValue> = Vec::new();
            if let (Some(col), Some(q)) = (&rule.quantity_column, merge.quantity) {
                params.push(SqlValue::I64(q));
                sets.push(format!("{} = ${}::bigint", quote_pg(col)?, params.len()));
            }
            if let (Some(col), Some(p)) = (&rule.price_column, merge.price) {
                params.push(SqlValue::Decimal(p));
                sets.push(format!("{} = ${}::numeric", quote_pg(col)?, params.len()));
            }
            if let (Some(col), Some(t)) = (&rule.total_column, merge.total) {
                params.push(SqlValue::Decimal(t));
                sets.push(format!("{} = ${}::numeric", quote_pg(col)?, params.len()));
            }

            if !sets.is_empty() {
                params.push(SqlValue::I64(merge.keeper));
                let sql = format!(
                    "UPDATE {} SET {} WHERE {} = ${}::bigint",
                    table,
                    sets.join(", "),
                    pk,
                    params.len()
                );
                let refs: Vec<&(dyn ToSql + Sync)> =
                    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
                tx.execute(&sql, &refs).await?;
            }

            deleted += tx.execute(&delete_sql, &[&merge.delete_ids]).await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }
}

fn rule_columns(rule: &ConsolidationRule) -> impl Iterator<Item = &str> {
    std::iter::once(rule.pk_column.as_str())
        .chain(rule.key_columns.iter().map(String::as_str))
        .chain(rule.quantity_column.as_deref())
        .chain(rule.price_column.as_deref())
        .chain(rule.total_column.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_consolidation_rules;
    use std::str::FromStr;

    fn order_rule() -> ConsolidationRule {
        default_consolidation_rules()
            .into_iter()
            .find(|r| r.table == "order_items")
            .unwrap()
    }

    fn cart_rule() -> ConsolidationRule {
        default_consolidation_rules()
            .into_iter()
            .find(|r| r.table == "cart_items")
            .unwrap()
    }

    fn item(pk: i64, a: i64, b: i64, qty: Option<i64>, price: Option<&str>) -> ItemRow {
        ItemRow {
            pk,
            key: vec![Some(a.to_string()), Some(b.to_string())],
            quantity: qty,
            price: price.map(|p| Decimal::from_str(p).unwrap()),
        }
    }

    #[test]
    fn test_order_items_merge() {
        let rows = vec![
            item(1, 10, 7, Some(2), Some("19.99")),
            item(2, 10, 7, Some(3), Some("21.50")),
            item(3, 11, 7, Some(1), Some("5.00")),
        ];
        let merges = plan_merges(&rows, &order_rule()).unwrap();

        assert_eq!(
            merges,
            vec![Merge {
                keeper: 1,
                quantity: Some(5),
                price: Some(Decimal::from_str("21.50").unwrap()),
                total: Some(Decimal::from_str("107.50").unwrap()),
                delete_ids: vec![2],
            }]
        );
    }

    #[test]
    fn test_keeper_is_lowest_pk_regardless_of_input_order() {
        let rows = vec![
            item(9, 1, 1, Some(1), Some("2.00")),
            item(4, 1, 1, Some(1), Some("3.00")),
            item(6, 1, 1, None, None),
        ];
        let merges = plan_merges(&rows, &order_rule()).unwrap();
        assert_eq!(merges.len(), 1);
        assert_eq!(merges[0].keeper, 4);
        assert_eq!(merges[0].delete_ids, vec![6, 9]);
        assert_eq!(merges[0].quantity, Some(2));
        assert_eq!(merges[0].total, Some(Decimal::from_str("6.00").unwrap()));
    }

    #[test]
    fn test_quantity_sum_is_preserved() {
        let rows = vec![
            item(1, 1, 1, Some(2), None),
            item(2, 1, 1, Some(5), None),
            item(3, 2, 1, Some(4), None),
            item(4, 2, 1, Some(1), None),
            item(5, 3, 1, Some(7), None),
        ];
        let merges = plan_merges(&rows, &cart_rule()).unwrap();
        let before: i64 = rows.iter().filter_map(|r| r.quantity).sum();
        let deleted: HashSet<i64> = merges.iter().flat_map(|m| m.delete_ids.clone()).collect();
        let after: i64 = rows
            .iter()
            .filter(|r| !deleted.contains(&r.pk))
            .map(|r| {
                merges
                    .iter()
                    .find(|m| m.keeper == r.pk)
                    .and_then(|m| m.quantity)
                    .or(r.quantity)
                    .unwrap_or(0)
            })
            .sum();
        assert_eq!(before, after);
        assert!(merges.iter().all(|m| m.price.is_none() && m.total.is_none()));
    }

    #[test]
    fn test_quantity_overflow_is_an_error() {
        let rows = vec![
            item(1, 1, 1, Some(i64::MAX), None),
            item(2, 1, 1, Some(1), None),
        ];
        let err = plan_merges(&rows, &cart_rule()).unwrap_err();
        assert_eq!(err.exit_code(), 5);
        assert!(err.to_string().contains("cart_items"));
    }

    #[test]
    fn test_null_keys_are_not_grouped() {
        let mut a = item(1, 1, 1, Some(1), None);
        let mut b = item(2, 1, 1, Some(1), None);
        a.key[1] = None;
        b.key[1] = None;
        assert!(plan_merges(&[a, b], &cart_rule()).unwrap().is_empty());
    }

    #[test]
    fn test_no_duplicates_no_merges() {
        let rows = vec![item(1, 1, 1, Some(1), None), item(2, 1, 2, Some(1), None)];
        assert!(plan_merges(&rows, &cart_rule()).unwrap().is_empty());
    }

    #[test]
    fn test_rule_columns_lists_everything() {
        let rule = order_rule();
        let cols: Vec<&str> = rule_columns(&rule).collect();
        assert_eq!(
            cols,
            vec!["id", "order_id", "slipper_id", "quantity", "unit_price", "total_price"]
        );
    }
}
