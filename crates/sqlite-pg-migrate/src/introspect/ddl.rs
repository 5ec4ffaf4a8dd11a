//! PostgreSQL DDL rendering.

use std::collections::HashSet;

use crate::config::ConsolidationRule;
use crate::core::identifier::{qualify_pg, quote_pg};
use crate::core::schema::{Column, Table, TargetType};
use crate::error::Result;

/// PostgreSQL identifier limit in bytes.
const MAX_NAME_LEN: usize = 63;

/// Render `CREATE TABLE IF NOT EXISTS` statements for tables in plan order.
///
/// A lone integer primary key becomes `BIGSERIAL` so the target owns a
/// sequence for it. Primary key columns are always `NOT NULL`.
pub fn schema_sql(tables: &[&Table], schema: &str) -> Result<String> {
    let mut out = String::new();
    out.push_str(&format!("CREATE SCHEMA IF NOT EXISTS {};\n", quote_pg(schema)?));

    for table in tables {
        out.push('\n');
        out.push_str(&create_table(table, schema)?);
    }
    Ok(out)
}

fn create_table(table: &Table, schema: &str) -> Result<String> {
    let serial = table.integer_pk().map(|c| c.name.as_str());
    let mut notes = Vec::new();
    let mut lines = Vec::with_capacity(table.columns.len() + 1);

    for col in &table.columns {
        let quoted = quote_pg(&col.name)?;
        if Some(col.name.as_str()) == serial {
            lines.push(format!("{} BIGSERIAL NOT NULL", quoted));
            continue;
        }

        let mut line = format!("{} {}", quoted, col.target_type.pg_type());
        if !col.is_nullable {
            line.push_str(" NOT NULL");
        }
        if let Some(default) = &col.default {
            match translate_default(default, col) {
                Some(expr) => line.push_str(&format!(" DEFAULT {}", expr)),
                None => notes.push(format!(
                    "-- default for {}.{} dropped: {}",
                    table.name,
                    col.name,
                    default.replace('\n', " ")
                )),
            }
        }
        lines.push(line);
    }

    if !table.primary_key.is_empty() {
        let cols = table
            .primary_key
            .iter()
            .map(|c| quote_pg(c))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        lines.push(format!("PRIMARY KEY ({})", cols));
    }

    let mut out = String::new();
    for note in notes {
        out.push_str(&note);
        out.push('\n');
    }
    out.push_str(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
        qualify_pg(schema, &table.name)?,
        lines.join(",\n    ")
    ));
    Ok(out)
}

/// Translate a SQLite default expression, or `None` when there is no safe
/// PostgreSQL equivalent.
pub fn translate_default(default: &str, column: &Column) -> Option<String> {
    let mut expr = default.trim();
    while expr.starts_with('(') && expr.ends_with(')') && expr.len() >= 2 {
        expr = expr[1..expr.len() - 1].trim();
    }
    if expr.is_empty() {
        return None;
    }

    let upper = expr.to_uppercase();
    let compact: String = upper.chars().filter(|c| !c.is_whitespace()).collect();

    if upper == "NULL" {
        return Some("NULL".to_string());
    }

    if column.target_type == TargetType::Boolean {
        let unquoted = compact.trim_matches('\'');
        return match unquoted {
            "1" | "TRUE" | "T" | "Y" | "YES" => Some("TRUE".to_string()),
            "0" | "FALSE" | "F" | "N" | "NO" => Some("FALSE".to_string()),
            _ => None,
        };
    }

    match compact.as_str() {
        "CURRENT_TIMESTAMP" => return Some("CURRENT_TIMESTAMP".to_string()),
        "CURRENT_DATE" => return Some("CURRENT_DATE".to_string()),
        "CURRENT_TIME" => return Some("CURRENT_TIME".to_string()),
        _ => {}
    }
    if compact.starts_with("DATETIME('NOW'") || compact.starts_with("STRFTIME(") {
        return Some("CURRENT_TIMESTAMP".to_string());
    }
    if compact.starts_with("DATE('NOW'") {
        return Some("CURRENT_DATE".to_string());
    }

    let numeric_start = expr
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
    if numeric_start && expr.parse::<f64>().is_ok() {
        return Some(expr.to_string());
    }
    if is_quoted_literal(expr) {
        return Some(expr.to_string());
    }
    if upper == "TRUE" || upper == "FALSE" {
        return Some(upper);
    }

    None
}

fn is_quoted_literal(expr: &str) -> bool {
    if expr.len() < 2 || !expr.starts_with('\'') || !expr.ends_with('\'') {
        return false;
    }
    // Every inner quote must be doubled.
    let inner = &expr[1..expr.len() - 1];
    inner.replace("''", "").find('\'').is_none()
}

/// Render indexes, foreign keys and consolidation unique indexes, to be
/// applied once the data is in place.
///
/// Every statement is idempotent so the script can be re-applied.
pub fn constraints_sql(
    tables: &[&Table],
    schema: &str,
    rules: &[ConsolidationRule],
) -> Result<String> {
    let known: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let mut out = String::from("-- Indexes\n");

    for table in tables {
        for index in &table.indexes {
            if index.columns.is_empty() {
                out.push_str(&format!(
                    "-- skipped expression index {} on {}\n",
                    index.name, table.name
                ));
                continue;
            }
            let name = if index.origin == "u" || index.name.starts_with("sqlite_") {
                truncate_name(format!("{}_{}_key", table.name, index.columns.join("_")))
            } else {
                index.name.clone()
            };
            out.push_str(&format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});\n",
                if index.is_unique { "UNIQUE " } else { "" },
                quote_pg(&name)?,
                qualify_pg(schema, &table.name)?,
                quote_list(&index.columns)?
            ));
        }
    }

    out.push_str("\n-- Foreign keys\n");
    for table in tables {
        for fk in &table.foreign_keys {
            if !known.contains(fk.ref_table.as_str()) {
                out.push_str(&format!(
                    "-- skipped {}.{:?}: {} is not migrated\n",
                    table.name, fk.columns, fk.ref_table
                ));
                continue;
            }
            let name = truncate_name(format!(
                "fk_{}_{}_{}",
                table.name,
                fk.columns.join("_"),
                fk.ref_table
            ));
            let references = if fk.ref_columns.is_empty() {
                qualify_pg(schema, &fk.ref_table)?
            } else {
                format!(
                    "{} ({})",
                    qualify_pg(schema, &fk.ref_table)?,
                    quote_list(&fk.ref_columns)?
                )
            };
            let mut actions = String::new();
            for (verb, action) in [("DELETE", &fk.on_delete), ("UPDATE", &fk.on_update)] {
                let action = action.to_uppercase();
                if !action.is_empty() && action != "NO ACTION" {
                    actions.push_str(&format!(" ON {} {}", verb, action));
                }
            }
            out.push_str(&format!(
                "DO $$ BEGIN\n    ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {}{};\nEXCEPTION WHEN duplicate_object THEN NULL;\nEND $$;\n",
                qualify_pg(schema, &table.name)?,
                quote_pg(&name)?,
                quote_list(&fk.columns)?,
                references,
                actions
            ));
        }
    }

    out.push_str("\n-- Uniqueness introduced by consolidation\n");
    for rule in rules.iter().filter(|r| known.contains(r.table.as_str())) {
        out.push_str(&unique_index_sql(rule, schema)?);
        out.push('\n');
    }

    Ok(out)
}

/// `CREATE UNIQUE INDEX` for a consolidation rule.
pub fn unique_index_sql(rule: &ConsolidationRule, schema: &str) -> Result<String> {
    Ok(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({});",
        quote_pg(&rule.unique_index)?,
        qualify_pg(schema, &rule.table)?,
        quote_list(&rule.key_columns)?
    ))
}

/// Comment header naming the source, for generated files.
pub fn header(source: &str, run_id: &str) -> String {
    format!("-- Generated from {} (run {})\n", source, run_id)
}

fn quote_list(cols: &[String]) -> Result<String> {
    Ok(cols
        .iter()
        .map(|c| quote_pg(c))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

fn truncate_name(mut name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        let mut cut = MAX_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}
