//! Scenarios against a live PostgreSQL server.
//!
//! Set `SQLITE_PG_MIGRATE_TEST_DSN` to a database the tests may create
//! schemas in; every test works in its own throwaway schema. Without the
//! variable the tests return early.

use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use sqlite_pg_migrate::consolidate::RuleStatus;
use sqlite_pg_migrate::pipeline;
use sqlite_pg_migrate::sequences::SequenceStatus;
use sqlite_pg_migrate::{
    Config, DuplicateConsolidator, MigrationStatus, PgTarget, RunContext, SequenceReconciler,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

const DSN_VAR: &str = "SQLITE_PG_MIGRATE_TEST_DSN";

struct Scratch {
    target: PgTarget,
    schema: String,
}

impl Scratch {
    async fn new() -> Option<Self> {
        let dsn = std::env::var(DSN_VAR).ok()?;
        let target = PgTarget::connect(&dsn, 4).await.unwrap();
        let schema = format!("spm_test_{}", uuid::Uuid::new_v4().simple());
        target
            .batch_execute(&format!("CREATE SCHEMA \"{}\"", schema))
            .await
            .unwrap();
        Some(Self { target, schema })
    }

    async fn exec(&self, sql: &str) {
        let sql = sql.replace("{schema}", &format!("\"{}\"", self.schema));
        self.target.batch_execute(&sql).await.unwrap();
    }

    async fn cleanup(self) {
        self.target
            .batch_execute(&format!("DROP SCHEMA \"{}\" CASCADE", self.schema))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_duplicate_line_items_are_merged() {
    let Some(scratch) = Scratch::new().await else {
        return;
    };
    scratch
        .exec(
            "CREATE TABLE {schema}.order_items (
                id BIGSERIAL PRIMARY KEY,
                order_id BIGINT NOT NULL,
                slipper_id BIGINT NOT NULL,
                quantity BIGINT NOT NULL,
                unit_price NUMERIC(10,2) NOT NULL,
                total_price NUMERIC(10,2) NOT NULL
            );
            INSERT INTO {schema}.order_items VALUES
                (1, 10, 7, 2, 19.99, 39.98),
                (2, 10, 7, 3, 21.50, 64.50),
                (3, 11, 7, 1, 5.00, 5.00);",
        )
        .await;

    let rules = sqlite_pg_migrate::config::default_consolidation_rules();
    let consolidator = DuplicateConsolidator::new(&scratch.target, &scratch.schema, true);
    let ctx = RunContext::new("test");
    let report = consolidator.run(&rules, &ctx).await.unwrap();

    let items = report.rules.iter().find(|r| r.table == "order_items").unwrap();
    assert_eq!(items.status, RuleStatus::Applied);
    assert_eq!(items.groups_merged, 1);
    assert_eq!(items.rows_deleted, 1);
    assert!(items.index_created);
    let carts = report.rules.iter().find(|r| r.table == "cart_items").unwrap();
    assert_eq!(carts.status, RuleStatus::Skipped);

    let client = scratch.target.client().await.unwrap();
    let rows = client
        .query(
            &format!(
                "SELECT id, quantity, unit_price, total_price FROM \"{}\".order_items ORDER BY id",
                scratch.schema
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<_, i64>(0), 1);
    assert_eq!(rows[0].get::<_, i64>(1), 5);
    assert_eq!(rows[0].get::<_, Decimal>(2), Decimal::from_str("21.50").unwrap());
    assert_eq!(rows[0].get::<_, Decimal>(3), Decimal::from_str("107.50").unwrap());

    // Second pass finds nothing left to merge.
    let again = consolidator.run(&rules, &ctx).await.unwrap();
    assert_eq!(again.rows_deleted(), 0);
    drop(client);

    scratch.cleanup().await;
}

#[tokio::test]
async fn test_sequence_advances_past_copied_ids() {
    let Some(scratch) = Scratch::new().await else {
        return;
    };
    scratch
        .exec(
            "CREATE TABLE {schema}.users (id BIGSERIAL PRIMARY KEY, email TEXT);
            CREATE TABLE {schema}.carts (id BIGSERIAL PRIMARY KEY);
            INSERT INTO {schema}.users (id, email) VALUES (1, 'a'), (2, 'b'), (42, 'c');",
        )
        .await;

    let reconciler = SequenceReconciler::new(&scratch.target, &scratch.schema);
    let ctx = RunContext::new("test");
    let report = reconciler.run(&ctx).await.unwrap();

    let users = report.sequences.iter().find(|s| s.table == "users").unwrap();
    assert_eq!(users.status, SequenceStatus::Advanced);
    assert_eq!(users.next_value, Some(43));
    let carts = report.sequences.iter().find(|s| s.table == "carts").unwrap();
    assert_eq!(carts.status, SequenceStatus::SkippedEmpty);

    let client = scratch.target.client().await.unwrap();
    let row = client
        .query_one(
            &format!(
                "INSERT INTO \"{}\".users (email) VALUES ('d') RETURNING id",
                scratch.schema
            ),
            &[],
        )
        .await
        .unwrap();
    assert_eq!(row.get::<_, i64>(0), 43);
    drop(client);

    // Already past the maximum: left alone.
    let again = reconciler.run(&ctx).await.unwrap();
    let users = again.sequences.iter().find(|s| s.table == "users").unwrap();
    assert_eq!(users.status, SequenceStatus::Unchanged);

    scratch.cleanup().await;
}

async fn create_source(path: &Path) {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    for stmt in [
        "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL, is_admin BOOLEAN DEFAULT 0, created_at DATETIME DEFAULT CURRENT_TIMESTAMP)",
        "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users(id), total NUMERIC(10,2), notes TEXT)",
        "INSERT INTO users VALUES (1, 'a@example.com', 1, '2024-01-01 10:00:00'), (2, 'b|c@example.com', 0, '2024-02-01T08:30:00Z')",
        "INSERT INTO orders VALUES (5, 1, 19.99, NULL), (6, 2, 20, 'gift\\wrap')",
    ] {
        sqlx::query(stmt).execute(&pool).await.unwrap();
    }
    pool.close().await;
}

#[tokio::test]
async fn test_migrate_then_verify_matches() {
    let Some(scratch) = Scratch::new().await else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("shop.db");
    create_source(&source).await;

    let mut config = Config::default();
    config.source.path = Some(source);
    config.target.dsn = std::env::var(DSN_VAR).ok();
    config.target.schema = scratch.schema.clone();
    config.artifacts.dir = dir.path().to_path_buf();
    let ctx = RunContext::new("test");

    let (reader, analysis) = pipeline::introspect(&config, &ctx).await.unwrap();
    scratch
        .target
        .batch_execute(&analysis.schema_sql(&scratch.schema).unwrap())
        .await
        .unwrap();

    let outcome = pipeline::migrate_stages(&reader, &scratch.target, &analysis, &config, &ctx)
        .await
        .unwrap();
    assert_eq!(outcome.migration.status, MigrationStatus::Completed);
    assert_eq!(outcome.migration.total_rows, 4);
    assert_eq!(outcome.sequences.count(SequenceStatus::Advanced), 2);

    let (report, path) = pipeline::verify_stage(&reader, &scratch.target, &analysis, &config, &ctx)
        .await
        .unwrap();
    assert!(report.all_match(), "{:?}", report);
    assert!(path.exists());

    // The gate keeps a second copy from duplicating rows.
    let rerun = pipeline::migrate_stages(&reader, &scratch.target, &analysis, &config, &ctx)
        .await
        .unwrap();
    assert!(rerun.migration.is_skipped());

    scratch.cleanup().await;
}
