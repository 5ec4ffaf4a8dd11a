//! CLI integration tests for sqlite-pg-migrate.
//!
//! These tests cover argument parsing, help output, exit codes and the
//! artifacts written by commands that do not need a PostgreSQL server.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Get a command for the sqlite-pg-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("sqlite-pg-migrate").unwrap()
}

/// Files in `dir` whose names contain `needle`.
fn files_containing(dir: &Path, needle: &str) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains(needle))
                    .unwrap_or(false)
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Build a small shop database at `path`.
fn create_shop_db(path: &Path) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        for stmt in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE, is_admin BOOLEAN DEFAULT 0)",
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users(id), total NUMERIC(10,2), created_at DATETIME)",
            "INSERT INTO users (id, email, is_admin) VALUES (1, 'a@example.com', 1), (2, 'b@example.com', 0)",
            "INSERT INTO orders (id, user_id, total, created_at) VALUES (1, 1, 19.99, '2024-01-01 10:00:00')",
        ] {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        pool.close().await;
    });
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("analyze"))
        .stdout(predicate::str::contains("create-db"))
        .stdout(predicate::str::contains("apply-sql"))
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("consolidate"))
        .stdout(predicate::str::contains("reset-sequences"))
        .stdout(predicate::str::contains("startup"));
}

#[test]
fn test_migrate_subcommand_help() {
    cmd()
        .args(["migrate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<SOURCE_PATH>"))
        .stdout(predicate::str::contains("<TARGET_DSN>"))
        .stdout(predicate::str::contains("--batch-size"))
        .stdout(predicate::str::contains("--workers"))
        .stdout(predicate::str::contains("--transaction-scope"));
}

#[test]
fn test_verify_subcommand_help() {
    cmd()
        .args(["verify", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--strict"));
}

#[test]
fn test_create_db_subcommand_help() {
    cmd()
        .args(["create-db", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<ADMIN_DSN>"))
        .stdout(predicate::str::contains("<DB_NAME>"))
        .stdout(predicate::str::contains("--owner"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sqlite-pg-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_exist() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--artifacts-dir"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_invalid_transaction_scope_rejected() {
    cmd()
        .args(["migrate", "app.db", "host=localhost", "--transaction-scope", "row"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("row"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args(["--config", "nonexistent_config_file.yaml"])
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .arg("startup")
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap()])
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .arg("startup")
        .assert()
        .code(1);
}

#[test]
fn test_zero_workers_exits_with_code_1() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .args(["migrate", "app.db", "host=localhost", "--workers", "0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn test_missing_source_exits_with_code_3() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.db");

    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .args(["analyze", missing.to_str().unwrap()])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("source database not found"));
}

#[test]
fn test_apply_sql_unreachable_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.sql");

    // Closed port: the connection is refused.
    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .args([
            "apply-sql",
            "host=127.0.0.1 port=1 user=nobody connect_timeout=1",
            missing.to_str().unwrap(),
        ])
        .assert()
        .failure();
}

#[test]
fn test_startup_without_source_exits_with_code_1() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .env_remove("DATABASE_URL")
        .arg("startup")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("source.path is required"));

    assert_eq!(files_containing(dir.path(), "pipeline_report").len(), 1);
}

#[test]
fn test_reset_sequences_without_target_exits_with_code_1() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .env_remove("DATABASE_URL")
        .arg("reset-sequences")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("target.dsn is required"));
}

#[test]
fn test_reset_sequences_reads_database_url() {
    let dir = tempfile::tempdir().unwrap();
    // Closed port: the DSN is found, the connection is refused.
    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .env(
            "DATABASE_URL",
            "postgresql+asyncpg://nobody@127.0.0.1:1/slippers?connect_timeout=1",
        )
        .arg("reset-sequences")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("target.dsn is required").not());
}

// =============================================================================
// Artifact Tests
// =============================================================================

#[test]
fn test_failure_writes_failure_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.db");

    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .args(["analyze", missing.to_str().unwrap()])
        .assert()
        .code(3);

    let failures = files_containing(&dir.path().join("analysis"), "analyze_failure");
    assert_eq!(failures.len(), 1);
    let content = std::fs::read_to_string(&failures[0]).unwrap();
    let json: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["command"], "analyze");
    assert_eq!(json["exit_code"], 3);
}

#[test]
fn test_analyze_writes_report_and_ddl() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);

    cmd()
        .args(["--artifacts-dir", dir.path().to_str().unwrap()])
        .args(["analyze", db.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Analysis completed"))
        .stdout(predicate::str::contains("users -> orders"));

    let reports = files_containing(&dir.path().join("analysis"), "sqlite_analysis");
    assert_eq!(reports.len(), 1);
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&reports[0]).unwrap()).unwrap();
    assert!(report.to_string().contains("orders"));

    let schema = files_containing(&dir.path().join("migrations"), "pg_schema");
    assert_eq!(schema.len(), 1);
    let ddl = std::fs::read_to_string(&schema[0]).unwrap();
    assert!(ddl.contains("CREATE TABLE"));
    assert!(ddl.contains("\"users\""));

    assert_eq!(
        files_containing(&dir.path().join("migrations"), "pg_constraints").len(),
        1
    );
}

#[test]
fn test_analyze_twice_keeps_both_reports() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);

    for _ in 0..2 {
        cmd()
            .args(["--artifacts-dir", dir.path().to_str().unwrap()])
            .args(["analyze", db.to_str().unwrap()])
            .assert()
            .success();
    }

    assert_eq!(
        files_containing(&dir.path().join("analysis"), "sqlite_analysis").len(),
        2
    );
}

#[test]
fn test_analyze_output_json() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("shop.db");
    create_shop_db(&db);

    let output = cmd()
        .args(["--output-json", "--artifacts-dir", dir.path().to_str().unwrap()])
        .args(["analyze", db.to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert!(json["report"].as_str().unwrap().contains("sqlite_analysis"));
    assert!(json["schema_sql"].as_str().unwrap().ends_with(".sql"));
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
