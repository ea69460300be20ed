//! Smoke tests for command wiring, run against the `memory:` sample database

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// 23 sample users, with no config files or env leaking in from the host.
fn sluice(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sluice").unwrap();
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("DATABASE_URL", "memory://?rows=23")
        .env_remove("RUST_LOG")
        .arg("--quiet");
    cmd
}

fn line_count(n: usize) -> impl Predicate<str> {
    predicate::function(move |out: &str| out.lines().count() == n)
}

// === Help ===

#[test]
fn test_help_lists_commands() {
    let mut cmd = Command::cargo_bin("sluice").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("stream"))
        .stdout(predicate::str::contains("paginate"))
        .stdout(predicate::str::contains("fetch"));
}

#[test]
fn test_stream_help() {
    let mut cmd = Command::cargo_bin("sluice").unwrap();
    cmd.arg("stream").arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Rows pulled per cursor fetch"));
}

// === Streaming ===

#[test]
fn test_stream_rows() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["stream", "SELECT name, age FROM user_data", "--fetch-size", "10"])
        .assert()
        .success()
        .stdout(line_count(23))
        .stdout(predicate::str::starts_with(r#"{"name":"Ada 0","age":18}"#));
}

#[test]
fn test_stream_batches_are_bounded() {
    let dir = TempDir::new().unwrap();
    let output = sluice(&dir)
        .args(["stream", "SELECT * FROM user_data", "-k", "10", "--batches"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let sizes: Vec<usize> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| {
            serde_json::from_str::<Vec<serde_json::Value>>(line)
                .unwrap()
                .len()
        })
        .collect();
    assert_eq!(sizes, vec![10, 10, 3]);
}

#[test]
fn test_stream_filter() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["stream", "SELECT name, age FROM user_data", "--filter", "age > 60"])
        .assert()
        .success()
        .stdout(line_count(4));
}

#[test]
fn test_stream_unknown_table_fails() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["stream", "SELECT * FROM missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open row stream"));
}

// === Pagination ===

#[test]
fn test_page() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["page", "SELECT name FROM user_data", "--page", "3", "--per-page", "10"])
        .assert()
        .success()
        .stdout(line_count(3))
        .stdout(predicate::str::contains("Ada 20"));
}

#[test]
fn test_paginate_walks_every_page() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["paginate", "SELECT name FROM user_data", "--page-size", "10"])
        .assert()
        .success()
        .stdout(line_count(23));
}

#[test]
fn test_paginate_with_param() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args([
            "paginate",
            "SELECT name FROM user_data WHERE age > $1",
            "-p",
            "60",
            "--page-size",
            "3",
        ])
        .assert()
        .success()
        .stdout(line_count(4));
}

// === Aggregation ===

#[test]
fn test_average() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["average", "--column", "age", "SELECT age FROM user_data"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""column":"age""#))
        .stdout(predicate::str::contains(r#""count":23"#))
        .stdout(predicate::str::contains(r#""sum":988.0"#));
}

// === Concurrency, cache, writes ===

#[test]
fn test_fetch_settles_all() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args([
            "fetch",
            "SELECT name FROM user_data LIMIT 2",
            "SELECT * FROM missing",
            "--settle-all",
        ])
        .assert()
        .failure()
        .stdout(line_count(2))
        .stdout(predicate::str::contains(r#""index":0"#))
        .stdout(predicate::str::contains(r#""error""#))
        .stderr(predicate::str::contains("1 of 2 queries failed"));
}

#[test]
fn test_query_repeat() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["query", "SELECT email FROM user_data WHERE age = 18", "--repeat", "3"])
        .assert()
        .success()
        .stdout(line_count(3));
}

#[test]
fn test_exec_insert() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .args(["exec", "INSERT INTO logs (message) VALUES ($1)", "-p", "'hello'"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"rows_affected":1}"#));
}

// === Config ===

#[test]
fn test_config_init_then_show() {
    let dir = TempDir::new().unwrap();
    sluice(&dir).args(["config", "init"]).assert().success();
    assert!(dir.path().join("sluice.toml").exists());

    sluice(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("fetch_size = 100"))
        .stdout(predicate::str::contains("memory://?rows=23"));

    sluice(&dir)
        .args(["config", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Use --force to overwrite"));
}

#[test]
fn test_config_rejects_zero_fetch_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[stream]\nfetch_size = 0\n").unwrap();

    sluice(&dir)
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("stream.fetch_size"));
}

#[test]
fn test_missing_database_url() {
    let dir = TempDir::new().unwrap();
    sluice(&dir)
        .env_remove("DATABASE_URL")
        .args(["stream", "SELECT 1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no database url"));
}

#[test]
fn test_completions() {
    let mut cmd = Command::cargo_bin("sluice").unwrap();
    cmd.args(["completions", "bash"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("sluice"));
}
