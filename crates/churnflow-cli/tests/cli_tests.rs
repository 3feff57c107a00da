//! Command-line behavior that needs no database

use assert_cmd::Command;
use predicates::prelude::*;

fn churnflow() -> Command {
    let mut cmd = Command::cargo_bin("churnflow").unwrap();
    // keep a developer's .env and shell from leaking into the test
    cmd.current_dir(std::env::temp_dir())
        .env_remove("PRIMARY_DATABASE_URL")
        .env_remove("WAREHOUSE_DATABASE_URL")
        .env_remove("ETL_SOURCE_PATH")
        .env("LOG_LEVEL", "error");
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    churnflow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("reset"))
        .stdout(predicate::str::contains("jobs"));
}

#[test]
fn test_run_requires_source() {
    churnflow()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--source"));
}

#[test]
fn test_run_without_database_url_fails_cleanly() {
    churnflow()
        .args(["run", "--source", "customers.csv"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("PRIMARY_DATABASE_URL"));
}

#[test]
fn test_reset_requires_confirmation() {
    churnflow()
        .arg("reset")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn test_jobs_rejects_zero_limit() {
    churnflow()
        .args(["jobs", "--limit", "0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Limit"));
}
