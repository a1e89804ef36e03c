//! CLI integration tests for sql-import.
//!
//! These tests cover argument parsing, help output, exit codes, and the
//! job store commands that run without a database connection.

use assert_cmd::Command;
use predicates::prelude::*;
use sql_import::{
    FieldMapping, FileJobStore, Job, JobStore, MappingDescriptor, SourceLocation, Transform,
};
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// Get a command for the sql-import binary.
fn cmd() -> Command {
    Command::cargo_bin("sql-import").unwrap()
}

/// Write a valid config whose job store lives under `dir`.
fn write_config(dir: &Path) -> String {
    let path = dir.join("config.yaml");
    let yaml = format!(
        r#"
source:
  type: mssql
  host: 127.0.0.1
  port: 1
  database: Sales
  user: importer
  password: secret
  encrypt: "false"
  timeout_secs: 1
target:
  type: postgres
  host: 127.0.0.1
  port: 1
  database: app
  user: app
  password: secret
  ssl_mode: disable
state_dir: {}
mappings:
  - name: customers
    source:
      table: Customers
    target_entity: res_partner
    fields:
      - {{ source_field: Id, target_field: legacy_id, transform: int }}
"#,
        dir.join("jobs").display()
    );
    std::fs::write(&path, yaml).unwrap();
    path.to_str().unwrap().to_string()
}

/// Store a draft job directly and return its id.
fn seed_job(dir: &Path) -> String {
    let mapping = MappingDescriptor::new(
        "customers",
        SourceLocation::new("dbo", "Customers"),
        "res_partner",
        vec![FieldMapping::new("Id", "legacy_id", Transform::Int)],
    );
    let job = Job::new(mapping);
    let store = FileJobStore::new(dir.join("jobs")).unwrap();
    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(store.save(&job))
        .unwrap();
    job.id
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
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("preview"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("retry"))
        .stdout(predicate::str::contains("cancel"))
        .stdout(predicate::str::contains("report"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--mapping"))
        .stdout(predicate::str::contains("--verify"));
}

#[test]
fn test_preview_limit_default() {
    cmd()
        .args(["preview", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--limit"))
        .stdout(predicate::str::contains("[default: 5]"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sql-import"));
}

#[test]
fn test_global_flags() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_run_requires_mapping() {
    cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--mapping"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 2)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_2() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "list"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "list"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_required_fields_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  type: mssql").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

// =============================================================================
// Job Store Commands (no database needed)
// =============================================================================

#[test]
fn test_list_empty_store() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    cmd()
        .args(["--config", &config, "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No jobs"));
}

#[test]
fn test_config_hash_logged_at_load() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    cmd()
        .args(["--config", &config, "list"])
        .assert()
        .success()
        .stderr(predicate::str::is_match(r"Loaded configuration from .* \(hash [0-9a-f]{12}\)").unwrap());
}

#[test]
fn test_list_json_empty_store() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    cmd()
        .args(["--config", &config, "--output-json", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_status_unknown_job_exits_with_code_7() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    cmd()
        .args(["--config", &config, "status", "--job", "no-such-job"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_status_of_stored_job() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let id = seed_job(dir.path());

    cmd()
        .args(["--config", &config, "status", "--job", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Status: draft"))
        .stdout(predicate::str::contains("Mapping: customers"));

    cmd()
        .args(["--config", &config, "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));
}

#[test]
fn test_cancel_draft_is_invalid_state() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let id = seed_job(dir.path());

    cmd()
        .args(["--config", &config, "cancel", "--job", &id])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("cannot cancel"));
}

#[test]
fn test_report_without_verification() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let id = seed_job(dir.path());

    cmd()
        .args(["--config", &config, "report", "--job", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("No verification report"));
}

#[test]
fn test_retry_creates_new_job() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());
    let id = seed_job(dir.path());

    cmd()
        .args(["--config", &config, "retry", "--job", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("(retry of {})", id)));

    let store = FileJobStore::new(dir.path().join("jobs")).unwrap();
    let jobs = tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(store.list())
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().any(|j| j.retry_of.as_deref() == Some(id.as_str())));
}

// =============================================================================
// Connection Failures (Exit Code 4)
// =============================================================================

#[test]
fn test_validate_unreachable_source_exits_with_code_4() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    cmd()
        .args(["--config", &config, "validate", "--mapping", "customers"])
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .code(4);
}
