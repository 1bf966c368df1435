//! Binary-level smoke tests.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path, dsn: &str) -> std::path::PathBuf {
    let path = dir.join("retcon.toml");
    let contents = format!(
        r#"
[store]
dsn = "{dsn}"

[[entity]]
name = "customer"

  [[entity.source]]
  name = "db1"
  driver = "memory"

  [[entity.source]]
  name = "db2"
  driver = "memory"
"#
    );
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn retcond_missing_config_exits_1() {
    Command::cargo_bin("retcond")
        .expect("binary")
        .env_remove("RETCON_CONFIG")
        .args(["--config", "/nonexistent/retcon.toml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("config"));
}

#[test]
fn retcond_invalid_config_exits_1() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("retcon.toml");
    fs::write(&path, "workers = \"many\"").expect("write");

    Command::cargo_bin("retcond")
        .expect("binary")
        .env_remove("RETCON_CONFIG")
        .args(["--config"])
        .arg(&path)
        .assert()
        .code(1);
}

#[test]
fn retcond_unreachable_store_exits_2() {
    let dir = tempfile::tempdir().expect("tempdir");
    // A directory is not a database file.
    let config = write_config(dir.path(), &dir.path().display().to_string());

    Command::cargo_bin("retcond")
        .expect("binary")
        .env_remove("RETCON_CONFIG")
        .args(["--config"])
        .arg(&config)
        .assert()
        .code(2);
}

#[test]
fn oneshot_runs_one_cycle_and_exits_0() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dsn = dir.path().join("retcon.sqlite");
    let config = write_config(dir.path(), &dsn.display().to_string());

    // A fresh memory source has no copy; the cycle is a clean no-op.
    Command::cargo_bin("retcon-oneshot")
        .expect("binary")
        .env_remove("RETCON_CONFIG")
        .args(["--config"])
        .arg(&config)
        .args(["customer", "db1", "41"])
        .assert()
        .success();
    assert!(dsn.exists());
}

#[test]
fn client_reports_connection_failures() {
    Command::cargo_bin("retcon-client")
        .expect("binary")
        .args(["--address", "tcp://127.0.0.1:1", "list-conflicts"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("error"));
}

#[test]
fn env_var_overrides_config_flag() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dsn = dir.path().join("retcon.sqlite");
    let good = write_config(dir.path(), &dsn.display().to_string());

    // RETCON_CONFIG wins over a bogus --config path.
    Command::cargo_bin("retcon-oneshot")
        .expect("binary")
        .env("RETCON_CONFIG", &good)
        .args(["--config", "/nonexistent/retcon.toml"])
        .args(["customer", "db1", "41"])
        .assert()
        .success();
}
