#[path = "common/mod.rs"]
mod common;

use std::net::TcpListener;

use assert_cmd::Command;
use common::{free_port, write_config};
use predicates::prelude::*;
use tempfile::tempdir;

fn warden() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("warden"))
}

fn single_service_config(dir: &std::path::Path, port: u16) -> String {
    let path = write_config(
        dir,
        &format!(
            r#"version: "1"
services:
  backend:
    port: {port}
    command: ["sleep", "30"]
    identity:
      all: ["uvicorn", "app.gateway"]
"#
        ),
    );
    path.to_str().unwrap().to_string()
}

#[test]
fn help_lists_subcommands() {
    warden()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("cleanup"));
}

#[test]
fn status_json_reports_stopped_service() {
    let temp = tempdir().unwrap();
    let config = single_service_config(temp.path(), free_port());

    warden()
        .args(["status", "--json", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"backend\""))
        .stdout(predicate::str::contains("\"status\": \"stopped\""));
}

#[test]
fn status_table_flags_unmanaged_owner() {
    let temp = tempdir().unwrap();
    let foreign = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = foreign.local_addr().unwrap().port();
    let config = single_service_config(temp.path(), port);

    warden()
        .args(["status", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("running"))
        .stdout(predicate::str::contains("not managed"));
    drop(foreign);
}

#[test]
fn stop_leaves_foreign_listener_and_succeeds() {
    let temp = tempdir().unwrap();
    let foreign = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = foreign.local_addr().unwrap().port();
    let config = single_service_config(temp.path(), port);

    warden()
        .args(["stop", "--config", &config])
        .assert()
        .success();
    assert!(common::port_open(port));
}

#[test]
fn cleanup_with_nothing_to_do() {
    let temp = tempdir().unwrap();
    let config = single_service_config(temp.path(), free_port());

    warden()
        .args(["cleanup", "--config", &config])
        .assert()
        .success()
        .stdout(predicate::str::contains("No hanging processes found"));
}

#[test]
fn unknown_service_is_an_error() {
    let temp = tempdir().unwrap();
    let config = single_service_config(temp.path(), free_port());

    warden()
        .args(["stop", "--service", "ghost", "--config", &config])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn missing_config_is_reported() {
    let temp = tempdir().unwrap();
    let missing = temp.path().join("nope.yaml");

    warden()
        .args(["status", "--config", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nope.yaml"));
}

#[test]
fn watchdog_rejects_missing_arguments() {
    Command::new(assert_cmd::cargo::cargo_bin!("warden-watchdog"))
        .assert()
        .code(1);
}
