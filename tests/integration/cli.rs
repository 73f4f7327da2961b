#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path, time::Duration};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn svcmgr(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("svcmgr"));
    cmd.arg("--config")
        .arg(config)
        .arg("--log-level")
        .arg("warn");
    cmd
}

fn status_json(config: &Path) -> Value {
    let output = svcmgr(config)
        .args(["status", "--json"])
        .output()
        .expect("failed to run status");
    assert!(output.status.success(), "status failed: {output:?}");
    serde_json::from_slice(&output.stdout).expect("status output is not JSON")
}

#[test]
fn add_list_and_remove_round_trip() {
    let dir = tempdir().expect("failed to create tempdir");
    let config = dir.path().join("svcmgr.yaml");

    svcmgr(&config)
        .args(["add", "-s", "api", "--", "python", "server.py", "--port", "8000"])
        .assert()
        .success();
    svcmgr(&config)
        .args(["add", "-s", "worker", "-p", "9000", "--", "python", "worker.py"])
        .assert()
        .success();

    let saved = fs::read_to_string(&config).expect("registry not written");
    assert!(saved.contains("python server.py --port 8000"));
    assert!(saved.contains("expected_port: 9000"));

    svcmgr(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("api").and(predicate::str::contains("8000")))
        .stdout(predicate::str::contains("worker").and(predicate::str::contains("9000")));

    svcmgr(&config)
        .args(["remove", "-s", "api"])
        .assert()
        .success();
    svcmgr(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("api").not());
}

#[test]
fn duplicate_names_are_rejected() {
    let dir = tempdir().expect("failed to create tempdir");
    let config = dir.path().join("svcmgr.yaml");

    svcmgr(&config)
        .args(["add", "-s", "api", "--", "python", "server.py"])
        .assert()
        .success();
    svcmgr(&config)
        .args(["add", "-s", "api", "--", "python", "other.py"])
        .assert()
        .failure();

    let saved = fs::read_to_string(&config).expect("registry not written");
    assert!(!saved.contains("other.py"));
}

#[test]
fn update_changes_command_and_port() {
    let dir = tempdir().expect("failed to create tempdir");
    let config = common::write_registry(
        dir.path(),
        "services:\n  - name: web\n    command: npm start\n    expected_port: 3000\n",
    );

    svcmgr(&config)
        .args(["update", "-s", "web", "--rename", "frontend", "--clear-port", "--", "npm", "run", "dev"])
        .assert()
        .success();

    let saved = fs::read_to_string(&config).expect("registry not written");
    assert!(saved.contains("name: frontend"));
    assert!(saved.contains("command: npm run dev"));
    assert!(!saved.contains("expected_port"));
}

#[test]
fn status_json_reports_stopped_services() {
    let dir = tempdir().expect("failed to create tempdir");
    let command = common::unique_sleep_command();
    let config = common::write_registry(
        dir.path(),
        &format!("services:\n  - name: sleeper\n    command: {command}\n"),
    );

    let snapshot = status_json(&config);
    let service = &snapshot["services"][0];
    assert_eq!(service["status"]["spec"]["name"], "sleeper");
    assert_eq!(service["status"]["running"], false);
    assert_eq!(service["state"], "stopped");
    assert!(snapshot["conflicts"]["port_conflicts"].as_object().unwrap().is_empty());
}

#[test]
fn malformed_registry_falls_back_to_empty() {
    let dir = tempdir().expect("failed to create tempdir");
    let config = common::write_registry(dir.path(), "services: [this is: not valid");

    svcmgr(&config)
        .args(["status", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No services declared."));
}

#[test]
fn add_to_malformed_registry_fails_without_writing() {
    let dir = tempdir().expect("failed to create tempdir");
    let original = "services: [this is: not valid";
    let config = common::write_registry(dir.path(), original);

    svcmgr(&config)
        .args(["add", "-s", "api", "--", "python", "server.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid YAML"));

    assert_eq!(fs::read_to_string(&config).expect("registry missing"), original);
}

#[test]
fn unknown_service_fails() {
    let dir = tempdir().expect("failed to create tempdir");
    let config = common::write_registry(dir.path(), "services: []\n");

    svcmgr(&config)
        .args(["start", "-s", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn conflicts_reports_none_for_quiet_registry() {
    let dir = tempdir().expect("failed to create tempdir");
    let config = common::write_registry(dir.path(), "services: []\n");

    svcmgr(&config)
        .args(["conflicts", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No conflicts detected."));
}

#[cfg(target_os = "linux")]
#[test]
fn start_and_stop_across_invocations() {
    let dir = tempdir().expect("failed to create tempdir");
    let command = common::unique_sleep_command();
    let config = common::write_registry(
        dir.path(),
        &format!("services:\n  - name: sleeper\n    command: {command}\n"),
    );

    svcmgr(&config)
        .args(["start", "-s", "sleeper"])
        .assert()
        .success();

    let snapshot = status_json(&config);
    let service = &snapshot["services"][0];
    let pid = service["status"]["pid"].as_u64().map(|pid| pid as u32);
    assert_eq!(service["state"], "running", "{snapshot}");
    assert_eq!(service["status"]["running"], true);

    let stopped = svcmgr(&config).args(["stop", "-s", "sleeper"]).output();
    if !matches!(&stopped, Ok(output) if output.status.success()) {
        if let Some(pid) = pid {
            common::kill_group(pid);
        }
        panic!("stop failed: {stopped:?}");
    }

    assert!(common::wait_until(Duration::from_secs(3), || {
        common::pids_running(&command).is_empty()
    }));
    assert_eq!(status_json(&config)["services"][0]["state"], "stopped");
}
