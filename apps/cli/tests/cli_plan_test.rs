//! Integration tests for the `callsheet check` and `callsheet run` commands.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::PathBuf;
use tempfile::TempDir;

/// Runs the binary inside `dir` with no user config or token in the environment.
fn callsheet(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("callsheet").unwrap();
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("NO_COLOR", "1")
        .env_remove("CALLSHEET_LOG_LEVEL")
        .env_remove("CALLSHEET_TOKEN");
    cmd
}

fn write_plan(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("plan.toml");
    std::fs::write(&path, content).unwrap();
    path
}

const PAUSE_PLAN: &str = r#"
name = "pauses"

[[operations]]
kind = "pause"
name = "Wait for role assignment"
millis = 10

[[operations]]
kind = "pause"
millis = 1
"#;

/// Every request to this plan's API fails to connect.
const UNREACHABLE_PLAN: &str = r#"
name = "unreachable"

[endpoints]
arm_url = "http://127.0.0.1:9"

[tokens]
"https://management.azure.com/" = "test-token"

[[operations]]
kind = "pause"
millis = 1

[[operations]]
kind = "resource_group"
name = "Create resource group"
subscription_id = "sub"
resource_group = "rg-{id}"
location = "westus2"

[[operations]]
kind = "pause"
name = "Never reached"
millis = 1
"#;

#[test]
fn test_check_lists_operations() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, PAUSE_PLAN);

    callsheet(&dir)
        .arg("check")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wait for role assignment"))
        .stdout(predicate::str::contains("Pause 1ms"))
        .stdout(predicate::str::contains("2 operation(s)"));
}

#[test]
fn test_check_missing_plan_fails() {
    let dir = TempDir::new().unwrap();

    callsheet(&dir)
        .args(["check", "missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read missing.toml"));
}

#[test]
fn test_check_missing_template_fails() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(
        &dir,
        r#"
[[operations]]
kind = "arm_deployment"
subscription_id = "sub"
resource_group = "rg"
deployment = "main"
template = "absent.json"
"#,
    );

    callsheet(&dir)
        .arg("check")
        .arg(&plan)
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.json"));
}

#[test]
fn test_run_completes_pause_plan() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, PAUSE_PLAN);

    callsheet(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::contains("Wait for role assignment"))
        .stdout(predicate::str::contains("2 operation(s) completed"));
}

#[test]
fn test_run_json_streams_events() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, PAUSE_PLAN);

    let assert = callsheet(&dir).arg("run").arg(&plan).arg("--json").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();

    let events: Vec<Value> =
        stdout.lines().map(|line| serde_json::from_str(line).expect("each line is JSON")).collect();
    assert_eq!(events.first().unwrap()["type"], "run_started");
    assert_eq!(events.first().unwrap()["total"], 2);
    assert_eq!(events.last().unwrap()["type"], "completed");
    assert_eq!(events.last().unwrap()["executed"], 2);
    let succeeded = events.iter().filter(|e| e["type"] == "operation_succeeded").count();
    assert_eq!(succeeded, 2);
}

#[test]
fn test_run_halts_with_exit_code_one() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, UNREACHABLE_PLAN);

    callsheet(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Halted at Create resource group"))
        .stdout(predicate::str::contains("Never reached").not());
}

#[test]
fn test_config_file_enables_json_output() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, PAUSE_PLAN);
    std::fs::write(dir.path().join(".callsheetrc"), "[output]\nformat = \"json\"\n").unwrap();

    callsheet(&dir)
        .arg("run")
        .arg(&plan)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("{"));
}
