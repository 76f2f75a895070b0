// ABOUTME: Integration tests for the halyard CLI commands.
// ABOUTME: Validates --help output, init, status on a fresh project, and deploy argument errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn halyard_cmd() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("halyard"));
    cmd.env_remove("RUST_LOG");
    cmd
}

fn initialized_project() -> tempfile::TempDir {
    let temp_dir = tempfile::tempdir().unwrap();
    halyard_cmd()
        .current_dir(temp_dir.path())
        .args(["init", "--project", "shop"])
        .assert()
        .success();
    temp_dir
}

#[test]
fn help_shows_commands() {
    halyard_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn init_creates_config_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("halyard.yml");

    halyard_cmd()
        .current_dir(temp_dir.path())
        .args(["init", "--project", "shop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created halyard.yml"));

    let content = fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("project: shop"));
    assert!(content.contains("environments:"));
}

#[test]
fn init_refuses_to_overwrite_existing_config() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config_path = temp_dir.path().join("halyard.yml");

    fs::write(&config_path, "existing: config").unwrap();

    halyard_cmd()
        .current_dir(temp_dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    assert_eq!(fs::read_to_string(&config_path).unwrap(), "existing: config");
}

#[test]
fn status_of_fresh_project() {
    let project = initialized_project();

    halyard_cmd()
        .current_dir(project.path())
        .args(["status", "-e", "staging"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Known good:  none"))
        .stdout(predicate::str::contains("Lock:        free"));
}

#[test]
fn status_as_json() {
    let project = initialized_project();

    let output = halyard_cmd()
        .current_dir(project.path())
        .args(["--json", "status", "-e", "prod"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["environment"]["name"], "prod");
    assert!(report["lock"].is_null());
}

#[test]
fn deploy_to_unknown_environment_fails() {
    let project = initialized_project();

    halyard_cmd()
        .current_dir(project.path())
        .args(["deploy", "-e", "qa", "--version", "v1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown environment: qa"));
}

#[test]
fn deploy_without_registry_variable_fails() {
    let project = initialized_project();

    halyard_cmd()
        .current_dir(project.path())
        .env_remove("HALYARD_REGISTRY")
        .args(["deploy", "-e", "dev", "--version", "v1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("HALYARD_REGISTRY"));
}

#[test]
fn deploy_without_image_repository_fails() {
    let project = initialized_project();

    halyard_cmd()
        .current_dir(project.path())
        .env("HALYARD_REGISTRY", ".halyard/registry")
        .env_remove("HALYARD_IMAGE")
        .args(["deploy", "-e", "dev", "--version", "v1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("HALYARD_IMAGE"));
}

#[test]
fn deploy_refuses_a_local_path_as_image() {
    let project = initialized_project();

    halyard_cmd()
        .current_dir(project.path())
        .env("HALYARD_REGISTRY", ".halyard/registry")
        .env("HALYARD_IMAGE", ".halyard/registry")
        .args(["deploy", "-e", "dev", "--version", "v1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("local path"));
}

#[test]
fn deploy_without_config_fails() {
    let temp_dir = tempfile::tempdir().unwrap();

    halyard_cmd()
        .current_dir(temp_dir.path())
        .args(["deploy", "-e", "dev", "--version", "v1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("configuration file not found"));
}

#[test]
fn quiet_and_json_conflict() {
    halyard_cmd()
        .args(["--quiet", "--json", "status", "-e", "dev"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
