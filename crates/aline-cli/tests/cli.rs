//! CLI command integration tests.
//! Each test uses a temp directory via ALINE_DATA_DIR for full isolation.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn aline_cmd(data_dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("aline").unwrap();
    cmd.env("ALINE_DATA_DIR", data_dir.path());
    cmd
}

fn init_tiny(dir: &TempDir) {
    aline_cmd(dir)
        .args(["init", "--tiny"])
        .assert()
        .success()
        .stdout(predicate::str::contains("initialized checkpoint"));
}

fn write_request(dir: &TempDir, rows: usize) -> std::path::PathBuf {
    let path = dir.path().join("request.json");
    let body = serde_json::json!({
        "user_id": "cli-user",
        "features": vec![vec![0.3; 20]; rows],
        "k": 2,
        "observed_hours": [0, 1]
    });
    std::fs::write(&path, body.to_string()).unwrap();
    path
}

#[test]
fn schema_lists_wire_records() {
    let dir = TempDir::new().unwrap();
    aline_cmd(&dir)
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("PolicyRequest"))
        .stdout(predicate::str::contains("DailyRiskResponse"));
}

#[test]
fn stats_fresh_corpus() {
    let dir = TempDir::new().unwrap();
    aline_cmd(&dir)
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("days:       0"))
        .stdout(predicate::str::contains("checkpoint: (none)"));
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    init_tiny(&dir);
    aline_cmd(&dir)
        .args(["init", "--tiny"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    aline_cmd(&dir).args(["init", "--tiny", "--force"]).assert().success();
}

#[test]
fn predict_without_checkpoint_fails() {
    let dir = TempDir::new().unwrap();
    let req = write_request(&dir, 24);
    aline_cmd(&dir)
        .arg("predict")
        .arg(&req)
        .assert()
        .failure()
        .stderr(predicate::str::contains("aline init"));
}

#[test]
fn predict_after_init() {
    let dir = TempDir::new().unwrap();
    init_tiny(&dir);
    let req = write_request(&dir, 24);
    let output = aline_cmd(&dir).arg("predict").arg(&req).output().unwrap();
    assert!(output.status.success());
    let body: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["user_id"], "cli-user");
    assert_eq!(body["hourly_posteriors"].as_array().unwrap().len(), 24);
    assert_eq!(body["selected_hours"].as_array().unwrap().len(), 2);
    assert_eq!(body["available_hours"], 22);
}

#[test]
fn predict_rejects_short_day() {
    let dir = TempDir::new().unwrap();
    init_tiny(&dir);
    let req = write_request(&dir, 12);
    aline_cmd(&dir)
        .arg("predict")
        .arg(&req)
        .assert()
        .failure()
        .stderr(predicate::str::contains("prediction failed"))
        .stderr(predicate::str::contains("validation error"));
}

#[test]
fn train_then_eval() {
    let dir = TempDir::new().unwrap();
    init_tiny(&dir);
    aline_cmd(&dir)
        .args(["train", "--episodes", "10", "--epochs", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("best epoch"));

    let output = aline_cmd(&dir)
        .args(["eval", "--episodes", "6", "--k", "2"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["prediction"]["n"], 6);
    assert_eq!(report["policy"]["k"], 2);
}

#[test]
fn config_file_overrides_data_dir() {
    let dir = TempDir::new().unwrap();
    let other = TempDir::new().unwrap();
    let cfg = dir.path().join("aline.toml");
    std::fs::write(
        &cfg,
        format!("[storage]\ndata_dir = \"{}\"\n", other.path().display()),
    )
    .unwrap();
    aline_cmd(&dir)
        .args(["init", "--tiny", "--config"])
        .arg(&cfg)
        .assert()
        .success();
    assert!(other.path().join("checkpoint").join("model.toml").is_file());
    assert!(!dir.path().join("checkpoint").exists());
}
