//! Integration tests for the resume and worker binaries

mod common;

use assert_cmd::Command;
use batchloop::checkpoint::write_checkpoint;
use batchloop::loops::PipelineState;
use batchloop::{CompositeOutput, WorkingArea};
use common::{counting_composite, datasets};
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_resume_help() {
    let mut cmd = Command::cargo_bin("batchloop-resume").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("CHECKPOINT"));
}

#[test]
fn test_resume_requires_checkpoint_argument() {
    let mut cmd = Command::cargo_bin("batchloop-resume").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("error:"));
}

#[test]
fn test_missing_checkpoint_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("batchloop-resume").unwrap();
    cmd.arg(dir.path().join("reader_state.json.gz"))
        .assert()
        .code(3)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_corrupt_checkpoint_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let checkpoint = dir.path().join("reader_state.json.gz");
    std::fs::write(&checkpoint, b"not gzip").unwrap();

    let mut cmd = Command::cargo_bin("batchloop-resume").unwrap();
    cmd.arg(&checkpoint).assert().code(3);
}

#[tokio::test]
async fn test_resume_prints_results_as_json() {
    let dir = TempDir::new().unwrap();
    let area = WorkingArea::create(dir.path()).unwrap();
    let mut composite = counting_composite();
    for unit in datasets() {
        composite.read(&unit).unwrap();
    }
    write_checkpoint(
        &area.checkpoint_path(),
        &PipelineState::Composite(composite.snapshot().unwrap()),
    )
    .await
    .unwrap();

    let assert = Command::cargo_bin("batchloop-resume")
        .unwrap()
        .arg(area.checkpoint_path())
        .assert()
        .success();
    let output: CompositeOutput = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(output.results[0], json!(3));
    assert_eq!(output.results[1], json!(6));
}

#[tokio::test]
async fn test_concurrent_resume_processes_extract_once() {
    let dir = TempDir::new().unwrap();
    let area = WorkingArea::create(dir.path()).unwrap();
    let module = dir.path().join("btagging");
    std::fs::create_dir_all(&module).unwrap();
    std::fs::write(module.join("weights.csv"), "0.8,0.9\n").unwrap();
    area.pack_modules(&[module]).unwrap();

    let mut composite = counting_composite();
    for unit in datasets() {
        composite.read(&unit).unwrap();
    }
    write_checkpoint(
        &area.checkpoint_path(),
        &PipelineState::Composite(composite.snapshot().unwrap()),
    )
    .await
    .unwrap();

    let children: Vec<_> = (0..6)
        .map(|_| {
            std::process::Command::new(env!("CARGO_BIN_EXE_batchloop-resume"))
                .arg(area.checkpoint_path())
                .args(["--lock-timeout", "60"])
                .env("RUST_LOG", "info")
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .unwrap()
        })
        .collect();
    let outputs: Vec<_> = children
        .into_iter()
        .map(|child| child.wait_with_output().unwrap())
        .collect();

    let mut extracted = 0;
    for output in &outputs {
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(output.status.success(), "{stderr}");
        if stderr.contains("Extracted runtime modules") {
            extracted += 1;
        }
        assert_eq!(output.stdout, outputs[0].stdout);
    }
    assert_eq!(extracted, 1);
    assert!(!area.marker_path().exists());
    assert_eq!(
        std::fs::read_to_string(area.modules_dir().join("btagging/weights.csv")).unwrap(),
        "0.8,0.9\n"
    );

    let output: CompositeOutput = serde_json::from_slice(&outputs[0].stdout).unwrap();
    assert_eq!(output.results[0], json!(3));
}

#[test]
fn test_worker_fails_on_missing_task() {
    let dir = TempDir::new().unwrap();
    let area = WorkingArea::create(dir.path()).unwrap();

    let mut cmd = Command::cargo_bin("batchloop-worker").unwrap();
    cmd.arg(area.task_path(7)).assert().failure();
}
