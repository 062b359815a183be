//! CLI test cases.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("docmill").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_options() {
    cmd()
        .arg("schema")
        .arg("options")
        .assert()
        .success()
        .stdout(predicate::str::contains("ocr_engine"));
}

#[test]
fn test_schema_task() {
    cmd()
        .arg("schema")
        .arg("task")
        .assert()
        .success()
        .stdout(predicate::str::contains("task_id"));
}

#[test]
fn test_process_text_document() {
    let store = tempfile::tempdir().unwrap();
    cmd()
        .arg("process")
        .arg("tests/fixtures/doc.txt")
        .arg("--engine")
        .arg("echo")
        .arg("--store-dir")
        .arg(store.path())
        .arg("--wait-secs")
        .arg("60")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"completed\""));
}

#[test]
fn test_process_missing_document_is_invalid_input() {
    let store = tempfile::tempdir().unwrap();
    cmd()
        .arg("process")
        .arg("tests/fixtures/no-such-file.txt")
        .arg("--store-dir")
        .arg(store.path())
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_batch_jsonl() {
    let store = tempfile::tempdir().unwrap();
    let output = store.path().join("out.jsonl");
    cmd()
        .arg("batch")
        .arg("tests/fixtures/input.jsonl")
        .arg("--store-dir")
        .arg(store.path())
        .arg("--out")
        .arg(&output)
        .arg("--wait-secs")
        .arg("60")
        .assert()
        .success();

    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(written.lines().count(), 2);
    assert!(written.contains("doc-a"));
    assert!(written.contains("\"completed\""));
}

#[test]
fn test_tasks_on_empty_store() {
    let store = tempfile::tempdir().unwrap();
    cmd()
        .arg("tasks")
        .arg("--store-dir")
        .arg(store.path())
        .arg("--stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 0"));
}
