//! CLI tests for the `foreman` binary.
//!
//! Each test runs against a fresh config in a temp directory and checks exit
//! codes and the persisted task state.

use std::path::Path;
use std::process::{Command, Output};

use foreman::core::status::TaskStatus;
use foreman::exit_codes;
use foreman::io::json_store::JsonFileStore;
use foreman::io::store::Store;
use serde_json::Value;

fn foreman(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_foreman"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .arg("--config")
        .arg(dir.join("foreman.toml"))
        .args(args)
        .output()
        .expect("run foreman")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn init(dir: &Path) {
    let output = foreman(dir, &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}

#[test]
fn init_writes_config_and_state_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());

    assert!(temp.path().join("foreman.toml").is_file());
    assert!(temp.path().join(".foreman").is_dir());
    assert!(temp.path().join("workspace").is_dir());

    let again = foreman(temp.path(), &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::OK));
    assert!(stdout(&again).contains("exists"));
}

#[test]
fn seed_then_status_reports_the_pending_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());

    let seeded = foreman(
        temp.path(),
        &[
            "seed",
            "Add login",
            "--type",
            "bug",
            "--priority",
            "-2",
            "--content",
            r#"{"ticket": 42}"#,
        ],
    );
    assert_eq!(seeded.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout(&seeded).trim(), "1");

    let status = foreman(temp.path(), &["status", "--json"]);
    assert_eq!(status.status.code(), Some(exit_codes::OK));
    let reports: Value = serde_json::from_str(&stdout(&status)).expect("json");
    let task = &reports[0]["task"];
    assert_eq!(task["title"], "Add login");
    assert_eq!(task["type"], "bug");
    assert_eq!(task["status"], "pending");
    assert_eq!(task["priority"], -2);
    assert_eq!(task["content"]["ticket"], 42);

    let text = foreman(temp.path(), &["status", "1"]);
    assert!(stdout(&text).contains("#1 [pending] Add login"));
}

#[test]
fn invalid_content_json_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());

    let output = foreman(temp.path(), &["seed", "Broken", "--content", "{not json"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--content"));
}

#[test]
fn cancel_and_retry_move_the_task_between_states() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());
    foreman(temp.path(), &["seed", "Flaky"]);

    let cancelled = foreman(temp.path(), &["cancel", "1"]);
    assert_eq!(cancelled.status.code(), Some(exit_codes::OK));
    let store = JsonFileStore::open(&temp.path().join(".foreman")).expect("store");
    assert_eq!(
        store.get_task(1).expect("task").status,
        TaskStatus::Cancelled
    );

    let retried = foreman(temp.path(), &["retry", "1"]);
    assert_eq!(retried.status.code(), Some(exit_codes::OK));
    let task = store.get_task(1).expect("task");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 0);

    let missing = foreman(temp.path(), &["cancel", "99"]);
    assert_eq!(missing.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn dispatch_with_nothing_to_do_exits_cleanly() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());

    let output = foreman(temp.path(), &["dispatch"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).trim().is_empty());
}

#[test]
fn cleanup_dry_run_reports_without_deleting() {
    let temp = tempfile::tempdir().expect("tempdir");
    init(temp.path());

    let output = foreman(temp.path(), &["cleanup", "--days", "7", "--dry-run"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report: Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["interactions"], 0);
}
