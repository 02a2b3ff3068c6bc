//! End-to-end engine scenarios against a scripted collaborator.
//!
//! Each test seeds a task in a temporary workspace, locks it as a dispatcher
//! would, and drives `Engine::process_task` through planning, milestone
//! execution and final validation.

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use foreman::core::role::AgentRole;
use foreman::core::status::{MilestoneStatus, TaskStatus};
use foreman::core::types::{InteractionStatus, TaskType};
use foreman::engine::TaskOutcome;
use foreman::error::EngineError;
use foreman::io::locks::LockManager;
use foreman::io::store::Store;
use foreman::test_support::{Scripted, TestHarness};

const WORKER: &str = "worker-test";

fn lock(harness: &TestHarness, task_id: u64) {
    assert!(
        harness
            .store
            .try_lock_task(task_id, WORKER, Utc::now(), Duration::from_secs(600))
            .expect("lock task")
    );
}

#[test]
fn single_dev_milestone_plan_completes_and_unlocks() {
    let harness = TestHarness::new();
    let task = harness.seed("Add greeting", TaskType::Feature);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Implement X","agent_type":"dev"}]}"#);
    harness.client.reply(
        r#"{"summary":"added","file_changes":[{"path":"src/greet.rs","content":"pub fn greet() {}\n"}]}"#,
    );

    let engine = harness.engine();
    let planned = engine.plan_task(&task, &[], "run-1").expect("plan");
    assert_eq!(planned.len(), 1);
    assert_eq!(planned[0].sequence, 1);
    assert_eq!(planned[0].agent_role, AgentRole::Dev);
    assert_eq!(planned[0].status, MilestoneStatus::Pending);
    assert_eq!(planned[0].title, "Implement X");

    let outcome = engine.process_task(task.id, WORKER).expect("process");
    assert_eq!(outcome, TaskOutcome::Completed);

    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.locked_by.is_none());
    assert!(task.locked_until.is_none());
    assert!(task.completed_at.is_some());

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    assert_eq!(milestones.len(), 1);
    assert_eq!(milestones[0].status, MilestoneStatus::Completed);
    assert!(milestones[0].output_data.is_some());
    assert_eq!(harness.read_file("src/greet.rs"), "pub fn greet() {}\n");

    let log = harness.store.interactions(Some(task.id)).expect("interactions");
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| r.status == InteractionStatus::Success));
    assert_eq!(log[0].role, AgentRole::Pm);
    assert_eq!(log[1].role, AgentRole::Dev);
    assert_eq!(log[1].milestone_id, Some(milestones[0].id));
    assert_eq!(harness.client.remaining(), 0);
}

#[test]
fn empty_plan_falls_back_to_default_three_steps() {
    let harness = TestHarness::new();
    let task = harness.seed("Improve search", TaskType::Feature);
    lock(&harness, task.id);
    harness.client.reply("");
    harness.client.reply("Requirements: search must be fast.");
    harness.client.reply(
        r#"{"file_changes":[{"path":"src/search.rs","content":"pub fn search() {}\n"}]}"#,
    );
    harness.client.reply(r#"{"assessment":"looks good","issues":[]}"#);

    let engine = harness.engine();
    let outcome = engine.process_task(task.id, WORKER).expect("process");
    assert_eq!(outcome, TaskOutcome::Completed);

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    let roles: Vec<AgentRole> = milestones.iter().map(|m| m.agent_role).collect();
    assert_eq!(roles, vec![AgentRole::Ba, AgentRole::Dev, AgentRole::Qa]);
    let sequences: Vec<u32> = milestones.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(milestones.iter().all(|m| m.status == MilestoneStatus::Completed));

    let qa_output = milestones[2].output_data.as_ref().expect("qa output");
    assert_eq!(qa_output["tests"]["status"], "skipped");

    let log = harness.store.interactions(Some(task.id)).expect("interactions");
    assert_eq!(log[0].status, InteractionStatus::Error);
    assert!(log[0].error.as_deref().unwrap_or_default().contains("empty"));
}

#[test]
fn milestone_failure_skips_the_rest_and_fails_the_task() {
    let harness = TestHarness::new();
    let task = harness.seed("Patch config", TaskType::Bug);
    lock(&harness, task.id);
    harness.client.reply(
        r#"{"milestones":[
            {"title":"Implement fix","agent_type":"dev"},
            {"title":"Test fix","agent_type":"qa"}
        ]}"#,
    );
    harness
        .client
        .reply(r#"{"file_changes":[{"path":"../outside.rs","content":"pwned"}]}"#);

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    match &err {
        EngineError::MilestoneExecutionFailed { sequence, reason, .. } => {
            assert_eq!(*sequence, 1);
            assert!(reason.contains("escapes workspace root"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    assert_eq!(milestones[0].status, MilestoneStatus::Failed);
    assert!(milestones[0].failure_reason.is_some());
    assert_eq!(milestones[1].status, MilestoneStatus::Skipped);

    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.locked_by.is_none());
    assert!(task.last_error.as_deref().unwrap_or_default().contains("milestone 1"));
    assert!(!harness.workspace().parent().expect("parent").join("outside.rs").exists());
    assert_eq!(harness.client.requests().len(), 2);
}

#[test]
fn held_milestone_lock_defers_without_touching_status() {
    let harness = TestHarness::new();
    let task = harness.seed("Write docs", TaskType::Maintenance);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Document the API","agent_type":"doc"}]}"#);

    let engine = harness.engine();
    let planned = engine.plan_task(&task, &[], "run-1").expect("plan");
    let key = format!("milestone:{}", planned[0].id);
    assert!(
        harness
            .locks
            .try_acquire(&key, "another-worker", Duration::from_secs(60))
            .expect("acquire")
    );

    let outcome = engine.process_task(task.id, WORKER).expect("process");
    assert_eq!(
        outcome,
        TaskOutcome::Deferred {
            milestone_id: planned[0].id
        }
    );
    let milestone = harness.store.get_milestone(planned[0].id).expect("milestone");
    assert_eq!(milestone.status, MilestoneStatus::Pending);
    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.locked_by.is_none());
    assert_eq!(harness.client.requests().len(), 1);
}

#[test]
fn dev_without_file_changes_streams_an_execution_plan() {
    let harness = TestHarness::new();
    let task = harness.seed("Scaffold library", TaskType::Feature);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Develop the library","agent_type":"dev"}]}"#);
    harness.client.reply("I will create the library skeleton.");
    harness.client.push(Scripted::Stream(vec![
        r#"{"actions": [{"action": "create_folder", "path": "src"},"#.to_string(),
        r#" {"action": "create_file", "path": "src/lib.rs", "content": "pub fn a() {}\n"}]}"#
            .to_string(),
    ]));

    let engine = harness.engine();
    assert_eq!(
        engine.process_task(task.id, WORKER).expect("process"),
        TaskOutcome::Completed
    );
    assert_eq!(harness.read_file("src/lib.rs"), "pub fn a() {}\n");

    let milestone = &harness.store.milestones_for_task(task.id).expect("milestones")[0];
    let actions = &milestone.output_data.as_ref().expect("output")["actions"]["outcomes"];
    assert_eq!(actions.as_array().map(Vec::len), Some(2));
}

#[test]
fn stream_without_end_marker_fails_the_milestone() {
    let harness = TestHarness::new();
    let task = harness.seed("Scaffold library", TaskType::Upgrade);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Implement upgrade","agent_type":"dev"}]}"#);
    harness.client.reply("Working on it.");
    harness
        .client
        .push(Scripted::Truncated(vec![r#"{"actions": ["#.to_string()]));

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    assert!(matches!(err, EngineError::MilestoneExecutionFailed { .. }));
    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);

    let log = harness.store.interactions(Some(task.id)).expect("interactions");
    assert_eq!(log.last().map(|r| r.status), Some(InteractionStatus::Error));
}

#[test]
fn final_validation_error_fails_the_task() {
    let mut harness = TestHarness::new();
    harness.config.commands.allowed = vec!["git".to_string()];
    harness.write_file("Cargo.toml", "[package]\nname = \"demo\"\n");
    let task = harness.seed("Tidy up", TaskType::Maintenance);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Analyze requirements","agent_type":"ba"}]}"#);
    harness.client.reply(r#"{"requirements":["keep it tidy"]}"#);

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    assert!(matches!(err, EngineError::Sandbox(_)), "{err}");

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    assert_eq!(milestones[0].status, MilestoneStatus::Completed);
    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.locked_by.is_none());
}

#[test]
fn collaborator_errors_fail_the_current_milestone() {
    let harness = TestHarness::new();
    let task = harness.seed("Design screens", TaskType::Feature);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Design the UI","agent_type":"ux"}]}"#);
    harness.client.push(Scripted::Fail(
        foreman::error::CollaboratorError::Status {
            code: 529,
            body: "overloaded".to_string(),
        },
    ));

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    match err {
        EngineError::MilestoneExecutionFailed { reason, .. } => {
            assert!(reason.contains("overloaded"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn requeued_task_appends_a_new_plan_after_existing_sequences() {
    let harness = TestHarness::new();
    let task = harness.seed("Retry me", TaskType::Feature);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Implement it","agent_type":"dev"}]}"#);
    harness
        .client
        .reply(r#"{"file_changes":[{"path":"/etc/passwd","content":"x"}]}"#);
    let engine = harness.engine();
    engine.process_task(task.id, WORKER).expect_err("first attempt fails");

    let mut task = harness.store.get_task(task.id).expect("task");
    task.transition_to(TaskStatus::Pending, Utc::now()).expect("requeue");
    harness.store.update_task(&task).expect("update");
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Implement it again","agent_type":"dev"}]}"#);
    harness
        .client
        .reply(r#"{"file_changes":[{"path":"src/ok.rs","content":"pub fn ok() {}\n"}]}"#);
    assert_eq!(
        engine.process_task(task.id, WORKER).expect("second attempt"),
        TaskOutcome::Completed
    );

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    let summary: Vec<(u32, MilestoneStatus)> =
        milestones.iter().map(|m| (m.sequence, m.status)).collect();
    assert_eq!(
        summary,
        vec![(1, MilestoneStatus::Failed), (2, MilestoneStatus::Completed)]
    );
}

#[test]
fn heartbeat_keeps_the_milestone_lock_past_its_ttl() {
    let mut harness = TestHarness::new();
    harness.config.locks.milestone_ttl_secs = 1;
    let task = harness.seed("Slow analysis", TaskType::Feature);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Analyze requirements","agent_type":"ba"}]}"#);
    harness.client.push(Scripted::Slow(
        Duration::from_millis(2500),
        r#"{"requirements":["be thorough"]}"#.to_string(),
    ));

    let engine = harness.engine();
    let planned = engine.plan_task(&task, &[], "run-1").expect("plan");
    let milestone_id = planned[0].id;
    let store = harness.store.clone();
    let locks = harness.locks.clone();
    let intruder = thread::spawn(move || {
        let give_up = Instant::now() + Duration::from_secs(5);
        while store.get_milestone(milestone_id).expect("milestone").status
            != MilestoneStatus::InProgress
        {
            assert!(Instant::now() < give_up, "milestone never started");
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(1500));
        locks
            .try_acquire(
                &format!("milestone:{milestone_id}"),
                "intruder",
                Duration::from_secs(60),
            )
            .expect("acquire")
    });

    let outcome = engine.process_task(task.id, WORKER).expect("process");
    let stolen = intruder.join().expect("intruder thread");
    assert!(!stolen, "lock expired while the handler was still running");
    assert_eq!(outcome, TaskOutcome::Completed);
    let milestone = harness.store.get_milestone(milestone_id).expect("milestone");
    assert_eq!(milestone.status, MilestoneStatus::Completed);
}

#[test]
fn failing_project_tests_fail_final_validation() {
    let harness = TestHarness::new();
    harness.write_file("Cargo.toml", "not toml [");
    let task = harness.seed("Tidy up", TaskType::Maintenance);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Analyze requirements","agent_type":"ba"}]}"#);
    harness.client.reply(r#"{"requirements":["keep it tidy"]}"#);

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    match &err {
        EngineError::ValidationFailed(detail) => {
            assert!(detail.starts_with("cargo exited with"), "{detail}");
        }
        other => panic!("unexpected error: {other}"),
    }

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    assert_eq!(milestones[0].status, MilestoneStatus::Completed);
    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.as_deref().unwrap_or_default().contains("final validation"));
}

#[test]
fn qa_milestone_fails_when_project_tests_fail() {
    let harness = TestHarness::new();
    harness.write_file("Cargo.toml", "not toml [");
    let task = harness.seed("Verify fix", TaskType::Bug);
    lock(&harness, task.id);
    harness.client.reply(
        r#"{"milestones":[
            {"title":"Test the fix","agent_type":"qa"},
            {"title":"Document the fix","agent_type":"doc"}
        ]}"#,
    );
    harness.client.reply(r#"{"assessment":"ship it","issues":[]}"#);

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    match &err {
        EngineError::MilestoneExecutionFailed { sequence, reason, .. } => {
            assert_eq!(*sequence, 1);
            assert!(reason.contains("cargo tests failed"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    assert_eq!(milestones[0].status, MilestoneStatus::Failed);
    assert_eq!(milestones[1].status, MilestoneStatus::Skipped);
    assert_eq!(harness.client.requests().len(), 2);
}

#[test]
fn exhausted_budget_stops_before_the_next_milestone() {
    let mut harness = TestHarness::new();
    harness.config.engine.execution_budget_secs = Some(1);
    let task = harness.seed("Long job", TaskType::Feature);
    lock(&harness, task.id);
    harness.client.reply(
        r#"{"milestones":[
            {"title":"Analyze requirements","agent_type":"ba"},
            {"title":"Analyze more","agent_type":"ba"}
        ]}"#,
    );
    harness.client.push(Scripted::Slow(
        Duration::from_millis(1500),
        r#"{"requirements":["slow"]}"#.to_string(),
    ));

    let engine = harness.engine();
    let err = engine.process_task(task.id, WORKER).expect_err("must fail");
    assert!(
        matches!(err, EngineError::DeadlineExceeded { budget_secs: 1, .. }),
        "{err}"
    );

    let milestones = harness.store.milestones_for_task(task.id).expect("milestones");
    assert_eq!(milestones[0].status, MilestoneStatus::Completed);
    assert_eq!(milestones[1].status, MilestoneStatus::Pending);
    let task = harness.store.get_task(task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.locked_by.is_none());
    assert_eq!(harness.client.requests().len(), 2);
}

#[test]
fn upgrade_tasks_snapshot_the_workspace_before_planning() {
    let harness = TestHarness::new();
    harness.write_file("src/lib.rs", "pub fn before() {}\n");
    harness.write_file("target/debug/artifact", "binary");
    let task = harness.seed("Upgrade framework", TaskType::Upgrade);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Implement upgrade","agent_type":"dev"}]}"#);
    harness
        .client
        .reply(r#"{"file_changes":[{"path":"src/lib.rs","content":"pub fn after() {}\n"}]}"#);

    let engine = harness.engine();
    assert_eq!(
        engine.process_task(task.id, WORKER).expect("process"),
        TaskOutcome::Completed
    );
    assert_eq!(harness.read_file("src/lib.rs"), "pub fn after() {}\n");

    let backups: Vec<_> = fs::read_dir(harness.config.state_dir.join("backups"))
        .expect("backups dir")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(backups.len(), 1);
    let name = backups[0].file_name().and_then(|n| n.to_str()).unwrap_or_default();
    assert!(name.starts_with(&format!("upgrade-{}-", task.id)), "{name}");
    assert_eq!(
        fs::read_to_string(backups[0].join("src/lib.rs")).expect("backup copy"),
        "pub fn before() {}\n"
    );
    assert!(!backups[0].join("target").exists());
}

#[test]
fn non_upgrade_tasks_take_no_snapshot() {
    let harness = TestHarness::new();
    harness.write_file("src/lib.rs", "pub fn a() {}\n");
    let task = harness.seed("Small feature", TaskType::Feature);
    lock(&harness, task.id);
    harness
        .client
        .reply(r#"{"milestones":[{"title":"Analyze requirements","agent_type":"ba"}]}"#);
    harness.client.reply(r#"{"requirements":["small"]}"#);

    harness.engine().process_task(task.id, WORKER).expect("process");
    assert!(!harness.config.state_dir.join("backups").exists());
}
