// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end scenario tests against in-memory backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::*;
use fargate_e2e::mock::{
    MockExecutor, MockLogStore, MockQueue, MockScheduleRegistrar, MockServiceProbe,
};
use fargate_e2e::{
    ExecutionState, Expectation, JobScenario, LogReader, OutputSource, Phase, QueueDepth,
    QueueScenario, ScenarioDriver, StreamSelector, Submission, SubmissionMode, Verdict,
};

fn task_logs() -> OutputSource {
    OutputSource::Logs {
        group: TASK_GROUP.to_string(),
        selector: StreamSelector::TaskId("ecs/hello-fargate".to_string()),
        begin_marker: TASK_BANNER.to_string(),
    }
}

// ============================================================================
// One-off task
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_oneoff_round_trip() {
    let executor = Arc::new(MockExecutor::new());
    let store = Arc::new(MockLogStore::new());
    let input = json!({"message": "Hello!"});
    // The mock hands out handles in order.
    push(&store, TASK_GROUP, "ecs/hello-fargate/mock-exec-1", &task_output(&input)).await;

    let scenario = JobScenario::new(
        "oneoff",
        executor.clone(),
        Submission::direct("hello-fargate-task", input.clone()),
        config(),
    )
    .with_logs(reader(&store))
    .with_output(task_logs())
    .expect(Expectation::echoed_message(&input));

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(verdict.success, "{}", verdict);
    assert_eq!(verdict.exit_code(), 0);
    assert_eq!(
        verdict.phases,
        vec![
            Phase::Building,
            Phase::Submitted,
            Phase::Polling,
            Phase::Terminal(ExecutionState::Succeeded),
            Phase::Verified,
        ]
    );
    assert_eq!(verdict.output.unwrap()["message"], "Processed: Hello!");
}

#[tokio::test(start_paused = true)]
async fn test_oneoff_wrong_output_fails_with_expected_and_actual() {
    let executor = Arc::new(MockExecutor::new());
    let store = Arc::new(MockLogStore::new());
    push(
        &store,
        TASK_GROUP,
        "ecs/hello-fargate/mock-exec-1",
        &task_output(&json!({"message": "Goodbye"})),
    )
    .await;

    let input = json!({"message": "Hello!"});
    let scenario = JobScenario::new(
        "oneoff",
        executor.clone(),
        Submission::direct("hello-fargate-task", input.clone()),
        config(),
    )
    .with_logs(reader(&store))
    .with_output(task_logs())
    .expect(Expectation::echoed_message(&input));

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(!verdict.success);
    assert_eq!(verdict.phase(), Some(Phase::Terminal(ExecutionState::Succeeded)));
    let notes = verdict.diagnostics.notes.join("\n");
    assert!(notes.contains("Processed: Hello!"), "{}", notes);
    assert!(notes.contains("Processed: Goodbye"), "{}", notes);
}

#[tokio::test(start_paused = true)]
async fn test_oneoff_nonzero_exit_code_propagates() {
    let executor = Arc::new(MockExecutor::failing(
        "Essential container in task exited (exit code 3)",
        Some(3),
    ));
    let scenario = JobScenario::new(
        "oneoff",
        executor.clone(),
        Submission::direct("hello-fargate-task", json!({"message": "Hello!"})),
        config(),
    );

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(!verdict.success);
    assert_eq!(verdict.exit_code(), 3);
    assert_eq!(verdict.diagnostics.last_state, Some(ExecutionState::Failed));
    assert_eq!(
        verdict.diagnostics.failure_reason.as_deref(),
        Some("Essential container in task exited (exit code 3)")
    );
    assert!(!verdict.diagnostics.backend.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stuck_execution_hits_scenario_deadline() {
    let executor = Arc::new(MockExecutor::never_completing());
    let config = config().with_scenario_deadline(Duration::from_secs(60));
    let scenario = JobScenario::new(
        "oneoff",
        executor.clone(),
        Submission::direct("hello-fargate-task", json!({})),
        config.clone(),
    );

    let verdict = ScenarioDriver::new(config).run(&scenario).await;

    assert!(!verdict.success);
    assert!(verdict.message.contains("deadline"), "{}", verdict.message);
    assert_eq!(verdict.diagnostics.last_state, Some(ExecutionState::Running));
    assert_eq!(verdict.phase(), Some(Phase::Polling));
    assert!(!verdict.diagnostics.backend.is_empty());
    assert_eq!(verdict.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_driver_reports_cancellation() {
    let executor = Arc::new(MockExecutor::never_completing());
    let token = CancellationToken::new();
    token.cancel();
    let scenario = JobScenario::new(
        "oneoff",
        executor.clone(),
        Submission::direct("hello-fargate-task", json!({})),
        config(),
    );

    let verdict = ScenarioDriver::new(config())
        .with_cancellation(token)
        .run(&scenario)
        .await;

    assert!(!verdict.success);
    assert_eq!(verdict.message, "cancelled");
}

// ============================================================================
// Workflow trigger modes
// ============================================================================

const STATE_MACHINE: &str = "arn:aws:states:eu-west-1:123456789012:stateMachine:hello";

#[tokio::test(start_paused = true)]
async fn test_workflow_direct_captures_result_payload() {
    let executor = Arc::new(MockExecutor::new().with_output(json!({
        "message": "Output from Initial Step",
        "parallelItems": [{"task_input": "item_A"}, {"task_input": "item_B"}],
    })));
    let scenario = JobScenario::new(
        "workflow direct",
        executor.clone(),
        Submission::direct(STATE_MACHINE, json!({"message": "Hello from E2E test!"})),
        config(),
    )
    .with_output(OutputSource::ExecutionResult)
    .expect(Expectation::Succeeded);

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;
    assert!(verdict.success, "{}", verdict);
    let output = verdict.output.unwrap();
    assert_eq!(output["message"], "Output from Initial Step");
    assert_eq!(output["parallelItems"][1]["task_input"], "item_B");
}

#[tokio::test(start_paused = true)]
async fn test_workflow_result_that_does_not_echo_input_fails_an_echo_check() {
    let executor = Arc::new(
        MockExecutor::new().with_output(json!({"message": "Output from Initial Step"})),
    );
    let input = json!({"message": "Hello from E2E test!"});
    let scenario = JobScenario::new(
        "workflow direct",
        executor.clone(),
        Submission::direct(STATE_MACHINE, input.clone()),
        config(),
    )
    .with_output(OutputSource::ExecutionResult)
    .expect(Expectation::echoed_message(&input));

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;
    assert!(!verdict.success);
    assert!(verdict.phases.contains(&Phase::Terminal(ExecutionState::Succeeded)));
}

#[tokio::test(start_paused = true)]
async fn test_workflow_event_mode_is_correlated() {
    let executor = Arc::new(MockExecutor::new().with_event_delay(1));
    // An unrelated run of the same state machine started just before.
    executor
        .launch(STATE_MACHINE, r#"{"message":"other"}"#, chrono::Utc::now())
        .await;

    let submission = Submission::new(
        STATE_MACHINE,
        json!({"message": "hi", "testId": "evt-42"}),
        SubmissionMode::EventTriggered,
    )
    .with_correlation_token("evt-42");
    let scenario = JobScenario::new("workflow event", executor.clone(), submission, config());

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(verdict.success, "{}", verdict);
    assert_eq!(
        verdict.phases,
        vec![
            Phase::Building,
            Phase::Submitted,
            Phase::Correlating,
            Phase::Correlated,
            Phase::Polling,
            Phase::Terminal(ExecutionState::Succeeded),
            Phase::Verified,
        ]
    );
    assert_eq!(verdict.execution.unwrap().handle, "mock-exec-2");
}

#[tokio::test(start_paused = true)]
async fn test_workflow_event_mode_times_out_with_candidates() {
    let executor = Arc::new(MockExecutor::new().with_event_delay(100));
    executor
        .launch(STATE_MACHINE, r#"{"message":"other"}"#, chrono::Utc::now())
        .await;
    let submission = Submission::new(
        STATE_MACHINE,
        json!({"testId": "evt-43"}),
        SubmissionMode::EventTriggered,
    )
    .with_correlation_token("evt-43");
    let config = config().with_event_correlation(3, Duration::from_secs(3));
    let scenario = JobScenario::new("workflow event", executor.clone(), submission, config.clone());

    let verdict = ScenarioDriver::new(config).run(&scenario).await;

    assert!(!verdict.success);
    assert_eq!(verdict.phase(), Some(Phase::Correlating));
    assert_eq!(executor.list_calls().await, 3);
    assert!(
        verdict
            .diagnostics
            .notes
            .iter()
            .any(|n| n.starts_with("candidate: mock-exec-1")),
        "{:?}",
        verdict.diagnostics.notes
    );
}

#[tokio::test(start_paused = true)]
async fn test_workflow_scheduled_mode_cleans_up_rule() {
    let executor = Arc::new(MockExecutor::new());
    let registrar = Arc::new(MockScheduleRegistrar::firing_into(executor.clone()));
    let submission = Submission::new(
        STATE_MACHINE,
        json!({"message": "scheduled", "testId": "sched-7"}),
        SubmissionMode::ScheduledTriggered,
    )
    .with_correlation_token("sched-7");
    let scenario = JobScenario::new("workflow scheduled", executor.clone(), submission, config())
        .with_registrar(registrar.clone());

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(verdict.success, "{}", verdict);
    assert!(verdict.phases.contains(&Phase::Correlated));
    assert!(registrar.rules().await.is_empty());
    assert_eq!(registrar.registered().await, registrar.removed().await);
    assert!(executor.submissions().await.is_empty());
}

// ============================================================================
// Array job
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_array_job_verifies_every_child() {
    let executor = Arc::new(MockExecutor::new().with_child_segments("hello-batch/default"));
    let store = Arc::new(MockLogStore::new());
    push(
        &store,
        BATCH_GROUP,
        "hello-batch/default/mock-exec-1/0",
        &child_output(0, "mock-exec-1:0", "item-A"),
    )
    .await;
    push(
        &store,
        BATCH_GROUP,
        "hello-batch/default/mock-exec-1/1",
        &child_output(1, "mock-exec-1:1", "item-B"),
    )
    .await;

    let input = json!({"items": ["item-A", "item-B"]});
    let scenario = JobScenario::new(
        "batch array",
        executor.clone(),
        Submission::direct("hello-batch-job", input.clone()).with_array_size(2),
        config(),
    )
    .with_logs(reader(&store))
    .with_output(OutputSource::ChildLogs {
        group: BATCH_GROUP.to_string(),
        begin_marker: JOB_BANNER.to_string(),
        success_marker: SUCCESS_MARKER.to_string(),
    })
    .expect(Expectation::array_items(&input, 2));

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(verdict.success, "{}", verdict);
    let output = verdict.output.unwrap();
    assert_eq!(output[0]["message"], "Processed item[0]: item-A");
    assert_eq!(output[1]["message"], "Processed item[1]: item-B");
    assert_eq!(output[1]["arrayIndex"], 1);
}

#[tokio::test(start_paused = true)]
async fn test_child_logs_without_children_fails() {
    let executor = Arc::new(MockExecutor::new());
    let store = Arc::new(MockLogStore::new());
    let scenario = JobScenario::new(
        "batch job",
        executor.clone(),
        Submission::direct("hello-batch-job", json!({"items": ["a"]})),
        config(),
    )
    .with_logs(reader(&store))
    .with_output(OutputSource::ChildLogs {
        group: BATCH_GROUP.to_string(),
        begin_marker: JOB_BANNER.to_string(),
        success_marker: SUCCESS_MARKER.to_string(),
    });

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(!verdict.success, "{}", verdict);
    assert!(!verdict.phases.contains(&Phase::Verified));
    assert!(verdict.to_string().contains("child count"), "{}", verdict);
}

#[tokio::test(start_paused = true)]
async fn test_array_job_with_failed_child_fails() {
    let executor = Arc::new(
        MockExecutor::new()
            .with_child_states(vec![ExecutionState::Succeeded, ExecutionState::Failed]),
    );
    let scenario = JobScenario::new(
        "batch array",
        executor.clone(),
        Submission::direct("hello-batch-job", json!({"items": ["a", "b"]})).with_array_size(2),
        config(),
    );

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(!verdict.success);
    assert_eq!(verdict.phase(), Some(Phase::Terminal(ExecutionState::Failed)));
    let summary = verdict.execution.unwrap().array.unwrap();
    assert_eq!(summary.count(ExecutionState::Failed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_array_size_is_validated_before_submission() {
    let executor = Arc::new(MockExecutor::new());
    let scenario = JobScenario::new(
        "batch array",
        executor.clone(),
        Submission::direct("hello-batch-job", json!({})).with_array_size(1),
        config(),
    );

    let verdict = ScenarioDriver::new(config()).run(&scenario).await;

    assert!(!verdict.success);
    assert!(verdict.message.contains("array size"));
    assert!(executor.submissions().await.is_empty());
}

// ============================================================================
// Queue round trip
// ============================================================================

async fn run(scenario: QueueScenario) -> Verdict {
    ScenarioDriver::new(config()).run(&scenario).await
}

fn queue_scenario(queue: Arc<MockQueue>, store: &Arc<MockLogStore>) -> QueueScenario {
    QueueScenario::new(queue, reader(store), WORKER_GROUP, config()).with_service(
        Arc::new(MockServiceProbe::new().with_service("queue-worker", 1, 1)),
        "queue-worker",
    )
}

#[tokio::test(start_paused = true)]
async fn test_queue_round_trip() {
    let store = Arc::new(MockLogStore::new());
    let queue = Arc::new(MockQueue::new().with_worker(
        store.clone(),
        WORKER_GROUP,
        "ecs/queue-worker/task-1",
    ));

    let verdict = run(queue_scenario(queue.clone(), &store).with_message("Hello from E2E test!")).await;

    assert!(verdict.success, "{}", verdict);
    let sent: serde_json::Value = serde_json::from_str(&queue.sent().await[0]).unwrap();
    let output = verdict.output.unwrap();
    assert_eq!(output["job_id"], sent["job_id"]);
    assert_eq!(output["message"], "Processed: Hello from E2E test!");
    assert!(verdict.diagnostics.notes.iter().any(|n| n == "queue drained"));
    assert!(!verdict.diagnostics.log_tail.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queue_without_worker_dumps_logs() {
    let store = Arc::new(MockLogStore::new());
    push(
        &store,
        WORKER_GROUP,
        "ecs/queue-worker/task-1",
        &["Waiting for messages...".to_string()],
    )
    .await;
    let queue = Arc::new(MockQueue::new());

    let verdict = run(queue_scenario(queue, &store)).await;

    assert!(!verdict.success);
    assert_eq!(verdict.phase(), Some(Phase::Polling));
    assert!(
        verdict
            .diagnostics
            .log_tail
            .iter()
            .any(|l| l.contains("Waiting for messages"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_queue_cancelled_while_reading_failure_tail() {
    let store = Arc::new(MockLogStore::new().with_read_delay(Duration::from_secs(3600)));
    push(
        &store,
        WORKER_GROUP,
        "ecs/queue-worker/task-1",
        &["Waiting for messages...".to_string()],
    )
    .await;
    let config = config().with_log_search(Duration::from_secs(1), Duration::from_secs(2));
    let scenario = QueueScenario::new(
        Arc::new(MockQueue::new()),
        LogReader::new(store.clone(), config.logs.clone()),
        WORKER_GROUP,
        config.clone(),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let verdict = ScenarioDriver::new(config)
        .with_cancellation(token)
        .run(&scenario)
        .await;

    assert!(!verdict.success);
    assert_eq!(verdict.message, "cancelled");
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_queue_message_left_behind_fails() {
    let store = Arc::new(MockLogStore::new());
    let queue = Arc::new(MockQueue::new().with_worker(
        store.clone(),
        WORKER_GROUP,
        "ecs/queue-worker/task-1",
    ));
    queue
        .script_depths(vec![QueueDepth {
            visible: 0,
            in_flight: 1,
        }])
        .await;

    let verdict = run(queue_scenario(queue, &store)).await;

    assert!(!verdict.success);
    assert!(verdict.message.contains("queue depth"), "{}", verdict.message);
}
