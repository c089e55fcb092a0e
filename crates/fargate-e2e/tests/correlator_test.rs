// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for finding executions that were started indirectly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use fargate_e2e::mock::{MockExecutor, MockScheduleRegistrar};
use fargate_e2e::{
    AsyncExecutor, CorrelationQuery, CorrelationSettings, CorrelationWindow, Correlator, Deadline,
    E2eError, ScheduleRegistrar, ScheduledTrigger, Submission, SubmissionMode, TriggerRule,
};

const TARGET: &str = "arn:aws:states:eu-west-1:123456789012:stateMachine:hello";
const INTERVAL: Duration = Duration::from_secs(3);

fn window_around_now() -> CorrelationWindow {
    CorrelationWindow::around(Utc::now(), Duration::from_secs(30), Duration::from_secs(60))
}

fn correlator(executor: &Arc<MockExecutor>) -> Correlator {
    Correlator::new(executor.clone(), CorrelationSettings::default())
}

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(300))
}

// ============================================================================
// Attempt budget
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_lists_exactly_max_attempts_then_times_out() {
    let executor = Arc::new(MockExecutor::new());
    let query = CorrelationQuery::new(TARGET, window_around_now());

    let start = tokio::time::Instant::now();
    let err = correlator(&executor)
        .correlate(&query, 4, INTERVAL, &deadline())
        .await
        .unwrap_err();

    match err {
        E2eError::CorrelationTimeout {
            attempts,
            candidates,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert!(candidates.is_empty());
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(executor.list_calls().await, 4);
    // No sleep after the last attempt.
    assert_eq!(start.elapsed(), INTERVAL * 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_listing_consumes_an_attempt() {
    let executor = Arc::new(MockExecutor::new());
    let handle = executor.launch(TARGET, "{}", Utc::now()).await;
    executor.fail_lists(2).await;
    let query = CorrelationQuery::new(TARGET, window_around_now());

    let found = correlator(&executor)
        .correlate(&query, 3, INTERVAL, &deadline())
        .await
        .unwrap();
    assert_eq!(found, handle);
    assert_eq!(executor.list_calls().await, 3);

    executor.fail_lists(3).await;
    let err = correlator(&executor)
        .correlate(&query, 3, INTERVAL, &deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::CorrelationTimeout { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_window_candidates_are_reported() {
    let executor = Arc::new(MockExecutor::new());
    let stale = executor
        .launch(TARGET, "{}", Utc::now() - ChronoDuration::minutes(10))
        .await;
    let query = CorrelationQuery::new(TARGET, window_around_now());

    let err = correlator(&executor)
        .correlate(&query, 2, INTERVAL, &deadline())
        .await
        .unwrap_err();
    match err {
        E2eError::CorrelationTimeout { candidates, .. } => {
            assert_eq!(candidates.len(), 1);
            assert_eq!(candidates[0].handle, stale);
        }
        other => panic!("unexpected error: {}", other),
    }
}

// ============================================================================
// Disambiguation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_latest_start_wins_without_token() {
    let executor = Arc::new(MockExecutor::new());
    let now = Utc::now();
    executor
        .launch(TARGET, "{}", now - ChronoDuration::seconds(5))
        .await;
    let newest = executor.launch(TARGET, "{}", now).await;
    executor
        .launch("other-state-machine", "{}", now + ChronoDuration::seconds(1))
        .await;

    let query = CorrelationQuery::new(TARGET, window_around_now());
    let found = correlator(&executor)
        .correlate(&query, 1, INTERVAL, &deadline())
        .await
        .unwrap();
    assert_eq!(found, newest);
}

#[tokio::test(start_paused = true)]
async fn test_token_picks_own_execution_over_newer_one() {
    let executor = Arc::new(MockExecutor::new());
    let now = Utc::now();
    let mine = executor
        .launch(
            TARGET,
            r#"{"message":"hi","testId":"token-123"}"#,
            now - ChronoDuration::seconds(2),
        )
        .await;
    executor
        .launch(TARGET, r#"{"message":"someone else"}"#, now)
        .await;

    let query = CorrelationQuery::new(TARGET, window_around_now())
        .with_token(Some("token-123".to_string()));
    let found = correlator(&executor)
        .correlate(&query, 1, INTERVAL, &deadline())
        .await
        .unwrap();
    assert_eq!(found, mine);
}

#[tokio::test(start_paused = true)]
async fn test_token_without_inputs_falls_back_to_newest() {
    let executor = Arc::new(MockExecutor::new().without_inputs());
    let now = Utc::now();
    executor
        .launch(TARGET, "{}", now - ChronoDuration::seconds(2))
        .await;
    let newest = executor.launch(TARGET, "{}", now).await;

    let query = CorrelationQuery::new(TARGET, window_around_now())
        .with_token(Some("token-123".to_string()));
    let found = correlator(&executor)
        .correlate(&query, 1, INTERVAL, &deadline())
        .await
        .unwrap();
    assert_eq!(found, newest);
}

// ============================================================================
// Event-triggered
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_event_correlation_waits_for_execution_to_appear() {
    let executor = Arc::new(MockExecutor::new().with_event_delay(2));
    let submitted_at = Utc::now();
    let submission = Submission::new(
        TARGET,
        json!({"message": "hi", "testId": "evt-1"}),
        SubmissionMode::EventTriggered,
    )
    .with_correlation_token("evt-1");
    assert_eq!(executor.submit(&submission).await.unwrap(), None);

    let handle = correlator(&executor)
        .correlate_event(TARGET, submitted_at, Some("evt-1".to_string()), &deadline())
        .await
        .unwrap();

    assert_eq!(executor.handles().await, vec![handle]);
    assert_eq!(executor.list_calls().await, 3);
}

// ============================================================================
// Scheduled
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduled_trigger_is_removed_after_correlation() {
    let executor = Arc::new(MockExecutor::new());
    let registrar = Arc::new(MockScheduleRegistrar::firing_into(executor.clone()));
    let rule = TriggerRule::one_shot(
        TARGET,
        r#"{"testId":"sched-1"}"#,
        Utc::now(),
        Duration::from_secs(60),
    );
    let name = rule.name.clone();

    let handle = correlator(&executor)
        .schedule_and_correlate(
            registrar.clone(),
            rule,
            Some("sched-1".to_string()),
            &deadline(),
        )
        .await
        .unwrap();

    assert_eq!(executor.handles().await, vec![handle]);
    assert!(
        registrar
            .list("test-scheduled-trigger-")
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(registrar.removed().await, vec![name]);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_trigger_is_removed_when_correlation_fails() {
    // Fires into nothing: the rule never starts an execution.
    let executor = Arc::new(MockExecutor::new());
    let registrar = Arc::new(MockScheduleRegistrar::new());
    let rule = TriggerRule::one_shot(TARGET, "{}", Utc::now(), Duration::from_secs(60));

    let settings = CorrelationSettings {
        scheduled_attempts: 2,
        ..CorrelationSettings::default()
    };
    let err = Correlator::new(executor.clone(), settings)
        .schedule_and_correlate(registrar.clone(), rule, None, &deadline())
        .await
        .unwrap_err();

    assert!(matches!(err, E2eError::CorrelationTimeout { attempts: 2, .. }));
    assert!(registrar.rules().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_trigger_is_removed_in_background() {
    let registrar = Arc::new(MockScheduleRegistrar::new());
    let rule = TriggerRule::one_shot(TARGET, "{}", Utc::now(), Duration::from_secs(60));

    let trigger = ScheduledTrigger::register(registrar.clone(), rule).await.unwrap();
    assert_eq!(registrar.rules().await.len(), 1);
    drop(trigger);

    for _ in 0..10 {
        if registrar.rules().await.is_empty() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(registrar.rules().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_release_still_removes_trigger() {
    let registrar =
        Arc::new(MockScheduleRegistrar::new().with_deregister_delay(Duration::from_secs(10)));
    let rule = TriggerRule::one_shot(TARGET, "{}", Utc::now(), Duration::from_secs(60));
    let trigger = ScheduledTrigger::register(registrar.clone(), rule).await.unwrap();

    let interrupted = tokio::time::timeout(Duration::from_secs(1), trigger.release()).await;
    assert!(interrupted.is_err());
    assert_eq!(registrar.rules().await.len(), 1);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(registrar.rules().await.is_empty());
    assert_eq!(registrar.removed().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_registration_leaves_nothing_behind() {
    let executor = Arc::new(MockExecutor::new());
    let registrar = Arc::new(MockScheduleRegistrar::failing());
    let rule = TriggerRule::one_shot(TARGET, "{}", Utc::now(), Duration::from_secs(60));

    let err = correlator(&executor)
        .schedule_and_correlate(registrar.clone(), rule, None, &deadline())
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::Backend(_)));
    assert!(registrar.registered().await.is_empty());
    assert_eq!(executor.list_calls().await, 0);
}
