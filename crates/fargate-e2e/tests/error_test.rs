// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for error messages and classification.

use std::time::Duration;

use chrono::{TimeZone, Utc};

use fargate_e2e::{
    CorrelationWindow, E2eError, Execution, ExecutionState, ExecutionSummary,
};

// ============================================================================
// Display
// ============================================================================

#[test]
fn test_terminal_failure_message() {
    let err = E2eError::TerminalFailure {
        handle: "task-1".to_string(),
        state: ExecutionState::Failed,
        reason: "Essential container in task exited".to_string(),
    };
    assert_eq!(
        err.to_string(),
        "execution task-1 ended FAILED: Essential container in task exited"
    );
}

#[test]
fn test_deadline_message_uses_seconds() {
    let err = E2eError::DeadlineExceeded {
        handle: "job-1".to_string(),
        budget: Duration::from_millis(300_500),
        last: None,
    };
    assert_eq!(err.to_string(), "deadline of 300s exceeded waiting for job-1");
    assert!(err.last_execution().is_none());
}

#[test]
fn test_correlation_timeout_counts_candidates() {
    let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2025, 3, 1, 12, 1, 0).unwrap();
    let err = E2eError::CorrelationTimeout {
        target: "hello-sm".to_string(),
        window: CorrelationWindow::new(start, end),
        attempts: 10,
        candidates: vec![ExecutionSummary {
            handle: "exec-1".to_string(),
            started_at: start,
            state: ExecutionState::Running,
        }],
    };
    assert_eq!(
        err.to_string(),
        "no execution of hello-sm started within [2025-03-01T12:00:00+00:00, 2025-03-01T12:01:00+00:00] after 10 attempts (1 candidates seen)"
    );
}

#[test]
fn test_assertion_helper_formats_values() {
    let err = E2eError::assertion("child count", 2, 1);
    assert_eq!(
        err.to_string(),
        "assertion failed: child count: expected 2, got 1"
    );
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn test_only_transient_errors_are_retryable() {
    assert!(E2eError::Transient("throttled".into()).is_retryable());
    assert!(!E2eError::NotFound("task-1".into()).is_retryable());
    assert!(!E2eError::Backend("access denied".into()).is_retryable());
    assert!(!E2eError::Cancelled.is_retryable());
}

#[test]
fn test_deadline_keeps_last_execution() {
    let last = Execution::new("task-1", ExecutionState::Running).with_raw_status("PROVISIONING");
    let err = E2eError::DeadlineExceeded {
        handle: "task-1".to_string(),
        budget: Duration::from_secs(60),
        last: Some(Box::new(last.clone())),
    };
    assert_eq!(err.last_execution(), Some(&last));
}

// ============================================================================
// Conversions
// ============================================================================

#[test]
fn test_json_error_converts_to_serialization() {
    let err: E2eError = serde_json::from_str::<serde_json::Value>("{not json")
        .unwrap_err()
        .into();
    assert!(matches!(err, E2eError::Serialization(_)));
}

#[test]
fn test_url_error_converts_to_invalid_input() {
    let err: E2eError = url::Url::parse("not a url").unwrap_err().into();
    match err {
        E2eError::InvalidInput(message) => assert!(message.starts_with("invalid url")),
        other => panic!("unexpected error: {}", other),
    }
}
