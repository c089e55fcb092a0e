// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend contracts: executors, schedule registrars and message queues.
//!
//! Each backend (task launch, state machine, array job queue, queue plus
//! consumer service) implements the same small capability set; scenarios only
//! ever talk to these traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{E2eError, Result};
use crate::types::{ChildExecution, Execution, ExecutionSummary, Submission, to_chrono};

/// Submit work and report its state.
#[async_trait]
pub trait AsyncExecutor: Send + Sync {
    /// Short backend name used in logs and diagnostics.
    fn backend_name(&self) -> &'static str;

    /// Start the work described by `submission`.
    ///
    /// Direct submissions return an authoritative handle. Event and scheduled
    /// submissions return `None`: an execution will start later and has to be
    /// correlated. This call is not idempotent and is never retried
    /// automatically.
    async fn submit(&self, submission: &Submission) -> Result<Option<String>>;

    /// Describe the current state of `handle`.
    ///
    /// Fails with `NotFound` for stale or unknown handles and `Transient` for
    /// network or throttling problems.
    async fn describe(&self, handle: &str) -> Result<Execution>;

    /// Recently started executions of `target`, used as correlation candidates.
    async fn list_recent(&self, target: &str, running_only: bool) -> Result<Vec<ExecutionSummary>> {
        let _ = (target, running_only);
        Err(E2eError::InvalidInput(format!(
            "{} executor cannot list executions",
            self.backend_name()
        )))
    }

    /// Children of an array execution, ordered by index.
    async fn describe_children(&self, handle: &str) -> Result<Vec<ChildExecution>> {
        let _ = handle;
        Ok(Vec::new())
    }

    /// Free-form backend state that helps explain a stalled execution.
    async fn diagnose(&self, handle: &str) -> Vec<String> {
        let _ = handle;
        Vec::new()
    }
}

// ============================================================================
// One-shot schedules
// ============================================================================

/// A rule that fires once and starts `target` with `input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRule {
    pub name: String,
    pub fire_at: DateTime<Utc>,
    pub schedule_expression: String,
    pub target: String,
    pub input: String,
    pub description: String,
}

impl TriggerRule {
    /// Rule firing at `now + delay`, truncated to the minute.
    pub fn one_shot(
        target: impl Into<String>,
        input: impl Into<String>,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Self {
        let mut fire_at = truncate_to_minute(now + to_chrono(delay));
        if fire_at <= now {
            fire_at += chrono::Duration::minutes(1);
        }
        Self {
            name: format!("test-scheduled-trigger-{}", now.timestamp()),
            fire_at,
            schedule_expression: cron_at(fire_at),
            target: target.into(),
            input: input.into(),
            description: format!("One-shot e2e trigger at {}", fire_at.to_rfc3339()),
        }
    }
}

/// Single-fire cron expression for `at` (UTC).
pub fn cron_at(at: DateTime<Utc>) -> String {
    format!(
        "cron({} {} {} {} ? {})",
        at.minute(),
        at.hour(),
        at.day(),
        at.month(),
        at.year()
    )
}

fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(at)
}

/// Registers and removes one-shot schedules.
#[async_trait]
pub trait ScheduleRegistrar: Send + Sync {
    /// Create the rule and attach its target. A partially created rule is
    /// removed before an error is returned.
    async fn register(&self, rule: &TriggerRule) -> Result<()>;

    /// Detach targets and delete the rule. Missing rules are not an error.
    async fn deregister(&self, rule_name: &str) -> Result<()>;

    /// Names of rules starting with `name_prefix`.
    async fn list(&self, name_prefix: &str) -> Result<Vec<String>>;
}

// ============================================================================
// Queues
// ============================================================================

/// Approximate number of messages held by a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn is_empty(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

/// A message queue drained by a consumer service.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue `body`, returning the queue's message id. Not retried.
    async fn send(&self, body: &str) -> Result<String>;

    async fn depth(&self) -> Result<QueueDepth>;
}

pub type SharedExecutor = Arc<dyn AsyncExecutor>;
pub type SharedRegistrar = Arc<dyn ScheduleRegistrar>;
pub type SharedQueue = Arc<dyn MessageQueue>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cron_expression() {
        let at = Utc.with_ymd_and_hms(2025, 7, 4, 9, 5, 0).unwrap();
        assert_eq!(cron_at(at), "cron(5 9 4 7 ? 2025)");
    }

    #[test]
    fn test_one_shot_truncates_to_minute() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 58, 42).unwrap();
        let rule = TriggerRule::one_shot("arn:sm", "{}", now, Duration::from_secs(60));
        assert_eq!(
            rule.fire_at,
            Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 0).unwrap()
        );
        assert_eq!(rule.schedule_expression, "cron(59 23 31 12 ? 2025)");
        assert_eq!(rule.name, format!("test-scheduled-trigger-{}", now.timestamp()));
    }

    #[test]
    fn test_one_shot_rolls_over_year() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 30).unwrap();
        let rule = TriggerRule::one_shot("arn:sm", "{}", now, Duration::from_secs(60));
        assert_eq!(rule.schedule_expression, "cron(0 0 1 1 ? 2026)");
    }

    #[test]
    fn test_one_shot_never_fires_in_the_past() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 50).unwrap();
        let rule = TriggerRule::one_shot("arn:sm", "{}", now, Duration::from_secs(5));
        assert_eq!(
            rule.fire_at,
            Utc.with_ymd_and_hms(2025, 3, 1, 10, 1, 0).unwrap()
        );
    }

    #[test]
    fn test_queue_depth_empty() {
        assert!(QueueDepth::default().is_empty());
        assert!(
            !QueueDepth {
                visible: 0,
                in_flight: 1
            }
            .is_empty()
        );
    }
}
