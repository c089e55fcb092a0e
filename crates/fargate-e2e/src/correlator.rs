// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resolves handle-less submissions to the execution they started.
//!
//! Event and scheduled triggers only promise that "an execution will start
//! soon". The correlator lists recent executions of the target and picks the
//! one whose start time falls inside a [`CorrelationWindow`]. When the
//! submission carries a correlation token, candidates whose input does not
//! contain it are rejected, which removes the false positives a pure
//! time-window match has under concurrent runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::CorrelationSettings;
use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::executor::{AsyncExecutor, ScheduleRegistrar, TriggerRule};
use crate::types::{CorrelationWindow, ExecutionSummary, to_chrono};

/// What the correlator is looking for.
#[derive(Debug, Clone)]
pub struct CorrelationQuery {
    pub target: String,
    pub window: CorrelationWindow,
    pub token: Option<String>,
    /// Only list executions that are still running.
    pub running_only: bool,
}

impl CorrelationQuery {
    pub fn new(target: impl Into<String>, window: CorrelationWindow) -> Self {
        Self {
            target: target.into(),
            window,
            token: None,
            running_only: false,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn running_only(mut self, running_only: bool) -> Self {
        self.running_only = running_only;
        self
    }
}

pub struct Correlator {
    executor: Arc<dyn AsyncExecutor>,
    settings: CorrelationSettings,
}

impl Correlator {
    pub fn new(executor: Arc<dyn AsyncExecutor>, settings: CorrelationSettings) -> Self {
        Self { executor, settings }
    }

    pub fn settings(&self) -> &CorrelationSettings {
        &self.settings
    }

    /// Find the execution matching `query`.
    ///
    /// Lists exactly `max_attempts` times, sleeping `attempt_interval` between
    /// attempts, then fails with `CorrelationTimeout` carrying every candidate
    /// seen. Among several matches the latest start wins.
    pub async fn correlate(
        &self,
        query: &CorrelationQuery,
        max_attempts: u32,
        attempt_interval: Duration,
        deadline: &Deadline,
    ) -> Result<String> {
        let max_attempts = max_attempts.max(1);
        let mut seen: Vec<ExecutionSummary> = Vec::new();
        let mut seen_handles: HashSet<String> = HashSet::new();

        for attempt in 1..=max_attempts {
            deadline.check()?;

            let listed = match deadline
                .run(self.executor.list_recent(&query.target, query.running_only))
                .await?
            {
                Some(Ok(listed)) => listed,
                Some(Err(e)) if e.is_retryable() => {
                    warn!(attempt, max_attempts, error = %e, "Listing executions failed, will retry");
                    Vec::new()
                }
                Some(Err(e)) => return Err(e),
                None => return Err(self.deadline_error(query, deadline)),
            };

            for summary in &listed {
                if seen_handles.insert(summary.handle.clone()) {
                    seen.push(summary.clone());
                }
            }

            let mut candidates: Vec<&ExecutionSummary> = listed
                .iter()
                .filter(|s| query.window.contains(s.started_at))
                .collect();
            candidates.sort_by(|a, b| b.started_at.cmp(&a.started_at));

            info!(
                attempt,
                max_attempts,
                listed = listed.len(),
                in_window = candidates.len(),
                "Correlation attempt"
            );

            if let Some(handle) = self.pick(query, &candidates, deadline).await? {
                info!(handle = %handle, attempt, "Correlated execution");
                return Ok(handle);
            }

            if attempt < max_attempts {
                deadline.sleep(attempt_interval).await?;
                if deadline.is_expired() {
                    return Err(self.deadline_error(query, deadline));
                }
            }
        }

        Err(E2eError::CorrelationTimeout {
            target: query.target.clone(),
            window: query.window,
            attempts: max_attempts,
            candidates: seen,
        })
    }

    /// Choose among in-window candidates, newest first.
    async fn pick(
        &self,
        query: &CorrelationQuery,
        candidates: &[&ExecutionSummary],
        deadline: &Deadline,
    ) -> Result<Option<String>> {
        let Some(token) = &query.token else {
            return Ok(candidates.first().map(|c| c.handle.clone()));
        };

        let mut unverifiable: Option<&ExecutionSummary> = None;
        for candidate in candidates {
            let described = match deadline.run(self.executor.describe(&candidate.handle)).await? {
                Some(Ok(execution)) => execution,
                Some(Err(e)) if e.is_retryable() || matches!(e, E2eError::NotFound(_)) => {
                    debug!(handle = %candidate.handle, error = %e, "Skipping candidate this attempt");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => return Err(self.deadline_error(query, deadline)),
            };

            match described.input.as_deref() {
                Some(input) if input.contains(token.as_str()) => {
                    return Ok(Some(candidate.handle.clone()));
                }
                Some(_) => {
                    debug!(handle = %candidate.handle, "Candidate input lacks correlation token");
                }
                None => {
                    if unverifiable.is_none() {
                        unverifiable = Some(candidate);
                    }
                }
            }
        }

        // Backend does not expose inputs: fall back to the newest in-window start.
        if let Some(candidate) = unverifiable {
            warn!(
                handle = %candidate.handle,
                "Candidate input unavailable, matching on start time only"
            );
            return Ok(Some(candidate.handle.clone()));
        }
        Ok(None)
    }

    /// Correlate an event-triggered submission made at `submitted_at`.
    pub async fn correlate_event(
        &self,
        target: &str,
        submitted_at: chrono::DateTime<Utc>,
        token: Option<String>,
        deadline: &Deadline,
    ) -> Result<String> {
        deadline.sleep(self.settings.settle_delay).await?;
        let window = CorrelationWindow::around(
            submitted_at,
            self.settings.skew,
            self.settings.event_max_wait(),
        );
        let query = CorrelationQuery::new(target, window)
            .with_token(token)
            .running_only(false);
        self.correlate(
            &query,
            self.settings.event_attempts,
            self.settings.event_interval,
            deadline,
        )
        .await
    }

    /// Register a one-shot trigger, wait for it to fire, correlate the
    /// execution it started and remove the trigger again.
    ///
    /// The trigger is removed on every exit path: explicitly once correlation
    /// finishes, or by the guard's `Drop` if this future is cancelled.
    pub async fn schedule_and_correlate(
        &self,
        registrar: Arc<dyn ScheduleRegistrar>,
        rule: TriggerRule,
        token: Option<String>,
        deadline: &Deadline,
    ) -> Result<String> {
        let trigger = ScheduledTrigger::register(registrar, rule).await?;
        let outcome = self.await_scheduled(trigger.rule(), token, deadline).await;
        trigger.release().await;
        outcome
    }

    async fn await_scheduled(
        &self,
        rule: &TriggerRule,
        token: Option<String>,
        deadline: &Deadline,
    ) -> Result<String> {
        let settle = rule.fire_at + to_chrono(self.settings.fire_buffer);
        let wait = (settle - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        info!(
            rule = %rule.name,
            fire_at = %rule.fire_at.to_rfc3339(),
            wait_secs = wait.as_secs(),
            "Waiting for scheduled trigger to fire"
        );

        let mut remaining = wait;
        while !remaining.is_zero() {
            let step = remaining.min(Duration::from_secs(10));
            deadline.sleep(step).await?;
            if deadline.is_expired() {
                return Err(E2eError::DeadlineExceeded {
                    handle: rule.name.clone(),
                    budget: deadline.budget(),
                    last: None,
                });
            }
            remaining = remaining.saturating_sub(step);
            if !remaining.is_zero() {
                info!(remaining_secs = remaining.as_secs(), "Still waiting for trigger");
            }
        }

        let window = CorrelationWindow::new(
            rule.fire_at - to_chrono(self.settings.fire_buffer),
            rule.fire_at + to_chrono(self.settings.scheduled_window),
        );
        let query = CorrelationQuery::new(rule.target.clone(), window)
            .with_token(token)
            .running_only(false);
        self.correlate(
            &query,
            self.settings.scheduled_attempts,
            self.settings.scheduled_interval,
            deadline,
        )
        .await
    }

    fn deadline_error(&self, query: &CorrelationQuery, deadline: &Deadline) -> E2eError {
        E2eError::DeadlineExceeded {
            handle: format!("correlation of {}", query.target),
            budget: deadline.budget(),
            last: None,
        }
    }
}

// ============================================================================
// Scoped trigger registration
// ============================================================================

/// A registered one-shot trigger that is removed when released or dropped.
pub struct ScheduledTrigger {
    registrar: Arc<dyn ScheduleRegistrar>,
    rule: TriggerRule,
    released: bool,
}

impl ScheduledTrigger {
    pub async fn register(registrar: Arc<dyn ScheduleRegistrar>, rule: TriggerRule) -> Result<Self> {
        registrar.register(&rule).await?;
        info!(
            rule = %rule.name,
            schedule = %rule.schedule_expression,
            "Registered one-shot trigger"
        );
        Ok(Self {
            registrar,
            rule,
            released: false,
        })
    }

    pub fn rule(&self) -> &TriggerRule {
        &self.rule
    }

    /// Remove the trigger now. Failures are logged, never returned.
    ///
    /// The drop guard stays armed until deregistration returns, so a release
    /// that is itself cancelled still cleans up.
    pub async fn release(mut self) {
        let outcome = self.registrar.deregister(&self.rule.name).await;
        self.released = true;
        match outcome {
            Ok(()) => info!(rule = %self.rule.name, "Removed one-shot trigger"),
            Err(e) => warn!(rule = %self.rule.name, error = %e, "Failed to remove one-shot trigger"),
        }
    }
}

impl Drop for ScheduledTrigger {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registrar = self.registrar.clone();
        let name = self.rule.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = registrar.deregister(&name).await {
                        warn!(rule = %name, error = %e, "Failed to remove one-shot trigger on drop");
                    }
                });
            }
            Err(_) => warn!(rule = %name, "No runtime available, one-shot trigger left registered"),
        }
    }
}
