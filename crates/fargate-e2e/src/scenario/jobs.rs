// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Submit-and-verify scenarios for run-to-completion work.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::config::E2eConfig;
use crate::correlator::Correlator;
use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::executor::{AsyncExecutor, ScheduleRegistrar, TriggerRule};
use crate::logstore::{ChildLogTarget, LogReader, reconstruct_json, render_records};
use crate::poller::{Waiter, ensure_succeeded};
use crate::scenario::{DIAGNOSTICS_BUDGET, Phase, Scenario, Tracker, Verdict};
use crate::types::{ExecutionState, Submission, SubmissionMode, to_chrono};

/// How the log segment of an execution is named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelector {
    /// `<prefix>/<id>`, where `id` is the last `/`-separated part of the handle.
    TaskId(String),
    /// A fixed prefix shared by every execution.
    Prefix(String),
}

impl StreamSelector {
    pub fn resolve(&self, handle: &str) -> String {
        match self {
            StreamSelector::TaskId(prefix) => {
                let id = handle.rsplit('/').next().unwrap_or(handle);
                format!("{}/{}", prefix.trim_end_matches('/'), id)
            }
            StreamSelector::Prefix(prefix) => prefix.clone(),
        }
    }
}

/// Where the result of an execution is read from.
#[derive(Debug, Clone)]
pub enum OutputSource {
    /// Only the terminal state is checked.
    None,
    /// The result payload the executor reports.
    ExecutionResult,
    /// A JSON block printed after `begin_marker` in the execution's segment.
    Logs {
        group: String,
        selector: StreamSelector,
        begin_marker: String,
    },
    /// One JSON block per child of an array execution.
    ChildLogs {
        group: String,
        begin_marker: String,
        success_marker: String,
    },
}

/// What the output must look like.
#[derive(Debug, Clone, PartialEq)]
pub enum Expectation {
    Succeeded,
    /// `output[field] == expected`.
    OutputField { field: String, expected: Value },
    /// Child `i` reports `message == messages[i]`.
    ChildMessages(Vec<String>),
}

impl Expectation {
    pub fn field(field: impl Into<String>, expected: Value) -> Self {
        Expectation::OutputField {
            field: field.into(),
            expected,
        }
    }

    /// `message == "Processed: <input.message>"` when the input has a message.
    pub fn echoed_message(input: &Value) -> Self {
        match input.get("message").and_then(Value::as_str) {
            Some(message) => Self::field("message", json!(format!("Processed: {}", message))),
            None => Expectation::Succeeded,
        }
    }

    /// Per-child messages the array workload prints for `input`.
    pub fn array_items(input: &Value, size: u32) -> Self {
        let items: Vec<&str> = input
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let message = input.get("message").and_then(Value::as_str);

        let messages = (0..size as usize)
            .map(|i| match (items.get(i), message) {
                (Some(item), _) => format!("Processed item[{}]: {}", i, item),
                (None, _) if !items.is_empty() => {
                    format!("Array index {} out of range (items: {})", i, items.len())
                }
                (None, Some(message)) => format!("Processed: {} (index: {})", message, i),
                (None, None) => format!("Processed successfully (array index: {})", i),
            })
            .collect();
        Expectation::ChildMessages(messages)
    }

    fn child_message(&self, index: u32) -> Option<&str> {
        match self {
            Expectation::ChildMessages(messages) => messages.get(index as usize).map(String::as_str),
            _ => None,
        }
    }
}

/// Submit one unit of work, wait for it and verify its output.
pub struct JobScenario {
    name: String,
    submission: Submission,
    executor: Arc<dyn AsyncExecutor>,
    registrar: Option<Arc<dyn ScheduleRegistrar>>,
    logs: Option<LogReader>,
    output: OutputSource,
    expectation: Expectation,
    config: E2eConfig,
}

impl JobScenario {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn AsyncExecutor>,
        submission: Submission,
        config: E2eConfig,
    ) -> Self {
        Self {
            name: name.into(),
            submission,
            executor,
            registrar: None,
            logs: None,
            output: OutputSource::None,
            expectation: Expectation::Succeeded,
            config,
        }
    }

    /// Needed for scheduled submissions.
    pub fn with_registrar(mut self, registrar: Arc<dyn ScheduleRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_logs(mut self, logs: LogReader) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn with_output(mut self, output: OutputSource) -> Self {
        self.output = output;
        self
    }

    pub fn expect(mut self, expectation: Expectation) -> Self {
        self.expectation = expectation;
        self
    }

    async fn execute(
        &self,
        tracker: &mut Tracker,
        handle_slot: &mut Option<String>,
        deadline: &Deadline,
    ) -> Result<String> {
        self.submission.validate()?;
        let submitted_at = Utc::now();

        let handle = match self.submission.mode {
            SubmissionMode::ScheduledTriggered => {
                let registrar = self.registrar.clone().ok_or_else(|| {
                    E2eError::Config("scheduled submissions need a schedule registrar".into())
                })?;
                let rule = TriggerRule::one_shot(
                    self.submission.target.clone(),
                    self.submission.payload()?,
                    submitted_at,
                    self.config.correlation.schedule_delay,
                );
                tracker.enter(Phase::Submitted);
                tracker.enter(Phase::Correlating);
                tracker.note(format!(
                    "one-shot trigger {} ({})",
                    rule.name, rule.schedule_expression
                ));
                let handle = self
                    .correlator()
                    .schedule_and_correlate(
                        registrar,
                        rule,
                        self.submission.correlation_token.clone(),
                        deadline,
                    )
                    .await?;
                tracker.enter(Phase::Correlated);
                handle
            }
            mode => {
                let returned = deadline
                    .bound("submission", self.executor.submit(&self.submission))
                    .await?
                    .filter(|h| !h.is_empty());
                tracker.enter(Phase::Submitted);
                match (returned, mode) {
                    (Some(handle), _) => handle,
                    (None, SubmissionMode::Direct) => {
                        return Err(E2eError::Backend(format!(
                            "{} returned no handle for a direct submission",
                            self.executor.backend_name()
                        )));
                    }
                    (None, _) => {
                        tracker.enter(Phase::Correlating);
                        let handle = self
                            .correlator()
                            .correlate_event(
                                &self.submission.target,
                                submitted_at,
                                self.submission.correlation_token.clone(),
                                deadline,
                            )
                            .await?;
                        tracker.enter(Phase::Correlated);
                        handle
                    }
                }
            }
        };
        info!(scenario = %self.name, handle = %handle, "Tracking execution");
        *handle_slot = Some(handle.clone());

        tracker.enter(Phase::Polling);
        let execution = Waiter::new(self.executor.clone())
            .with_not_found_grace(self.config.poll.not_found_grace)
            .wait_for_terminal(&handle, self.config.poll.interval, deadline)
            .await?;
        tracker.enter(Phase::Terminal(execution.state));
        tracker.set_execution(execution.clone());
        ensure_succeeded(&execution)?;

        let output = self
            .collect_output(tracker, &handle, execution.output_json(), submitted_at, deadline)
            .await?;
        if let Some(output) = output {
            tracker.set_output(output);
        }

        tracker.enter(Phase::Verified);
        Ok(format!("execution {} succeeded and output verified", handle))
    }

    async fn collect_output(
        &self,
        tracker: &mut Tracker,
        handle: &str,
        result: Option<Value>,
        submitted_at: DateTime<Utc>,
        deadline: &Deadline,
    ) -> Result<Option<Value>> {
        match &self.output {
            OutputSource::None | OutputSource::ExecutionResult => {
                self.check_value(result.as_ref())?;
                Ok(result)
            }
            OutputSource::Logs {
                group,
                selector,
                begin_marker,
            } => {
                let reader = self.reader()?;
                let since = submitted_at - to_chrono(reader.settings().lookback);
                let records = reader
                    .await_output(group, &selector.resolve(handle), Some(since), deadline)
                    .await?;
                let value = reconstruct_json(&records, begin_marker);
                if value.is_none() {
                    tracker.log_tail(render_records(&records));
                    return Err(E2eError::assertion(
                        "task output",
                        format!("a JSON block after '{}'", begin_marker),
                        format!("no parsable output in {} records", records.len()),
                    ));
                }
                self.check_value(value.as_ref())?;
                Ok(value)
            }
            OutputSource::ChildLogs {
                group,
                begin_marker,
                success_marker,
            } => self
                .verify_children(
                    tracker,
                    handle,
                    group,
                    begin_marker,
                    success_marker,
                    submitted_at,
                    deadline,
                )
                .await
                .map(Some),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn verify_children(
        &self,
        tracker: &mut Tracker,
        handle: &str,
        group: &str,
        begin_marker: &str,
        success_marker: &str,
        submitted_at: DateTime<Utc>,
        deadline: &Deadline,
    ) -> Result<Value> {
        let reader = self.reader()?;
        let children = deadline
            .retry(self.config.poll.interval, handle, || {
                self.executor.describe_children(handle)
            })
            .await?;

        let size = self.submission.array_size.unwrap_or(children.len() as u32);
        if size == 0 {
            return Err(E2eError::assertion(
                "child count",
                "at least one child",
                0,
            ));
        }
        if !children.is_empty() && children.len() as u32 != size {
            return Err(E2eError::assertion("child count", size, children.len()));
        }
        for child in &children {
            if child.state != ExecutionState::Succeeded {
                return Err(E2eError::TerminalFailure {
                    handle: child.handle.clone(),
                    state: child.state,
                    reason: child
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "child did not succeed".into()),
                });
            }
        }

        let targets: Vec<ChildLogTarget> = (0..size)
            .map(|index| ChildLogTarget {
                index,
                segment: children
                    .iter()
                    .find(|c| c.index == index)
                    .and_then(|c| c.log_segment.clone()),
                token: self.expectation.child_message(index).map(str::to_string),
            })
            .collect();

        let settings = reader.settings();
        let fanout = reader
            .find_fanout_output(
                group,
                &targets,
                success_marker,
                submitted_at,
                settings.interval,
                settings.max_attempts(),
                deadline,
            )
            .await?;

        let mut outputs = Vec::with_capacity(fanout.children.len());
        for child in &fanout.children {
            let value = reconstruct_json(&child.records, begin_marker);
            let message = value
                .as_ref()
                .and_then(|v| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string);
            info!(
                index = child.index,
                segment = child.segment.as_deref().unwrap_or("<unknown>"),
                done = child.done,
                message = message.as_deref().unwrap_or(""),
                "Child output"
            );

            if !child.done {
                tracker.log_tail(render_records(&child.records));
                return Err(E2eError::assertion(
                    format!("child {} output", child.index),
                    format!("a record containing '{}'", success_marker),
                    format!("{} records without it", child.records.len()),
                ));
            }
            if let Some(expected) = self.expectation.child_message(child.index) {
                let found = message.as_deref() == Some(expected)
                    || child.records.iter().any(|r| r.message.contains(expected));
                if !found {
                    return Err(E2eError::assertion(
                        format!("child {} message", child.index),
                        expected,
                        message.unwrap_or_else(|| "<none>".into()),
                    ));
                }
            }
            outputs.push(value.unwrap_or(Value::Null));
        }
        Ok(Value::Array(outputs))
    }

    fn check_value(&self, value: Option<&Value>) -> Result<()> {
        match &self.expectation {
            Expectation::Succeeded => Ok(()),
            Expectation::OutputField { field, expected } => {
                let actual = value.and_then(|v| v.get(field.as_str()));
                if actual == Some(expected) {
                    Ok(())
                } else {
                    Err(E2eError::assertion(
                        format!("output field '{}'", field),
                        expected,
                        actual.map(Value::to_string).unwrap_or_else(|| "<missing>".into()),
                    ))
                }
            }
            Expectation::ChildMessages(_) => Err(E2eError::Config(
                "child messages can only be checked against child logs".into(),
            )),
        }
    }

    fn reader(&self) -> Result<&LogReader> {
        self.logs
            .as_ref()
            .ok_or_else(|| E2eError::Config(format!("scenario {} reads logs but has no log store", self.name)))
    }

    fn correlator(&self) -> Correlator {
        Correlator::new(self.executor.clone(), self.config.correlation.clone())
    }

    /// Gather backend state and recent logs for a failed run.
    async fn collect_failure(
        &self,
        tracker: &mut Tracker,
        handle: Option<&str>,
        err: &E2eError,
        deadline: &Deadline,
    ) {
        if deadline.is_cancelled() && !deadline.is_expired() {
            return;
        }
        let budget = Deadline::after(DIAGNOSTICS_BUDGET);

        if let Some(handle) = handle
            && matches!(err, E2eError::DeadlineExceeded { .. } | E2eError::TerminalFailure { .. })
        {
            match budget.run(self.executor.diagnose(handle)).await {
                Ok(Some(lines)) => tracker.backend_diagnostics(lines),
                _ => warn!(handle = %handle, "Backend diagnostics unavailable"),
            }
        }

        let Some(reader) = &self.logs else {
            return;
        };
        let tail = match (&self.output, handle) {
            (OutputSource::Logs { group, selector, .. }, Some(handle)) => {
                let prefix = selector.resolve(handle);
                budget
                    .run(reader.tail(group, Some(&prefix), reader.settings().failure_tail))
                    .await
            }
            (OutputSource::ChildLogs { group, .. }, _) => {
                budget
                    .run(reader.tail(group, None, reader.settings().failure_tail))
                    .await
            }
            _ => return,
        };
        if let Ok(Some(Ok(records))) = tail
            && !records.is_empty()
        {
            tracker.log_tail(render_records(&records));
        }
    }
}

#[async_trait]
impl Scenario for JobScenario {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, deadline: &Deadline) -> Verdict {
        let mut tracker = Tracker::new(&self.name);
        let mut handle = None;
        match self.execute(&mut tracker, &mut handle, deadline).await {
            Ok(message) => tracker.pass(message),
            Err(err) => {
                self.collect_failure(&mut tracker, handle.as_deref(), &err, deadline)
                    .await;
                tracker.fail(&err)
            }
        }
    }
}
