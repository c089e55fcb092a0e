// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step Functions state machines.
//!
//! Direct submissions call `StartExecution` and get the execution ARN back.
//! Event-triggered submissions publish a `Test Trigger` event on an
//! EventBridge bus; a rule on that bus starts the execution, which is then
//! found by listing the state machine's recent executions.

use async_trait::async_trait;
use aws_sdk_eventbridge::types::PutEventsRequestEntry;
use aws_sdk_sfn::Client;
use aws_sdk_sfn::types::ExecutionStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use fargate_e2e::{
    AsyncExecutor, E2eError, Execution, ExecutionState, ExecutionSummary, Result, Submission,
    SubmissionMode,
};

use crate::error::SdkResultExt;
use crate::to_utc;

pub const EVENT_SOURCE: &str = "fargate.workflow.test";
pub const EVENT_DETAIL_TYPE: &str = "Test Trigger";

/// Executions looked at per listing.
const LIST_PAGE_SIZE: i32 = 10;

/// History events included in diagnostics.
const HISTORY_EVENTS: i32 = 5;

/// Map an execution status string onto the core state.
pub fn execution_state(status: &str) -> ExecutionState {
    match status {
        "SUCCEEDED" => ExecutionState::Succeeded,
        "FAILED" | "PENDING_REDRIVE" => ExecutionState::Failed,
        "TIMED_OUT" => ExecutionState::TimedOut,
        "ABORTED" => ExecutionState::Aborted,
        _ => ExecutionState::Running,
    }
}

/// Detail of the trigger event. String input that is not a JSON document is
/// passed as `rawInput`.
pub fn event_detail(state_machine_arn: &str, input: &Value, at: DateTime<Utc>) -> Value {
    let mut detail = json!({
        "stateMachineArn": state_machine_arn,
        "timestamp": at.to_rfc3339_opts(SecondsFormat::Secs, true),
    });
    match input {
        Value::String(raw) => detail["rawInput"] = json!(raw),
        other => detail["testInput"] = other.clone(),
    }
    detail
}

fn failure_reason(error: Option<&str>, cause: Option<&str>) -> Option<String> {
    match (error, cause) {
        (Some(error), Some(cause)) => Some(format!("{}: {}", error, cause)),
        (Some(only), None) | (None, Some(only)) => Some(only.to_string()),
        (None, None) => None,
    }
}

/// Publishes trigger events onto an EventBridge bus.
#[derive(Clone)]
pub struct EventTrigger {
    client: aws_sdk_eventbridge::Client,
    bus: String,
}

impl EventTrigger {
    pub fn new(client: aws_sdk_eventbridge::Client, bus: impl Into<String>) -> Self {
        Self {
            client,
            bus: bus.into(),
        }
    }

    async fn emit(&self, state_machine_arn: &str, input: &Value) -> Result<()> {
        let detail = event_detail(state_machine_arn, input, Utc::now());
        let entry = PutEventsRequestEntry::builder()
            .source(EVENT_SOURCE)
            .detail_type(EVENT_DETAIL_TYPE)
            .detail(serde_json::to_string(&detail)?)
            .event_bus_name(&self.bus)
            .build();

        let output = self
            .client
            .put_events()
            .entries(entry)
            .send()
            .await
            .or_classify("PutEvents")?;

        if output.failed_entry_count() > 0 {
            let reason = output
                .entries()
                .iter()
                .find_map(|e| e.error_message())
                .unwrap_or("unknown reason");
            return Err(E2eError::Backend(format!("event rejected: {}", reason)));
        }
        let event_id = output.entries().first().and_then(|e| e.event_id());
        info!(bus = %self.bus, event_id = ?event_id, "Trigger event published");
        Ok(())
    }
}

/// Starts and observes state machine executions.
pub struct StepFunctionsExecutor {
    client: Client,
    events: Option<EventTrigger>,
}

impl StepFunctionsExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            events: None,
        }
    }

    pub fn from_conf(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }

    /// Needed for event-triggered submissions.
    pub fn with_event_trigger(mut self, events: EventTrigger) -> Self {
        self.events = Some(events);
        self
    }
}

#[async_trait]
impl AsyncExecutor for StepFunctionsExecutor {
    fn backend_name(&self) -> &'static str {
        "step-functions"
    }

    async fn submit(&self, submission: &Submission) -> Result<Option<String>> {
        match submission.mode {
            SubmissionMode::Direct => {
                let output = self
                    .client
                    .start_execution()
                    .state_machine_arn(&submission.target)
                    .input(submission.payload()?)
                    .set_name(submission.name.clone())
                    .send()
                    .await
                    .or_classify("StartExecution")?;
                let arn = output.execution_arn();
                info!(execution_arn = %arn, "Execution started");
                Ok(Some(arn.to_string()))
            }
            SubmissionMode::EventTriggered => {
                let events = self.events.as_ref().ok_or_else(|| {
                    E2eError::Config("event-triggered submissions need an event bus".into())
                })?;
                events.emit(&submission.target, &submission.input).await?;
                Ok(None)
            }
            // The schedule registrar owns scheduled submissions.
            SubmissionMode::ScheduledTriggered => Ok(None),
        }
    }

    async fn describe(&self, handle: &str) -> Result<Execution> {
        let output = self
            .client
            .describe_execution()
            .execution_arn(handle)
            .send()
            .await
            .or_classify("DescribeExecution")?;

        let status = output.status().as_str();
        let state = execution_state(status);
        let mut execution = Execution::new(handle, state).with_raw_status(status);
        if let Some(started) = to_utc(output.start_date()) {
            execution = execution.with_started_at(started);
        }
        if let Some(result) = output.output() {
            execution = execution.with_output(result);
        }
        if let Some(input) = output.input() {
            execution = execution.with_input(input);
        }
        if !state.is_success()
            && let Some(reason) = failure_reason(output.error(), output.cause())
        {
            execution = execution.with_failure_reason(reason);
        }
        debug!(execution_arn = %handle, status = %status, "Execution described");
        Ok(execution)
    }

    async fn list_recent(&self, target: &str, running_only: bool) -> Result<Vec<ExecutionSummary>> {
        let output = self
            .client
            .list_executions()
            .state_machine_arn(target)
            .set_status_filter(running_only.then_some(ExecutionStatus::Running))
            .max_results(LIST_PAGE_SIZE)
            .send()
            .await
            .or_classify("ListExecutions")?;

        Ok(output
            .executions()
            .iter()
            .filter_map(|item| {
                Some(ExecutionSummary {
                    handle: item.execution_arn().to_string(),
                    started_at: to_utc(item.start_date())?,
                    state: execution_state(item.status().as_str()),
                })
            })
            .collect())
    }

    async fn diagnose(&self, handle: &str) -> Vec<String> {
        let history = self
            .client
            .get_execution_history()
            .execution_arn(handle)
            .reverse_order(true)
            .max_results(HISTORY_EVENTS)
            .send()
            .await
            .or_classify("GetExecutionHistory");

        match history {
            Ok(history) => {
                let mut lines = vec![format!("execution: {}", handle)];
                lines.extend(history.events().iter().map(|event| {
                    let at = to_utc(event.timestamp())
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                        .unwrap_or_default();
                    format!("event {} {} at {}", event.id(), event.r#type().as_str(), at)
                }));
                lines
            }
            Err(e) => {
                warn!(execution_arn = %handle, error = %e, "Could not read execution history");
                vec![format!("execution {}: {}", handle, e)]
            }
        }
    }
}
