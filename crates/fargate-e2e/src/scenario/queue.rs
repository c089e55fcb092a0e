// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue round trip: enqueue a job, find its result in the worker's logs,
//! then make sure the message was consumed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::E2eConfig;
use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::executor::MessageQueue;
use crate::logstore::{LogReader, OutputMatcher, reconstruct_json, render_records};
use crate::scenario::{DIAGNOSTICS_BUDGET, Phase, Scenario, Tracker, Verdict};
use crate::service::{ServiceProbe, wait_for_service};
use crate::types::{Execution, ExecutionState, LogRecord};

/// Printed by the worker once a job has been handled.
pub const SUCCESS_MARKER: &str = "\"status\": \"success\"";
/// Printed by the worker when it picks up any message.
pub const PROCESSING_MARKER: &str = "Processing message:";
pub const RESULT_BANNER: &str = "--- Job Result ---";

/// Message understood by the queue worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    pub action: String,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub message: String,
    pub timestamp: String,
}

impl JobMessage {
    /// A `test` job with a fresh id.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            action: "test".to_string(),
            payload: JobPayload {
                message: message.into(),
                timestamp: Utc::now().to_rfc3339(),
            },
        }
    }
}

/// The result block printed for `job_id`.
fn job_result(records: &[LogRecord], job_id: &str) -> Option<Value> {
    let at = records.iter().position(|r| r.message.contains(job_id))?;
    let begin = records[..at]
        .iter()
        .rposition(|r| r.message.contains(RESULT_BANNER))?;
    let end = records[at..]
        .iter()
        .position(|r| r.message.contains(RESULT_BANNER))
        .map_or(records.len(), |i| at + i);
    reconstruct_json(&records[begin..end], RESULT_BANNER)
}

pub struct QueueScenario {
    name: String,
    queue: Arc<dyn MessageQueue>,
    logs: LogReader,
    log_group: String,
    service: Option<(Arc<dyn ServiceProbe>, String)>,
    message: String,
    config: E2eConfig,
}

impl QueueScenario {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        logs: LogReader,
        log_group: impl Into<String>,
        config: E2eConfig,
    ) -> Self {
        Self {
            name: "queue round trip".to_string(),
            queue,
            logs,
            log_group: log_group.into(),
            service: None,
            message: "Hello from E2E test!".to_string(),
            config,
        }
    }

    /// Wait for the consumer service before sending.
    pub fn with_service(mut self, probe: Arc<dyn ServiceProbe>, name: impl Into<String>) -> Self {
        self.service = Some((probe, name.into()));
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    async fn execute(&self, tracker: &mut Tracker, deadline: &Deadline) -> Result<String> {
        if let Some((probe, name)) = &self.service {
            let ready = deadline.child(self.config.poll.service_ready_timeout);
            let status =
                wait_for_service(probe.as_ref(), name, 1, self.config.poll.interval, &ready)
                    .await?;
            tracker.note(format!("consumer ready: {}", status));
        }

        let job = JobMessage::new(self.message.clone());
        let body = serde_json::to_string(&job)?;
        let since = Utc::now();
        let message_id = deadline.bound("send message", self.queue.send(&body)).await?;
        tracker.enter(Phase::Submitted);
        info!(job_id = %job.job_id, message_id = %message_id, "Sent job message");

        tracker.enter(Phase::Polling);
        let matcher =
            OutputMatcher::new(job.job_id.clone(), SUCCESS_MARKER).with_reset_marker(PROCESSING_MARKER);
        let settings = self.logs.settings();
        let search_deadline = deadline.child(settings.timeout);
        let search = self
            .logs
            .find_output(
                &self.log_group,
                &matcher,
                since,
                settings.interval,
                settings.max_attempts(),
                &search_deadline,
            )
            .await?;

        if !search.found {
            let diagnostics = deadline.child(DIAGNOSTICS_BUDGET);
            let tail = match diagnostics
                .bound(
                    "log tail",
                    self.logs.tail(&self.log_group, None, settings.failure_tail),
                )
                .await
            {
                Ok(tail) => tail,
                Err(E2eError::Cancelled) => return Err(E2eError::Cancelled),
                Err(_) => search.records,
            };
            tracker.log_tail(render_records(&tail));
            tracker.set_execution(Execution::new(message_id, ExecutionState::Pending));
            return Err(E2eError::assertion(
                "job result",
                format!("job id {} followed by {}", job.job_id, SUCCESS_MARKER),
                format!("not found after {} log searches", search.attempts),
            ));
        }

        tracker.enter(Phase::Terminal(ExecutionState::Succeeded));
        let mut execution = Execution::new(message_id, ExecutionState::Succeeded);
        if let Some(segment) = &search.segment
            && let Ok(segments) = deadline
                .bound(
                    "result segment",
                    self.logs.fetch_output(&self.log_group, segment, None),
                )
                .await
        {
            let records: Vec<LogRecord> = segments
                .into_iter()
                .filter(|s| &s.name == segment)
                .flat_map(|s| s.records)
                .collect();
            if let Some(output) = job_result(&records, &job.job_id) {
                execution.output = Some(output.to_string());
                tracker.set_output(output);
            }
        }
        tracker.set_execution(execution);

        self.verify_consumed(tracker, deadline).await?;

        if let Ok(tail) = deadline
            .bound(
                "log tail",
                self.logs.tail(&self.log_group, None, settings.success_tail),
            )
            .await
        {
            tracker.log_tail(render_records(&tail));
        }
        tracker.enter(Phase::Verified);
        Ok(format!("job {} processed and removed from the queue", job.job_id))
    }

    /// The worker deletes messages it handled; the queue must drain.
    async fn verify_consumed(&self, tracker: &mut Tracker, deadline: &Deadline) -> Result<()> {
        let checks = self.config.poll.drain_checks.max(1);
        let mut depth = deadline
            .retry(self.config.poll.interval, "queue depth", || self.queue.depth())
            .await?;
        for _ in 1..checks {
            if depth.is_empty() {
                break;
            }
            info!(visible = depth.visible, in_flight = depth.in_flight, "Queue not drained yet");
            deadline.sleep(self.config.poll.interval).await?;
            depth = deadline
                .retry(self.config.poll.interval, "queue depth", || self.queue.depth())
                .await?;
        }

        if depth.is_empty() {
            tracker.note("queue drained");
            Ok(())
        } else {
            Err(E2eError::assertion(
                "queue depth",
                "0 visible, 0 in flight",
                format!("{} visible, {} in flight", depth.visible, depth.in_flight),
            ))
        }
    }
}

#[async_trait]
impl Scenario for QueueScenario {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, deadline: &Deadline) -> Verdict {
        let mut tracker = Tracker::new(&self.name);
        match self.execute(&mut tracker, deadline).await {
            Ok(message) => tracker.pass(message),
            Err(err) => tracker.fail(&err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_message_shape() {
        let job = JobMessage::new("Hello from E2E test!");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["action"], "test");
        assert_eq!(value["payload"]["message"], "Hello from E2E test!");
        assert!(Uuid::parse_str(&job.job_id).is_ok());
    }

    #[test]
    fn test_job_result_picks_block_of_job() {
        let lines = [
            "Processing message: m-1",
            "--- Job Result ---",
            "{",
            "  \"job_id\": \"other\",",
            "  \"status\": \"success\"",
            "}",
            "------------------",
            "Processing message: m-2",
            "--- Job Result ---",
            "{",
            "  \"job_id\": \"mine\",",
            "  \"status\": \"success\"",
            "}",
            "------------------",
        ];
        let records: Vec<LogRecord> = lines.iter().map(|l| LogRecord::new("worker", *l)).collect();
        let value = job_result(&records, "mine").unwrap();
        assert_eq!(value["job_id"], "mine");
        assert!(job_result(&records, "missing").is_none());
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobMessage::new("a").job_id, JobMessage::new("a").job_id);
    }
}
