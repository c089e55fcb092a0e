// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Types shared by every executor backend and scenario.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{E2eError, Result};

/// Largest fan-out an array submission may request.
pub const MAX_ARRAY_SIZE: u32 = 10_000;

// ============================================================================
// Submission
// ============================================================================

/// How a submission reaches its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// The executor returns an authoritative handle synchronously.
    Direct,
    /// An event is emitted; an execution starts "soon", without a handle.
    EventTriggered,
    /// A one-shot schedule fires later; an execution starts without a handle.
    ScheduledTriggered,
}

impl SubmissionMode {
    /// Whether a handle has to be discovered after submission.
    pub fn requires_correlation(&self) -> bool {
        !matches!(self, SubmissionMode::Direct)
    }
}

impl fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionMode::Direct => write!(f, "direct"),
            SubmissionMode::EventTriggered => write!(f, "event"),
            SubmissionMode::ScheduledTriggered => write!(f, "scheduled"),
        }
    }
}

impl FromStr for SubmissionMode {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(SubmissionMode::Direct),
            "event" | "eventbridge" | "event-triggered" => Ok(SubmissionMode::EventTriggered),
            "scheduled" | "schedule" | "scheduled-triggered" => {
                Ok(SubmissionMode::ScheduledTriggered)
            }
            other => Err(E2eError::InvalidInput(format!(
                "unknown submission mode '{}' (expected direct, event or scheduled)",
                other
            ))),
        }
    }
}

/// One request to execute work. Not mutated after it is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    /// Executor-specific target (task definition, state machine, job definition, queue).
    pub target: String,
    /// Input payload handed to the workload.
    pub input: Value,
    /// Trigger path; fixes the correlation strategy.
    pub mode: SubmissionMode,
    /// Number of children for fan-out jobs.
    pub array_size: Option<u32>,
    /// Unique token embedded in the input so correlation can filter by it.
    pub correlation_token: Option<String>,
    /// Optional name given to the execution by backends that accept one.
    pub name: Option<String>,
}

impl Submission {
    /// Create a submission in the given mode.
    pub fn new(target: impl Into<String>, input: Value, mode: SubmissionMode) -> Self {
        Self {
            target: target.into(),
            input,
            mode,
            array_size: None,
            correlation_token: None,
            name: None,
        }
    }

    /// Create a direct-mode submission.
    pub fn direct(target: impl Into<String>, input: Value) -> Self {
        Self::new(target, input, SubmissionMode::Direct)
    }

    /// Request a fan-out of `size` children.
    pub fn with_array_size(mut self, size: u32) -> Self {
        self.array_size = Some(size);
        self
    }

    /// Attach a correlation token.
    pub fn with_correlation_token(mut self, token: impl Into<String>) -> Self {
        self.correlation_token = Some(token.into());
        self
    }

    /// Name the execution.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Serialized input payload.
    pub fn payload(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.input)?)
    }

    /// Check the submission before it is handed to an executor.
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(E2eError::InvalidInput("submission target is empty".into()));
        }
        if let Some(size) = self.array_size
            && !(2..=MAX_ARRAY_SIZE).contains(&size)
        {
            return Err(E2eError::InvalidInput(format!(
                "array size must be between 2 and {}, got {}",
                MAX_ARRAY_SIZE, size
            )));
        }
        if let Some(token) = &self.correlation_token {
            let payload = self.payload()?;
            if !payload.contains(token.as_str()) {
                return Err(E2eError::InvalidInput(format!(
                    "correlation token '{}' does not appear in the input payload",
                    token
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Execution state
// ============================================================================

/// Collapsed execution state shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Aborted
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionState::Succeeded)
    }

    /// Position along Pending -> Running -> terminal.
    pub fn rank(&self) -> u8 {
        match self {
            ExecutionState::Pending => 0,
            ExecutionState::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "PENDING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Succeeded => "SUCCEEDED",
            ExecutionState::Failed => "FAILED",
            ExecutionState::TimedOut => "TIMED_OUT",
            ExecutionState::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Array summaries
// ============================================================================

/// Per-state child counts of a fan-out execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySummary {
    pub size: u32,
    pub counts: BTreeMap<ExecutionState, u32>,
}

impl ArraySummary {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            counts: BTreeMap::new(),
        }
    }

    /// Builds a summary from child states.
    pub fn from_states(size: u32, states: impl IntoIterator<Item = ExecutionState>) -> Self {
        let mut summary = Self::new(size);
        for state in states {
            summary.add(state, 1);
        }
        summary
    }

    pub fn with_count(mut self, state: ExecutionState, count: u32) -> Self {
        self.add(state, count);
        self
    }

    pub fn add(&mut self, state: ExecutionState, count: u32) {
        if count > 0 {
            *self.counts.entry(state).or_insert(0) += count;
        }
    }

    pub fn count(&self, state: ExecutionState) -> u32 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn terminal_count(&self) -> u32 {
        self.counts
            .iter()
            .filter(|(state, _)| state.is_terminal())
            .map(|(_, count)| *count)
            .sum()
    }

    /// True once every child has reached a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.size > 0 && self.terminal_count() >= self.size
    }

    /// Aggregate state: any failed child fails the whole array, success needs every child.
    pub fn aggregate_state(&self) -> ExecutionState {
        if self.count(ExecutionState::Failed) > 0 {
            ExecutionState::Failed
        } else if self.count(ExecutionState::TimedOut) > 0 {
            ExecutionState::TimedOut
        } else if self.count(ExecutionState::Aborted) > 0 {
            ExecutionState::Aborted
        } else if self.size > 0 && self.count(ExecutionState::Succeeded) >= self.size {
            ExecutionState::Succeeded
        } else if self.count(ExecutionState::Running) > 0
            || self.count(ExecutionState::Succeeded) > 0
        {
            ExecutionState::Running
        } else {
            ExecutionState::Pending
        }
    }
}

impl fmt::Display for ArraySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PENDING: {}, RUNNING: {}, SUCCEEDED: {}, FAILED: {}",
            self.count(ExecutionState::Pending),
            self.count(ExecutionState::Running),
            self.count(ExecutionState::Succeeded),
            self.count(ExecutionState::Failed)
                + self.count(ExecutionState::TimedOut)
                + self.count(ExecutionState::Aborted),
        )
    }
}

// ============================================================================
// Execution
// ============================================================================

/// One running or completed unit of work, as last described by its executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub handle: String,
    pub state: ExecutionState,
    /// Backend status string before it was collapsed.
    pub raw_status: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// Result payload, present only once succeeded.
    pub output: Option<String>,
    /// Backend failure reason, verbatim.
    pub failure_reason: Option<String>,
    pub exit_code: Option<i32>,
    /// Input the execution was started with, when the backend exposes it.
    pub input: Option<String>,
    /// Child counts for fan-out executions.
    pub array: Option<ArraySummary>,
}

impl Execution {
    pub fn new(handle: impl Into<String>, state: ExecutionState) -> Self {
        Self {
            handle: handle.into(),
            state,
            raw_status: None,
            started_at: None,
            output: None,
            failure_reason: None,
            exit_code: None,
            input: None,
            array: None,
        }
    }

    pub fn with_raw_status(mut self, status: impl Into<String>) -> Self {
        self.raw_status = Some(status.into());
        self
    }

    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_array(mut self, summary: ArraySummary) -> Self {
        self.array = Some(summary);
        self
    }

    /// Terminal when the execution itself is, or when every child of an array is.
    pub fn is_terminal(&self) -> bool {
        if self.state.is_terminal() {
            return true;
        }
        self.array.as_ref().is_some_and(ArraySummary::all_terminal)
    }

    /// State after folding in the children of an array execution.
    pub fn effective_state(&self) -> ExecutionState {
        match &self.array {
            Some(summary) if !self.state.is_terminal() && summary.all_terminal() => {
                summary.aggregate_state()
            }
            Some(summary) if self.state.is_success() && summary.size > 0 => {
                // A parent reported as succeeded with failed children is still a failure.
                match summary.aggregate_state() {
                    s if s.is_terminal() => s,
                    _ => self.state,
                }
            }
            _ => self.state,
        }
    }

    /// Output parsed as JSON, if any.
    pub fn output_json(&self) -> Option<Value> {
        self.output
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// One child of an array execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildExecution {
    pub index: u32,
    pub handle: String,
    pub state: ExecutionState,
    pub failure_reason: Option<String>,
    /// Log segment the child writes to, when the backend reports it.
    pub log_segment: Option<String>,
}

/// A listing entry used as a correlation candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub handle: String,
    pub started_at: DateTime<Utc>,
    pub state: ExecutionState,
}

impl fmt::Display for ExecutionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, started {})",
            self.handle,
            self.state,
            self.started_at.to_rfc3339()
        )
    }
}

// ============================================================================
// Correlation window
// ============================================================================

/// Time range an asynchronously started execution must begin in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CorrelationWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// `[anchor - skew, anchor + max_wait]`.
    pub fn around(anchor: DateTime<Utc>, skew: Duration, max_wait: Duration) -> Self {
        Self {
            start: anchor - to_chrono(skew),
            end: anchor + to_chrono(max_wait),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

impl fmt::Display for CorrelationWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

// ============================================================================
// Logs
// ============================================================================

/// One textual record from a log segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub segment: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

impl LogRecord {
    pub fn new(segment: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            timestamp: None,
            message: message.into(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.timestamp {
            Some(ts) => write!(f, "[{}] {}", ts.format("%H:%M:%S"), self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Listing entry for a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub name: String,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// A named, chronologically ordered sequence of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSegment {
    pub name: String,
    pub records: Vec<LogRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Pending.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Succeeded.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::TimedOut.is_terminal());
        assert!(ExecutionState::Aborted.is_terminal());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(
            "eventbridge".parse::<SubmissionMode>().unwrap(),
            SubmissionMode::EventTriggered
        );
        assert_eq!(
            "Scheduled".parse::<SubmissionMode>().unwrap(),
            SubmissionMode::ScheduledTriggered
        );
        assert!("cron".parse::<SubmissionMode>().is_err());
        assert!(!SubmissionMode::Direct.requires_correlation());
    }

    #[test]
    fn test_array_any_failure_fails_everything() {
        let summary = ArraySummary::from_states(
            3,
            [
                ExecutionState::Succeeded,
                ExecutionState::Failed,
                ExecutionState::Running,
            ],
        );
        assert_eq!(summary.aggregate_state(), ExecutionState::Failed);
        assert!(!summary.all_terminal());
    }

    #[test]
    fn test_array_success_needs_every_child() {
        let partial = ArraySummary::new(2).with_count(ExecutionState::Succeeded, 1);
        assert_eq!(partial.aggregate_state(), ExecutionState::Running);

        let done = ArraySummary::new(2).with_count(ExecutionState::Succeeded, 2);
        assert_eq!(done.aggregate_state(), ExecutionState::Succeeded);
        assert!(done.all_terminal());
    }

    #[test]
    fn test_array_execution_terminal_when_children_done() {
        let exec = Execution::new("job-1", ExecutionState::Running).with_array(
            ArraySummary::new(2)
                .with_count(ExecutionState::Succeeded, 1)
                .with_count(ExecutionState::Failed, 1),
        );
        assert!(exec.is_terminal());
        assert_eq!(exec.effective_state(), ExecutionState::Failed);
    }

    #[test]
    fn test_window_contains_bounds() {
        let anchor = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let window =
            CorrelationWindow::around(anchor, Duration::from_secs(30), Duration::from_secs(60));
        assert!(window.contains(anchor - chrono::Duration::seconds(30)));
        assert!(window.contains(anchor + chrono::Duration::seconds(60)));
        assert!(!window.contains(anchor - chrono::Duration::seconds(31)));
        assert!(!window.contains(anchor + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_submission_validation() {
        let ok = Submission::direct("arn:sm", json!({"message": "Hello!"}));
        assert!(ok.validate().is_ok());

        let bad_array = Submission::direct("def", json!({})).with_array_size(1);
        assert!(matches!(
            bad_array.validate(),
            Err(E2eError::InvalidInput(_))
        ));

        let token_missing =
            Submission::direct("def", json!({"a": 1})).with_correlation_token("abc-123");
        assert!(token_missing.validate().is_err());

        let token_present = Submission::direct("def", json!({"correlation_id": "abc-123"}))
            .with_correlation_token("abc-123");
        assert!(token_present.validate().is_ok());
    }

    #[test]
    fn test_summary_display_counts() {
        let summary = ArraySummary::new(4)
            .with_count(ExecutionState::Pending, 1)
            .with_count(ExecutionState::Running, 2)
            .with_count(ExecutionState::Succeeded, 1);
        assert_eq!(
            summary.to_string(),
            "PENDING: 1, RUNNING: 2, SUCCEEDED: 1, FAILED: 0"
        );
    }
}
