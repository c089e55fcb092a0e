// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backends for testing.
//!
//! Every backend trait has a scripted counterpart here so scenarios can be
//! exercised without cloud access. Executions follow a scripted list of
//! states, one per `describe` call, and stay in the last one.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::error::{E2eError, Result};
use crate::executor::{AsyncExecutor, MessageQueue, QueueDepth, ScheduleRegistrar, TriggerRule};
use crate::logstore::LogStore;
use crate::service::{ServiceProbe, ServiceStatus};
use crate::types::{
    ArraySummary, ChildExecution, Execution, ExecutionState, ExecutionSummary, LogRecord,
    SegmentInfo, Submission, SubmissionMode,
};

// ============================================================================
// Executor
// ============================================================================

#[derive(Debug, Clone)]
struct MockJob {
    target: String,
    input: String,
    started_at: DateTime<Utc>,
    states: Vec<ExecutionState>,
    polls: usize,
    array_size: Option<u32>,
    /// Listings that must happen before the job shows up in `list_recent`.
    hidden_for: u32,
}

impl MockJob {
    fn current(&self) -> ExecutionState {
        let idx = self.polls.min(self.states.len().saturating_sub(1));
        self.states.get(idx).copied().unwrap_or(ExecutionState::Pending)
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    jobs: BTreeMap<String, MockJob>,
    next_id: u32,
    submissions: Vec<Submission>,
    describe_calls: u32,
    list_calls: u32,
    transient_describes: u32,
    transient_lists: u32,
    not_found_describes: u32,
}

/// Scripted [`AsyncExecutor`].
pub struct MockExecutor {
    state: Mutex<ExecutorState>,
    /// States walked through by every submitted execution.
    pub script: Vec<ExecutionState>,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub exit_code: Option<i32>,
    /// Final state of each array child; defaults to the parent's final state.
    pub child_states: Option<Vec<ExecutionState>>,
    /// Report child log segments as `<prefix>/<handle>/<index>`.
    pub child_segment_prefix: Option<String>,
    /// Whether `describe` reports the execution input.
    pub expose_inputs: bool,
    /// Listings before an event-triggered execution becomes visible.
    pub event_delay_lists: u32,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Executions run once and then succeed.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ExecutorState::default()),
            script: vec![ExecutionState::Running, ExecutionState::Succeeded],
            output: None,
            failure_reason: None,
            exit_code: None,
            child_states: None,
            child_segment_prefix: None,
            expose_inputs: true,
            event_delay_lists: 0,
        }
    }

    /// Executions that end `Failed` with `reason`.
    pub fn failing(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            script: vec![ExecutionState::Running, ExecutionState::Failed],
            failure_reason: Some(reason.into()),
            exit_code,
            ..Self::new()
        }
    }

    /// Executions that never leave `Running`.
    pub fn never_completing() -> Self {
        Self {
            script: vec![ExecutionState::Running],
            ..Self::new()
        }
    }

    pub fn with_states(mut self, states: Vec<ExecutionState>) -> Self {
        self.script = states;
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output.to_string());
        self
    }

    pub fn with_child_states(mut self, states: Vec<ExecutionState>) -> Self {
        self.child_states = Some(states);
        self
    }

    pub fn with_child_segments(mut self, prefix: impl Into<String>) -> Self {
        self.child_segment_prefix = Some(prefix.into());
        self
    }

    pub fn without_inputs(mut self) -> Self {
        self.expose_inputs = false;
        self
    }

    pub fn with_event_delay(mut self, listings: u32) -> Self {
        self.event_delay_lists = listings;
        self
    }

    /// The next `count` describe calls fail with `Transient`.
    pub async fn fail_describes(&self, count: u32) {
        self.state.lock().await.transient_describes = count;
    }

    /// The next `count` list calls fail with `Transient`.
    pub async fn fail_lists(&self, count: u32) {
        self.state.lock().await.transient_lists = count;
    }

    /// The next `count` describe calls fail with `NotFound`.
    pub async fn hide_describes(&self, count: u32) {
        self.state.lock().await.not_found_describes = count;
    }

    /// Start an execution of `target` outside of `submit`, as a trigger or
    /// an unrelated caller would. Returns its handle.
    pub async fn launch(
        &self,
        target: &str,
        input: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> String {
        self.insert(target, input.into(), started_at, None, 0).await
    }

    /// Like [`launch`](Self::launch) with an explicit state script.
    pub async fn launch_with_states(
        &self,
        target: &str,
        input: impl Into<String>,
        started_at: DateTime<Utc>,
        states: Vec<ExecutionState>,
    ) -> String {
        let handle = self.insert(target, input.into(), started_at, None, 0).await;
        if let Some(job) = self.state.lock().await.jobs.get_mut(&handle) {
            job.states = states;
        }
        handle
    }

    pub async fn submissions(&self) -> Vec<Submission> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn describe_calls(&self) -> u32 {
        self.state.lock().await.describe_calls
    }

    pub async fn list_calls(&self) -> u32 {
        self.state.lock().await.list_calls
    }

    pub async fn handles(&self) -> Vec<String> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    async fn insert(
        &self,
        target: &str,
        input: String,
        started_at: DateTime<Utc>,
        array_size: Option<u32>,
        hidden_for: u32,
    ) -> String {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let handle = format!("mock-exec-{}", state.next_id);
        state.jobs.insert(
            handle.clone(),
            MockJob {
                target: target.to_string(),
                input,
                started_at,
                states: self.script.clone(),
                polls: 0,
                array_size,
                hidden_for,
            },
        );
        handle
    }

    fn child_state(&self, index: u32, parent: ExecutionState) -> ExecutionState {
        self.child_states
            .as_ref()
            .and_then(|states| states.get(index as usize).copied())
            .unwrap_or(parent)
    }

    fn render(&self, handle: &str, job: &MockJob, state: ExecutionState) -> Execution {
        let mut execution = Execution::new(handle, state)
            .with_raw_status(state.as_str())
            .with_started_at(job.started_at);
        if self.expose_inputs {
            execution = execution.with_input(job.input.clone());
        }

        if let Some(size) = job.array_size {
            let summary = if state.is_terminal() {
                ArraySummary::from_states(size, (0..size).map(|i| self.child_state(i, state)))
            } else {
                ArraySummary::new(size).with_count(state, size)
            };
            execution = execution.with_array(summary);
        }

        match state {
            ExecutionState::Succeeded => {
                if let Some(output) = &self.output {
                    execution = execution.with_output(output.clone());
                }
                if let Some(code) = self.exit_code {
                    execution = execution.with_exit_code(code);
                } else if job.array_size.is_none() {
                    execution = execution.with_exit_code(0);
                }
            }
            s if s.is_terminal() => {
                if let Some(reason) = &self.failure_reason {
                    execution = execution.with_failure_reason(reason.clone());
                }
                if let Some(code) = self.exit_code {
                    execution = execution.with_exit_code(code);
                }
            }
            _ => {}
        }
        execution
    }
}

#[async_trait]
impl AsyncExecutor for MockExecutor {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, submission: &Submission) -> Result<Option<String>> {
        self.state.lock().await.submissions.push(submission.clone());
        let payload = submission.payload()?;

        match submission.mode {
            SubmissionMode::Direct => {
                let handle = self
                    .insert(
                        &submission.target,
                        payload,
                        Utc::now(),
                        submission.array_size,
                        0,
                    )
                    .await;
                Ok(Some(handle))
            }
            SubmissionMode::EventTriggered => {
                self.insert(
                    &submission.target,
                    payload,
                    Utc::now(),
                    submission.array_size,
                    self.event_delay_lists,
                )
                .await;
                Ok(None)
            }
            // Scheduled executions are started by the registrar.
            SubmissionMode::ScheduledTriggered => Ok(None),
        }
    }

    async fn describe(&self, handle: &str) -> Result<Execution> {
        let mut state = self.state.lock().await;
        state.describe_calls += 1;
        if state.transient_describes > 0 {
            state.transient_describes -= 1;
            return Err(E2eError::Transient("mock throttling".to_string()));
        }
        if state.not_found_describes > 0 {
            state.not_found_describes -= 1;
            return Err(E2eError::NotFound(format!("execution {}", handle)));
        }

        let job = state
            .jobs
            .get_mut(handle)
            .ok_or_else(|| E2eError::NotFound(format!("execution {}", handle)))?;
        let current = job.current();
        job.polls += 1;
        let job = job.clone();
        drop(state);
        Ok(self.render(handle, &job, current))
    }

    async fn list_recent(&self, target: &str, running_only: bool) -> Result<Vec<ExecutionSummary>> {
        let mut state = self.state.lock().await;
        state.list_calls += 1;
        if state.transient_lists > 0 {
            state.transient_lists -= 1;
            return Err(E2eError::Transient("mock list throttling".to_string()));
        }

        let mut listed = Vec::new();
        for (handle, job) in state.jobs.iter_mut() {
            if job.target != target {
                continue;
            }
            if job.hidden_for > 0 {
                job.hidden_for -= 1;
                continue;
            }
            let current = job.current();
            if running_only && current.is_terminal() {
                continue;
            }
            listed.push(ExecutionSummary {
                handle: handle.clone(),
                started_at: job.started_at,
                state: current,
            });
        }
        listed.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(listed)
    }

    async fn describe_children(&self, handle: &str) -> Result<Vec<ChildExecution>> {
        let state = self.state.lock().await;
        let job = state
            .jobs
            .get(handle)
            .ok_or_else(|| E2eError::NotFound(format!("execution {}", handle)))?;
        let Some(size) = job.array_size else {
            return Ok(Vec::new());
        };
        let parent = job.current();

        Ok((0..size)
            .map(|index| {
                let child_state = self.child_state(index, parent);
                ChildExecution {
                    index,
                    handle: format!("{}:{}", handle, index),
                    state: child_state,
                    failure_reason: (child_state.is_terminal() && !child_state.is_success())
                        .then(|| format!("child {} failed", index)),
                    log_segment: self
                        .child_segment_prefix
                        .as_ref()
                        .map(|prefix| format!("{}/{}/{}", prefix, handle, index)),
                }
            })
            .collect())
    }

    async fn diagnose(&self, handle: &str) -> Vec<String> {
        let state = self.state.lock().await;
        match state.jobs.get(handle) {
            Some(job) => vec![format!(
                "mock execution {} of {}: {} after {} polls",
                handle,
                job.target,
                job.current(),
                job.polls
            )],
            None => vec![format!("mock execution {} unknown", handle)],
        }
    }
}

// ============================================================================
// Log store
// ============================================================================

#[derive(Debug, Default)]
struct MockSegment {
    records: Vec<LogRecord>,
    /// Listings before the segment becomes visible.
    hidden_for: u32,
}

#[derive(Debug, Default)]
struct LogState {
    groups: BTreeMap<String, BTreeMap<String, MockSegment>>,
    list_calls: u32,
    transient_lists: u32,
}

/// Append-only [`LogStore`] with optionally delayed segments.
#[derive(Default)]
pub struct MockLogStore {
    state: Mutex<LogState>,
    read_delay: Option<Duration>,
}

impl MockLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every segment read takes `delay` before it answers.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Append one record per line to `segment`, stamped now.
    pub async fn push(&self, group: &str, segment: &str, lines: &[&str]) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let target = state
            .groups
            .entry(group.to_string())
            .or_default()
            .entry(segment.to_string())
            .or_default();
        target
            .records
            .extend(lines.iter().map(|line| LogRecord::new(segment, *line).at(now)));
    }

    /// Append `lines` as a segment that only appears after `listings` listings.
    pub async fn push_delayed(&self, group: &str, segment: &str, lines: &[&str], listings: u32) {
        self.push(group, segment, lines).await;
        let mut state = self.state.lock().await;
        if let Some(target) = state
            .groups
            .get_mut(group)
            .and_then(|segments| segments.get_mut(segment))
        {
            target.hidden_for = listings;
        }
    }

    /// The next `count` listings fail with `Transient`.
    pub async fn fail_lists(&self, count: u32) {
        self.state.lock().await.transient_lists = count;
    }

    pub async fn list_calls(&self) -> u32 {
        self.state.lock().await.list_calls
    }
}

#[async_trait]
impl LogStore for MockLogStore {
    async fn list_segments(
        &self,
        group: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SegmentInfo>> {
        let mut state = self.state.lock().await;
        state.list_calls += 1;
        if state.transient_lists > 0 {
            state.transient_lists -= 1;
            return Err(E2eError::Transient("mock log throttling".to_string()));
        }
        let Some(segments) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut listed = Vec::new();
        for (name, segment) in segments.iter_mut() {
            if prefix.is_some_and(|p| !name.starts_with(p)) {
                continue;
            }
            if segment.hidden_for > 0 {
                segment.hidden_for -= 1;
                continue;
            }
            listed.push(SegmentInfo {
                name: name.clone(),
                last_event_at: segment.records.last().and_then(|r| r.timestamp),
            });
        }
        listed.sort_by(|a, b| b.last_event_at.cmp(&a.last_event_at));
        listed.truncate(limit);
        Ok(listed)
    }

    async fn read_segment(
        &self,
        group: &str,
        segment: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().await;
        let Some(found) = state.groups.get(group).and_then(|s| s.get(segment)) else {
            return Ok(Vec::new());
        };
        if found.hidden_for > 0 {
            return Ok(Vec::new());
        }
        Ok(found
            .records
            .iter()
            .filter(|r| match (since, r.timestamp) {
                (Some(since), Some(at)) => at >= since,
                _ => true,
            })
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Schedules
// ============================================================================

#[derive(Debug, Default)]
struct ScheduleState {
    rules: BTreeMap<String, TriggerRule>,
    registered: Vec<String>,
    removed: Vec<String>,
}

/// [`ScheduleRegistrar`] that optionally starts an execution for every rule.
#[derive(Default)]
pub struct MockScheduleRegistrar {
    state: Mutex<ScheduleState>,
    executor: Option<Arc<MockExecutor>>,
    fail_register: bool,
    deregister_delay: Option<Duration>,
}

impl MockScheduleRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each registered rule starts an execution on `executor` at its fire time.
    pub fn firing_into(executor: Arc<MockExecutor>) -> Self {
        Self {
            executor: Some(executor),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_register: true,
            ..Self::default()
        }
    }

    /// Every deregistration takes `delay` before it takes effect.
    pub fn with_deregister_delay(mut self, delay: Duration) -> Self {
        self.deregister_delay = Some(delay);
        self
    }

    /// Rules currently registered.
    pub async fn rules(&self) -> Vec<TriggerRule> {
        self.state.lock().await.rules.values().cloned().collect()
    }

    pub async fn registered(&self) -> Vec<String> {
        self.state.lock().await.registered.clone()
    }

    pub async fn removed(&self) -> Vec<String> {
        self.state.lock().await.removed.clone()
    }
}

#[async_trait]
impl ScheduleRegistrar for MockScheduleRegistrar {
    async fn register(&self, rule: &TriggerRule) -> Result<()> {
        if self.fail_register {
            return Err(E2eError::Backend(format!("cannot create rule {}", rule.name)));
        }
        {
            let mut state = self.state.lock().await;
            state.rules.insert(rule.name.clone(), rule.clone());
            state.registered.push(rule.name.clone());
        }
        if let Some(executor) = &self.executor {
            executor
                .launch(&rule.target, rule.input.clone(), rule.fire_at)
                .await;
        }
        Ok(())
    }

    async fn deregister(&self, rule_name: &str) -> Result<()> {
        if let Some(delay) = self.deregister_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().await;
        state.rules.remove(rule_name);
        state.removed.push(rule_name.to_string());
        Ok(())
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .await
            .rules
            .keys()
            .filter(|name| name.starts_with(name_prefix))
            .cloned()
            .collect())
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Worker that prints results to a log store, like the real consumer does.
struct MockWorker {
    logs: Arc<MockLogStore>,
    group: String,
    segment: String,
}

#[derive(Debug, Default)]
struct QueueState {
    sent: Vec<String>,
    depths: VecDeque<QueueDepth>,
}

/// [`MessageQueue`] whose messages are consumed by an in-memory worker.
#[derive(Default)]
pub struct MockQueue {
    state: Mutex<QueueState>,
    worker: Option<MockWorker>,
}

impl MockQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume every message by writing the worker's log lines to `segment`.
    pub fn with_worker(
        mut self,
        logs: Arc<MockLogStore>,
        group: impl Into<String>,
        segment: impl Into<String>,
    ) -> Self {
        self.worker = Some(MockWorker {
            logs,
            group: group.into(),
            segment: segment.into(),
        });
        self
    }

    /// Depths reported by successive `depth` calls; the last one repeats.
    pub async fn script_depths(&self, depths: Vec<QueueDepth>) {
        self.state.lock().await.depths = depths.into();
    }

    pub async fn sent(&self) -> Vec<String> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl MessageQueue for MockQueue {
    async fn send(&self, body: &str) -> Result<String> {
        let message_id = {
            let mut state = self.state.lock().await;
            state.sent.push(body.to_string());
            format!("mock-msg-{}", state.sent.len())
        };

        if let Some(worker) = &self.worker {
            let job: Value = serde_json::from_str(body)?;
            let result = json!({
                "job_id": job.get("job_id").cloned().unwrap_or(Value::Null),
                "status": "success",
                "message": format!(
                    "Processed: {}",
                    job.pointer("/payload/message").and_then(Value::as_str).unwrap_or("")
                ),
            });
            let pretty = serde_json::to_string_pretty(&result)?;
            let mut lines = vec![
                format!("Processing message: {}", message_id),
                "--- Job Result ---".to_string(),
            ];
            lines.extend(pretty.lines().map(str::to_string));
            lines.push("------------------".to_string());
            let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
            worker.logs.push(&worker.group, &worker.segment, &lines).await;
        }
        Ok(message_id)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let mut state = self.state.lock().await;
        if state.depths.len() > 1 {
            return Ok(state.depths.pop_front().unwrap_or_default());
        }
        Ok(state.depths.front().copied().unwrap_or_default())
    }
}

// ============================================================================
// Services
// ============================================================================

/// [`ServiceProbe`] answering from scripted statuses.
#[derive(Default)]
pub struct MockServiceProbe {
    statuses: Mutex<HashMap<String, VecDeque<ServiceStatus>>>,
    endpoints: HashMap<String, String>,
}

impl MockServiceProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `running` of `desired` tasks, `ACTIVE`, on every call.
    pub fn with_service(self, name: &str, running: u32, desired: u32) -> Self {
        self.with_statuses(
            name,
            vec![ServiceStatus {
                name: name.to_string(),
                status: "ACTIVE".to_string(),
                running,
                desired,
            }],
        )
    }

    /// Successive statuses of `name`; the last one repeats.
    pub fn with_statuses(mut self, name: &str, statuses: Vec<ServiceStatus>) -> Self {
        self.statuses
            .get_mut()
            .insert(name.to_string(), statuses.into());
        self
    }

    pub fn with_public_endpoint(mut self, name: &str, address: impl Into<String>) -> Self {
        self.endpoints.insert(name.to_string(), address.into());
        self
    }
}

#[async_trait]
impl ServiceProbe for MockServiceProbe {
    async fn describe_service(&self, name: &str) -> Result<ServiceStatus> {
        let mut statuses = self.statuses.lock().await;
        let queue = statuses
            .get_mut(name)
            .ok_or_else(|| E2eError::NotFound(format!("service {}", name)))?;
        let status = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        status.ok_or_else(|| E2eError::NotFound(format!("service {}", name)))
    }

    async fn public_endpoint(&self, name: &str) -> Result<Option<String>> {
        Ok(self.endpoints.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_executor_walks_script_and_stays_terminal() {
        let executor = MockExecutor::new();
        let handle = executor
            .submit(&Submission::direct("task-def", json!({"message": "hi"})))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(executor.describe(&handle).await.unwrap().state, ExecutionState::Running);
        assert_eq!(executor.describe(&handle).await.unwrap().state, ExecutionState::Succeeded);
        assert_eq!(executor.describe(&handle).await.unwrap().state, ExecutionState::Succeeded);
        assert_eq!(executor.describe_calls().await, 3);
    }

    #[tokio::test]
    async fn test_event_submission_is_listed_after_delay() {
        let executor = MockExecutor::new().with_event_delay(1);
        let submission = Submission::new("sm", json!({}), SubmissionMode::EventTriggered);
        assert_eq!(executor.submit(&submission).await.unwrap(), None);

        assert!(executor.list_recent("sm", false).await.unwrap().is_empty());
        assert_eq!(executor.list_recent("sm", false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_log_store_hides_delayed_segments() {
        let store = MockLogStore::new();
        store.push_delayed("g", "s", &["line"], 1).await;
        assert!(store.list_segments("g", None, 10).await.unwrap().is_empty());
        assert_eq!(store.list_segments("g", None, 10).await.unwrap().len(), 1);
        assert_eq!(store.read_segment("g", "s", None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_queue_depth_script_repeats_last() {
        let queue = MockQueue::new();
        queue
            .script_depths(vec![
                QueueDepth { visible: 1, in_flight: 0 },
                QueueDepth::default(),
            ])
            .await;
        assert_eq!(queue.depth().await.unwrap().visible, 1);
        assert!(queue.depth().await.unwrap().is_empty());
        assert!(queue.depth().await.unwrap().is_empty());
    }
}
