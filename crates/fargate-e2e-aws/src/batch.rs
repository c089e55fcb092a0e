// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS Batch jobs, including array jobs.
//!
//! The job id is the handle; child `i` of an array job has the handle
//! `<job id>:<i>`. The parent's `arrayProperties.statusSummary` carries the
//! per-state child counts while the children run.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_batch::Client;
use aws_sdk_batch::types::{ArrayProperties, ContainerOverrides, JobDetail, KeyValuePair};
use chrono::Utc;
use tracing::{debug, info, warn};

use fargate_e2e::{
    ArraySummary, AsyncExecutor, ChildExecution, E2eError, Execution, ExecutionState, Result,
    Submission, SubmissionMode,
};

use crate::error::SdkResultExt;
use crate::millis_to_utc;

/// Environment variable the workload reads its input from.
pub const JOB_INPUT_VARIABLE: &str = "JOB_INPUT";

/// `DescribeJobs` accepts at most this many ids per call.
const DESCRIBE_BATCH: usize = 100;

/// Child jobs listed in diagnostics.
const DIAGNOSTIC_CHILDREN: i32 = 5;

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

/// Map a job status onto the core state.
pub fn job_state(status: &str) -> ExecutionState {
    match status {
        "RUNNING" => ExecutionState::Running,
        "SUCCEEDED" => ExecutionState::Succeeded,
        "FAILED" => ExecutionState::Failed,
        // SUBMITTED, PENDING, RUNNABLE, STARTING
        _ => ExecutionState::Pending,
    }
}

/// Child counts from a parent's status summary.
pub fn array_summary(size: u32, status_summary: &HashMap<String, i32>) -> ArraySummary {
    let mut summary = ArraySummary::new(size);
    for (status, count) in status_summary {
        if *count > 0 {
            summary.add(job_state(status), *count as u32);
        }
    }
    summary
}

/// Handle of child `index` of `parent`.
pub fn child_handle(parent: &str, index: u32) -> String {
    format!("{}:{}", parent, index)
}

/// Index of a child handle, if it is one.
pub fn child_index(handle: &str) -> Option<u32> {
    handle.rsplit_once(':')?.1.parse().ok()
}

/// Default name of a submitted job.
pub fn default_job_name(now: chrono::DateTime<Utc>) -> String {
    format!("e2e-test-job-{}", now.timestamp())
}

fn failure_reason(job: &JobDetail) -> Option<String> {
    let container = job.container();
    let mut parts: Vec<String> = [job.status_reason(), container.and_then(|c| c.reason())]
        .into_iter()
        .flatten()
        .filter(|reason| !reason.is_empty())
        .map(String::from)
        .collect();
    if let Some(code) = container.and_then(|c| c.exit_code()).filter(|c| *c != 0) {
        parts.push(format!("exit code {}", code));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

/// `startedAt` reads as zero until the job has started.
fn started_millis(job: &JobDetail) -> Option<i64> {
    Some(job.started_at())
        .filter(|millis| *millis > 0)
        .or(job.created_at())
}

fn job_to_execution(handle: &str, job: &JobDetail) -> Execution {
    let status = job.status().as_str();
    let state = job_state(status);
    let mut execution = Execution::new(handle, state).with_raw_status(status);

    if let Some(started) = started_millis(job).and_then(millis_to_utc) {
        execution = execution.with_started_at(started);
    }
    if let Some(code) = job.container().and_then(|c| c.exit_code()) {
        execution = execution.with_exit_code(code);
    }
    if let Some(properties) = job.array_properties()
        && let Some(size) = properties.size()
        && size > 0
    {
        let summary = properties
            .status_summary()
            .map(|counts| array_summary(size as u32, counts))
            .unwrap_or_else(|| ArraySummary::new(size as u32));
        execution = execution.with_array(summary);
    }
    if !state.is_success()
        && let Some(reason) = failure_reason(job)
    {
        execution = execution.with_failure_reason(reason);
    }
    execution
}

/// Submits jobs to one job queue.
pub struct BatchExecutor {
    client: Client,
    job_queue: String,
}

impl BatchExecutor {
    pub fn new(client: Client, job_queue: impl Into<String>) -> Self {
        Self {
            client,
            job_queue: job_queue.into(),
        }
    }

    pub fn from_conf(config: &aws_config::SdkConfig, job_queue: impl Into<String>) -> Self {
        Self::new(Client::new(config), job_queue)
    }

    async fn describe_jobs(&self, ids: Vec<String>) -> Result<Vec<JobDetail>> {
        let output = self
            .client
            .describe_jobs()
            .set_jobs(Some(ids))
            .send()
            .await
            .or_classify("DescribeJobs")?;
        Ok(output.jobs().to_vec())
    }

    async fn describe_job(&self, handle: &str) -> Result<JobDetail> {
        self.describe_jobs(vec![handle.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| E2eError::NotFound(format!("job {}", handle)))
    }

    async fn queue_lines(&self) -> Result<Vec<String>> {
        let queues = self
            .client
            .describe_job_queues()
            .job_queues(&self.job_queue)
            .send()
            .await
            .or_classify("DescribeJobQueues")?;

        let mut lines = Vec::new();
        let mut environments = Vec::new();
        for queue in queues.job_queues() {
            lines.push(format!(
                "job queue {}: state={} status={} reason={}",
                queue.job_queue_name(),
                queue.state().as_str(),
                or_dash(queue.status().map(|s| s.as_str())),
                or_dash(queue.status_reason()),
            ));
            environments.extend(
                queue
                    .compute_environment_order()
                    .iter()
                    .map(|order| order.compute_environment().to_string()),
            );
        }
        if environments.is_empty() {
            return Ok(lines);
        }

        let described = self
            .client
            .describe_compute_environments()
            .set_compute_environments(Some(environments))
            .send()
            .await
            .or_classify("DescribeComputeEnvironments")?;
        for env in described.compute_environments() {
            let resources = env.compute_resources();
            lines.push(format!(
                "compute environment {}: state={} status={} type={} maxvCpus={} reason={}",
                env.compute_environment_name(),
                or_dash(env.state().map(|s| s.as_str())),
                or_dash(env.status().map(|s| s.as_str())),
                or_dash(resources.map(|r| r.r#type().as_str())),
                resources.map_or_else(|| "-".to_string(), |r| r.max_vcpus().to_string()),
                or_dash(env.status_reason()),
            ));
        }
        Ok(lines)
    }

    async fn child_lines(&self, handle: &str) -> Result<Vec<String>> {
        let output = self
            .client
            .list_jobs()
            .array_job_id(handle)
            .max_results(DIAGNOSTIC_CHILDREN)
            .send()
            .await
            .or_classify("ListJobs")?;
        Ok(output
            .job_summary_list()
            .iter()
            .map(|child| {
                format!(
                    "child {}: {} reason={}",
                    child.job_id(),
                    or_dash(child.status().map(|s| s.as_str())),
                    or_dash(child.status_reason()),
                )
            })
            .collect())
    }
}

#[async_trait]
impl AsyncExecutor for BatchExecutor {
    fn backend_name(&self) -> &'static str {
        "batch"
    }

    async fn submit(&self, submission: &Submission) -> Result<Option<String>> {
        if submission.mode != SubmissionMode::Direct {
            return Err(E2eError::InvalidInput(format!(
                "Batch jobs are submitted directly, not in {} mode",
                submission.mode
            )));
        }
        let name = submission
            .name
            .clone()
            .unwrap_or_else(|| default_job_name(Utc::now()));
        let overrides = ContainerOverrides::builder()
            .environment(
                KeyValuePair::builder()
                    .name(JOB_INPUT_VARIABLE)
                    .value(submission.payload()?)
                    .build(),
            )
            .build();

        let output = self
            .client
            .submit_job()
            .job_name(&name)
            .job_queue(&self.job_queue)
            .job_definition(&submission.target)
            .set_array_properties(
                submission
                    .array_size
                    .map(|size| ArrayProperties::builder().size(size as i32).build()),
            )
            .container_overrides(overrides)
            .send()
            .await
            .or_classify("SubmitJob")?;

        let job_id = output.job_id().to_string();
        if job_id.is_empty() {
            return Err(E2eError::Backend("SubmitJob returned no job id".to_string()));
        }
        info!(
            job_id = %job_id,
            job_name = %name,
            job_queue = %self.job_queue,
            array_size = ?submission.array_size,
            "Job submitted"
        );
        Ok(Some(job_id))
    }

    async fn describe(&self, handle: &str) -> Result<Execution> {
        let job = self.describe_job(handle).await?;
        let execution = job_to_execution(handle, &job);
        debug!(job_id = %handle, status = ?execution.raw_status, "Job described");
        Ok(execution)
    }

    async fn describe_children(&self, handle: &str) -> Result<Vec<ChildExecution>> {
        let parent = self.describe_job(handle).await?;
        let size = parent
            .array_properties()
            .and_then(|p| p.size())
            .unwrap_or(0)
            .max(0) as u32;

        let ids: Vec<String> = (0..size).map(|i| child_handle(handle, i)).collect();
        let mut children = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(DESCRIBE_BATCH) {
            for job in self.describe_jobs(chunk.to_vec()).await? {
                let Some(index) = child_index(job.job_id()) else {
                    continue;
                };
                let state = job_state(job.status().as_str());
                children.push(ChildExecution {
                    index,
                    handle: job.job_id().to_string(),
                    state,
                    failure_reason: failure_reason(&job).filter(|_| !state.is_success()),
                    log_segment: job
                        .container()
                        .and_then(|c| c.log_stream_name())
                        .map(String::from),
                });
            }
        }
        children.sort_by_key(|c| c.index);
        Ok(children)
    }

    async fn diagnose(&self, handle: &str) -> Vec<String> {
        let mut lines = Vec::new();
        match self.describe_job(handle).await {
            Ok(job) => {
                lines.push(format!(
                    "job {}: {} reason={}",
                    handle,
                    job.status().as_str(),
                    or_dash(job.status_reason())
                ));
                if let Some(size) = job.array_properties().and_then(|p| p.size()) {
                    lines.push(format!("array size: {}", size));
                }
            }
            Err(e) => lines.push(format!("job {}: {}", handle, e)),
        }
        match self.queue_lines().await {
            Ok(queue) => lines.extend(queue),
            Err(e) => {
                warn!(job_queue = %self.job_queue, error = %e, "Could not describe job queue");
                lines.push(format!("job queue {}: {}", self.job_queue, e));
            }
        }
        match self.child_lines(handle).await {
            Ok(children) => lines.extend(children),
            Err(e) => lines.push(format!("child jobs: {}", e)),
        }
        lines
    }
}
