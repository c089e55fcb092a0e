// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ECS one-off tasks and long-running services.
//!
//! A one-off task is submitted with `RunTask` on Fargate, its input passed in
//! a container environment variable. The task ARN is the handle. A task is
//! finished once `lastStatus` is `STOPPED`; whether it succeeded is decided by
//! the exit code of the workload container.

use async_trait::async_trait;
use aws_sdk_ecs::Client;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, DesiredStatus, KeyValuePair,
    LaunchType, NetworkConfiguration, Task, TaskOverride,
};
use tracing::{debug, info, warn};

use fargate_e2e::{
    AsyncExecutor, E2eError, Execution, ExecutionState, Result, ServiceProbe, ServiceStatus,
    Submission, SubmissionMode,
};

use crate::error::{SdkResultExt, build_error};
use crate::to_utc;

/// Environment variable the workload reads its input from.
pub const TASK_INPUT_VARIABLE: &str = "TASK_INPUT";

/// Network attachment detail holding a task's public address.
const PUBLIC_IP_DETAIL: &str = "publicIPv4Address";

/// Where one-off tasks are placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNetwork {
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

impl TaskNetwork {
    pub fn new(subnets: Vec<String>, security_groups: Vec<String>) -> Self {
        Self {
            subnets,
            security_groups,
            assign_public_ip: true,
        }
    }

    /// Split a comma-separated id list, ignoring blanks.
    pub fn parse_ids(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect()
    }

    fn to_configuration(&self) -> Result<NetworkConfiguration> {
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.subnets.clone()))
            .set_security_groups(Some(self.security_groups.clone()))
            .assign_public_ip(if self.assign_public_ip {
                AssignPublicIp::Enabled
            } else {
                AssignPublicIp::Disabled
            })
            .build()
            .map_err(|e| build_error("awsvpc configuration", e))?;
        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }
}

// ============================================================================
// State mapping
// ============================================================================

/// Map `lastStatus` plus the workload's exit code onto the core state.
pub fn task_state(last_status: &str, exit_code: Option<i32>) -> ExecutionState {
    match last_status {
        "PROVISIONING" | "PENDING" | "ACTIVATING" => ExecutionState::Pending,
        "STOPPED" => match exit_code {
            Some(0) => ExecutionState::Succeeded,
            _ => ExecutionState::Failed,
        },
        // RUNNING, DEACTIVATING, STOPPING, DEPROVISIONING
        _ => ExecutionState::Running,
    }
}

/// Reason reported for a stopped task that did not succeed.
pub fn stopped_failure_reason(stopped_reason: Option<&str>, exit_code: Option<i32>) -> String {
    let reason = stopped_reason
        .filter(|r| !r.is_empty())
        .unwrap_or("task stopped");
    match exit_code {
        Some(code) => format!("{} (exit code {})", reason, code),
        None => format!("{} (no exit code)", reason),
    }
}

/// Exit code of `container`, or failing that the first non-zero one, or
/// failing that the first reported one.
pub fn select_exit_code<'a>(
    containers: impl IntoIterator<Item = (Option<&'a str>, Option<i32>)>,
    container: Option<&str>,
) -> Option<i32> {
    let codes: Vec<(Option<&str>, i32)> = containers
        .into_iter()
        .filter_map(|(name, code)| code.map(|c| (name, c)))
        .collect();
    if let Some(wanted) = container
        && let Some((_, code)) = codes.iter().find(|(name, _)| *name == Some(wanted))
    {
        return Some(*code);
    }
    codes
        .iter()
        .find(|(_, code)| *code != 0)
        .or_else(|| codes.first())
        .map(|(_, code)| *code)
}

fn exit_code_of(task: &Task, container: Option<&str>) -> Option<i32> {
    select_exit_code(
        task.containers().iter().map(|c| (c.name(), c.exit_code())),
        container,
    )
}

fn input_of(task: &Task) -> Option<String> {
    task.overrides()?
        .container_overrides()
        .iter()
        .flat_map(|o| o.environment())
        .find(|kv| kv.name() == Some(TASK_INPUT_VARIABLE))
        .and_then(|kv| kv.value())
        .map(String::from)
}

fn task_to_execution(handle: &str, task: &Task, container: Option<&str>) -> Execution {
    let last_status = task.last_status().unwrap_or("PENDING");
    let exit_code = exit_code_of(task, container);
    let state = task_state(last_status, exit_code);

    let mut execution = Execution::new(handle, state).with_raw_status(last_status);
    if let Some(started) = task.started_at().or(task.created_at()).and_then(to_utc) {
        execution = execution.with_started_at(started);
    }
    if let Some(code) = exit_code {
        execution = execution.with_exit_code(code);
    }
    if state == ExecutionState::Failed {
        execution =
            execution.with_failure_reason(stopped_failure_reason(task.stopped_reason(), exit_code));
    }
    if let Some(input) = input_of(task) {
        execution = execution.with_input(input);
    }
    execution
}

// ============================================================================
// One-off tasks
// ============================================================================

/// Runs task definitions as one-off Fargate tasks.
pub struct EcsTaskExecutor {
    client: Client,
    cluster: String,
    network: TaskNetwork,
    container_name: String,
}

impl EcsTaskExecutor {
    pub fn new(
        client: Client,
        cluster: impl Into<String>,
        network: TaskNetwork,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cluster: cluster.into(),
            network,
            container_name: container_name.into(),
        }
    }

    pub fn from_conf(
        config: &aws_config::SdkConfig,
        cluster: impl Into<String>,
        network: TaskNetwork,
        container_name: impl Into<String>,
    ) -> Self {
        Self::new(Client::new(config), cluster, network, container_name)
    }

    async fn describe_task(&self, handle: &str) -> Result<Task> {
        let output = self
            .client
            .describe_tasks()
            .cluster(&self.cluster)
            .tasks(handle)
            .send()
            .await
            .or_classify("DescribeTasks")?;

        output.tasks().first().cloned().ok_or_else(|| {
            let reason = output
                .failures()
                .first()
                .and_then(|f| f.reason())
                .unwrap_or("no such task");
            E2eError::NotFound(format!("task {}: {}", handle, reason))
        })
    }
}

#[async_trait]
impl AsyncExecutor for EcsTaskExecutor {
    fn backend_name(&self) -> &'static str {
        "ecs"
    }

    async fn submit(&self, submission: &Submission) -> Result<Option<String>> {
        if submission.mode != SubmissionMode::Direct {
            return Err(E2eError::InvalidInput(format!(
                "ECS tasks are started directly, not in {} mode",
                submission.mode
            )));
        }
        let payload = submission.payload()?;

        let overrides = TaskOverride::builder()
            .container_overrides(
                ContainerOverride::builder()
                    .name(&self.container_name)
                    .environment(
                        KeyValuePair::builder()
                            .name(TASK_INPUT_VARIABLE)
                            .value(payload)
                            .build(),
                    )
                    .build(),
            )
            .build();

        let output = self
            .client
            .run_task()
            .cluster(&self.cluster)
            .task_definition(&submission.target)
            .launch_type(LaunchType::Fargate)
            .network_configuration(self.network.to_configuration()?)
            .overrides(overrides)
            .send()
            .await
            .or_classify("RunTask")?;

        if let Some(failure) = output.failures().first() {
            return Err(E2eError::Backend(format!(
                "RunTask failed for {}: {}",
                failure.arn().unwrap_or(&submission.target),
                failure.reason().unwrap_or("unknown reason")
            )));
        }
        let arn = output
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .ok_or_else(|| E2eError::Backend("RunTask started no task".to_string()))?;

        info!(task_arn = %arn, cluster = %self.cluster, "Task started");
        Ok(Some(arn.to_string()))
    }

    async fn describe(&self, handle: &str) -> Result<Execution> {
        let task = self.describe_task(handle).await?;
        let execution = task_to_execution(handle, &task, Some(&self.container_name));
        debug!(
            task_arn = %handle,
            last_status = ?task.last_status(),
            state = %execution.state,
            "Task described"
        );
        Ok(execution)
    }

    async fn diagnose(&self, handle: &str) -> Vec<String> {
        let task = match self.describe_task(handle).await {
            Ok(task) => task,
            Err(e) => {
                warn!(task_arn = %handle, error = %e, "Could not describe task for diagnostics");
                return vec![format!("task {}: {}", handle, e)];
            }
        };

        let mut lines = vec![
            format!("task: {}", handle),
            format!("last status: {}", task.last_status().unwrap_or("-")),
            format!("desired status: {}", task.desired_status().unwrap_or("-")),
        ];
        if let Some(reason) = task.stopped_reason() {
            lines.push(format!("stopped reason: {}", reason));
        }
        if let Some(code) = task.stop_code() {
            lines.push(format!("stop code: {}", code.as_str()));
        }
        for container in task.containers() {
            lines.push(format!(
                "container {}: {} exit={} reason={}",
                container.name().unwrap_or("-"),
                container.last_status().unwrap_or("-"),
                container
                    .exit_code()
                    .map_or_else(|| "-".to_string(), |c| c.to_string()),
                container.reason().unwrap_or("-"),
            ));
        }
        lines
    }
}

// ============================================================================
// Services
// ============================================================================

/// Reads ECS service status and task addresses.
pub struct EcsServiceProbe {
    client: Client,
    cluster: String,
}

impl EcsServiceProbe {
    pub fn new(client: Client, cluster: impl Into<String>) -> Self {
        Self {
            client,
            cluster: cluster.into(),
        }
    }

    pub fn from_conf(config: &aws_config::SdkConfig, cluster: impl Into<String>) -> Self {
        Self::new(Client::new(config), cluster)
    }
}

#[async_trait]
impl ServiceProbe for EcsServiceProbe {
    async fn describe_service(&self, name: &str) -> Result<ServiceStatus> {
        let output = self
            .client
            .describe_services()
            .cluster(&self.cluster)
            .services(name)
            .send()
            .await
            .or_classify("DescribeServices")?;

        let service = output
            .services()
            .first()
            .ok_or_else(|| E2eError::NotFound(format!("service {}", name)))?;
        Ok(ServiceStatus {
            name: name.to_string(),
            status: service.status().unwrap_or("UNKNOWN").to_string(),
            running: service.running_count().max(0) as u32,
            desired: service.desired_count().max(0) as u32,
        })
    }

    async fn public_endpoint(&self, name: &str) -> Result<Option<String>> {
        let listed = self
            .client
            .list_tasks()
            .cluster(&self.cluster)
            .service_name(name)
            .desired_status(DesiredStatus::Running)
            .send()
            .await
            .or_classify("ListTasks")?;
        if listed.task_arns().is_empty() {
            return Ok(None);
        }

        let described = self
            .client
            .describe_tasks()
            .cluster(&self.cluster)
            .set_tasks(Some(listed.task_arns().to_vec()))
            .send()
            .await
            .or_classify("DescribeTasks")?;

        let ip = described
            .tasks()
            .iter()
            .flat_map(|t| t.attachments())
            .filter(|a| a.r#type() == Some("ElasticNetworkInterface"))
            .flat_map(|a| a.details())
            .find(|d| d.name() == Some(PUBLIC_IP_DETAIL))
            .and_then(|d| d.value())
            .map(String::from);
        debug!(service = %name, ip = ?ip, "Resolved public endpoint");
        Ok(ip)
    }
}
