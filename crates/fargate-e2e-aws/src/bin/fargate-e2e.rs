// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fargate-e2e - end-to-end checks for Fargate deployments
//!
//! One subcommand per deployment shape:
//! - `oneoff`: run a task, wait for it, read its output from CloudWatch Logs
//! - `queue`: send a job to SQS and watch the worker service process it
//! - `workflow`: start a state machine directly, by event or by schedule
//! - `batch`: submit an (array) Batch job and verify each child
//! - `webapi`: client-credentials JWT flow against an API behind a load balancer
//! - `webapp`: Cognito login through a load balancer
//! - `service-connect`: frontend to backend load spread over Service Connect
//!
//! The verdict is printed to stdout; the exit code is 0 on success.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use fargate_e2e::http::HttpSession;
use fargate_e2e::http::jwt::{ClientCredentials, JwtScenario};
use fargate_e2e::http::login::{LoginConfig, LoginScenario, cognito_login_base};
use fargate_e2e::http::mesh::{MeshConfig, ServiceConnectScenario};
use fargate_e2e::{
    E2eConfig, Expectation, JobScenario, LogReader, OutputSource, QueueScenario, Scenario,
    ScenarioDriver, StreamSelector, Submission, SubmissionMode, Verdict,
};
use fargate_e2e_aws::events::RoleSource;
use fargate_e2e_aws::{
    BatchExecutor, CloudWatchLogStore, EcsServiceProbe, EcsTaskExecutor,
    EventBridgeScheduleRegistrar, EventTrigger, SqsQueue, StepFunctionsExecutor, TaskNetwork,
    load_sdk_config,
};

const TASK_BANNER: &str = "--- Task Output ---";
const JOB_BANNER: &str = "--- Job Output ---";
const SUCCESS_MARKER: &str = "\"status\": \"success\"";

#[derive(Debug, Parser)]
#[command(name = "fargate-e2e", version, about = "End-to-end checks for Fargate deployments")]
struct Cli {
    /// Overall time budget for the scenario, in seconds.
    #[arg(long, global = true, env = "FARGATE_E2E_TIMEOUT_SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a one-off ECS task and verify its output.
    Oneoff(OneoffArgs),
    /// Send a job through SQS and verify the worker processed it.
    Queue(QueueArgs),
    /// Start a Step Functions workflow and verify its result.
    Workflow(WorkflowArgs),
    /// Submit a Batch job and verify every array child.
    Batch(BatchArgs),
    /// Client-credentials JWT flow against a web API.
    Webapi(WebapiArgs),
    /// Cognito login flow against a web app.
    Webapp(WebappArgs),
    /// Frontend to backend load distribution over Service Connect.
    ServiceConnect(ServiceConnectArgs),
}

#[derive(Debug, Args)]
struct OneoffArgs {
    #[arg(long, env = "CLUSTER_ARN")]
    cluster_arn: String,
    #[arg(long, env = "TASK_DEFINITION_ARN")]
    task_definition_arn: String,
    /// Comma-separated subnet ids.
    #[arg(long, env = "SUBNET_IDS")]
    subnet_ids: String,
    #[arg(long, env = "SECURITY_GROUP_ID")]
    security_group_id: String,
    #[arg(long, default_value = "hello-fargate-oneoff-app-container")]
    container_name: String,
    #[arg(long, default_value = r#"{"message":"Hello from E2E test!"}"#)]
    input: String,
    #[arg(long, default_value = "/ecs/hello-fargate-oneoff-task")]
    log_group: String,
    /// Log stream prefix; the task id is appended.
    #[arg(long, default_value = "ecs/hello-fargate-oneoff-app-container")]
    log_stream_prefix: String,
}

#[derive(Debug, Args)]
struct QueueArgs {
    #[arg(long, env = "QUEUE_URL")]
    queue_url: String,
    #[arg(long)]
    log_group: String,
    /// Wait for this worker service before sending.
    #[arg(long, requires = "service_name")]
    cluster_arn: Option<String>,
    #[arg(long, requires = "cluster_arn")]
    service_name: Option<String>,
    #[arg(long, default_value = "Hello from E2E test!")]
    message: String,
}

#[derive(Debug, Args)]
struct WorkflowArgs {
    #[arg(long, env = "STATE_MACHINE_ARN")]
    sm_arn: String,
    #[arg(long, default_value = r#"{"message":"Hello from E2E test!"}"#)]
    input: String,
    /// direct, eventbridge or scheduled.
    #[arg(long, default_value = "direct")]
    mode: SubmissionMode,
    #[arg(long, default_value = "default")]
    event_bus: String,
    /// Minutes until the one-shot schedule fires.
    #[arg(long)]
    scheduled_delay: Option<u64>,
    /// Role EventBridge assumes to start the workflow.
    #[arg(long, env = "SCHEDULE_ROLE_ARN")]
    role_arn: Option<String>,
    /// Borrow the role of an existing rule with this prefix.
    #[arg(long, default_value = fargate_e2e_aws::events::DEFAULT_ROLE_RULE_PREFIX)]
    role_rule_prefix: String,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[arg(long, env = "JOB_QUEUE")]
    job_queue: String,
    #[arg(long, env = "JOB_DEFINITION")]
    job_definition: String,
    #[arg(long, default_value = r#"{"items":["apple","banana"]}"#)]
    input: String,
    /// Number of array children; 0 submits a single job.
    #[arg(long, default_value_t = 2)]
    array_size: u32,
    #[arg(long, default_value = "/aws/batch/hello-fargate-batchjobs")]
    log_group: String,
}

#[derive(Debug, Args)]
struct WebapiArgs {
    #[arg(long, env = "ALB_URL")]
    alb_url: Url,
    #[arg(long, env = "TOKEN_ENDPOINT")]
    token_endpoint: Url,
    #[arg(long, env = "CLIENT_ID")]
    client_id: String,
    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    client_secret: String,
    #[arg(long)]
    scope: Option<String>,
}

#[derive(Debug, Args)]
struct WebappArgs {
    #[arg(long, env = "ALB_URL")]
    alb_url: Url,
    /// Cognito hosted UI domain prefix.
    #[arg(long, env = "COGNITO_DOMAIN")]
    cognito_domain: String,
    /// Defaults to the region of the AWS configuration.
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,
    #[arg(long, env = "E2E_USERNAME")]
    username: String,
    #[arg(long, env = "E2E_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Debug, Args)]
struct ServiceConnectArgs {
    #[arg(long, env = "CLUSTER_ARN")]
    cluster_arn: String,
    #[arg(long)]
    frontend_service: String,
    #[arg(long)]
    backend_service: String,
    #[arg(long, default_value_t = 20)]
    requests: u32,
    /// Call this URL instead of the frontend task's public address.
    #[arg(long)]
    frontend_url: Option<Url>,
}

/// Parse `raw` as JSON; anything else is passed on as a plain string.
fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Add a `testId` to object input so an indirectly started execution can be
/// told apart from others. Returns the token.
fn tag_input(input: &mut Value) -> Option<String> {
    let object = input.as_object_mut()?;
    if let Some(existing) = object.get("testId").and_then(Value::as_str) {
        return Some(existing.to_string());
    }
    let token = uuid::Uuid::new_v4().to_string();
    object.insert("testId".to_string(), json!(token));
    Some(token)
}

async fn build_scenario(
    command: Command,
    config: &E2eConfig,
) -> anyhow::Result<(Box<dyn Scenario>, E2eConfig)> {
    let sdk = load_sdk_config().await;
    let logs = || {
        LogReader::new(
            Arc::new(CloudWatchLogStore::from_conf(&sdk)),
            config.logs.clone(),
        )
    };
    let mut config = config.clone();

    let scenario: Box<dyn Scenario> = match command {
        Command::Oneoff(args) => {
            let network = TaskNetwork::new(
                TaskNetwork::parse_ids(&args.subnet_ids),
                vec![args.security_group_id],
            );
            let executor =
                EcsTaskExecutor::from_conf(&sdk, args.cluster_arn, network, args.container_name);
            let input = parse_input(&args.input);
            Box::new(
                JobScenario::new(
                    "oneoff",
                    Arc::new(executor),
                    Submission::direct(args.task_definition_arn, input.clone()),
                    config.clone(),
                )
                .with_logs(logs())
                .with_output(OutputSource::Logs {
                    group: args.log_group,
                    selector: StreamSelector::TaskId(args.log_stream_prefix),
                    begin_marker: TASK_BANNER.to_string(),
                })
                .expect(Expectation::echoed_message(&input)),
            )
        }
        Command::Queue(args) => {
            let queue = SqsQueue::from_conf(&sdk, args.queue_url);
            let mut scenario =
                QueueScenario::new(Arc::new(queue), logs(), args.log_group, config.clone())
                    .with_message(args.message);
            if let (Some(cluster), Some(service)) = (args.cluster_arn, args.service_name) {
                let probe = EcsServiceProbe::from_conf(&sdk, cluster);
                scenario = scenario.with_service(Arc::new(probe), service);
            }
            Box::new(scenario)
        }
        Command::Workflow(args) => {
            if let Some(minutes) = args.scheduled_delay {
                config = config.with_schedule_delay(Duration::from_secs(minutes * 60));
            }
            let mut input = parse_input(&args.input);
            let token = match args.mode {
                SubmissionMode::Direct => None,
                _ => tag_input(&mut input),
            };
            let executor = StepFunctionsExecutor::from_conf(&sdk).with_event_trigger(
                EventTrigger::new(aws_sdk_eventbridge::Client::new(&sdk), args.event_bus),
            );

            let mut submission = Submission::new(args.sm_arn, input, args.mode);
            if let Some(token) = token {
                submission = submission.with_correlation_token(token);
            }
            // The result is whatever the last state emits; only the terminal
            // state is asserted.
            let mut scenario = JobScenario::new(
                format!("workflow {}", args.mode),
                Arc::new(executor),
                submission,
                config.clone(),
            )
            .with_output(OutputSource::ExecutionResult)
            .expect(Expectation::Succeeded);
            if args.mode == SubmissionMode::ScheduledTriggered {
                let role = match args.role_arn {
                    Some(arn) => RoleSource::Arn(arn),
                    None => RoleSource::BorrowFrom(args.role_rule_prefix),
                };
                let registrar = EventBridgeScheduleRegistrar::from_conf(&sdk, role);
                scenario = scenario.with_registrar(Arc::new(registrar));
            }
            Box::new(scenario)
        }
        Command::Batch(args) => {
            let executor = BatchExecutor::from_conf(&sdk, args.job_queue);
            let input = parse_input(&args.input);
            let submission = Submission::direct(args.job_definition, input.clone());
            let scenario = if args.array_size == 0 {
                JobScenario::new("batch job", Arc::new(executor), submission, config.clone())
            } else {
                JobScenario::new(
                    "batch array",
                    Arc::new(executor),
                    submission.with_array_size(args.array_size),
                    config.clone(),
                )
                .with_logs(logs())
                .with_output(OutputSource::ChildLogs {
                    group: args.log_group,
                    begin_marker: JOB_BANNER.to_string(),
                    success_marker: SUCCESS_MARKER.to_string(),
                })
                .expect(Expectation::array_items(&input, args.array_size))
            };
            Box::new(scenario)
        }
        Command::Webapi(args) => Box::new(JwtScenario::new(
            args.alb_url,
            ClientCredentials {
                token_endpoint: args.token_endpoint,
                client_id: args.client_id,
                client_secret: args.client_secret,
                scope: args.scope,
            },
            HttpSession::new(&config.http)?,
        )),
        Command::Webapp(args) => {
            let region = args
                .region
                .or_else(|| sdk.region().map(|r| r.to_string()))
                .ok_or_else(|| anyhow::anyhow!("no AWS region configured; pass --region"))?;
            let login_base = cognito_login_base(&args.cognito_domain, &region)?;
            Box::new(LoginScenario::new(
                LoginConfig::new(args.alb_url, login_base, args.username, args.password),
                HttpSession::new(&config.http)?,
            ))
        }
        Command::ServiceConnect(args) => {
            let mut mesh = MeshConfig::new(args.backend_service, args.frontend_service)
                .with_requests(args.requests);
            if let Some(url) = args.frontend_url {
                mesh = mesh.with_frontend_url(url);
            }
            Box::new(ServiceConnectScenario::new(
                Arc::new(EcsServiceProbe::from_conf(&sdk, args.cluster_arn)),
                mesh,
                HttpSession::new(&config.http)?,
                config.poll.clone(),
            ))
        }
    };
    Ok((scenario, config))
}

async fn run(cli: Cli) -> anyhow::Result<Verdict> {
    let mut config = E2eConfig::from_env()?;
    if let Some(secs) = cli.timeout {
        config = config.with_scenario_deadline(Duration::from_secs(secs));
    }
    config.validate()?;

    let (scenario, config) = build_scenario(cli.command, &config).await?;
    info!(
        scenario = %scenario.name(),
        deadline_secs = config.poll.scenario_deadline.as_secs(),
        "Running scenario"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cleaning up");
            on_signal.cancel();
        }
    });

    Ok(ScenarioDriver::new(config)
        .with_cancellation(cancel)
        .run(scenario.as_ref())
        .await)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fargate_e2e=info,fargate_e2e_aws=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let verdict = run(cli).await?;

    println!("{}", verdict);
    Ok(ExitCode::from(verdict.exit_code().clamp(0, 255) as u8))
}
