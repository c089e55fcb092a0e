// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fargate-e2e-aws - AWS backends for fargate-e2e
//!
//! Implements the core traits on top of the AWS SDK:
//!
//! | trait               | adapter                                   |
//! |---------------------|-------------------------------------------|
//! | `AsyncExecutor`     | [`EcsTaskExecutor`], [`BatchExecutor`], [`StepFunctionsExecutor`] |
//! | `ScheduleRegistrar` | [`EventBridgeScheduleRegistrar`]          |
//! | `MessageQueue`      | [`SqsQueue`]                              |
//! | `LogStore`          | [`CloudWatchLogStore`]                    |
//! | `ServiceProbe`      | [`EcsServiceProbe`]                       |
//!
//! Every SDK failure goes through [`error::classify`] so the core retry
//! policy sees `Transient` and `NotFound` the same way it does for the mocks.

pub mod batch;
pub mod ecs;
pub mod error;
pub mod events;
pub mod logs;
pub mod sfn;
pub mod sqs;

pub use batch::BatchExecutor;
pub use ecs::{EcsServiceProbe, EcsTaskExecutor, TaskNetwork};
pub use events::EventBridgeScheduleRegistrar;
pub use logs::CloudWatchLogStore;
pub use sfn::{EventTrigger, StepFunctionsExecutor};
pub use sqs::SqsQueue;

use aws_sdk_sfn::primitives::DateTime as AwsDateTime;
use chrono::{DateTime, Utc};

/// Load region and credentials from the standard AWS provider chain.
pub async fn load_sdk_config() -> aws_config::SdkConfig {
    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await
}

/// SDK timestamp to UTC.
pub(crate) fn to_utc(at: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(at.secs(), at.subsec_nanos())
}

/// Epoch milliseconds (Batch, CloudWatch Logs) to UTC.
pub(crate) fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}
