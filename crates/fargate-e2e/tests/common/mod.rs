// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for fargate-e2e integration tests.
//!
//! Log lines mimic what the sample workloads print: a banner, a
//! pretty-printed JSON object one line per record, and a dashed closing line.

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{Value, json};

use fargate_e2e::mock::MockLogStore;
use fargate_e2e::{E2eConfig, LogReader};

pub const TASK_GROUP: &str = "/ecs/hello-fargate";
pub const BATCH_GROUP: &str = "/aws/batch/hello-fargate-batchjobs";
pub const WORKER_GROUP: &str = "/ecs/queue-worker";
pub const TASK_BANNER: &str = "--- Task Output ---";
pub const JOB_BANNER: &str = "--- Job Output ---";
pub const SUCCESS_MARKER: &str = "\"status\": \"success\"";

pub fn config() -> E2eConfig {
    E2eConfig::default()
}

pub fn reader(store: &Arc<MockLogStore>) -> LogReader {
    LogReader::new(store.clone(), config().logs)
}

fn block(banner: &str, value: &Value, closing: &str) -> Vec<String> {
    let mut lines = vec![banner.to_string()];
    lines.extend(
        serde_json::to_string_pretty(value)
            .unwrap()
            .lines()
            .map(str::to_string),
    );
    lines.push(closing.to_string());
    lines
}

/// What the one-off task prints for `input`.
pub fn task_output(input: &Value) -> Vec<String> {
    let message = input["message"].as_str().unwrap_or("");
    let mut lines = vec!["Task started".to_string()];
    lines.extend(block(
        TASK_BANNER,
        &json!({
            "status": "success",
            "message": format!("Processed: {}", message),
            "input": input,
        }),
        "-------------------",
    ));
    lines
}

/// What array child `index` prints for `item`.
pub fn child_output(index: u32, job_id: &str, item: &str) -> Vec<String> {
    block(
        JOB_BANNER,
        &json!({
            "status": "success",
            "message": format!("Processed item[{}]: {}", index, item),
            "arrayIndex": index,
            "jobId": job_id,
        }),
        "------------------",
    )
}

pub async fn push(store: &MockLogStore, group: &str, segment: &str, lines: &[String]) {
    let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
    store.push(group, segment, &lines).await;
}
