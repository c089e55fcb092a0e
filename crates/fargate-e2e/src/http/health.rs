// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Health endpoint checks.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::http::{endpoint, truncate};

/// Answer of a `/health` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status_code: u16,
    pub status: Option<String>,
    pub server_id: Option<String>,
}

/// GET `<base>/health` once and require 200.
pub async fn check_health(client: &Client, base: &Url) -> Result<HealthReport> {
    let url = endpoint(base, "/health")?;
    let response = client.get(url).send().await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    info!(status = status.as_u16(), body = %truncate(body.trim(), 200), "Health response");

    if status != StatusCode::OK {
        return Err(E2eError::assertion("GET /health status", 200, status.as_u16()));
    }

    let parsed: Option<Value> = serde_json::from_str(&body).ok();
    let field = |name: &str| {
        parsed
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Ok(HealthReport {
        status_code: status.as_u16(),
        status: field("status"),
        server_id: field("server_id"),
    })
}

/// Poll `<base>/health` until it answers 200.
pub async fn wait_for_health(
    client: &Client,
    base: &Url,
    interval: Duration,
    deadline: &Deadline,
) -> Result<HealthReport> {
    let mut attempt = 0u32;
    loop {
        deadline.check()?;
        if deadline.is_expired() {
            return Err(E2eError::DeadlineExceeded {
                handle: format!("health of {}", base),
                budget: deadline.budget(),
                last: None,
            });
        }

        attempt += 1;
        match deadline.run(check_health(client, base)).await? {
            Some(Ok(report)) => return Ok(report),
            Some(Err(e)) => info!(attempt, error = %e, "Waiting for health check"),
            None => continue,
        }
        deadline.sleep(interval).await?;
    }
}
