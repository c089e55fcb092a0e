// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Readiness checks for long-running services.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::deadline::Deadline;
use crate::error::{E2eError, Result};

/// Service state as reported by its orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub status: String,
    pub running: u32,
    pub desired: u32,
}

impl ServiceStatus {
    /// Active with at least `min_running` tasks.
    pub fn is_ready(&self, min_running: u32) -> bool {
        self.status == "ACTIVE" && self.running >= min_running.max(1)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} status={} running={} desired={}",
            self.name, self.status, self.running, self.desired
        )
    }
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn describe_service(&self, name: &str) -> Result<ServiceStatus>;

    /// Publicly reachable address of one of the service's tasks, if any.
    async fn public_endpoint(&self, name: &str) -> Result<Option<String>> {
        let _ = name;
        Ok(None)
    }
}

/// Poll `name` until it is ready or `deadline` passes.
pub async fn wait_for_service(
    probe: &dyn ServiceProbe,
    name: &str,
    min_running: u32,
    poll_interval: Duration,
    deadline: &Deadline,
) -> Result<ServiceStatus> {
    let mut last: Option<ServiceStatus> = None;
    loop {
        deadline.check()?;
        if deadline.is_expired() {
            return Err(E2eError::DeadlineExceeded {
                handle: match &last {
                    Some(status) => format!("service {}", status),
                    None => format!("service {}", name),
                },
                budget: deadline.budget(),
                last: None,
            });
        }

        match deadline.run(probe.describe_service(name)).await? {
            Some(Ok(status)) => {
                info!(
                    service = %name,
                    status = %status.status,
                    running = status.running,
                    desired = status.desired,
                    "Service status"
                );
                if status.is_ready(min_running) {
                    return Ok(status);
                }
                last = Some(status);
            }
            Some(Err(e)) if e.is_retryable() || matches!(e, E2eError::NotFound(_)) => {
                info!(service = %name, error = %e, "Service not describable yet");
            }
            Some(Err(e)) => return Err(e),
            None => continue,
        }

        deadline.sleep(poll_interval).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: &str, running: u32) -> ServiceStatus {
        ServiceStatus {
            name: "worker".into(),
            status: state.into(),
            running,
            desired: 2,
        }
    }

    #[test]
    fn test_ready_requires_active_and_running() {
        assert!(status("ACTIVE", 1).is_ready(1));
        assert!(!status("ACTIVE", 0).is_ready(0));
        assert!(!status("DRAINING", 2).is_ready(1));
        assert!(!status("ACTIVE", 1).is_ready(2));
    }
}
