// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service-to-service calls through a service registry.
//!
//! The frontend exposes `/api/test?requests=N`, which fans N calls out to the
//! backend service and reports which backend instance answered each one.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::config::PollSettings;
use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::http::health::wait_for_health;
use crate::http::{HttpSession, endpoint, truncate};
use crate::scenario::{Scenario, Tracker, Verdict};
use crate::service::{ServiceProbe, wait_for_service};

/// Frontend answer to a distribution test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshReport {
    pub total_requests: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub unique_backends: u32,
    /// Responses per backend instance.
    pub distribution: BTreeMap<String, u32>,
    pub success: bool,
    pub message: String,
    pub frontend_id: String,
}

impl MeshReport {
    /// `backend: count (pct%)` lines, busiest first.
    pub fn distribution_lines(&self) -> Vec<String> {
        let total = self.success_count.max(1) as f64;
        let mut entries: Vec<(&String, &u32)> = self.distribution.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .map(|(backend, count)| {
                format!(
                    "{}: {} ({:.1}%)",
                    backend,
                    count,
                    *count as f64 * 100.0 / total
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub backend_service: String,
    pub frontend_service: String,
    /// Skip endpoint discovery and call this URL.
    pub frontend_url: Option<Url>,
    pub frontend_port: u16,
    pub requests: u32,
    pub min_backends: u32,
}

impl MeshConfig {
    pub fn new(backend_service: impl Into<String>, frontend_service: impl Into<String>) -> Self {
        Self {
            backend_service: backend_service.into(),
            frontend_service: frontend_service.into(),
            frontend_url: None,
            frontend_port: 8080,
            requests: 20,
            min_backends: 2,
        }
    }

    pub fn with_frontend_url(mut self, url: Url) -> Self {
        self.frontend_url = Some(url);
        self
    }

    pub fn with_requests(mut self, requests: u32) -> Self {
        self.requests = requests;
        self
    }
}

pub struct ServiceConnectScenario {
    name: String,
    probe: Arc<dyn ServiceProbe>,
    mesh: MeshConfig,
    session: HttpSession,
    poll: PollSettings,
}

impl ServiceConnectScenario {
    pub fn new(
        probe: Arc<dyn ServiceProbe>,
        mesh: MeshConfig,
        session: HttpSession,
        poll: PollSettings,
    ) -> Self {
        Self {
            name: "service connect".to_string(),
            probe,
            mesh,
            session,
            poll,
        }
    }

    async fn resolve_frontend(&self) -> Result<Url> {
        if let Some(url) = &self.mesh.frontend_url {
            return Ok(url.clone());
        }
        let ip = self
            .probe
            .public_endpoint(&self.mesh.frontend_service)
            .await?
            .ok_or_else(|| {
                E2eError::NotFound(format!(
                    "no public address for service {}",
                    self.mesh.frontend_service
                ))
            })?;
        Ok(Url::parse(&format!("http://{}:{}", ip, self.mesh.frontend_port))?)
    }

    async fn distribution_test(&self, base: &Url) -> Result<MeshReport> {
        let mut url = endpoint(base, "/api/test")?;
        url.query_pairs_mut()
            .append_pair("requests", &self.mesh.requests.to_string());
        info!(url = %url, "Running distribution test");

        let response = self.session.client().get(url).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status != StatusCode::OK {
            return Err(E2eError::assertion(
                "GET /api/test status",
                200,
                format!("{} {}", status.as_u16(), truncate(body.trim(), 300)),
            ));
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn execute(&self, tracker: &mut Tracker, deadline: &Deadline) -> Result<String> {
        let interval = self.poll.interval;
        let ready = self.poll.service_ready_timeout;

        tracker.record(
            "backend service ready",
            wait_for_service(
                self.probe.as_ref(),
                &self.mesh.backend_service,
                self.mesh.min_backends,
                interval,
                &deadline.child(ready),
            )
            .await,
            |s| s.to_string(),
        )?;
        tracker.record(
            "frontend service ready",
            wait_for_service(
                self.probe.as_ref(),
                &self.mesh.frontend_service,
                1,
                interval,
                &deadline.child(ready),
            )
            .await,
            |s| s.to_string(),
        )?;

        let frontend = deadline.bound("resolve frontend", self.resolve_frontend()).await;
        let base = tracker.record("resolve frontend", frontend, |u| u.to_string())?;
        tracker.record(
            "wait for health",
            wait_for_health(
                self.session.client(),
                &base,
                self.session.settings().health_interval,
                deadline,
            )
            .await,
            |_| "frontend healthy".to_string(),
        )?;

        let report = deadline
            .bound("distribution test", self.distribution_test(&base))
            .await;
        let report = tracker.record("distribution test", report, |r| {
            format!(
                "{}/{} succeeded across {} backends (frontend {})",
                r.success_count, r.total_requests, r.unique_backends, r.frontend_id
            )
        })?;
        for line in report.distribution_lines() {
            tracker.note(line);
        }
        tracker.set_output(serde_json::to_value(&report)?);

        let checked = if !report.success {
            Err(E2eError::assertion(
                "distribution test success",
                true,
                format!("false ({})", report.message),
            ))
        } else if report.unique_backends < self.mesh.min_backends {
            Err(E2eError::assertion(
                "unique backends",
                format!(">= {}", self.mesh.min_backends),
                report.unique_backends,
            ))
        } else {
            Ok(report.unique_backends)
        };
        let backends = tracker.record("load distribution", checked, |n| {
            format!("{} distinct backends answered", n)
        })?;

        Ok(format!(
            "{} requests spread over {} backends",
            report.total_requests, backends
        ))
    }
}

#[async_trait]
impl Scenario for ServiceConnectScenario {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, deadline: &Deadline) -> Verdict {
        let mut tracker = Tracker::steps_only(&self.name);
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
    fn test_report_parses_frontend_answer() {
        let body = r#"{
            "total_requests": 20,
            "success_count": 20,
            "failure_count": 0,
            "unique_backends": 2,
            "distribution": {"backend-a": 12, "backend-b": 8},
            "success": true,
            "message": "ok",
            "frontend_id": "frontend-1"
        }"#;
        let report: MeshReport = serde_json::from_str(body).unwrap();
        assert_eq!(report.unique_backends, 2);
        assert_eq!(
            report.distribution_lines(),
            vec!["backend-a: 12 (60.0%)", "backend-b: 8 (40.0%)"]
        );
    }

    #[test]
    fn test_report_tolerates_missing_fields() {
        let report: MeshReport = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!report.success);
        assert!(report.distribution_lines().is_empty());
    }
}
