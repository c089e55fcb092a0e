// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer-token flow: client-credentials exchange, then authenticated calls.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use url::Url;

use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::http::health::{check_health, wait_for_health};
use crate::http::{HttpSession, endpoint, truncate};
use crate::scenario::{Scenario, Tracker, Verdict};

/// Token endpoint answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

/// Confidential client allowed to use the client-credentials grant.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub token_endpoint: Url,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

/// POST `grant_type=client_credentials` with Basic auth.
pub async fn exchange_client_credentials(
    client: &Client,
    credentials: &ClientCredentials,
) -> Result<TokenResponse> {
    let mut form = vec![("grant_type", "client_credentials")];
    if let Some(scope) = credentials.scope.as_deref() {
        form.push(("scope", scope));
    }
    info!(
        endpoint = %credentials.token_endpoint,
        client_id = %credentials.client_id,
        scope = credentials.scope.as_deref().unwrap_or(""),
        "Requesting access token"
    );

    let response = client
        .post(credentials.token_endpoint.clone())
        .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
        .form(&form)
        .send()
        .await?;
    let status = response.status();
    let body = response.text().await?;
    if status != StatusCode::OK {
        return Err(E2eError::Http(format!(
            "token request failed with status {}: {}",
            status.as_u16(),
            truncate(&body, 500)
        )));
    }

    let token: TokenResponse = serde_json::from_str(&body)?;
    if token.access_token.is_empty() {
        return Err(E2eError::assertion("access_token", "a non-empty token", "\"\""));
    }
    info!(token_type = %token.token_type, expires_in = token.expires_in, "Got access token");
    Ok(token)
}

/// GET `url`, optionally with a bearer token, returning status and body.
pub(crate) async fn get(client: &Client, url: Url, bearer: Option<&str>) -> Result<(StatusCode, String)> {
    let mut request = client.get(url);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Ok((status, body))
}

pub(crate) fn expect_status(what: &str, expected: StatusCode, actual: StatusCode, body: &str) -> Result<()> {
    if actual == expected {
        return Ok(());
    }
    Err(E2eError::assertion(
        what,
        expected.as_u16(),
        format!("{} {}", actual.as_u16(), truncate(body.trim(), 300)),
    ))
}

/// Health, 401 without a token, token exchange, then authenticated calls.
pub struct JwtScenario {
    name: String,
    base: Url,
    credentials: ClientCredentials,
    session: HttpSession,
}

impl JwtScenario {
    pub fn new(base: Url, credentials: ClientCredentials, session: HttpSession) -> Self {
        Self {
            name: "jwt flow".to_string(),
            base,
            credentials,
            session,
        }
    }

    async fn execute(&self, tracker: &mut Tracker, deadline: &Deadline) -> Result<String> {
        let client = self.session.client();
        let interval = self.session.settings().health_interval;

        tracker.record(
            "wait for health",
            wait_for_health(client, &self.base, interval, deadline).await,
            |_| "load balancer healthy".to_string(),
        )?;

        tracker.record(
            "health endpoint",
            deadline.bound("health check", check_health(client, &self.base)).await,
            |r| {
                format!(
                    "200, status={} server_id={}",
                    r.status.as_deref().unwrap_or("-"),
                    r.server_id.as_deref().unwrap_or("-")
                )
            },
        )?;

        let echo = endpoint(&self.base, "/api/echo")?;
        let unauthenticated = async {
            let (status, body) = deadline
                .bound("GET /api/echo", get(client, echo.clone(), None))
                .await?;
            expect_status("GET /api/echo without token", StatusCode::UNAUTHORIZED, status, &body)
        }
        .await;
        tracker.record("unauthenticated echo", unauthenticated, |_| "401 as expected".into())?;

        let token = tracker.record(
            "token exchange",
            deadline
                .bound(
                    "token exchange",
                    exchange_client_credentials(client, &self.credentials),
                )
                .await,
            |t| {
                format!(
                    "{} token, {} chars, expires in {}s",
                    t.token_type,
                    t.access_token.len(),
                    t.expires_in
                )
            },
        )?;

        let authenticated = async {
            let (status, body) = deadline
                .bound(
                    "GET /api/echo",
                    get(client, echo.clone(), Some(&token.access_token)),
                )
                .await?;
            expect_status("GET /api/echo with token", StatusCode::OK, status, &body)?;
            Ok(body)
        }
        .await;
        tracker.record("authenticated echo", authenticated, |body| {
            format!("200 {}", truncate(body.trim(), 120))
        })?;

        let whoami_url = endpoint(&self.base, "/api/whoami")?;
        let whoami = async {
            let (status, body) = deadline
                .bound("GET /api/whoami", get(client, whoami_url, Some(&token.access_token)))
                .await?;
            expect_status("GET /api/whoami with token", StatusCode::OK, status, &body)?;
            let value: Value = serde_json::from_str(&body)?;
            for field in ["server_id", "headers"] {
                if value.get(field).is_none() {
                    return Err(E2eError::assertion(
                        "whoami response",
                        format!("a '{}' field", field),
                        truncate(&body, 300),
                    ));
                }
            }
            Ok(value)
        }
        .await;
        let whoami = tracker.record("whoami", whoami, |v| {
            format!("server_id={}", v.get("server_id").cloned().unwrap_or(Value::Null))
        })?;
        tracker.set_output(whoami);

        Ok("all bearer-token checks passed".to_string())
    }
}

#[async_trait]
impl Scenario for JwtScenario {
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
