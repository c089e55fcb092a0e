// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redirect-based login handshake driven as an explicit state machine.
//!
//! ```text
//! UnauthenticatedRedirect -> LoginPageFetched -> TokenExtracted
//!     -> CredentialsPosted -> RedirectChainFollowed -> SessionCookieVerified
//! ```
//!
//! Every request goes through the redirect-less client so each hop is
//! observed; cookies set along the way land in the shared jar. The parsing
//! half of each transition is a pure function and tested on its own.

use std::fmt;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::LOCATION;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::http::health::{check_health, wait_for_health};
use crate::http::{HttpSession, endpoint, truncate};
use crate::scenario::{Scenario, Tracker, Verdict};

/// Hidden-field patterns, tolerant of attribute order and quote style.
static CSRF_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#"name="_csrf"\s+value="([^"]+)""#,
        r#"value="([^"]+)"\s+name="_csrf""#,
        r#"<input[^>]*name="_csrf"[^>]*value="([^"]+)""#,
        r#"<input[^>]*value="([^"]+)"[^>]*name="_csrf""#,
        r#"name=['"]_csrf['"][^>]*value=['"]([^'"]+)['"]"#,
        r#"value=['"]([^'"]+)['"][^>]*name=['"]_csrf['"]"#,
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Query parameters of the authorize URL that are not echoed into the form.
const SKIPPED_QUERY_PARAMS: [&str; 2] = ["response_type", "scope"];

/// Where the handshake goes and who logs in.
#[derive(Debug, Clone)]
pub struct LoginConfig {
    /// Load balancer origin serving the protected application.
    pub app_base: Url,
    pub protected_path: String,
    /// Hosted login page origin; the form is posted to `<login_base>/login`.
    pub login_base: Url,
    /// Substring the unauthenticated redirect must point at.
    pub login_host_marker: String,
    pub username: String,
    pub password: String,
    pub session_cookie_prefix: String,
}

impl LoginConfig {
    pub fn new(
        app_base: Url,
        login_base: Url,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            app_base,
            protected_path: "/app/profile".to_string(),
            login_base,
            login_host_marker: "amazoncognito.com".to_string(),
            username: username.into(),
            password: password.into(),
            session_cookie_prefix: "AWSELBAuthSessionCookie".to_string(),
        }
    }

    pub fn with_protected_path(mut self, path: impl Into<String>) -> Self {
        self.protected_path = path.into();
        self
    }

    pub fn with_login_host_marker(mut self, marker: impl Into<String>) -> Self {
        self.login_host_marker = marker.into();
        self
    }

    pub fn with_session_cookie_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.session_cookie_prefix = prefix.into();
        self
    }

    pub fn protected_url(&self) -> Result<Url> {
        endpoint(&self.app_base, &self.protected_path)
    }
}

/// Hosted login origin of a user pool domain.
pub fn cognito_login_base(domain: &str, region: &str) -> Result<Url> {
    Ok(Url::parse(&format!(
        "https://{}.auth.{}.amazoncognito.com",
        domain, region
    ))?)
}

// ============================================================================
// States
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    /// The protected path redirected to the login host.
    UnauthenticatedRedirect { authorize_url: Url },
    LoginPageFetched { authorize_url: Url, page: String },
    TokenExtracted { authorize_url: Url, csrf: String },
    /// The form was accepted and answered with a redirect.
    CredentialsPosted { next: Url },
    RedirectChainFollowed { final_url: Url, status: u16, hops: usize },
    SessionCookieVerified { cookie: String },
}

impl LoginState {
    pub fn name(&self) -> &'static str {
        match self {
            LoginState::UnauthenticatedRedirect { .. } => "UnauthenticatedRedirect",
            LoginState::LoginPageFetched { .. } => "LoginPageFetched",
            LoginState::TokenExtracted { .. } => "TokenExtracted",
            LoginState::CredentialsPosted { .. } => "CredentialsPosted",
            LoginState::RedirectChainFollowed { .. } => "RedirectChainFollowed",
            LoginState::SessionCookieVerified { .. } => "SessionCookieVerified",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, LoginState::SessionCookieVerified { .. })
    }
}

impl fmt::Display for LoginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginState::UnauthenticatedRedirect { authorize_url } => {
                write!(f, "redirected to {}", truncate(authorize_url.as_str(), 100))
            }
            LoginState::LoginPageFetched { page, .. } => {
                write!(f, "login page fetched ({} bytes)", page.len())
            }
            LoginState::TokenExtracted { csrf, .. } => {
                write!(f, "csrf token {}", truncate(csrf, 20))
            }
            LoginState::CredentialsPosted { next } => {
                write!(f, "credentials accepted, next {}", truncate(next.as_str(), 100))
            }
            LoginState::RedirectChainFollowed {
                final_url,
                status,
                hops,
            } => write!(f, "{} hops, ended at {} with {}", hops, final_url, status),
            LoginState::SessionCookieVerified { cookie } => write!(f, "session cookie {}", cookie),
        }
    }
}

// ============================================================================
// Pure transitions
// ============================================================================

/// First hidden `_csrf` value found in `html`.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    CSRF_PATTERNS
        .iter()
        .find_map(|re| re.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Fields of the login form post, in submission order.
pub fn login_form_fields(
    authorize_url: &Url,
    csrf: &str,
    username: &str,
    password: &str,
) -> Vec<(String, String)> {
    let mut fields = vec![
        ("_csrf".to_string(), csrf.to_string()),
        ("username".to_string(), username.to_string()),
        ("password".to_string(), password.to_string()),
        ("cognitoAsfData".to_string(), String::new()),
    ];
    fields.extend(
        authorize_url
            .query_pairs()
            .filter(|(key, _)| !SKIPPED_QUERY_PARAMS.contains(&key.as_ref()))
            .map(|(key, value)| (key.into_owned(), value.into_owned())),
    );
    fields
}

/// `<login_base>/login` carrying the authorize URL's query verbatim.
pub fn login_post_url(login_base: &Url, authorize_url: &Url) -> Result<Url> {
    let mut url = endpoint(login_base, "/login")?;
    url.set_query(authorize_url.query());
    Ok(url)
}

/// Resolve a `Location` header against the URL that produced it.
pub fn next_redirect(current: &Url, location: &str) -> Result<Url> {
    Ok(current.join(location)?)
}

/// Name of the first cookie starting with `prefix`.
pub fn find_session_cookie(cookies: &[(String, String)], prefix: &str) -> Option<String> {
    cookies
        .iter()
        .find(|(name, _)| name.starts_with(prefix))
        .map(|(name, _)| name.clone())
}

fn location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

// ============================================================================
// Flow
// ============================================================================

/// Drives one login handshake against a session's cookie jar.
pub struct LoginFlow<'a> {
    session: &'a HttpSession,
    config: &'a LoginConfig,
}

impl<'a> LoginFlow<'a> {
    pub fn new(session: &'a HttpSession, config: &'a LoginConfig) -> Self {
        Self { session, config }
    }

    /// Request the protected path without a session.
    pub async fn start(&self) -> Result<LoginState> {
        let url = self.config.protected_url()?;
        let response = self.session.manual().get(url.clone()).send().await?;
        let status = response.status();
        let target = location(&response);
        info!(status = status.as_u16(), location = ?target, "Unauthenticated response");

        if status != StatusCode::FOUND {
            return Err(E2eError::assertion(
                format!("GET {} without session", self.config.protected_path),
                302,
                status.as_u16(),
            ));
        }
        let target = target.unwrap_or_default();
        if !target.contains(&self.config.login_host_marker) {
            return Err(E2eError::assertion(
                "unauthenticated redirect target",
                format!("a URL containing '{}'", self.config.login_host_marker),
                target,
            ));
        }
        Ok(LoginState::UnauthenticatedRedirect {
            authorize_url: next_redirect(&url, &target)?,
        })
    }

    /// Perform the transition out of `state`.
    pub async fn advance(&self, state: LoginState) -> Result<LoginState> {
        match state {
            LoginState::UnauthenticatedRedirect { authorize_url } => {
                let page = self.fetch_login_page(&authorize_url).await?;
                Ok(LoginState::LoginPageFetched {
                    authorize_url,
                    page,
                })
            }
            LoginState::LoginPageFetched {
                authorize_url,
                page,
            } => {
                let csrf = extract_csrf_token(&page).ok_or_else(|| {
                    E2eError::assertion(
                        "login page",
                        "a hidden _csrf field",
                        truncate(&page, 300),
                    )
                })?;
                Ok(LoginState::TokenExtracted {
                    authorize_url,
                    csrf,
                })
            }
            LoginState::TokenExtracted {
                authorize_url,
                csrf,
            } => {
                let next = self.post_credentials(&authorize_url, &csrf).await?;
                Ok(LoginState::CredentialsPosted { next })
            }
            LoginState::CredentialsPosted { next } => self.follow_chain(next).await,
            LoginState::RedirectChainFollowed { .. } => {
                let cookies = self.session.cookies(&self.config.app_base);
                let cookie = find_session_cookie(&cookies, &self.config.session_cookie_prefix)
                    .ok_or_else(|| {
                        let names: Vec<&str> = cookies.iter().map(|(n, _)| n.as_str()).collect();
                        E2eError::assertion(
                            format!("cookies for {}", self.config.app_base),
                            format!("a cookie named {}*", self.config.session_cookie_prefix),
                            format!("{:?}", names),
                        )
                    })?;
                Ok(LoginState::SessionCookieVerified { cookie })
            }
            LoginState::SessionCookieVerified { .. } => Err(E2eError::InvalidInput(
                "login flow already completed".to_string(),
            )),
        }
    }

    async fn fetch_login_page(&self, authorize_url: &Url) -> Result<String> {
        let response = self.session.manual().get(authorize_url.clone()).send().await?;
        let status = response.status();

        let response = if status.is_redirection() {
            let target = location(&response).unwrap_or_default();
            let login_url = next_redirect(authorize_url, &target)?;
            debug!(url = %login_url, "Authorize endpoint redirected to login page");
            self.session.client().get(login_url).send().await?
        } else {
            response
        };

        let status = response.status();
        let page = response.text().await?;
        if status != StatusCode::OK {
            return Err(E2eError::assertion("login page status", 200, status.as_u16()));
        }
        Ok(page)
    }

    async fn post_credentials(&self, authorize_url: &Url, csrf: &str) -> Result<Url> {
        let url = login_post_url(&self.config.login_base, authorize_url)?;
        let form = login_form_fields(
            authorize_url,
            csrf,
            &self.config.username,
            &self.config.password,
        );
        info!(url = %truncate(url.as_str(), 100), username = %self.config.username, "Posting credentials");

        let response = self.session.manual().post(url.clone()).form(&form).send().await?;
        let status = response.status();
        match location(&response) {
            Some(target) if status.is_redirection() => next_redirect(&url, &target),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(E2eError::assertion(
                    "login form response",
                    "a redirect",
                    format!("{} {}", status.as_u16(), truncate(body.trim(), 300)),
                ))
            }
        }
    }

    async fn follow_chain(&self, mut current: Url) -> Result<LoginState> {
        let max = self.session.settings().max_redirects;
        for hop in 1..=max {
            let response = self.session.manual().get(current.clone()).send().await?;
            let status = response.status();
            debug!(hop, status = status.as_u16(), url = %truncate(current.as_str(), 100), "Redirect hop");

            match location(&response) {
                Some(target) if status.is_redirection() => {
                    current = next_redirect(&current, &target)?;
                }
                _ => {
                    return Ok(LoginState::RedirectChainFollowed {
                        final_url: current,
                        status: status.as_u16(),
                        hops: hop,
                    });
                }
            }
        }
        Err(E2eError::assertion(
            "redirect chain",
            format!("at most {} redirects", max),
            format!("still redirecting at {}", truncate(current.as_str(), 100)),
        ))
    }
}

// ============================================================================
// Scenario
// ============================================================================

/// Health, login redirect, login handshake, then the authenticated profile.
pub struct LoginScenario {
    name: String,
    config: LoginConfig,
    session: HttpSession,
}

impl LoginScenario {
    pub fn new(config: LoginConfig, session: HttpSession) -> Self {
        Self {
            name: "cookie login flow".to_string(),
            config,
            session,
        }
    }

    async fn execute(&self, tracker: &mut Tracker, deadline: &Deadline) -> Result<String> {
        let client = self.session.client();
        let base = &self.config.app_base;

        tracker.record(
            "wait for health",
            wait_for_health(client, base, self.session.settings().health_interval, deadline).await,
            |_| "load balancer healthy".to_string(),
        )?;
        let health = deadline.bound("health check", check_health(client, base)).await;
        tracker.record("health endpoint", health, |r| {
            format!("200, server_id={}", r.server_id.as_deref().unwrap_or("-"))
        })?;

        let flow = LoginFlow::new(&self.session, &self.config);
        let mut state = tracker.record(
            "UnauthenticatedRedirect",
            deadline.bound("login redirect", flow.start()).await,
            LoginState::to_string,
        )?;
        while !state.is_final() {
            deadline.check()?;
            let result = deadline.bound("login handshake", flow.advance(state)).await;
            let name = match &result {
                Ok(next) => next.name(),
                Err(_) => "login handshake",
            };
            state = tracker.record(name, result, LoginState::to_string)?;
        }

        let profile = deadline.bound("profile request", self.fetch_profile()).await;
        let profile = tracker.record("authenticated profile", profile, |v| {
            format!("user_id={}", v.get("user_id").and_then(Value::as_str).unwrap_or("-"))
        })?;
        tracker.set_output(profile);

        Ok("login handshake produced a working session".to_string())
    }

    async fn fetch_profile(&self) -> Result<Value> {
        let url = self.config.protected_url()?;
        let response = self.session.client().get(url).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status != StatusCode::OK {
            return Err(E2eError::assertion(
                format!("GET {} with session", self.config.protected_path),
                200,
                format!("{} {}", status.as_u16(), truncate(body.trim(), 300)),
            ));
        }

        let profile: Value = serde_json::from_str(&body)?;
        let user_id = profile.get("user_id").and_then(Value::as_str).unwrap_or("");
        if user_id.is_empty() {
            return Err(E2eError::assertion("profile user_id", "non-empty", "empty"));
        }
        if profile.get("claims").is_none_or(Value::is_null) {
            return Err(E2eError::assertion("profile claims", "an object", "null"));
        }
        if profile.get("has_token").and_then(Value::as_bool) != Some(true) {
            return Err(E2eError::assertion(
                "profile has_token",
                true,
                profile.get("has_token").cloned().unwrap_or(Value::Null),
            ));
        }
        Ok(profile)
    }
}

#[async_trait]
impl Scenario for LoginScenario {
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
