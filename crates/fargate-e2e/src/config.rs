// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timing and HTTP configuration for scenarios.
//!
//! All numbers here are defaults; every one can be overridden per run
//! through `FARGATE_E2E_*` environment variables or the `with_*` builders.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{E2eError, Result};

/// Polling behaviour of the waiter and readiness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Delay between two `describe` calls.
    pub interval: Duration,
    /// Overall budget for one scenario.
    pub scenario_deadline: Duration,
    /// Budget for a long-running service to become ready.
    pub service_ready_timeout: Duration,
    /// Consecutive `NotFound` answers tolerated before giving up on a handle.
    pub not_found_grace: u32,
    /// Depth checks made while waiting for a queue to drain.
    pub drain_checks: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            scenario_deadline: Duration::from_secs(5 * 60),
            service_ready_timeout: Duration::from_secs(60),
            not_found_grace: 3,
            drain_checks: 6,
        }
    }
}

/// How hard the correlator looks for a handle-less execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationSettings {
    /// Pause between emitting an event and the first listing.
    pub settle_delay: Duration,
    pub event_attempts: u32,
    pub event_interval: Duration,
    /// Allowed clock difference between this host and the executor.
    pub skew: Duration,
    /// How far in the future a one-shot schedule fires.
    pub schedule_delay: Duration,
    pub scheduled_attempts: u32,
    pub scheduled_interval: Duration,
    /// Tolerance before the fire time.
    pub fire_buffer: Duration,
    /// Tolerance after the fire time.
    pub scheduled_window: Duration,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            event_attempts: 10,
            event_interval: Duration::from_secs(3),
            skew: Duration::from_secs(30),
            schedule_delay: Duration::from_secs(60),
            scheduled_attempts: 20,
            scheduled_interval: Duration::from_secs(5),
            fire_buffer: Duration::from_secs(30),
            scheduled_window: Duration::from_secs(2 * 60),
        }
    }
}

impl CorrelationSettings {
    /// Latest point after submission an event-triggered execution may start.
    pub fn event_max_wait(&self) -> Duration {
        self.settle_delay + self.event_interval * self.event_attempts.max(1)
    }
}

/// Log search behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSearchSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// Records older than `since - lookback` are ignored.
    pub lookback: Duration,
    /// Segments inspected per listing, most recent first.
    pub segment_limit: usize,
    /// A search listing is widened while every segment it returned is still
    /// inside the search window, up to this many segments.
    pub segment_cap: usize,
    /// Records kept in a diagnostic tail on failure.
    pub failure_tail: usize,
    /// Records kept in a diagnostic tail on success.
    pub success_tail: usize,
}

impl Default for LogSearchSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(120),
            lookback: Duration::from_secs(60),
            segment_limit: 50,
            segment_cap: 800,
            failure_tail: 50,
            success_tail: 20,
        }
    }
}

impl LogSearchSettings {
    /// Attempts that fit into the timeout at the configured interval.
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        ((self.timeout.as_millis() / interval) as u32).max(1)
    }
}

/// HTTP client behaviour for the web scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub request_timeout: Duration,
    pub max_redirects: usize,
    /// Load balancers in these setups use self-signed certificates.
    pub accept_invalid_certs: bool,
    pub health_interval: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_redirects: 10,
            accept_invalid_certs: true,
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Configuration for a scenario run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct E2eConfig {
    pub poll: PollSettings,
    pub correlation: CorrelationSettings,
    pub logs: LogSearchSettings,
    pub http: HttpSettings,
}

impl E2eConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from environment variables.
    ///
    /// Environment variables (durations in milliseconds):
    /// - `FARGATE_E2E_POLL_INTERVAL_MS` (default: 5000)
    /// - `FARGATE_E2E_SCENARIO_TIMEOUT_MS` (default: 300000)
    /// - `FARGATE_E2E_SERVICE_READY_TIMEOUT_MS` (default: 60000)
    /// - `FARGATE_E2E_NOT_FOUND_GRACE` (default: 3)
    /// - `FARGATE_E2E_DRAIN_CHECKS` (default: 6)
    /// - `FARGATE_E2E_SETTLE_DELAY_MS` (default: 2000)
    /// - `FARGATE_E2E_EVENT_ATTEMPTS` (default: 10)
    /// - `FARGATE_E2E_EVENT_INTERVAL_MS` (default: 3000)
    /// - `FARGATE_E2E_CLOCK_SKEW_MS` (default: 30000)
    /// - `FARGATE_E2E_SCHEDULE_DELAY_MS` (default: 60000)
    /// - `FARGATE_E2E_SCHEDULED_ATTEMPTS` (default: 20)
    /// - `FARGATE_E2E_SCHEDULED_INTERVAL_MS` (default: 5000)
    /// - `FARGATE_E2E_LOG_INTERVAL_MS` (default: 5000)
    /// - `FARGATE_E2E_LOG_TIMEOUT_MS` (default: 120000)
    /// - `FARGATE_E2E_HTTP_TIMEOUT_MS` (default: 30000)
    /// - `FARGATE_E2E_MAX_REDIRECTS` (default: 10)
    /// - `FARGATE_E2E_ACCEPT_INVALID_CERTS` (default: "true")
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let poll = PollSettings {
            interval: env_millis("FARGATE_E2E_POLL_INTERVAL_MS", defaults.poll.interval)?,
            scenario_deadline: env_millis(
                "FARGATE_E2E_SCENARIO_TIMEOUT_MS",
                defaults.poll.scenario_deadline,
            )?,
            service_ready_timeout: env_millis(
                "FARGATE_E2E_SERVICE_READY_TIMEOUT_MS",
                defaults.poll.service_ready_timeout,
            )?,
            not_found_grace: env_parse(
                "FARGATE_E2E_NOT_FOUND_GRACE",
                defaults.poll.not_found_grace,
            )?,
            drain_checks: env_parse("FARGATE_E2E_DRAIN_CHECKS", defaults.poll.drain_checks)?,
        };

        let correlation = CorrelationSettings {
            settle_delay: env_millis(
                "FARGATE_E2E_SETTLE_DELAY_MS",
                defaults.correlation.settle_delay,
            )?,
            event_attempts: env_parse(
                "FARGATE_E2E_EVENT_ATTEMPTS",
                defaults.correlation.event_attempts,
            )?,
            event_interval: env_millis(
                "FARGATE_E2E_EVENT_INTERVAL_MS",
                defaults.correlation.event_interval,
            )?,
            skew: env_millis("FARGATE_E2E_CLOCK_SKEW_MS", defaults.correlation.skew)?,
            schedule_delay: env_millis(
                "FARGATE_E2E_SCHEDULE_DELAY_MS",
                defaults.correlation.schedule_delay,
            )?,
            scheduled_attempts: env_parse(
                "FARGATE_E2E_SCHEDULED_ATTEMPTS",
                defaults.correlation.scheduled_attempts,
            )?,
            scheduled_interval: env_millis(
                "FARGATE_E2E_SCHEDULED_INTERVAL_MS",
                defaults.correlation.scheduled_interval,
            )?,
            ..defaults.correlation
        };

        let logs = LogSearchSettings {
            interval: env_millis("FARGATE_E2E_LOG_INTERVAL_MS", defaults.logs.interval)?,
            timeout: env_millis("FARGATE_E2E_LOG_TIMEOUT_MS", defaults.logs.timeout)?,
            segment_cap: env_parse("FARGATE_E2E_LOG_SEGMENT_CAP", defaults.logs.segment_cap)?,
            ..defaults.logs
        };

        let http = HttpSettings {
            request_timeout: env_millis(
                "FARGATE_E2E_HTTP_TIMEOUT_MS",
                defaults.http.request_timeout,
            )?,
            max_redirects: env_parse("FARGATE_E2E_MAX_REDIRECTS", defaults.http.max_redirects)?,
            accept_invalid_certs: std::env::var("FARGATE_E2E_ACCEPT_INVALID_CERTS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(defaults.http.accept_invalid_certs),
            ..defaults.http
        };

        let config = Self {
            poll,
            correlation,
            logs,
            http,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a wait loop spin or never run.
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval.is_zero() {
            return Err(E2eError::Config("poll interval must be positive".into()));
        }
        if self.logs.interval.is_zero() {
            return Err(E2eError::Config("log search interval must be positive".into()));
        }
        if self.correlation.event_attempts == 0 || self.correlation.scheduled_attempts == 0 {
            return Err(E2eError::Config(
                "correlation attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        self
    }

    /// Set the overall scenario budget.
    pub fn with_scenario_deadline(mut self, deadline: Duration) -> Self {
        self.poll.scenario_deadline = deadline;
        self
    }

    pub fn with_service_ready_timeout(mut self, timeout: Duration) -> Self {
        self.poll.service_ready_timeout = timeout;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.correlation.settle_delay = delay;
        self
    }

    /// Set attempts and spacing for event-triggered correlation.
    pub fn with_event_correlation(mut self, attempts: u32, interval: Duration) -> Self {
        self.correlation.event_attempts = attempts;
        self.correlation.event_interval = interval;
        self
    }

    /// Set attempts and spacing for scheduled correlation.
    pub fn with_scheduled_correlation(mut self, attempts: u32, interval: Duration) -> Self {
        self.correlation.scheduled_attempts = attempts;
        self.correlation.scheduled_interval = interval;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.correlation.skew = skew;
        self
    }

    pub fn with_schedule_delay(mut self, delay: Duration) -> Self {
        self.correlation.schedule_delay = delay;
        self
    }

    /// Set log search spacing and budget.
    pub fn with_log_search(mut self, interval: Duration, timeout: Duration) -> Self {
        self.logs.interval = interval;
        self.logs.timeout = timeout;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http.request_timeout = timeout;
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.http.accept_invalid_certs = accept;
        self
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| E2eError::Config(format!("invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| E2eError::Config(format!("invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}
