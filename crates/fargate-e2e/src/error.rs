// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for fargate-e2e.

use std::time::Duration;

use thiserror::Error;

use crate::types::{CorrelationWindow, Execution, ExecutionState, ExecutionSummary};

/// Result type using E2eError.
pub type Result<T> = std::result::Result<T, E2eError>;

/// Errors raised while submitting, correlating, waiting for or verifying work.
#[derive(Debug, Error)]
pub enum E2eError {
    /// Network or throttling problem; retried by the lowest layer.
    #[error("transient error: {0}")]
    Transient(String),

    /// Handle, log group or segment does not exist (yet).
    #[error("not found: {0}")]
    NotFound(String),

    /// No execution matched the correlation window.
    #[error(
        "no execution of {target} started within {window} after {attempts} attempts ({} candidates seen)",
        .candidates.len()
    )]
    CorrelationTimeout {
        target: String,
        window: CorrelationWindow,
        attempts: u32,
        candidates: Vec<ExecutionSummary>,
    },

    /// A wait ran out of its time budget.
    #[error("deadline of {}s exceeded waiting for {handle}", .budget.as_secs())]
    DeadlineExceeded {
        handle: String,
        budget: Duration,
        last: Option<Box<Execution>>,
    },

    /// The work itself reported a non-success terminal state.
    #[error("execution {handle} ended {state}: {reason}")]
    TerminalFailure {
        handle: String,
        state: ExecutionState,
        reason: String,
    },

    /// Output or response did not match what was expected.
    #[error("assertion failed: {what}: expected {expected}, got {actual}")]
    AssertionFailure {
        what: String,
        expected: String,
        actual: String,
    },

    /// Configuration error (missing or invalid values).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// HTTP request could not be completed.
    #[error("http error: {0}")]
    Http(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The surrounding scenario was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Backend rejected a request for a non-retryable reason.
    #[error("backend error: {0}")]
    Backend(String),
}

impl E2eError {
    /// Whether the failed call can simply be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, E2eError::Transient(_))
    }

    pub fn assertion(
        what: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        E2eError::AssertionFailure {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Last execution observed before a deadline expired.
    pub fn last_execution(&self) -> Option<&Execution> {
        match self {
            E2eError::DeadlineExceeded { last, .. } => last.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for E2eError {
    fn from(err: serde_json::Error) -> Self {
        E2eError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for E2eError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            E2eError::Transient(err.to_string())
        } else {
            E2eError::Http(err.to_string())
        }
    }
}

impl From<url::ParseError> for E2eError {
    fn from(err: url::ParseError) -> Self {
        E2eError::InvalidInput(format!("invalid url: {}", err))
    }
}
