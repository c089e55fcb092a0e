// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives an execution handle to a terminal state under a deadline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::deadline::Deadline;
use crate::error::{E2eError, Result};
use crate::executor::AsyncExecutor;
use crate::types::{Execution, Submission};

/// Callback invoked with every observed execution.
pub type ProgressFn = Arc<dyn Fn(&Execution) + Send + Sync>;

/// Polls `describe` until an execution is terminal.
pub struct Waiter {
    executor: Arc<dyn AsyncExecutor>,
    not_found_grace: u32,
    progress: Option<ProgressFn>,
}

impl Waiter {
    pub fn new(executor: Arc<dyn AsyncExecutor>) -> Self {
        Self {
            executor,
            not_found_grace: 3,
            progress: None,
        }
    }

    /// Consecutive `NotFound` answers treated as "not visible yet".
    pub fn with_not_found_grace(mut self, grace: u32) -> Self {
        self.not_found_grace = grace;
        self
    }

    /// Observe every poll iteration (array counts included).
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Poll `handle` every `poll_interval` until it is terminal.
    ///
    /// Returns the terminal execution whatever its outcome; failed executions
    /// are not errors here. Transient describe errors are retried. When the
    /// deadline passes first, `DeadlineExceeded` carries the last execution
    /// observed.
    pub async fn wait_for_terminal(
        &self,
        handle: &str,
        poll_interval: Duration,
        deadline: &Deadline,
    ) -> Result<Execution> {
        let mut last: Option<Execution> = None;
        let mut not_found = 0u32;
        let mut iteration = 0u32;

        loop {
            deadline.check()?;
            if deadline.is_expired() {
                warn!(
                    handle = %handle,
                    last_state = ?last.as_ref().map(|e| e.state),
                    "Deadline exceeded while waiting for terminal state"
                );
                return Err(E2eError::DeadlineExceeded {
                    handle: handle.to_string(),
                    budget: deadline.budget(),
                    last: last.map(Box::new),
                });
            }

            iteration += 1;
            match deadline.run(self.executor.describe(handle)).await? {
                Some(Ok(mut execution)) => {
                    not_found = 0;
                    if let Some(previous) = &last
                        && execution.state.rank() < previous.state.rank()
                    {
                        warn!(
                            handle = %handle,
                            previous = %previous.state,
                            observed = %execution.state,
                            "Backend reported an earlier state, keeping the later one"
                        );
                        execution.state = previous.state;
                    }

                    match &execution.array {
                        Some(summary) => info!(
                            handle = %handle,
                            iteration,
                            state = %execution.state,
                            counts = %summary,
                            "Array execution progress"
                        ),
                        None => info!(
                            handle = %handle,
                            iteration,
                            state = %execution.state,
                            raw_status = execution.raw_status.as_deref().unwrap_or(""),
                            "Execution status"
                        ),
                    }
                    if let Some(progress) = &self.progress {
                        progress(&execution);
                    }

                    if execution.is_terminal() {
                        execution.state = execution.effective_state();
                        return Ok(execution);
                    }
                    last = Some(execution);
                }
                Some(Err(E2eError::NotFound(what))) if not_found < self.not_found_grace => {
                    not_found += 1;
                    debug!(handle = %handle, not_found, what = %what, "Execution not visible yet");
                }
                Some(Err(e)) if e.is_retryable() => {
                    warn!(handle = %handle, error = %e, "Transient describe failure, retrying");
                }
                Some(Err(e)) => return Err(e),
                // Deadline hit mid-call; reported at the top of the loop.
                None => continue,
            }

            deadline.sleep(poll_interval).await?;
        }
    }

    /// Like [`wait_for_terminal`](Self::wait_for_terminal), but a non-success
    /// terminal state becomes `TerminalFailure` with the backend's reason.
    pub async fn wait_for_success(
        &self,
        handle: &str,
        poll_interval: Duration,
        deadline: &Deadline,
    ) -> Result<Execution> {
        let execution = self
            .wait_for_terminal(handle, poll_interval, deadline)
            .await?;
        ensure_succeeded(&execution)?;
        Ok(execution)
    }

    /// Submit a direct-mode submission and wait for it to finish.
    pub async fn run_to_completion(
        &self,
        submission: &Submission,
        poll_interval: Duration,
        deadline: &Deadline,
    ) -> Result<Execution> {
        submission.validate()?;
        let handle = self
            .executor
            .submit(submission)
            .await?
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                E2eError::InvalidInput(format!(
                    "{} submission of {} returned no handle",
                    submission.mode, submission.target
                ))
            })?;

        self.wait_for_terminal(&handle, poll_interval, deadline)
            .await
    }
}

/// `TerminalFailure` unless `execution` succeeded.
pub fn ensure_succeeded(execution: &Execution) -> Result<()> {
    if execution.state.is_success() {
        return Ok(());
    }
    Err(E2eError::TerminalFailure {
        handle: execution.handle.clone(),
        state: execution.state,
        reason: execution
            .failure_reason
            .clone()
            .unwrap_or_else(|| "no reason reported".to_string()),
    })
}
