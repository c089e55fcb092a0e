// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end scenarios and their verdicts.
//!
//! Every job scenario walks the same phases:
//!
//! ```text
//! Building -> Submitted -> [Correlating -> Correlated] -> Polling -> Terminal(state) -> Verified
//! ```
//!
//! `Correlating` only appears for event and scheduled submissions. The HTTP
//! scenarios record named steps instead. Whatever happens, a scenario ends in
//! a [`Verdict`]; errors never escape the driver.

mod jobs;
mod queue;

pub use jobs::{Expectation, JobScenario, OutputSource, StreamSelector};
pub use queue::{JobMessage, JobPayload, QueueScenario};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::E2eConfig;
use crate::deadline::Deadline;
use crate::error::E2eError;
use crate::types::{Execution, ExecutionState};

/// Time allowed for diagnostics after the scenario deadline has passed.
pub(crate) const DIAGNOSTICS_BUDGET: Duration = Duration::from_secs(30);

/// Progress marker of a job scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Building,
    Submitted,
    Correlating,
    Correlated,
    Polling,
    Terminal(ExecutionState),
    Verified,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Building => f.write_str("Building"),
            Phase::Submitted => f.write_str("Submitted"),
            Phase::Correlating => f.write_str("Correlating"),
            Phase::Correlated => f.write_str("Correlated"),
            Phase::Polling => f.write_str("Polling"),
            Phase::Terminal(state) => write!(f, "Terminal({})", state),
            Phase::Verified => f.write_str("Verified"),
        }
    }
}

/// One named check of a step-based scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// Context needed to act on a failure without rerunning.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub last_state: Option<ExecutionState>,
    pub failure_reason: Option<String>,
    /// Backend state dump (queues, compute environments, child jobs).
    pub backend: Vec<String>,
    pub notes: Vec<String>,
    pub log_tail: Vec<String>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.last_state.is_none()
            && self.failure_reason.is_none()
            && self.backend.is_empty()
            && self.notes.is_empty()
            && self.log_tail.is_empty()
    }
}

/// Result of one scenario.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub scenario: String,
    pub success: bool,
    pub message: String,
    pub phases: Vec<Phase>,
    pub steps: Vec<StepOutcome>,
    pub execution: Option<Execution>,
    pub output: Option<Value>,
    pub diagnostics: Diagnostics,
}

impl Verdict {
    /// Last phase reached.
    pub fn phase(&self) -> Option<Phase> {
        self.phases.last().copied()
    }

    /// Process exit code: 0 on success, the workload's own non-zero exit code
    /// when it reported one, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.success {
            return 0;
        }
        self.execution
            .as_ref()
            .and_then(|e| e.exit_code)
            .filter(|code| *code != 0)
            .unwrap_or(1)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.scenario)?;
        if !self.phases.is_empty() {
            let phases: Vec<String> = self.phases.iter().map(Phase::to_string).collect();
            writeln!(f, "Phases: {}", phases.join(" -> "))?;
        }
        for step in &self.steps {
            let mark = if step.passed { "PASS" } else { "FAIL" };
            writeln!(f, "  [{}] {}: {}", mark, step.name, step.detail)?;
        }
        if let Some(execution) = &self.execution {
            writeln!(f, "Execution: {} ({})", execution.handle, execution.state)?;
            if let Some(array) = &execution.array {
                writeln!(f, "Children: {}", array)?;
            }
        }
        if let Some(output) = &self.output {
            let pretty = serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
            writeln!(f, "Output:\n{}", pretty)?;
        }

        if !self.success || !self.diagnostics.is_empty() {
            let d = &self.diagnostics;
            writeln!(f, "--- Diagnostics ---")?;
            if let Some(state) = d.last_state {
                writeln!(f, "Last state: {}", state)?;
            }
            if let Some(reason) = &d.failure_reason {
                writeln!(f, "Failure reason: {}", reason)?;
            }
            if !d.backend.is_empty() {
                writeln!(f, "Backend:")?;
                for line in &d.backend {
                    writeln!(f, "  {}", line)?;
                }
            }
            for note in &d.notes {
                writeln!(f, "Note: {}", note)?;
            }
            if !d.log_tail.is_empty() {
                writeln!(f, "Last {} log records:", d.log_tail.len())?;
                for line in &d.log_tail {
                    writeln!(f, "  {}", line)?;
                }
            }
        }

        let result = if self.success { "PASSED" } else { "FAILED" };
        write!(f, "Result: {} - {}", result, self.message)
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Accumulates phases, steps and diagnostics while a scenario runs.
#[derive(Debug)]
pub struct Tracker {
    scenario: String,
    phases: Vec<Phase>,
    steps: Vec<StepOutcome>,
    execution: Option<Execution>,
    output: Option<Value>,
    diagnostics: Diagnostics,
}

impl Tracker {
    /// Start in `Building`.
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            phases: vec![Phase::Building],
            steps: Vec::new(),
            execution: None,
            output: None,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Start without phases, for step-based scenarios.
    pub fn steps_only(scenario: impl Into<String>) -> Self {
        Self {
            phases: Vec::new(),
            ..Self::new(scenario)
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        info!(scenario = %self.scenario, phase = %phase, "Scenario phase");
        self.phases.push(phase);
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn step(&mut self, name: impl Into<String>, passed: bool, detail: impl Into<String>) {
        let outcome = StepOutcome {
            name: name.into(),
            passed,
            detail: detail.into(),
        };
        if passed {
            info!(scenario = %self.scenario, step = %outcome.name, "Step passed");
        } else {
            error!(scenario = %self.scenario, step = %outcome.name, detail = %outcome.detail, "Step failed");
        }
        self.steps.push(outcome);
    }

    /// Record `result` as step `name` and pass it through.
    pub fn record<T>(
        &mut self,
        name: &str,
        result: Result<T, E2eError>,
        detail: impl FnOnce(&T) -> String,
    ) -> Result<T, E2eError> {
        match &result {
            Ok(value) => self.step(name, true, detail(value)),
            Err(err) => self.step(name, false, err.to_string()),
        }
        result
    }

    pub fn set_execution(&mut self, execution: Execution) {
        self.diagnostics.last_state = Some(execution.state);
        if execution.failure_reason.is_some() {
            self.diagnostics.failure_reason = execution.failure_reason.clone();
        }
        self.execution = Some(execution);
    }

    pub fn set_output(&mut self, output: Value) {
        self.output = Some(output);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.diagnostics.notes.push(note.into());
    }

    pub fn backend_diagnostics(&mut self, lines: Vec<String>) {
        self.diagnostics.backend.extend(lines);
    }

    pub fn log_tail(&mut self, lines: Vec<String>) {
        self.diagnostics.log_tail = lines;
    }

    pub fn pass(self, message: impl Into<String>) -> Verdict {
        self.finish(true, message.into())
    }

    /// Fail with the context carried by `err`.
    pub fn fail(mut self, err: &E2eError) -> Verdict {
        match err {
            E2eError::DeadlineExceeded { last, .. } => {
                if let Some(last) = last {
                    self.set_execution((**last).clone());
                }
            }
            E2eError::TerminalFailure { state, reason, .. } => {
                self.diagnostics.last_state = Some(*state);
                self.diagnostics.failure_reason = Some(reason.clone());
            }
            E2eError::CorrelationTimeout {
                window,
                candidates,
                attempts,
                ..
            } => {
                self.note(format!("correlation window {} ({} attempts)", window, attempts));
                if candidates.is_empty() {
                    self.note("no candidate executions were listed");
                }
                for candidate in candidates {
                    self.note(format!("candidate: {}", candidate));
                }
            }
            E2eError::AssertionFailure {
                what,
                expected,
                actual,
            } => {
                self.note(format!("{}: expected {}", what, expected));
                self.note(format!("{}: actual   {}", what, actual));
            }
            _ => {}
        }
        self.finish(false, err.to_string())
    }

    fn finish(self, success: bool, message: String) -> Verdict {
        Verdict {
            scenario: self.scenario,
            success,
            message,
            phases: self.phases,
            steps: self.steps,
            execution: self.execution,
            output: self.output,
            diagnostics: self.diagnostics,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// A runnable end-to-end check.
#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &str;

    /// Run to a verdict within `deadline`.
    async fn run(&self, deadline: &Deadline) -> Verdict;
}

/// Runs scenarios under one overall deadline and cancellation signal.
pub struct ScenarioDriver {
    config: E2eConfig,
    token: CancellationToken,
}

impl ScenarioDriver {
    pub fn new(config: E2eConfig) -> Self {
        Self {
            config,
            token: CancellationToken::new(),
        }
    }

    /// Cancel every running scenario when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn config(&self) -> &E2eConfig {
        &self.config
    }

    pub async fn run(&self, scenario: &dyn Scenario) -> Verdict {
        let deadline = Deadline::with_token(
            self.config.poll.scenario_deadline,
            self.token.child_token(),
        );
        info!(
            scenario = %scenario.name(),
            budget_secs = deadline.budget().as_secs(),
            "Starting scenario"
        );

        let verdict = scenario.run(&deadline).await;
        // Stop anything the scenario left polling.
        deadline.cancel();

        if verdict.success {
            info!(scenario = %verdict.scenario, message = %verdict.message, "Scenario passed");
        } else {
            error!(scenario = %verdict.scenario, message = %verdict.message, "Scenario failed");
        }
        verdict
    }
}
