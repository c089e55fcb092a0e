// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fargate-e2e - Asynchronous Job Verification
//!
//! Submits work to black-box asynchronous executors, waits for it to finish,
//! finds executions that were started indirectly, and reads their output back
//! from an eventually consistent log store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        ScenarioDriver                            │
//! │   JobScenario · QueueScenario · JwtScenario · LoginScenario ·    │
//! │                   ServiceConnectScenario                         │
//! └──────────────────────────────────────────────────────────────────┘
//!        │                 │                 │               │
//!        ▼                 ▼                 ▼               ▼
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐  ┌───────────┐
//! │ Correlator  │   │   Waiter    │   │  LogReader  │  │   http    │
//! └─────────────┘   └─────────────┘   └─────────────┘  └───────────┘
//!        │                 │                 │
//!        ▼                 ▼                 ▼
//! ┌──────────────────────────────┐   ┌─────────────┐
//! │ AsyncExecutor                │   │  LogStore   │
//! │ ScheduleRegistrar            │   └─────────────┘
//! │ MessageQueue · ServiceProbe  │
//! └──────────────────────────────┘
//! ```
//!
//! Backends implement the traits at the bottom; [`mock`] has in-memory
//! versions of each. Every wait runs under a [`Deadline`], which also carries
//! the cancellation signal.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fargate_e2e::{E2eConfig, JobScenario, ScenarioDriver, Submission};
//!
//! let scenario = JobScenario::new("oneoff", executor, Submission::direct("task-def", input), config.clone());
//! let verdict = ScenarioDriver::new(config).run(&scenario).await;
//! println!("{}", verdict);
//! std::process::exit(verdict.exit_code());
//! ```

pub mod config;
pub mod correlator;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod http;
pub mod logstore;
pub mod mock;
pub mod poller;
pub mod scenario;
pub mod service;
pub mod types;

pub use config::{CorrelationSettings, E2eConfig, HttpSettings, LogSearchSettings, PollSettings};
pub use correlator::{CorrelationQuery, Correlator, ScheduledTrigger};
pub use deadline::Deadline;
pub use error::{E2eError, Result};
pub use executor::{
    AsyncExecutor, MessageQueue, QueueDepth, ScheduleRegistrar, SharedExecutor, SharedQueue,
    SharedRegistrar, TriggerRule, cron_at,
};
pub use logstore::{LogReader, LogStore, OutputMatcher, reconstruct_json};
pub use poller::{Waiter, ensure_succeeded};
pub use scenario::{
    Expectation, JobMessage, JobScenario, OutputSource, Phase, QueueScenario, Scenario,
    ScenarioDriver, StreamSelector, Verdict,
};
pub use service::{ServiceProbe, ServiceStatus, wait_for_service};
pub use types::{
    ArraySummary, ChildExecution, CorrelationWindow, Execution, ExecutionState,
    ExecutionSummary, LogRecord, LogSegment, SegmentInfo, Submission, SubmissionMode,
};
