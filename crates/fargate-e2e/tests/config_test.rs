// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for loading configuration from the environment.

use std::env;
use std::sync::Mutex;
use std::time::Duration;

use fargate_e2e::{E2eConfig, E2eError};

// Mutex to serialize tests that modify environment variables
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ALL_VARS: [&str; 17] = [
    "FARGATE_E2E_POLL_INTERVAL_MS",
    "FARGATE_E2E_SCENARIO_TIMEOUT_MS",
    "FARGATE_E2E_SERVICE_READY_TIMEOUT_MS",
    "FARGATE_E2E_NOT_FOUND_GRACE",
    "FARGATE_E2E_DRAIN_CHECKS",
    "FARGATE_E2E_SETTLE_DELAY_MS",
    "FARGATE_E2E_EVENT_ATTEMPTS",
    "FARGATE_E2E_EVENT_INTERVAL_MS",
    "FARGATE_E2E_CLOCK_SKEW_MS",
    "FARGATE_E2E_SCHEDULE_DELAY_MS",
    "FARGATE_E2E_SCHEDULED_ATTEMPTS",
    "FARGATE_E2E_SCHEDULED_INTERVAL_MS",
    "FARGATE_E2E_LOG_INTERVAL_MS",
    "FARGATE_E2E_LOG_TIMEOUT_MS",
    "FARGATE_E2E_HTTP_TIMEOUT_MS",
    "FARGATE_E2E_MAX_REDIRECTS",
    "FARGATE_E2E_ACCEPT_INVALID_CERTS",
];

/// Helper to set env vars for a test and restore them after
struct EnvGuard {
    vars: Vec<(String, Option<String>)>,
}

impl EnvGuard {
    /// Start from a clean slate: every known variable unset.
    fn clean() -> Self {
        let mut guard = Self { vars: Vec::new() };
        for key in ALL_VARS {
            guard.remove(key);
        }
        guard
    }

    fn set(&mut self, key: &str, value: &str) {
        let old = env::var(key).ok();
        self.vars.push((key.to_string(), old));
        // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
        unsafe { env::set_var(key, value) };
    }

    fn remove(&mut self, key: &str) {
        let old = env::var(key).ok();
        self.vars.push((key.to_string(), old));
        // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
        unsafe { env::remove_var(key) };
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.vars.drain(..).rev() {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe {
                match value {
                    Some(v) => env::set_var(&key, v),
                    None => env::remove_var(&key),
                }
            }
        }
    }
}

#[test]
fn test_from_env_without_variables_uses_defaults() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let _guard = EnvGuard::clean();

    let config = E2eConfig::from_env().unwrap();
    assert_eq!(config, E2eConfig::default());
}

#[test]
fn test_from_env_reads_durations_in_millis() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let mut guard = EnvGuard::clean();

    guard.set("FARGATE_E2E_POLL_INTERVAL_MS", "250");
    guard.set("FARGATE_E2E_SCENARIO_TIMEOUT_MS", "600000");
    guard.set("FARGATE_E2E_EVENT_ATTEMPTS", "4");
    guard.set("FARGATE_E2E_LOG_TIMEOUT_MS", "30000");
    guard.set("FARGATE_E2E_MAX_REDIRECTS", "3");

    let config = E2eConfig::from_env().unwrap();

    assert_eq!(config.poll.interval, Duration::from_millis(250));
    assert_eq!(config.poll.scenario_deadline, Duration::from_secs(600));
    assert_eq!(config.correlation.event_attempts, 4);
    assert_eq!(config.logs.timeout, Duration::from_secs(30));
    assert_eq!(config.http.max_redirects, 3);
    // Untouched values keep their defaults.
    assert_eq!(
        config.correlation.scheduled_attempts,
        E2eConfig::default().correlation.scheduled_attempts
    );
}

#[test]
fn test_accept_invalid_certs_flag() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let mut guard = EnvGuard::clean();

    guard.set("FARGATE_E2E_ACCEPT_INVALID_CERTS", "false");
    assert!(!E2eConfig::from_env().unwrap().http.accept_invalid_certs);

    guard.set("FARGATE_E2E_ACCEPT_INVALID_CERTS", "1");
    assert!(E2eConfig::from_env().unwrap().http.accept_invalid_certs);

    guard.set("FARGATE_E2E_ACCEPT_INVALID_CERTS", "TRUE");
    assert!(E2eConfig::from_env().unwrap().http.accept_invalid_certs);
}

#[test]
fn test_unparsable_value_names_the_variable() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let mut guard = EnvGuard::clean();

    guard.set("FARGATE_E2E_NOT_FOUND_GRACE", "three");

    match E2eConfig::from_env() {
        Err(E2eError::Config(message)) => {
            assert!(message.contains("FARGATE_E2E_NOT_FOUND_GRACE"), "{}", message);
        }
        other => panic!("expected a configuration error, got {:?}", other),
    }
}

#[test]
fn test_zero_attempts_rejected() {
    let _lock = ENV_MUTEX.lock().unwrap();
    let mut guard = EnvGuard::clean();

    guard.set("FARGATE_E2E_SCHEDULED_ATTEMPTS", "0");
    assert!(matches!(E2eConfig::from_env(), Err(E2eError::Config(_))));

    guard.set("FARGATE_E2E_SCHEDULED_ATTEMPTS", "5");
    guard.set("FARGATE_E2E_LOG_INTERVAL_MS", "0");
    assert!(matches!(E2eConfig::from_env(), Err(E2eError::Config(_))));
}
