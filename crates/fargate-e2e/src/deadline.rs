// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deadline and cancellation signal threaded through every blocking call.
//!
//! A scenario creates one [`Deadline`]; nested waits derive children from it,
//! so an expired or cancelled scenario stops every inner polling loop too.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{E2eError, Result};

#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
    token: CancellationToken,
}

impl Deadline {
    /// Expire `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::with_token(budget, CancellationToken::new())
    }

    /// Expire `budget` from now, or earlier if `token` is cancelled.
    pub fn with_token(budget: Duration, token: CancellationToken) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
            token,
        }
    }

    /// A nested deadline: never later than this one, cancelled with it.
    pub fn child(&self, budget: Duration) -> Self {
        let at = (Instant::now() + budget).min(self.at);
        Self {
            at,
            budget: budget.min(self.remaining()),
            token: self.token.child_token(),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail with `Cancelled` if the token fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(E2eError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `interval`, waking early at the deadline or on cancellation.
    pub async fn sleep(&self, interval: Duration) -> Result<()> {
        let wake = (Instant::now() + interval).min(self.at);
        tokio::select! {
            _ = self.token.cancelled() => Err(E2eError::Cancelled),
            _ = sleep_until(wake) => Ok(()),
        }
    }

    /// Drive `fut` until it completes, the deadline passes (`Ok(None)`) or the
    /// token is cancelled (`Err(Cancelled)`).
    pub async fn run<F>(&self, fut: F) -> Result<Option<F::Output>>
    where
        F: Future,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(E2eError::Cancelled),
            _ = sleep_until(self.at) => Ok(None),
            out = fut => Ok(Some(out)),
        }
    }

    /// Like [`run`](Self::run) for a fallible call; reaching the deadline
    /// yields `DeadlineExceeded` naming `what`.
    pub async fn bound<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.run(fut).await? {
            Some(result) => result,
            None => Err(E2eError::DeadlineExceeded {
                handle: what.to_string(),
                budget: self.budget,
                last: None,
            }),
        }
    }

    /// Repeat a read-only call while it fails transiently.
    ///
    /// Non-retryable errors propagate unchanged; an exhausted deadline yields
    /// `DeadlineExceeded` naming `what`.
    pub async fn retry<T, F, Fut>(&self, interval: Duration, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.run(op()).await? {
                Some(Ok(value)) => return Ok(value),
                Some(Err(e)) if e.is_retryable() => {
                    warn!(what = %what, attempt, error = %e, "Transient failure, retrying");
                }
                Some(Err(e)) => return Err(e),
                None => {}
            }

            if self.is_expired() {
                debug!(what = %what, attempt, "Deadline reached while retrying");
                return Err(E2eError::DeadlineExceeded {
                    handle: what.to_string(),
                    budget: self.budget,
                    last: None,
                });
            }
            self.sleep(interval).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_child_never_outlives_parent() {
        let parent = Deadline::after(Duration::from_secs(10));
        let child = parent.child(Duration::from_secs(60));
        assert!(child.remaining() <= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_propagates_to_child() {
        let parent = Deadline::after(Duration::from_secs(10));
        let child = parent.child(Duration::from_secs(5));
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(
            child.sleep(Duration::from_secs(1)).await,
            Err(E2eError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_at_deadline() {
        let deadline = Deadline::after(Duration::from_secs(2));
        let out = deadline
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(out.is_none());
        assert!(deadline.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_names_the_call_that_overran() {
        let deadline = Deadline::after(Duration::from_secs(2));
        let result: Result<()> = deadline
            .bound("GET /health", async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        match result {
            Err(E2eError::DeadlineExceeded { handle, .. }) => assert_eq!(handle, "GET /health"),
            other => panic!("expected DeadlineExceeded, got {:?}", other),
        }

        let cancelled = Deadline::after(Duration::from_secs(60));
        cancelled.cancel();
        let result: Result<u32> = cancelled
            .bound("GET /health", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(E2eError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let value = deadline
            .retry(Duration::from_secs(1), "describe", move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(E2eError::Transient("throttled".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_propagates_fatal_errors() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let result: Result<()> = deadline
            .retry(Duration::from_secs(1), "describe", || async {
                Err(E2eError::NotFound("exec-1".into()))
            })
            .await;
        assert!(matches!(result, Err(E2eError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_at_deadline() {
        let deadline = Deadline::after(Duration::from_secs(5));
        let result: Result<()> = deadline
            .retry(Duration::from_secs(1), "list", || async {
                Err(E2eError::Transient("connection reset".into()))
            })
            .await;
        assert!(matches!(result, Err(E2eError::DeadlineExceeded { .. })));
    }
}
