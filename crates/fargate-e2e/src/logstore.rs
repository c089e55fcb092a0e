// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reading execution output from a segmented, eventually consistent log store.
//!
//! Segments that do not exist yet are not errors: the workload simply has not
//! written anything. Searches keep polling within their own attempt budget and
//! report `found == false` when it runs out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::LogSearchSettings;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::types::{LogRecord, LogSegment, SegmentInfo, to_chrono};

/// Text log storage organised in groups of named segments.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Segments of `group`, most recently written first. A missing group
    /// yields an empty list.
    async fn list_segments(
        &self,
        group: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SegmentInfo>>;

    /// Records of one segment in chronological order, optionally only those
    /// at or after `since` and only the first `limit`. A missing segment
    /// yields an empty list.
    async fn read_segment(
        &self,
        group: &str,
        segment: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>>;
}

// ============================================================================
// Matching
// ============================================================================

/// Recognises one execution's output inside a stream of records.
///
/// A record containing `token` starts the match, a later record containing
/// `success_marker` completes it. A record containing `reset_marker` but not
/// the token means another job started, so a started match is dropped.
#[derive(Debug, Clone)]
pub struct OutputMatcher {
    pub token: String,
    pub success_marker: String,
    pub reset_marker: Option<String>,
}

impl OutputMatcher {
    pub fn new(token: impl Into<String>, success_marker: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            success_marker: success_marker.into(),
            reset_marker: None,
        }
    }

    pub fn with_reset_marker(mut self, marker: impl Into<String>) -> Self {
        self.reset_marker = Some(marker.into());
        self
    }

    /// Records from the token to the success marker, if both are present.
    pub fn scan<'a>(&self, records: &'a [LogRecord]) -> Option<&'a [LogRecord]> {
        let mut start: Option<usize> = None;
        for (i, record) in records.iter().enumerate() {
            let message = record.message.as_str();
            if message.contains(self.token.as_str()) {
                if start.is_none() {
                    start = Some(i);
                }
            } else if let Some(reset) = &self.reset_marker
                && message.contains(reset.as_str())
            {
                start = None;
                continue;
            }
            if let Some(begin) = start
                && message.contains(self.success_marker.as_str())
            {
                return Some(&records[begin..=i]);
            }
        }
        None
    }
}

/// Re-join a pretty-printed JSON block written line by line after a banner.
///
/// Uses the last occurrence of `begin_marker`, collects the records up to a
/// closing line made only of dashes and parses the result. Falls back to the
/// last record that is a JSON object by itself.
pub fn reconstruct_json(records: &[LogRecord], begin_marker: &str) -> Option<Value> {
    if let Some(begin) = records
        .iter()
        .rposition(|r| r.message.contains(begin_marker))
    {
        let block: Vec<&str> = records[begin + 1..]
            .iter()
            .map(|r| r.message.trim_end())
            .take_while(|line| !is_closing_banner(line))
            .collect();
        if let Ok(value) = serde_json::from_str::<Value>(&block.join("\n")) {
            return Some(value);
        }
    }

    records.iter().rev().find_map(|r| {
        let trimmed = r.message.trim();
        let json = trimmed.find('{').map(|i| &trimmed[i..])?;
        match serde_json::from_str::<Value>(json) {
            Ok(value @ Value::Object(_)) => Some(value),
            _ => None,
        }
    })
}

fn is_closing_banner(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 3 && trimmed.chars().all(|c| c == '-')
}

// ============================================================================
// Search results
// ============================================================================

/// Outcome of a token search.
#[derive(Debug, Clone, Default)]
pub struct OutputSearch {
    pub found: bool,
    /// Matched records when found, otherwise everything read on the last attempt.
    pub records: Vec<LogRecord>,
    pub attempts: u32,
    pub segment: Option<String>,
}

/// Where a child of an array execution writes.
#[derive(Debug, Clone)]
pub struct ChildLogTarget {
    pub index: u32,
    /// Known segment name; resolved by `token` when absent.
    pub segment: Option<String>,
    /// Text only this child prints.
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChildOutput {
    pub index: u32,
    pub segment: Option<String>,
    pub records: Vec<LogRecord>,
    pub done: bool,
}

/// Outcome of a fan-out search.
#[derive(Debug, Clone, Default)]
pub struct FanoutOutput {
    pub children: Vec<ChildOutput>,
    pub attempts: u32,
}

impl FanoutOutput {
    /// Every child reported the success sentinel.
    pub fn all_done(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(|c| c.done)
    }

    pub fn child(&self, index: u32) -> Option<&ChildOutput> {
        self.children.iter().find(|c| c.index == index)
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Polling search over a [`LogStore`].
#[derive(Clone)]
pub struct LogReader {
    store: Arc<dyn LogStore>,
    settings: LogSearchSettings,
}

impl LogReader {
    pub fn new(store: Arc<dyn LogStore>, settings: LogSearchSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &LogSearchSettings {
        &self.settings
    }

    /// Every record of segments matching `prefix`, one query per call.
    pub async fn fetch_output(
        &self,
        group: &str,
        prefix: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<LogSegment>> {
        let segments = self
            .store
            .list_segments(group, Some(prefix), self.settings.segment_limit)
            .await?;

        let mut out = Vec::with_capacity(segments.len());
        for info in segments {
            let records = self
                .store
                .read_segment(group, &info.name, since, None)
                .await?;
            debug!(group = %group, segment = %info.name, records = records.len(), "Read segment");
            out.push(LogSegment {
                name: info.name,
                records,
            });
        }
        Ok(out)
    }

    /// Poll `fetch_output` until at least one record shows up.
    pub async fn await_output(
        &self,
        group: &str,
        prefix: &str,
        since: Option<DateTime<Utc>>,
        deadline: &Deadline,
    ) -> Result<Vec<LogRecord>> {
        let attempts = self.settings.max_attempts();
        for attempt in 1..=attempts {
            deadline.check()?;
            match deadline.run(self.fetch_output(group, prefix, since)).await? {
                Some(Ok(segments)) => {
                    let records: Vec<LogRecord> =
                        segments.into_iter().flat_map(|s| s.records).collect();
                    if !records.is_empty() {
                        return Ok(records);
                    }
                    info!(group = %group, prefix = %prefix, attempt, "No log output yet");
                }
                Some(Err(e)) if e.is_retryable() => {
                    warn!(group = %group, error = %e, "Transient log read failure");
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
            if attempt < attempts {
                deadline.sleep(self.settings.interval).await?;
            }
        }
        Ok(Vec::new())
    }

    /// Search recent segments of `group` for one execution's output.
    ///
    /// Returns `found == false` after `max_attempts` unsuccessful listings or
    /// when the deadline passes; neither is an error.
    pub async fn find_output(
        &self,
        group: &str,
        matcher: &OutputMatcher,
        since: DateTime<Utc>,
        poll_interval: Duration,
        max_attempts: u32,
        deadline: &Deadline,
    ) -> Result<OutputSearch> {
        let since = since - to_chrono(self.settings.lookback);
        let mut search = OutputSearch::default();

        for attempt in 1..=max_attempts.max(1) {
            deadline.check()?;
            search.attempts = attempt;

            match deadline.run(self.scan_recent(group, matcher, since)).await? {
                Some(Ok((Some((segment, matched)), _))) => {
                    info!(group = %group, segment = %segment, attempt, "Found execution output");
                    search.found = true;
                    search.records = matched;
                    search.segment = Some(segment);
                    return Ok(search);
                }
                Some(Ok((None, read))) => {
                    info!(
                        group = %group,
                        attempt,
                        max_attempts,
                        records = read.len(),
                        "Execution output not found yet"
                    );
                    search.records = read;
                }
                Some(Err(e)) if e.is_retryable() => {
                    warn!(group = %group, attempt, error = %e, "Transient log search failure");
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }

            if attempt < max_attempts {
                deadline.sleep(poll_interval).await?;
                if deadline.is_expired() {
                    break;
                }
            }
        }
        Ok(search)
    }

    /// Most recent segments of `group`, newest first.
    ///
    /// Starts at `segment_limit` and doubles the listing while it comes back
    /// full and its oldest segment was still written after `since`, stopping
    /// at `segment_cap`.
    async fn list_window(&self, group: &str, since: DateTime<Utc>) -> Result<Vec<SegmentInfo>> {
        let cap = self.settings.segment_cap.max(self.settings.segment_limit).max(1);
        let mut limit = self.settings.segment_limit.clamp(1, cap);
        loop {
            let segments = self.store.list_segments(group, None, limit).await?;
            let full = segments.len() >= limit;
            let inside = segments
                .last()
                .and_then(|s| s.last_event_at)
                .is_some_and(|at| at >= since);
            if !(full && inside) {
                return Ok(segments);
            }
            if limit >= cap {
                warn!(group = %group, segments = limit, "Segment listing capped inside the search window");
                return Ok(segments);
            }
            limit = (limit * 2).min(cap);
            debug!(group = %group, limit, "Widening segment listing");
        }
    }

    /// One pass over the most recent segments.
    async fn scan_recent(
        &self,
        group: &str,
        matcher: &OutputMatcher,
        since: DateTime<Utc>,
    ) -> Result<(Option<(String, Vec<LogRecord>)>, Vec<LogRecord>)> {
        let segments = self.list_window(group, since).await?;

        let mut read = Vec::new();
        for info in segments {
            if let Some(last) = info.last_event_at
                && last < since
            {
                continue;
            }
            let records = self
                .store
                .read_segment(group, &info.name, Some(since), None)
                .await?;
            if let Some(matched) = matcher.scan(&records) {
                return Ok((Some((info.name, matched.to_vec())), read));
            }
            read.extend(records);
        }
        Ok((None, read))
    }

    /// Check every child's segment for `success_marker`.
    ///
    /// Children without a known segment are located by their token among the
    /// most recent segments. The search ends once every child is done, after
    /// `max_attempts`, or at the deadline.
    pub async fn find_fanout_output(
        &self,
        group: &str,
        targets: &[ChildLogTarget],
        success_marker: &str,
        since: DateTime<Utc>,
        poll_interval: Duration,
        max_attempts: u32,
        deadline: &Deadline,
    ) -> Result<FanoutOutput> {
        let since = since - to_chrono(self.settings.lookback);
        let mut children: BTreeMap<u32, ChildOutput> = targets
            .iter()
            .map(|t| {
                (
                    t.index,
                    ChildOutput {
                        index: t.index,
                        segment: t.segment.clone(),
                        records: Vec::new(),
                        done: false,
                    },
                )
            })
            .collect();
        let mut attempts = 0;

        for attempt in 1..=max_attempts.max(1) {
            deadline.check()?;
            attempts = attempt;

            let pass = self.fanout_pass(group, targets, success_marker, since, &mut children);
            match deadline.run(pass).await? {
                Some(Ok(())) => {}
                Some(Err(e)) if e.is_retryable() => {
                    warn!(group = %group, attempt, error = %e, "Transient log search failure");
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }

            let done = children.values().filter(|c| c.done).count();
            info!(group = %group, attempt, done, total = children.len(), "Array output progress");
            if done == children.len() {
                break;
            }
            if attempt < max_attempts {
                deadline.sleep(poll_interval).await?;
                if deadline.is_expired() {
                    break;
                }
            }
        }

        Ok(FanoutOutput {
            children: children.into_values().collect(),
            attempts,
        })
    }

    async fn fanout_pass(
        &self,
        group: &str,
        targets: &[ChildLogTarget],
        success_marker: &str,
        since: DateTime<Utc>,
        children: &mut BTreeMap<u32, ChildOutput>,
    ) -> Result<()> {
        let mut recent: Option<Vec<SegmentInfo>> = None;

        for target in targets {
            let Some(child) = children.get_mut(&target.index) else {
                continue;
            };
            if child.done {
                continue;
            }

            if let Some(segment) = child.segment.clone() {
                child.records = self
                    .store
                    .read_segment(group, &segment, Some(since), None)
                    .await?;
            } else if let Some(token) = &target.token {
                if recent.is_none() {
                    recent = Some(self.list_window(group, since).await?);
                }
                for info in recent.iter().flatten() {
                    let records = self
                        .store
                        .read_segment(group, &info.name, Some(since), None)
                        .await?;
                    if records.iter().any(|r| r.message.contains(token.as_str())) {
                        debug!(index = target.index, segment = %info.name, "Located child segment");
                        child.segment = Some(info.name.clone());
                        child.records = records;
                        break;
                    }
                }
            }

            child.done = child
                .records
                .iter()
                .any(|r| r.message.contains(success_marker));
        }
        Ok(())
    }

    /// Last `limit` records across the most recently written segments.
    pub async fn tail(&self, group: &str, prefix: Option<&str>, limit: usize) -> Result<Vec<LogRecord>> {
        let segments = self.store.list_segments(group, prefix, 5).await?;
        let mut records = Vec::new();
        for info in segments.iter().rev() {
            records.extend(self.store.read_segment(group, &info.name, None, None).await?);
        }
        records.sort_by_key(|r| r.timestamp);
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

/// Render records as diagnostic lines.
pub fn render_records(records: &[LogRecord]) -> Vec<String> {
    records.iter().map(|r| r.to_string()).collect()
}
