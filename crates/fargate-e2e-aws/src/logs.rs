// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudWatch Logs as the log store.
//!
//! Groups and segments map onto log groups and log streams. A group or
//! stream that does not exist yet reads as empty.

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::Client;
use aws_sdk_cloudwatchlogs::types::OrderBy;
use chrono::{DateTime, Utc};
use tracing::debug;

use fargate_e2e::{E2eError, LogRecord, LogStore, Result, SegmentInfo};

use crate::error::SdkResultExt;
use crate::millis_to_utc;

/// `DescribeLogStreams` returns at most this many streams per page.
const MAX_STREAMS_PER_PAGE: usize = 50;

/// Upper bound on `DescribeLogStreams` pages read for one listing.
const MAX_STREAM_PAGES: usize = 20;

/// Upper bound on `GetLogEvents` pages read for one segment.
const MAX_EVENT_PAGES: usize = 20;

pub struct CloudWatchLogStore {
    client: Client,
}

impl CloudWatchLogStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_conf(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }
}

fn empty_when_missing<T>(result: Result<Vec<T>>) -> Result<Vec<T>> {
    match result {
        Err(E2eError::NotFound(_)) => Ok(Vec::new()),
        other => other,
    }
}

/// Newest first; streams that never received an event go last.
pub fn sort_newest_first(segments: &mut [SegmentInfo]) {
    segments.sort_by(|a, b| b.last_event_at.cmp(&a.last_event_at));
}

impl CloudWatchLogStore {
    async fn describe_streams(
        &self,
        group: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SegmentInfo>> {
        let mut segments: Vec<SegmentInfo> = Vec::new();
        let mut token: Option<String> = None;

        for _ in 0..MAX_STREAM_PAGES {
            // Ordering by event time cannot be combined with a name prefix.
            let mut request = self
                .client
                .describe_log_streams()
                .log_group_name(group)
                .limit(limit.clamp(1, MAX_STREAMS_PER_PAGE) as i32)
                .set_next_token(token.take());
            request = match prefix {
                Some(prefix) => request.log_stream_name_prefix(prefix),
                None => request.order_by(OrderBy::LastEventTime).descending(true),
            };

            let output = request.send().await.or_classify("DescribeLogStreams")?;
            segments.extend(output.log_streams().iter().filter_map(|stream| {
                Some(SegmentInfo {
                    name: stream.log_stream_name()?.to_string(),
                    last_event_at: stream.last_event_timestamp().and_then(millis_to_utc),
                })
            }));

            // Prefix listings come back in name order, so every page is read.
            if prefix.is_none() && segments.len() >= limit {
                break;
            }
            match output.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        if prefix.is_some() {
            sort_newest_first(&mut segments);
        }
        segments.truncate(limit);
        Ok(segments)
    }

    async fn read_events(
        &self,
        group: &str,
        segment: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        let mut token: Option<String> = None;

        for _ in 0..MAX_EVENT_PAGES {
            let output = self
                .client
                .get_log_events()
                .log_group_name(group)
                .log_stream_name(segment)
                .start_from_head(true)
                .set_start_time(since.map(|t| t.timestamp_millis()))
                .set_next_token(token.clone())
                .send()
                .await
                .or_classify("GetLogEvents")?;

            let events = output.events();
            records.extend(events.iter().map(|event| {
                let record = LogRecord::new(segment, event.message().unwrap_or_default());
                match event.timestamp().and_then(millis_to_utc) {
                    Some(at) => record.at(at),
                    None => record,
                }
            }));
            if let Some(limit) = limit
                && records.len() >= limit
            {
                records.truncate(limit);
                break;
            }

            // The forward token repeats once the end of the stream is reached.
            let next = output.next_forward_token().map(String::from);
            if events.is_empty() || next.is_none() || next == token {
                break;
            }
            token = next;
        }
        Ok(records)
    }
}

#[async_trait]
impl LogStore for CloudWatchLogStore {
    async fn list_segments(
        &self,
        group: &str,
        prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SegmentInfo>> {
        let segments = empty_when_missing(self.describe_streams(group, prefix, limit).await)?;
        debug!(group = %group, prefix = ?prefix, segments = segments.len(), "Listed log streams");
        Ok(segments)
    }

    async fn read_segment(
        &self,
        group: &str,
        segment: &str,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LogRecord>> {
        let records = empty_when_missing(self.read_events(group, segment, since, limit).await)?;
        debug!(group = %group, segment = %segment, records = records.len(), "Read log stream");
        Ok(records)
    }
}
