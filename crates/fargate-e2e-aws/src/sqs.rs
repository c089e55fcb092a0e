// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQS work queue.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::types::QueueAttributeName;
use tracing::{debug, info};

use fargate_e2e::{E2eError, MessageQueue, QueueDepth, Result};

use crate::error::SdkResultExt;

pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    pub fn from_conf(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self::new(Client::new(config), queue_url)
    }
}

fn count(
    attributes: &HashMap<QueueAttributeName, String>,
    name: QueueAttributeName,
) -> Result<u64> {
    match attributes.get(&name) {
        None => Ok(0),
        Some(value) => value.parse().map_err(|_| {
            E2eError::Backend(format!(
                "queue attribute {} is not a count: {}",
                name.as_str(),
                value
            ))
        }),
    }
}

/// Visible and in-flight counts from `GetQueueAttributes`.
pub fn queue_depth(attributes: &HashMap<QueueAttributeName, String>) -> Result<QueueDepth> {
    Ok(QueueDepth {
        visible: count(attributes, QueueAttributeName::ApproximateNumberOfMessages)?,
        in_flight: count(
            attributes,
            QueueAttributeName::ApproximateNumberOfMessagesNotVisible,
        )?,
    })
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn send(&self, body: &str) -> Result<String> {
        let output = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .or_classify("SendMessage")?;
        let id = output
            .message_id()
            .ok_or_else(|| E2eError::Backend("SendMessage returned no message id".to_string()))?;
        info!(queue_url = %self.queue_url, message_id = %id, "Message sent");
        Ok(id.to_string())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .or_classify("GetQueueAttributes")?;
        let depth = match output.attributes() {
            Some(attributes) => queue_depth(attributes)?,
            None => QueueDepth::default(),
        };
        debug!(visible = depth.visible, in_flight = depth.in_flight, "Queue depth");
        Ok(depth)
    }
}
