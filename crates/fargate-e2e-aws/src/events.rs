// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot EventBridge schedule rules.

use async_trait::async_trait;
use aws_sdk_eventbridge::Client;
use aws_sdk_eventbridge::types::{RuleState, Target};
use tracing::{debug, info, warn};

use fargate_e2e::{E2eError, Result, ScheduleRegistrar, TriggerRule};

use crate::error::{SdkResultExt, build_error};

/// Id of the single target attached to each rule.
pub const TARGET_ID: &str = "1";

/// Prefix of the deployed rules whose target role is reused by default.
pub const DEFAULT_ROLE_RULE_PREFIX: &str = "fargate-workflow-schedule-rule";

/// Where the role EventBridge assumes to start the target comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleSource {
    /// An explicit role ARN.
    Arn(String),
    /// The role of the first target of an existing rule with this name prefix.
    BorrowFrom(String),
}

impl Default for RoleSource {
    fn default() -> Self {
        RoleSource::BorrowFrom(DEFAULT_ROLE_RULE_PREFIX.to_string())
    }
}

/// Registers schedule rules on the default event bus.
pub struct EventBridgeScheduleRegistrar {
    client: Client,
    role: RoleSource,
}

impl EventBridgeScheduleRegistrar {
    pub fn new(client: Client, role: RoleSource) -> Self {
        Self { client, role }
    }

    pub fn from_conf(config: &aws_config::SdkConfig, role: RoleSource) -> Self {
        Self::new(Client::new(config), role)
    }

    async fn role_arn(&self) -> Result<String> {
        let prefix = match &self.role {
            RoleSource::Arn(arn) => return Ok(arn.clone()),
            RoleSource::BorrowFrom(prefix) => prefix,
        };

        let rules = self
            .client
            .list_rules()
            .name_prefix(prefix)
            .send()
            .await
            .or_classify("ListRules")?;
        let rule = rules
            .rules()
            .iter()
            .find_map(|r| r.name())
            .ok_or_else(|| {
                E2eError::Config(format!(
                    "no existing rule with prefix {} to borrow a role from",
                    prefix
                ))
            })?;

        let targets = self
            .client
            .list_targets_by_rule()
            .rule(rule)
            .send()
            .await
            .or_classify("ListTargetsByRule")?;
        let role = targets
            .targets()
            .iter()
            .find_map(|t| t.role_arn())
            .ok_or_else(|| E2eError::Config(format!("rule {} has no target role", rule)))?;
        debug!(rule = %rule, role_arn = %role, "Borrowed target role");
        Ok(role.to_string())
    }

    async fn attach_target(&self, rule: &TriggerRule) -> Result<()> {
        let target = Target::builder()
            .id(TARGET_ID)
            .arn(&rule.target)
            .role_arn(self.role_arn().await?)
            .input(&rule.input)
            .build()
            .map_err(|e| build_error("rule target", e))?;

        let output = self
            .client
            .put_targets()
            .rule(&rule.name)
            .targets(target)
            .send()
            .await
            .or_classify("PutTargets")?;

        if output.failed_entry_count() > 0 {
            let reason = output
                .failed_entries()
                .iter()
                .find_map(|e| e.error_message())
                .unwrap_or("unknown reason");
            return Err(E2eError::Backend(format!(
                "target rejected for rule {}: {}",
                rule.name, reason
            )));
        }
        Ok(())
    }
}

fn ignore_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(E2eError::NotFound(_)) => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ScheduleRegistrar for EventBridgeScheduleRegistrar {
    async fn register(&self, rule: &TriggerRule) -> Result<()> {
        self.client
            .put_rule()
            .name(&rule.name)
            .description(&rule.description)
            .schedule_expression(&rule.schedule_expression)
            .state(RuleState::Enabled)
            .send()
            .await
            .or_classify("PutRule")?;

        if let Err(e) = self.attach_target(rule).await {
            warn!(rule = %rule.name, error = %e, "Target not attached, removing rule");
            if let Err(cleanup) = self.deregister(&rule.name).await {
                warn!(rule = %rule.name, error = %cleanup, "Could not remove partial rule");
            }
            return Err(e);
        }

        info!(
            rule = %rule.name,
            schedule = %rule.schedule_expression,
            fire_at = %rule.fire_at,
            "Schedule rule registered"
        );
        Ok(())
    }

    async fn deregister(&self, rule_name: &str) -> Result<()> {
        ignore_missing(
            self.client
                .remove_targets()
                .rule(rule_name)
                .ids(TARGET_ID)
                .send()
                .await
                .map(|_| ())
                .or_classify("RemoveTargets"),
        )?;
        ignore_missing(
            self.client
                .delete_rule()
                .name(rule_name)
                .send()
                .await
                .map(|_| ())
                .or_classify("DeleteRule"),
        )?;
        info!(rule = %rule_name, "Schedule rule removed");
        Ok(())
    }

    async fn list(&self, name_prefix: &str) -> Result<Vec<String>> {
        let output = self
            .client
            .list_rules()
            .name_prefix(name_prefix)
            .send()
            .await
            .or_classify("ListRules")?;
        Ok(output
            .rules()
            .iter()
            .filter_map(|r| r.name().map(String::from))
            .collect())
    }
}
