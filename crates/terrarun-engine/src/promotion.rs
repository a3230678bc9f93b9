// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment promotion gate.
//!
//! A workspace in environment E of a project with a lifecycle may only run a
//! VCS commit once the environments of the previous lifecycle group have run
//! that same commit successfully often enough. Group order 0 is never
//! restricted.

use std::sync::Arc;

use terrarun_core::Persistence;
use terrarun_core::models::{CommandStatus, ConfigurationVersionRecord, WorkspaceRecord};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Success counts of one commit across a lifecycle group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupTally {
    /// Environments with at least one run of the commit.
    pub runs: i32,
    /// Environments with at least one finished plan of the commit.
    pub successful_plans: i32,
    /// Environments with at least one finished apply of the commit.
    pub successful_applies: i32,
}

/// Admission check for new Runs.
#[derive(Clone)]
pub struct PromotionGate {
    persistence: Arc<dyn Persistence>,
}

impl PromotionGate {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Admit or reject a Run of `configuration_version` on `workspace`.
    pub async fn check(
        &self,
        configuration_version: &ConfigurationVersionRecord,
        workspace: &WorkspaceRecord,
    ) -> Result<()> {
        let Some(commit_sha) = configuration_version.ingress_commit_sha.as_deref() else {
            return Ok(());
        };
        let Some(environment_id) = workspace.environment_id.as_deref() else {
            return Ok(());
        };
        let Some(project) = self.persistence.get_project(&workspace.project_id).await? else {
            return Ok(());
        };
        let Some(lifecycle_id) = project.lifecycle_id.as_deref() else {
            return Ok(());
        };
        let Some(group) = self
            .persistence
            .get_lifecycle_group_for_environment(lifecycle_id, environment_id)
            .await?
        else {
            return Ok(());
        };
        if group.group_order == 0 {
            return Ok(());
        }

        let Some(parent) = self
            .persistence
            .get_lifecycle_group_by_order(lifecycle_id, group.group_order - 1)
            .await?
        else {
            warn!(
                lifecycle_id = %lifecycle_id,
                group_order = group.group_order,
                "Lifecycle has no parent group, admitting run"
            );
            return Ok(());
        };

        let environment_ids = self.persistence.list_group_environment_ids(&parent.id).await?;
        let tally = self
            .tally(&project.id, &environment_ids, commit_sha)
            .await?;

        let group_size = i32::try_from(environment_ids.len()).unwrap_or(i32::MAX);
        let thresholds = [
            ("runs", tally.runs, parent.minimum_runs),
            (
                "successful plans",
                tally.successful_plans,
                parent.minimum_successful_plans,
            ),
            (
                "successful applies",
                tally.successful_applies,
                parent.minimum_successful_applies,
            ),
        ];
        let unmet: Vec<String> = thresholds
            .iter()
            .filter_map(|(name, actual, minimum)| {
                let required = minimum.unwrap_or(group_size);
                (*actual < required).then(|| format!("{} {}/{}", name, actual, required))
            })
            .collect();

        if !unmet.is_empty() {
            info!(
                workspace_id = %workspace.id,
                commit_sha = %commit_sha,
                unmet = %unmet.join(", "),
                "Promotion gate rejected run"
            );
            return Err(Error::PromotionRejected(format!(
                "commit {} has not been promoted through lifecycle group {}: {}",
                commit_sha,
                parent.group_order,
                unmet.join(", ")
            )));
        }

        debug!(workspace_id = %workspace.id, commit_sha = %commit_sha, "Promotion gate admitted run");
        Ok(())
    }

    /// Count, per environment, whether `commit_sha` ran, planned and applied.
    pub async fn tally(
        &self,
        project_id: &str,
        environment_ids: &[String],
        commit_sha: &str,
    ) -> Result<GroupTally> {
        let mut tally = GroupTally::default();
        for environment_id in environment_ids {
            let Some(workspace) = self
                .persistence
                .find_project_workspace(project_id, environment_id)
                .await?
            else {
                continue;
            };
            let outcomes = self
                .persistence
                .list_commit_run_outcomes(&workspace.id, commit_sha)
                .await?;

            if !outcomes.is_empty() {
                tally.runs += 1;
            }
            if outcomes
                .iter()
                .any(|o| o.plan_status == Some(CommandStatus::Finished))
            {
                tally.successful_plans += 1;
            }
            if outcomes
                .iter()
                .any(|o| o.apply_status == Some(CommandStatus::Finished))
            {
                tally.successful_applies += 1;
            }
        }
        Ok(tally)
    }
}
