// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Raw rows shared by both backends.
//!
//! Status columns come back as text and are parsed into their enums here, so
//! a bad stored value fails loudly at the edge of the storage layer.

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    AgentJobCandidate, CommandKind, CommandRecord, JobRecord, ResourceCounts, RunOutcome,
    RunRecord, TaskResultRecord, TaskStageRecord, WorkspaceRecord, parse_stored,
};

fn parse_optional<T: std::str::FromStr>(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<T>, CoreError> {
    value.map(|v| parse_stored(field, &v)).transpose()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub id: String,
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub tool_id: String,
    pub status: String,
    pub confirmed: bool,
    pub auto_apply: bool,
    pub plan_only: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub is_destroy: bool,
    pub message: Option<String>,
    pub created_by: Option<String>,
    pub confirmed_by: Option<String>,
    pub canceled_by: Option<String>,
    pub discarded_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(RunRecord {
            status: parse_stored("runs.status", &row.status)?,
            id: row.id,
            workspace_id: row.workspace_id,
            configuration_version_id: row.configuration_version_id,
            tool_id: row.tool_id,
            confirmed: row.confirmed,
            auto_apply: row.auto_apply,
            plan_only: row.plan_only,
            refresh: row.refresh,
            refresh_only: row.refresh_only,
            is_destroy: row.is_destroy,
            message: row.message,
            created_by: row.created_by,
            confirmed_by: row.confirmed_by,
            canceled_by: row.canceled_by,
            discarded_by: row.discarded_by,
            created_at: row.created_at,
        })
    }
}

pub(crate) const RUN_COLUMNS: &str = "id, workspace_id, configuration_version_id, tool_id, status, \
     confirmed, auto_apply, plan_only, refresh, refresh_only, is_destroy, message, created_by, \
     confirmed_by, canceled_by, discarded_by, created_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CommandRow {
    pub id: String,
    pub run_id: String,
    pub status: String,
    pub has_changes: bool,
    pub resource_additions: i64,
    pub resource_changes: i64,
    pub resource_destructions: i64,
    pub log_blob_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CommandRow {
    pub fn into_record(self, kind: CommandKind) -> Result<CommandRecord, CoreError> {
        Ok(CommandRecord {
            status: parse_stored("command.status", &self.status)?,
            id: self.id,
            run_id: self.run_id,
            kind,
            resources: ResourceCounts {
                has_changes: self.has_changes,
                additions: self.resource_additions,
                changes: self.resource_changes,
                destructions: self.resource_destructions,
            },
            log_blob_path: self.log_blob_path,
            created_at: self.created_at,
        })
    }
}

pub(crate) const COMMAND_COLUMNS: &str = "id, run_id, status, has_changes, resource_additions, \
     resource_changes, resource_destructions, log_blob_path, created_at";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub run_id: String,
    pub queue_type: String,
    pub job_type: Option<String>,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            lane: parse_stored("run_queue.queue_type", &row.queue_type)?,
            job_type: parse_optional("run_queue.job_type", row.job_type)?,
            id: row.id,
            run_id: row.run_id,
            agent_id: row.agent_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CandidateRow {
    pub job_id: i64,
    pub run_id: String,
    pub job_type: Option<String>,
    pub organisation_id: String,
    pub workspace_execution_mode: Option<String>,
    pub project_execution_mode: Option<String>,
    pub organisation_execution_mode: String,
    pub workspace_agent_pool_id: Option<String>,
    pub project_agent_pool_id: Option<String>,
    pub environment_agent_pool_id: Option<String>,
    pub organisation_agent_pool_id: Option<String>,
}

impl TryFrom<CandidateRow> for AgentJobCandidate {
    type Error = CoreError;

    fn try_from(row: CandidateRow) -> Result<Self, Self::Error> {
        let job_type = row.job_type.ok_or_else(|| CoreError::InvalidValue {
            field: "run_queue.job_type".to_string(),
            value: "NULL".to_string(),
        })?;
        Ok(AgentJobCandidate {
            job_id: row.job_id,
            run_id: row.run_id,
            job_type: parse_stored("run_queue.job_type", &job_type)?,
            organisation_id: row.organisation_id,
            workspace_execution_mode: parse_optional(
                "workspaces.execution_mode",
                row.workspace_execution_mode,
            )?,
            project_execution_mode: parse_optional(
                "projects.execution_mode",
                row.project_execution_mode,
            )?,
            organisation_execution_mode: parse_stored(
                "organisations.default_execution_mode",
                &row.organisation_execution_mode,
            )?,
            workspace_agent_pool_id: row.workspace_agent_pool_id,
            project_agent_pool_id: row.project_agent_pool_id,
            environment_agent_pool_id: row.environment_agent_pool_id,
            organisation_agent_pool_id: row.organisation_agent_pool_id,
        })
    }
}

pub(crate) const CANDIDATE_SELECT: &str = r#"
    SELECT q.id AS job_id, q.run_id, q.job_type, w.organisation_id,
           w.execution_mode AS workspace_execution_mode,
           p.execution_mode AS project_execution_mode,
           o.default_execution_mode AS organisation_execution_mode,
           w.agent_pool_id AS workspace_agent_pool_id,
           p.agent_pool_id AS project_agent_pool_id,
           e.agent_pool_id AS environment_agent_pool_id,
           o.default_agent_pool_id AS organisation_agent_pool_id
    FROM run_queue q
    JOIN runs r ON r.id = q.run_id
    JOIN workspaces w ON w.id = r.workspace_id
    JOIN projects p ON p.id = w.project_id
    JOIN organisations o ON o.id = w.organisation_id
    LEFT JOIN environments e ON e.id = w.environment_id
    WHERE q.queue_type = 'agent' AND q.agent_id IS NULL
"#;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskStageRow {
    pub id: String,
    pub run_id: String,
    pub stage: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskStageRow> for TaskStageRecord {
    type Error = CoreError;

    fn try_from(row: TaskStageRow) -> Result<Self, Self::Error> {
        Ok(TaskStageRecord {
            stage: parse_stored("task_stages.stage", &row.stage)?,
            status: parse_stored("task_stages.status", &row.status)?,
            id: row.id,
            run_id: row.run_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskResultRow {
    pub id: String,
    pub task_stage_id: String,
    pub workspace_task_id: String,
    pub task_name: String,
    pub task_url: String,
    pub hmac_key: Option<String>,
    pub enforcement_level: String,
    pub callback_id: String,
    pub status: String,
    pub message: Option<String>,
    pub result_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TaskResultRow> for TaskResultRecord {
    type Error = CoreError;

    fn try_from(row: TaskResultRow) -> Result<Self, Self::Error> {
        Ok(TaskResultRecord {
            enforcement_level: parse_stored(
                "workspace_tasks.enforcement_level",
                &row.enforcement_level,
            )?,
            status: parse_stored("task_results.status", &row.status)?,
            id: row.id,
            task_stage_id: row.task_stage_id,
            workspace_task_id: row.workspace_task_id,
            task_name: row.task_name,
            task_url: row.task_url,
            hmac_key: row.hmac_key,
            callback_id: row.callback_id,
            message: row.message,
            result_url: row.result_url,
            start_time: row.start_time,
            created_at: row.created_at,
        })
    }
}

pub(crate) const TASK_RESULT_SELECT: &str = r#"
    SELECT tr.id, tr.task_stage_id, tr.workspace_task_id,
           t.name AS task_name, t.url AS task_url, t.hmac_key,
           wt.enforcement_level, tr.callback_id, tr.status, tr.message,
           tr.url AS result_url, tr.start_time, tr.created_at
    FROM task_results tr
    JOIN workspace_tasks wt ON wt.id = tr.workspace_task_id
    JOIN tasks t ON t.id = wt.task_id
"#;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct WorkspaceRow {
    pub id: String,
    pub name: String,
    pub organisation_id: String,
    pub project_id: String,
    pub environment_id: Option<String>,
    pub execution_mode: Option<String>,
    pub agent_pool_id: Option<String>,
    pub tool_id: Option<String>,
    pub auto_apply: bool,
    pub locked_by_run_id: Option<String>,
}

impl TryFrom<WorkspaceRow> for WorkspaceRecord {
    type Error = CoreError;

    fn try_from(row: WorkspaceRow) -> Result<Self, Self::Error> {
        Ok(WorkspaceRecord {
            execution_mode: parse_optional("workspaces.execution_mode", row.execution_mode)?,
            id: row.id,
            name: row.name,
            organisation_id: row.organisation_id,
            project_id: row.project_id,
            environment_id: row.environment_id,
            agent_pool_id: row.agent_pool_id,
            tool_id: row.tool_id,
            auto_apply: row.auto_apply,
            locked_by_run_id: row.locked_by_run_id,
        })
    }
}

pub(crate) const WORKSPACE_COLUMNS: &str = "id, name, organisation_id, project_id, environment_id, \
     execution_mode, agent_pool_id, tool_id, auto_apply, locked_by_run_id";

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OutcomeRow {
    pub run_id: String,
    pub run_status: String,
    pub plan_status: Option<String>,
    pub apply_status: Option<String>,
}

impl TryFrom<OutcomeRow> for RunOutcome {
    type Error = CoreError;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        Ok(RunOutcome {
            run_status: parse_stored("runs.status", &row.run_status)?,
            plan_status: parse_optional("plans.status", row.plan_status)?,
            apply_status: parse_optional("applies.status", row.apply_status)?,
            run_id: row.run_id,
        })
    }
}

/// Collect rows into records, stopping at the first unparseable one.
pub(crate) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, CoreError>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
