// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.
//!
//! SQLite has no row locks, so claims are single-statement compare-and-swap
//! updates (`... WHERE agent_id IS NULL`, `DELETE ... RETURNING`). The
//! observable contract matches the Postgres backend.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};
use strum::IntoEnumIterator;

use crate::error::CoreError;
use crate::migrations;
use crate::models::{
    AgentJobCandidate, AgentPoolRecord, AgentRecord, AuditSubject, CommandKind, CommandRecord,
    CommandStatus, ConfigurationVersionRecord, ExecutionMode, JobLane, JobRecord, JobType,
    LifecycleGroupRecord, NewRun, ProjectRecord, ResourceCounts, RunActor, RunOutcome, RunRecord,
    RunStatus, StatusTransition, TaskResultRecord, TaskResultStatus, TaskResultUpdate,
    TaskStageName, TaskStageRecord, TaskStageStatus, ToolRecord, WorkspaceRecord, new_id,
    parse_stored,
};

use super::Persistence;
use super::rows::{
    CANDIDATE_SELECT, COMMAND_COLUMNS, CandidateRow, CommandRow, JobRow, OutcomeRow, RUN_COLUMNS,
    RunRow, TASK_RESULT_SELECT, TaskResultRow, TaskStageRow, WORKSPACE_COLUMNS, WorkspaceRow,
    convert_all,
};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/terrarun.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn record_transition(
    conn: &mut SqliteConnection,
    subject: &AuditSubject,
    old_status: Option<&str>,
    new_status: &str,
    at: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO audit_events (object_type, object_id, old_status, new_status, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(subject.object_type())
    .bind(subject.object_id())
    .bind(old_status)
    .bind(new_status)
    .bind(at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_run(&self, run: &NewRun) -> Result<RunRecord, CoreError> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query(
            "UPDATE workspaces SET locked_by_run_id = ? WHERE id = ? AND locked_by_run_id IS NULL",
        )
        .bind(&run.id)
        .bind(&run.workspace_id)
        .execute(&mut *tx)
        .await?;

        if locked.rows_affected() == 0 {
            let holder: Option<Option<String>> =
                sqlx::query_scalar("SELECT locked_by_run_id FROM workspaces WHERE id = ?")
                    .bind(&run.workspace_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match holder {
                None => CoreError::not_found("workspace", &run.workspace_id),
                Some(locked_by) => CoreError::WorkspaceLocked {
                    workspace_id: run.workspace_id.clone(),
                    locked_by: locked_by.unwrap_or_default(),
                },
            });
        }

        sqlx::query(
            r#"
            INSERT INTO runs (id, workspace_id, configuration_version_id, tool_id, status,
                              confirmed, auto_apply, plan_only, refresh, refresh_only, is_destroy,
                              message, created_by, created_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.workspace_id)
        .bind(&run.configuration_version_id)
        .bind(&run.tool_id)
        .bind(RunStatus::Pending.as_str())
        .bind(run.auto_apply)
        .bind(run.plan_only)
        .bind(run.refresh)
        .bind(run.refresh_only)
        .bind(run.is_destroy)
        .bind(&run.message)
        .bind(&run.created_by)
        .bind(run.created_at)
        .execute(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            &AuditSubject::Run(run.id.clone()),
            None,
            RunStatus::Pending.as_str(),
            run.created_at,
        )
        .await?;

        for stage in TaskStageName::iter() {
            let stage_id = new_id("ts");
            sqlx::query(
                "INSERT INTO task_stages (id, run_id, stage, status, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&stage_id)
            .bind(&run.id)
            .bind(stage.as_str())
            .bind(TaskStageStatus::Pending.as_str())
            .bind(run.created_at)
            .execute(&mut *tx)
            .await?;
            record_transition(
                &mut tx,
                &AuditSubject::TaskStage(stage_id.clone()),
                None,
                TaskStageStatus::Pending.as_str(),
                run.created_at,
            )
            .await?;

            let workspace_task_ids: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT wt.id FROM workspace_tasks wt
                JOIN tasks t ON t.id = wt.task_id
                WHERE wt.workspace_id = ? AND wt.stage = ? AND wt.active AND t.enabled
                ORDER BY wt.id
                "#,
            )
            .bind(&run.workspace_id)
            .bind(stage.as_str())
            .fetch_all(&mut *tx)
            .await?;

            for workspace_task_id in workspace_task_ids {
                let result_id = new_id("taskrs");
                sqlx::query(
                    r#"
                    INSERT INTO task_results (id, task_stage_id, workspace_task_id, callback_id,
                                              status, created_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&result_id)
                .bind(&stage_id)
                .bind(&workspace_task_id)
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(TaskResultStatus::Pending.as_str())
                .bind(run.created_at)
                .execute(&mut *tx)
                .await?;
                record_transition(
                    &mut tx,
                    &AuditSubject::TaskResult(result_id),
                    None,
                    TaskResultStatus::Pending.as_str(),
                    run.created_at,
                )
                .await?;
            }
        }

        sqlx::query("INSERT INTO run_queue (run_id, queue_type, created_at) VALUES (?, ?, ?)")
            .bind(&run.id)
            .bind(JobLane::Worker.as_str())
            .bind(run.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(RunRecord {
            id: run.id.clone(),
            workspace_id: run.workspace_id.clone(),
            configuration_version_id: run.configuration_version_id.clone(),
            tool_id: run.tool_id.clone(),
            status: RunStatus::Pending,
            confirmed: false,
            auto_apply: run.auto_apply,
            plan_only: run.plan_only,
            refresh: run.refresh,
            refresh_only: run.refresh_only,
            is_destroy: run.is_destroy,
            message: run.message.clone(),
            created_by: run.created_by.clone(),
            confirmed_by: None,
            canceled_by: None,
            discarded_by: None,
            created_at: run.created_at,
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM runs WHERE id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn transition_run(
        &self,
        run_id: &str,
        next: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RunStatus>, CoreError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?;
        let current = current.ok_or_else(|| CoreError::not_found("run", run_id))?;
        let current: RunStatus = parse_stored("runs.status", &current)?;

        if !current.can_transition_to(next) {
            return Ok(None);
        }

        let updated = sqlx::query("UPDATE runs SET status = ? WHERE id = ? AND status = ?")
            .bind(next.as_str())
            .bind(run_id)
            .bind(current.as_str())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        record_transition(
            &mut tx,
            &AuditSubject::Run(run_id.to_string()),
            Some(current.as_str()),
            next.as_str(),
            at,
        )
        .await?;

        tx.commit().await?;
        Ok(Some(current))
    }

    async fn confirm_run(
        &self,
        run_id: &str,
        confirmed_by: Option<&str>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE runs SET confirmed = 1, confirmed_by = ? WHERE id = ?")
            .bind(confirmed_by)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("run", run_id));
        }
        Ok(())
    }

    async fn set_run_actor(
        &self,
        run_id: &str,
        actor: RunActor,
        user: Option<&str>,
    ) -> Result<(), CoreError> {
        let sql = match actor {
            RunActor::Canceled => "UPDATE runs SET canceled_by = ? WHERE id = ?",
            RunActor::Discarded => "UPDATE runs SET discarded_by = ? WHERE id = ?",
        };
        sqlx::query(sql)
            .bind(user)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_run_comment(
        &self,
        run_id: &str,
        body: &str,
        created_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO run_comments (id, run_id, body, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(new_id("wsrc"))
        .bind(run_id)
        .bind(body)
        .bind(created_by)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_command(
        &self,
        kind: CommandKind,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CommandRecord, CoreError> {
        let id = new_id(kind.as_ref());
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO {} (id, run_id, status, created_at) VALUES (?, ?, ?, ?)",
            kind.table()
        ))
        .bind(&id)
        .bind(run_id)
        .bind(CommandStatus::Pending.as_str())
        .bind(at)
        .execute(&mut *tx)
        .await?;

        record_transition(
            &mut tx,
            &kind.audit_subject(&id),
            None,
            CommandStatus::Pending.as_str(),
            at,
        )
        .await?;
        tx.commit().await?;

        Ok(CommandRecord {
            id,
            run_id: run_id.to_string(),
            kind,
            status: CommandStatus::Pending,
            resources: ResourceCounts::default(),
            log_blob_path: None,
            created_at: at,
        })
    }

    async fn latest_command(
        &self,
        kind: CommandKind,
        run_id: &str,
    ) -> Result<Option<CommandRecord>, CoreError> {
        let row = sqlx::query_as::<_, CommandRow>(&format!(
            "SELECT {} FROM {} WHERE run_id = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
            COMMAND_COLUMNS,
            kind.table()
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_record(kind)).transpose()
    }

    async fn update_command_status(
        &self,
        kind: CommandKind,
        command_id: &str,
        status: CommandStatus,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let old: Option<String> = sqlx::query_scalar(&format!(
            "SELECT status FROM {} WHERE id = ?",
            kind.table()
        ))
        .bind(command_id)
        .fetch_optional(&mut *tx)
        .await?;
        let old = old.ok_or_else(|| CoreError::not_found(kind.table(), command_id))?;
        if old == status.as_str() {
            return Ok(());
        }

        sqlx::query(&format!("UPDATE {} SET status = ? WHERE id = ?", kind.table()))
            .bind(status.as_str())
            .bind(command_id)
            .execute(&mut *tx)
            .await?;

        record_transition(
            &mut tx,
            &kind.audit_subject(command_id),
            Some(&old),
            status.as_str(),
            at,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_command_resources(
        &self,
        kind: CommandKind,
        command_id: &str,
        resources: &ResourceCounts,
    ) -> Result<(), CoreError> {
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET has_changes = ?, resource_additions = ?, resource_changes = ?,
                resource_destructions = ?
            WHERE id = ?
            "#,
            kind.table()
        ))
        .bind(resources.has_changes)
        .bind(resources.additions)
        .bind(resources.changes)
        .bind(resources.destructions)
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_command_log_blob(
        &self,
        kind: CommandKind,
        command_id: &str,
        path: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(&format!(
            "UPDATE {} SET log_blob_path = ? WHERE id = ?",
            kind.table()
        ))
        .bind(path)
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_job(
        &self,
        run_id: &str,
        lane: JobLane,
        job_type: Option<JobType>,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO run_queue (run_id, queue_type, job_type, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(lane.as_str())
        .bind(job_type.map(|t| t.as_str().to_string()))
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_worker_job(&self) -> Result<Option<JobRecord>, CoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            DELETE FROM run_queue
            WHERE id = (
                SELECT id FROM run_queue
                WHERE queue_type = 'worker'
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, run_id, queue_type, job_type, agent_id, created_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list_agent_job_candidates(
        &self,
        job_types: &[JobType],
    ) -> Result<Vec<AgentJobCandidate>, CoreError> {
        let rows = sqlx::query_as::<_, CandidateRow>(&format!("{} ORDER BY q.id", CANDIDATE_SELECT))
            .fetch_all(&self.pool)
            .await?;

        let candidates: Vec<AgentJobCandidate> = convert_all(rows)?;
        Ok(candidates
            .into_iter()
            .filter(|c| job_types.contains(&c.job_type))
            .collect())
    }

    async fn claim_agent_job(&self, job_id: i64, agent_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE run_queue SET agent_id = ?
            WHERE id = ? AND queue_type = 'agent' AND agent_id IS NULL
            "#,
        )
        .bind(agent_id)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_jobs(
        &self,
        run_id: &str,
        lane: JobLane,
        job_type: Option<JobType>,
    ) -> Result<i64, CoreError> {
        let job_type = job_type.map(|t| t.as_str().to_string());
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM run_queue
            WHERE run_id = ? AND queue_type = ? AND (? IS NULL OR job_type = ?)
            "#,
        )
        .bind(run_id)
        .bind(lane.as_str())
        .bind(&job_type)
        .bind(&job_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete_agent_jobs(&self, run_id: &str, job_type: JobType) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM run_queue WHERE run_id = ? AND queue_type = 'agent' AND job_type = ?",
        )
        .bind(run_id)
        .bind(job_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_jobs_for_run(&self, run_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM run_queue WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, CoreError> {
        let record = sqlx::query_as::<_, AgentRecord>(
            "SELECT id, name, agent_pool_id, last_checkin_at FROM agents WHERE id = ?",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_agent_pool(&self, pool_id: &str) -> Result<Option<AgentPoolRecord>, CoreError> {
        let record = sqlx::query_as::<_, AgentPoolRecord>(
            "SELECT id, name, organisation_id FROM agent_pools WHERE id = ?",
        )
        .bind(pool_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn touch_agent(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), CoreError> {
        sqlx::query("UPDATE agents SET last_checkin_at = ? WHERE id = ?")
            .bind(at)
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_task_stage(
        &self,
        run_id: &str,
        stage: TaskStageName,
    ) -> Result<Option<TaskStageRecord>, CoreError> {
        let row = sqlx::query_as::<_, TaskStageRow>(
            "SELECT id, run_id, stage, status, created_at FROM task_stages WHERE run_id = ? AND stage = ?",
        )
        .bind(run_id)
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskStageRecord::try_from).transpose()
    }

    async fn list_task_stages(&self, run_id: &str) -> Result<Vec<TaskStageRecord>, CoreError> {
        let rows = sqlx::query_as::<_, TaskStageRow>(
            "SELECT id, run_id, stage, status, created_at FROM task_stages WHERE run_id = ? ORDER BY rowid",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_task_results(
        &self,
        task_stage_id: &str,
    ) -> Result<Vec<TaskResultRecord>, CoreError> {
        let rows = sqlx::query_as::<_, TaskResultRow>(&format!(
            "{} WHERE tr.task_stage_id = ? ORDER BY tr.created_at, tr.workspace_task_id",
            TASK_RESULT_SELECT
        ))
        .bind(task_stage_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn update_task_stage_status(
        &self,
        task_stage_id: &str,
        status: TaskStageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let old: Option<String> = sqlx::query_scalar("SELECT status FROM task_stages WHERE id = ?")
            .bind(task_stage_id)
            .fetch_optional(&mut *tx)
            .await?;
        let old = old.ok_or_else(|| CoreError::not_found("task_stage", task_stage_id))?;
        if old == status.as_str() {
            return Ok(());
        }

        sqlx::query("UPDATE task_stages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(task_stage_id)
            .execute(&mut *tx)
            .await?;
        record_transition(
            &mut tx,
            &AuditSubject::TaskStage(task_stage_id.to_string()),
            Some(&old),
            status.as_str(),
            at,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_task_result(
        &self,
        task_result_id: &str,
        update: &TaskResultUpdate,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let old: Option<String> = sqlx::query_scalar("SELECT status FROM task_results WHERE id = ?")
            .bind(task_result_id)
            .fetch_optional(&mut *tx)
            .await?;
        let old = old.ok_or_else(|| CoreError::not_found("task_result", task_result_id))?;

        sqlx::query(
            r#"
            UPDATE task_results
            SET status = COALESCE(?, status),
                message = COALESCE(?, message),
                url = COALESCE(?, url),
                start_time = COALESCE(?, start_time)
            WHERE id = ?
            "#,
        )
        .bind(update.status.map(|s| s.as_str().to_string()))
        .bind(&update.message)
        .bind(&update.result_url)
        .bind(update.start_time)
        .bind(task_result_id)
        .execute(&mut *tx)
        .await?;

        if let Some(status) = update.status
            && old != status.as_str()
        {
            record_transition(
                &mut tx,
                &AuditSubject::TaskResult(task_result_id.to_string()),
                Some(&old),
                status.as_str(),
                at,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task_result_by_callback_id(
        &self,
        callback_id: &str,
    ) -> Result<Option<TaskResultRecord>, CoreError> {
        let row = sqlx::query_as::<_, TaskResultRow>(&format!(
            "{} WHERE tr.callback_id = ?",
            TASK_RESULT_SELECT
        ))
        .bind(callback_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskResultRecord::try_from).transpose()
    }

    async fn get_configuration_version(
        &self,
        id: &str,
    ) -> Result<Option<ConfigurationVersionRecord>, CoreError> {
        let record = sqlx::query_as::<_, ConfigurationVersionRecord>(
            r#"
            SELECT id, workspace_id, speculative, ingress_commit_sha, ingress_branch
            FROM configuration_versions WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, CoreError> {
        let row = sqlx::query_as::<_, WorkspaceRow>(&format!(
            "SELECT {} FROM workspaces WHERE id = ?",
            WORKSPACE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkspaceRecord::try_from).transpose()
    }

    async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>, CoreError> {
        let record = sqlx::query_as::<_, ProjectRecord>(
            "SELECT id, name, organisation_id, lifecycle_id FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_run_execution_mode(
        &self,
        run_id: &str,
    ) -> Result<Option<ExecutionMode>, CoreError> {
        let mode: Option<String> = sqlx::query_scalar(
            r#"
            SELECT COALESCE(w.execution_mode, p.execution_mode, o.default_execution_mode)
            FROM runs r
            JOIN workspaces w ON w.id = r.workspace_id
            JOIN projects p ON p.id = w.project_id
            JOIN organisations o ON o.id = w.organisation_id
            WHERE r.id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        mode.map(|m| parse_stored("execution_mode", &m)).transpose()
    }

    async fn get_lifecycle_group_for_environment(
        &self,
        lifecycle_id: &str,
        environment_id: &str,
    ) -> Result<Option<LifecycleGroupRecord>, CoreError> {
        let record = sqlx::query_as::<_, LifecycleGroupRecord>(
            r#"
            SELECT g.id, g.lifecycle_id, g.group_order, g.minimum_runs,
                   g.minimum_successful_plans, g.minimum_successful_applies
            FROM lifecycle_environment_groups g
            JOIN lifecycle_environments le ON le.lifecycle_environment_group_id = g.id
            WHERE g.lifecycle_id = ? AND le.environment_id = ?
            ORDER BY g.group_order
            LIMIT 1
            "#,
        )
        .bind(lifecycle_id)
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_lifecycle_group_by_order(
        &self,
        lifecycle_id: &str,
        group_order: i32,
    ) -> Result<Option<LifecycleGroupRecord>, CoreError> {
        let record = sqlx::query_as::<_, LifecycleGroupRecord>(
            r#"
            SELECT id, lifecycle_id, group_order, minimum_runs,
                   minimum_successful_plans, minimum_successful_applies
            FROM lifecycle_environment_groups
            WHERE lifecycle_id = ? AND group_order = ?
            "#,
        )
        .bind(lifecycle_id)
        .bind(group_order)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_group_environment_ids(&self, group_id: &str) -> Result<Vec<String>, CoreError> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT environment_id FROM lifecycle_environments
            WHERE lifecycle_environment_group_id = ?
            ORDER BY environment_id
            "#,
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_project_workspace(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Option<WorkspaceRecord>, CoreError> {
        let row = sqlx::query_as::<_, WorkspaceRow>(&format!(
            "SELECT {} FROM workspaces WHERE project_id = ? AND environment_id = ? ORDER BY id LIMIT 1",
            WORKSPACE_COLUMNS
        ))
        .bind(project_id)
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkspaceRecord::try_from).transpose()
    }

    async fn list_commit_run_outcomes(
        &self,
        workspace_id: &str,
        commit_sha: &str,
    ) -> Result<Vec<RunOutcome>, CoreError> {
        let rows = sqlx::query_as::<_, OutcomeRow>(
            r#"
            SELECT r.id AS run_id, r.status AS run_status,
                   (SELECT pl.status FROM plans pl WHERE pl.run_id = r.id
                    ORDER BY pl.created_at DESC, pl.rowid DESC LIMIT 1) AS plan_status,
                   (SELECT ap.status FROM applies ap WHERE ap.run_id = r.id
                    ORDER BY ap.created_at DESC, ap.rowid DESC LIMIT 1) AS apply_status
            FROM runs r
            JOIN configuration_versions cv ON cv.id = r.configuration_version_id
            WHERE r.workspace_id = ? AND cv.ingress_commit_sha = ?
            ORDER BY r.created_at
            "#,
        )
        .bind(workspace_id)
        .bind(commit_sha)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn release_workspace_lock(
        &self,
        workspace_id: &str,
        run_id: &str,
    ) -> Result<bool, CoreError> {
        let released = sqlx::query(
            "UPDATE workspaces SET locked_by_run_id = NULL WHERE id = ? AND locked_by_run_id = ?",
        )
        .bind(workspace_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if released.rows_affected() == 1 {
            return Ok(true);
        }

        let holder: Option<Option<String>> =
            sqlx::query_scalar("SELECT locked_by_run_id FROM workspaces WHERE id = ?")
                .bind(workspace_id)
                .fetch_optional(&self.pool)
                .await?;
        match holder {
            None => Err(CoreError::not_found("workspace", workspace_id)),
            Some(None) => Ok(true),
            Some(Some(_)) => Ok(false),
        }
    }

    async fn force_unlock_workspace(&self, workspace_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE workspaces SET locked_by_run_id = NULL WHERE id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("workspace", workspace_id));
        }
        Ok(())
    }

    async fn get_tool(&self, tool_id: &str) -> Result<Option<ToolRecord>, CoreError> {
        let record = sqlx::query_as::<_, ToolRecord>(
            "SELECT id, tool_type, version, url, checksum FROM tools WHERE id = ?",
        )
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn find_tool_by_version(&self, version: &str) -> Result<Option<ToolRecord>, CoreError> {
        let record = sqlx::query_as::<_, ToolRecord>(
            r#"
            SELECT id, tool_type, version, url, checksum FROM tools
            WHERE tool_type = 'terraform_version' AND version = ?
            "#,
        )
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_status_history(
        &self,
        subject: &AuditSubject,
    ) -> Result<Vec<StatusTransition>, CoreError> {
        let records = sqlx::query_as::<_, StatusTransition>(
            r#"
            SELECT id, old_status, new_status, created_at FROM audit_events
            WHERE object_type = ? AND object_id = ?
            ORDER BY id
            "#,
        )
        .bind(subject.object_type())
        .bind(subject.object_id())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn health_check_db(&self) -> Result<(), CoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
