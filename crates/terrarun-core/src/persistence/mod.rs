// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for terrarun-core.
//!
//! [`Persistence`] is the narrow repository the engine drives. Every status
//! write that goes through it also appends to the audit log inside the same
//! transaction, so the history can never drift from the current state.

pub mod postgres;
mod rows;
pub mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    AgentJobCandidate, AgentPoolRecord, AgentRecord, AuditSubject, CommandKind, CommandRecord,
    CommandStatus, ConfigurationVersionRecord, ExecutionMode, JobLane, JobRecord, JobType,
    LifecycleGroupRecord, NewRun, ProjectRecord, ResourceCounts, RunActor, RunOutcome, RunRecord,
    RunStatus, StatusTransition, TaskResultRecord, TaskResultUpdate, TaskStageName, TaskStageRecord,
    TaskStageStatus, ToolRecord, WorkspaceRecord,
};

/// Persistence interface used by the engine.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Create a Run and everything that hangs off it, atomically.
    ///
    /// Locks the workspace, inserts the run with status `pending` plus its
    /// first audit entry, creates one TaskStage per stage with a TaskResult
    /// for each active workspace task of that stage, and enqueues the first
    /// WORKER job. Fails with [`CoreError::WorkspaceLocked`] and persists
    /// nothing if another Run holds the workspace.
    async fn create_run(&self, run: &NewRun) -> Result<RunRecord, CoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// Move a Run to `next` if its current status allows it.
    ///
    /// Returns the previous status when the move was written, `None` when
    /// [`RunStatus::can_transition_to`] refused it.
    async fn transition_run(
        &self,
        run_id: &str,
        next: RunStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<RunStatus>, CoreError>;

    async fn confirm_run(&self, run_id: &str, confirmed_by: Option<&str>)
    -> Result<(), CoreError>;

    async fn set_run_actor(
        &self,
        run_id: &str,
        actor: RunActor,
        user: Option<&str>,
    ) -> Result<(), CoreError>;

    async fn add_run_comment(
        &self,
        run_id: &str,
        body: &str,
        created_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Plans and applies
    // ------------------------------------------------------------------

    async fn create_command(
        &self,
        kind: CommandKind,
        run_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CommandRecord, CoreError>;

    /// The current (most recently created) Plan or Apply of a Run.
    async fn latest_command(
        &self,
        kind: CommandKind,
        run_id: &str,
    ) -> Result<Option<CommandRecord>, CoreError>;

    async fn update_command_status(
        &self,
        kind: CommandKind,
        command_id: &str,
        status: CommandStatus,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn update_command_resources(
        &self,
        kind: CommandKind,
        command_id: &str,
        resources: &ResourceCounts,
    ) -> Result<(), CoreError>;

    async fn set_command_log_blob(
        &self,
        kind: CommandKind,
        command_id: &str,
        path: &str,
    ) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Job queue
    // ------------------------------------------------------------------

    async fn enqueue_job(
        &self,
        run_id: &str,
        lane: JobLane,
        job_type: Option<JobType>,
        at: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    /// Claim-and-delete the oldest WORKER job. Never blocks.
    async fn claim_worker_job(&self) -> Result<Option<JobRecord>, CoreError>;

    /// Unassigned AGENT jobs of the given types, oldest first, with their
    /// override chains.
    async fn list_agent_job_candidates(
        &self,
        job_types: &[JobType],
    ) -> Result<Vec<AgentJobCandidate>, CoreError>;

    /// Assign a job to an agent if it is still unassigned.
    ///
    /// Returns `false` when another agent got there first.
    async fn claim_agent_job(&self, job_id: i64, agent_id: &str) -> Result<bool, CoreError>;

    async fn count_jobs(
        &self,
        run_id: &str,
        lane: JobLane,
        job_type: Option<JobType>,
    ) -> Result<i64, CoreError>;

    /// Remove finished AGENT jobs of a Run for one job type.
    async fn delete_agent_jobs(&self, run_id: &str, job_type: JobType) -> Result<u64, CoreError>;

    async fn delete_jobs_for_run(&self, run_id: &str) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, CoreError>;

    async fn get_agent_pool(&self, pool_id: &str) -> Result<Option<AgentPoolRecord>, CoreError>;

    async fn touch_agent(&self, agent_id: &str, at: DateTime<Utc>) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    async fn get_task_stage(
        &self,
        run_id: &str,
        stage: TaskStageName,
    ) -> Result<Option<TaskStageRecord>, CoreError>;

    async fn list_task_stages(&self, run_id: &str) -> Result<Vec<TaskStageRecord>, CoreError>;

    async fn list_task_results(
        &self,
        task_stage_id: &str,
    ) -> Result<Vec<TaskResultRecord>, CoreError>;

    async fn update_task_stage_status(
        &self,
        task_stage_id: &str,
        status: TaskStageStatus,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Apply a partial update. A status change is audited.
    async fn update_task_result(
        &self,
        task_result_id: &str,
        update: &TaskResultUpdate,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn get_task_result_by_callback_id(
        &self,
        callback_id: &str,
    ) -> Result<Option<TaskResultRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Workspaces, projects, lifecycles
    // ------------------------------------------------------------------

    async fn get_configuration_version(
        &self,
        id: &str,
    ) -> Result<Option<ConfigurationVersionRecord>, CoreError>;

    async fn get_workspace(&self, id: &str) -> Result<Option<WorkspaceRecord>, CoreError>;

    async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>, CoreError>;

    /// Execution mode of a Run, resolved workspace -> project -> organisation.
    async fn get_run_execution_mode(
        &self,
        run_id: &str,
    ) -> Result<Option<ExecutionMode>, CoreError>;

    /// The group of `lifecycle_id` that contains `environment_id`.
    async fn get_lifecycle_group_for_environment(
        &self,
        lifecycle_id: &str,
        environment_id: &str,
    ) -> Result<Option<LifecycleGroupRecord>, CoreError>;

    async fn get_lifecycle_group_by_order(
        &self,
        lifecycle_id: &str,
        group_order: i32,
    ) -> Result<Option<LifecycleGroupRecord>, CoreError>;

    async fn list_group_environment_ids(&self, group_id: &str) -> Result<Vec<String>, CoreError>;

    async fn find_project_workspace(
        &self,
        project_id: &str,
        environment_id: &str,
    ) -> Result<Option<WorkspaceRecord>, CoreError>;

    /// Runs of a workspace whose configuration version came from `commit_sha`,
    /// with the status of each run's latest Plan and Apply.
    async fn list_commit_run_outcomes(
        &self,
        workspace_id: &str,
        commit_sha: &str,
    ) -> Result<Vec<RunOutcome>, CoreError>;

    // ------------------------------------------------------------------
    // Workspace lock
    // ------------------------------------------------------------------

    /// Clear the lock if `run_id` holds it.
    ///
    /// Returns `true` if the lock was released or already free, `false` if a
    /// different Run holds it.
    async fn release_workspace_lock(
        &self,
        workspace_id: &str,
        run_id: &str,
    ) -> Result<bool, CoreError>;

    async fn force_unlock_workspace(&self, workspace_id: &str) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Tools
    // ------------------------------------------------------------------

    async fn get_tool(&self, tool_id: &str) -> Result<Option<ToolRecord>, CoreError>;

    async fn find_tool_by_version(&self, version: &str) -> Result<Option<ToolRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Audit entries of one object, oldest first.
    async fn list_status_history(
        &self,
        subject: &AuditSubject,
    ) -> Result<Vec<StatusTransition>, CoreError>;

    async fn health_check_db(&self) -> Result<(), CoreError>;
}
