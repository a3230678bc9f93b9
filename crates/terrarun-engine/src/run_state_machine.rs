// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The Run state machine.
//!
//! A Run moves through its statuses driven by two sources: the worker poll
//! loop (one WORKER job per step) and agent status updates for its Plan and
//! Apply.
//!
//! ```text
//! pending -> pre_plan_running -> pre_plan_completed -> queuing -> plan_queued
//!   -> planning -> planned | planned_and_finished | errored
//! planned -> post_plan_running -> post_plan_completed -> confirmed
//!   -> pre_apply_running -> pre_apply_completed -> apply_queued
//!   -> applying -> applied | errored
//! ```
//!
//! Any non-terminal Run can be canceled; once canceled every later update is
//! ignored. Reaching a terminal status releases the workspace lock. Agent
//! reports are only accepted while the Run waits on that command: plan
//! reports in plan_queued or planning, apply reports in apply_queued or
//! applying.
//!
//! Queued work goes to an agent unless the Run's execution mode resolves to
//! LOCAL, in which case the worker runs terraform itself through
//! [`LocalExecutor`] and feeds the outcome back as a status report.
//!
//! Every status write goes through [`Persistence::transition_run`], which
//! refuses moves out of terminal statuses and writes the audit record in the
//! same transaction.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use terrarun_core::Persistence;
use terrarun_core::models::{
    AuditSubject, CommandKind, CommandStatus, ExecutionMode, JobLane, JobType, NewRun,
    ResourceCounts, RunActor, RunRecord, RunStatus, StatusTransition, TaskStageName, new_id,
};
use tracing::{debug, info, instrument, warn};

use crate::command::{Apply, BlobStore, ExecutableCommand, Plan};
use crate::error::{Error, Result};
use crate::executor::{ExecutionOutcome, LocalExecution, LocalExecutor};
use crate::job_queue::JobQueue;
use crate::promotion::PromotionGate;
use crate::task_orchestrator::{StageOutcome, TaskOrchestrator};
use crate::workspace_lock::WorkspaceLock;

/// Options for a new Run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAttributes {
    /// Terraform version to run with. Defaults to the workspace's tool.
    #[serde(default)]
    pub terraform_version: Option<String>,
    /// Overrides the workspace's auto-apply setting.
    #[serde(default)]
    pub auto_apply: Option<bool>,
    #[serde(default)]
    pub plan_only: bool,
    #[serde(default = "default_refresh")]
    pub refresh: bool,
    #[serde(default)]
    pub refresh_only: bool,
    #[serde(default)]
    pub is_destroy: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_refresh() -> bool {
    true
}

impl Default for RunAttributes {
    fn default() -> Self {
        Self {
            terraform_version: None,
            auto_apply: None,
            plan_only: false,
            refresh: true,
            refresh_only: false,
            is_destroy: false,
            message: None,
        }
    }
}

/// Status report posted by an agent for a Plan or Apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandStatusUpdate {
    pub run_id: String,
    pub status: String,
    #[serde(default)]
    pub has_changes: Option<bool>,
    #[serde(default)]
    pub resource_additions: Option<i64>,
    #[serde(default)]
    pub resource_changes: Option<i64>,
    #[serde(default)]
    pub resource_destructions: Option<i64>,
}

impl CommandStatusUpdate {
    fn command_status(&self) -> Result<CommandStatus> {
        self.status
            .to_ascii_lowercase()
            .parse()
            .map_err(|_| Error::UnhandledStatus(self.status.clone()))
    }

    fn resources(&self) -> ResourceCounts {
        ResourceCounts {
            has_changes: self.has_changes.unwrap_or(false),
            additions: self.resource_additions.unwrap_or(0),
            changes: self.resource_changes.unwrap_or(0),
            destructions: self.resource_destructions.unwrap_or(0),
        }
    }
}

/// Owns the Run aggregate.
#[derive(Clone)]
pub struct RunStateMachine {
    persistence: Arc<dyn Persistence>,
    blobs: Arc<dyn BlobStore>,
    queue: JobQueue,
    tasks: TaskOrchestrator,
    promotion: PromotionGate,
    lock: WorkspaceLock,
    local: LocalExecution,
    executor: LocalExecutor,
}

impl RunStateMachine {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        blobs: Arc<dyn BlobStore>,
        queue: JobQueue,
        tasks: TaskOrchestrator,
    ) -> Self {
        let local = LocalExecution::default();
        Self {
            promotion: PromotionGate::new(persistence.clone()),
            lock: WorkspaceLock::new(persistence.clone()),
            executor: LocalExecutor::new(persistence.clone(), local.watch_interval),
            local,
            persistence,
            blobs,
            queue,
            tasks,
        }
    }

    /// Run LOCAL-mode Runs with `local` instead of the defaults.
    pub fn with_local_execution(mut self, local: LocalExecution) -> Self {
        self.executor = LocalExecutor::new(self.persistence.clone(), local.watch_interval);
        self.local = local;
        self
    }

    pub fn job_queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn task_orchestrator(&self) -> &TaskOrchestrator {
        &self.tasks
    }

    pub fn workspace_lock(&self) -> &WorkspaceLock {
        &self.lock
    }

    /// Load a Run.
    pub async fn get(&self, run_id: &str) -> Result<RunRecord> {
        self.persistence
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Audit records of a Run, oldest first.
    pub async fn status_history(&self, run_id: &str) -> Result<Vec<StatusTransition>> {
        Ok(self
            .persistence
            .list_status_history(&AuditSubject::Run(run_id.to_string()))
            .await?)
    }

    // ------------------------------------------------------------------
    // Actor operations
    // ------------------------------------------------------------------

    /// Create a Run of `configuration_version_id`.
    ///
    /// Fails with [`Error::ToolNotConfigured`] or [`Error::PromotionRejected`]
    /// without persisting anything.
    #[instrument(skip(self, attributes))]
    pub async fn create(
        &self,
        configuration_version_id: &str,
        created_by: Option<&str>,
        attributes: RunAttributes,
    ) -> Result<RunRecord> {
        let configuration_version = self
            .persistence
            .get_configuration_version(configuration_version_id)
            .await?
            .ok_or_else(|| {
                Error::Core(terrarun_core::CoreError::NotFound {
                    entity: "configuration_version",
                    id: configuration_version_id.to_string(),
                })
            })?;
        let workspace = self
            .persistence
            .get_workspace(&configuration_version.workspace_id)
            .await?
            .ok_or_else(|| {
                Error::Core(terrarun_core::CoreError::NotFound {
                    entity: "workspace",
                    id: configuration_version.workspace_id.clone(),
                })
            })?;

        let tool = match attributes.terraform_version.as_deref() {
            Some(version) => self.persistence.find_tool_by_version(version).await?,
            None => match workspace.tool_id.as_deref() {
                Some(tool_id) => self.persistence.get_tool(tool_id).await?,
                None => None,
            },
        };
        let tool = tool.ok_or_else(|| Error::ToolNotConfigured(workspace.id.clone()))?;

        self.promotion
            .check(&configuration_version, &workspace)
            .await?;

        let run = self
            .persistence
            .create_run(&NewRun {
                id: new_id("run"),
                workspace_id: workspace.id.clone(),
                configuration_version_id: configuration_version.id.clone(),
                tool_id: tool.id,
                auto_apply: attributes.auto_apply.unwrap_or(workspace.auto_apply),
                plan_only: attributes.plan_only || configuration_version.speculative,
                refresh: attributes.refresh,
                refresh_only: attributes.refresh_only,
                is_destroy: attributes.is_destroy,
                message: attributes.message,
                created_by: created_by.map(String::from),
                created_at: Utc::now(),
            })
            .await?;

        info!(run_id = %run.id, workspace_id = %run.workspace_id, "Run created");
        Ok(run)
    }

    /// Cancel a Run that has not finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, run_id: &str, user: Option<&str>) -> Result<RunRecord> {
        let mut run = self.get(run_id).await?;
        if run.status.is_terminal() || !self.transition(&mut run, RunStatus::Canceled).await? {
            return Err(Error::RunCannotBeCanceled {
                run_id: run.id,
                status: run.status.to_string(),
            });
        }
        self.persistence
            .set_run_actor(&run.id, RunActor::Canceled, user)
            .await?;

        for kind in [CommandKind::Plan, CommandKind::Apply] {
            if let Some(command) = self.persistence.latest_command(kind, &run.id).await?
                && !command.status.is_terminal()
            {
                self.persistence
                    .update_command_status(kind, &command.id, CommandStatus::Canceled, Utc::now())
                    .await?;
            }
        }
        let removed = self.persistence.delete_jobs_for_run(&run.id).await?;
        debug!(run_id = %run.id, removed, "Removed queued jobs of canceled run");

        self.get(&run.id).await
    }

    /// Escalate a canceled Run to force-canceled.
    #[instrument(skip(self))]
    pub async fn force_cancel(&self, run_id: &str, user: Option<&str>) -> Result<RunRecord> {
        let mut run = self.get(run_id).await?;
        if run.status != RunStatus::Canceled
            || !self.transition(&mut run, RunStatus::ForceCanceled).await?
        {
            return Err(Error::RunCannotBeCanceled {
                run_id: run.id,
                status: run.status.to_string(),
            });
        }
        self.persistence
            .set_run_actor(&run.id, RunActor::Canceled, user)
            .await?;
        self.get(&run.id).await
    }

    /// Discard a planned Run instead of applying it.
    ///
    /// Legal only in POST_PLAN_COMPLETED; otherwise the lock is left as is.
    #[instrument(skip(self))]
    pub async fn discard(&self, run_id: &str, user: Option<&str>) -> Result<RunRecord> {
        let mut run = self.get(run_id).await?;
        if run.status != RunStatus::PostPlanCompleted {
            return Err(Error::RunCannotBeDiscarded {
                run_id: run.id,
                status: run.status.to_string(),
            });
        }

        if !self.transition(&mut run, RunStatus::Discarded).await? {
            return Err(Error::RunCannotBeDiscarded {
                run_id: run.id,
                status: run.status.to_string(),
            });
        }

        if let Some(apply) = self
            .persistence
            .latest_command(CommandKind::Apply, &run.id)
            .await?
            && !apply.status.is_terminal()
        {
            self.persistence
                .update_command_status(
                    CommandKind::Apply,
                    &apply.id,
                    CommandStatus::Unreachable,
                    Utc::now(),
                )
                .await?;
        }
        self.persistence
            .set_run_actor(&run.id, RunActor::Discarded, user)
            .await?;
        self.get(&run.id).await
    }

    /// Approve a planned Run for apply.
    ///
    /// Legal while PLANNED, POST_PLAN_RUNNING or POST_PLAN_COMPLETED and not
    /// yet confirmed. A Run still in post-plan checks moves on once they pass.
    #[instrument(skip(self, comment))]
    pub async fn confirm(
        &self,
        run_id: &str,
        comment: Option<&str>,
        user: Option<&str>,
    ) -> Result<RunRecord> {
        let mut run = self.get(run_id).await?;
        let confirmable = matches!(
            run.status,
            RunStatus::Planned | RunStatus::PostPlanRunning | RunStatus::PostPlanCompleted
        );
        if !confirmable || run.confirmed {
            return Err(Error::RunCannotBeConfirmed {
                run_id: run.id,
                status: run.status.to_string(),
            });
        }

        self.persistence.confirm_run(&run.id, user).await?;
        if let Some(body) = comment.filter(|c| !c.trim().is_empty()) {
            self.persistence
                .add_run_comment(&run.id, body, user, Utc::now())
                .await?;
        }
        run.confirmed = true;

        if run.status == RunStatus::PostPlanCompleted
            && self.transition(&mut run, RunStatus::Confirmed).await?
        {
            self.queue.enqueue_worker(&run.id).await?;
        }
        self.get(&run.id).await
    }

    // ------------------------------------------------------------------
    // Worker lane
    // ------------------------------------------------------------------

    /// Advance a Run by one worker step.
    ///
    /// On error the Run keeps its status; the caller re-queues the job.
    #[instrument(skip(self, run), fields(run_id = %run.id, status = %run.status))]
    pub async fn handle_worker_job(&self, run: RunRecord) -> Result<()> {
        let mut run = run;
        match run.status {
            RunStatus::Pending => self.start_plan(&mut run).await,
            RunStatus::PrePlanRunning => self.poll_stage(&mut run, TaskStageName::PrePlan).await,
            RunStatus::PrePlanCompleted | RunStatus::Queuing => self.queue_plan(&mut run).await,
            RunStatus::PlanQueued => self.resume_queued(&run, JobType::Plan).await,
            RunStatus::Planned => {
                self.ensure_apply(&run).await?;
                self.start_stage(&mut run, TaskStageName::PostPlan, RunStatus::PostPlanRunning)
                    .await
            }
            RunStatus::PostPlanRunning => self.poll_stage(&mut run, TaskStageName::PostPlan).await,
            RunStatus::PostPlanCompleted => self.maybe_confirm(&mut run).await,
            RunStatus::Confirmed => {
                self.start_stage(&mut run, TaskStageName::PreApply, RunStatus::PreApplyRunning)
                    .await
            }
            RunStatus::PreApplyRunning => self.poll_stage(&mut run, TaskStageName::PreApply).await,
            RunStatus::PreApplyCompleted => self.queue_apply(&mut run).await,
            RunStatus::ApplyQueued => self.resume_queued(&run, JobType::Apply).await,
            RunStatus::Planning | RunStatus::Applying => {
                debug!("Run is executing, nothing to do");
                Ok(())
            }
            RunStatus::Canceled | RunStatus::ForceCanceled => {
                debug!("Ignoring worker job for canceled run");
                self.lock
                    .release_on_terminal(&run.workspace_id, &run.id)
                    .await
            }
            RunStatus::PlannedAndFinished
            | RunStatus::Applied
            | RunStatus::Discarded
            | RunStatus::Errored => {
                debug!("Ignoring worker job for finished run");
                Ok(())
            }
        }
    }

    async fn start_plan(&self, run: &mut RunRecord) -> Result<()> {
        Plan::create(self.persistence.clone(), self.blobs.clone(), &run.id).await?;
        self.start_stage(run, TaskStageName::PrePlan, RunStatus::PrePlanRunning)
            .await
    }

    /// Dispatch a stage's tasks, move to its running status and re-queue.
    async fn start_stage(
        &self,
        run: &mut RunRecord,
        stage: TaskStageName,
        running: RunStatus,
    ) -> Result<()> {
        self.tasks.execute(run, stage).await?;
        if self.transition(run, running).await? {
            self.queue.enqueue_worker(&run.id).await?;
        }
        Ok(())
    }

    async fn poll_stage(&self, run: &mut RunRecord, stage: TaskStageName) -> Result<()> {
        match self.tasks.check_status(run, stage, Utc::now()).await? {
            StageOutcome::Incomplete => {
                self.queue.enqueue_worker(&run.id).await?;
                Ok(())
            }
            StageOutcome::Halted(status) => {
                self.transition(run, status).await?;
                Ok(())
            }
            StageOutcome::Complete => match stage {
                TaskStageName::PrePlan => {
                    if self.transition(run, RunStatus::PrePlanCompleted).await? {
                        self.queue_plan(run).await?;
                    }
                    Ok(())
                }
                TaskStageName::PostPlan => {
                    if self.transition(run, RunStatus::PostPlanCompleted).await? {
                        self.maybe_confirm(run).await?;
                    }
                    Ok(())
                }
                TaskStageName::PreApply => {
                    if self.transition(run, RunStatus::PreApplyCompleted).await? {
                        self.queue_apply(run).await?;
                    }
                    Ok(())
                }
            },
        }
    }

    async fn queue_plan(&self, run: &mut RunRecord) -> Result<()> {
        if run.status == RunStatus::PrePlanCompleted
            && !self.transition(run, RunStatus::Queuing).await?
        {
            return Ok(());
        }
        if self.transition(run, RunStatus::PlanQueued).await? {
            self.hand_off(run, JobType::Plan).await?;
        }
        Ok(())
    }

    async fn queue_apply(&self, run: &mut RunRecord) -> Result<()> {
        if self.transition(run, RunStatus::ApplyQueued).await? {
            self.hand_off(run, JobType::Apply).await?;
        }
        Ok(())
    }

    async fn execution_mode(&self, run: &RunRecord) -> Result<ExecutionMode> {
        self.persistence
            .get_run_execution_mode(&run.id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run.id.clone()))
    }

    /// Queue a queued Run's terraform work: for an agent, or for the worker
    /// when the Run executes locally.
    async fn hand_off(&self, run: &RunRecord, job_type: JobType) -> Result<()> {
        if self.execution_mode(run).await? == ExecutionMode::Local {
            debug!(run_id = %run.id, job_type = %job_type, "Run executes locally");
            self.queue.enqueue_worker(&run.id).await?;
        } else {
            self.queue.enqueue_agent(&run.id, job_type).await?;
        }
        Ok(())
    }

    async fn resume_queued(&self, run: &RunRecord, job_type: JobType) -> Result<()> {
        if self.execution_mode(run).await? == ExecutionMode::Local {
            self.execute_locally(run, job_type).await
        } else {
            self.ensure_agent_job(run, job_type).await
        }
    }

    /// Run a queued Plan or Apply in-process and report its outcome.
    ///
    /// The executor's watcher kills terraform if the Run is canceled while it
    /// runs. A process that cannot be started errors the command.
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    async fn execute_locally(&self, run: &RunRecord, job_type: JobType) -> Result<()> {
        let report = |status: CommandStatus, has_changes: Option<bool>| CommandStatusUpdate {
            run_id: run.id.clone(),
            status: status.to_string(),
            has_changes,
            ..Default::default()
        };

        let started = self
            .handle_status_update(job_type, &report(CommandStatus::Running, None))
            .await?;
        let executing = match job_type {
            JobType::Plan => RunStatus::Planning,
            _ => RunStatus::Applying,
        };
        if started.status != executing {
            return Ok(());
        }

        let request = self.local.request(run, job_type).await?;
        let outcome = match job_type {
            JobType::Plan => {
                let mut plan = Plan::latest(self.persistence.clone(), self.blobs.clone(), &run.id)
                    .await?
                    .ok_or_else(|| Error::UnhandledStatus(format!("run {} has no plan", run.id)))?;
                self.executor.execute(&mut plan, &request).await
            }
            _ => {
                let mut apply =
                    Apply::latest(self.persistence.clone(), self.blobs.clone(), &run.id)
                        .await?
                        .ok_or_else(|| {
                            Error::UnhandledStatus(format!("run {} has no apply", run.id))
                        })?;
                self.executor.execute(&mut apply, &request).await
            }
        };

        let (status, has_changes) = match outcome {
            Ok(outcome) => local_report(job_type, &outcome),
            Err(e) => {
                warn!(error = %e, program = %request.program, "Local execution failed to start");
                (CommandStatus::Errored, None)
            }
        };
        self.handle_status_update(job_type, &report(status, has_changes))
            .await?;
        Ok(())
    }

    async fn handle_status_update(
        &self,
        job_type: JobType,
        update: &CommandStatusUpdate,
    ) -> Result<RunRecord> {
        match job_type {
            JobType::Plan => self.handle_plan_status_update(update).await,
            JobType::Apply => self.handle_apply_status_update(update).await,
            other => Err(Error::UnhandledStatus(format!("job type {}", other))),
        }
    }

    /// Create the Apply of a planned Run if the plan report did not.
    async fn ensure_apply(&self, run: &RunRecord) -> Result<()> {
        if self
            .persistence
            .latest_command(CommandKind::Apply, &run.id)
            .await?
            .is_none()
        {
            warn!(run_id = %run.id, "Planned run has no apply, creating it");
            Apply::create(self.persistence.clone(), self.blobs.clone(), &run.id).await?;
        }
        Ok(())
    }

    /// Re-queue the agent job of a queued Run if an earlier step lost it.
    async fn ensure_agent_job(&self, run: &RunRecord, job_type: JobType) -> Result<()> {
        let kind = match job_type {
            JobType::Plan => CommandKind::Plan,
            JobType::Apply => CommandKind::Apply,
            other => return Err(Error::UnhandledStatus(other.to_string())),
        };
        let pending = self
            .persistence
            .latest_command(kind, &run.id)
            .await?
            .is_some_and(|c| c.status == CommandStatus::Pending);
        let queued = self
            .persistence
            .count_jobs(&run.id, JobLane::Agent, Some(job_type))
            .await?;
        if pending && queued == 0 {
            warn!(job_type = %job_type, "Queued run has no agent job, re-queueing");
            self.queue.enqueue_agent(&run.id, job_type).await?;
        }
        Ok(())
    }

    async fn maybe_confirm(&self, run: &mut RunRecord) -> Result<()> {
        if !(run.auto_apply || run.confirmed) {
            info!(run_id = %run.id, "Run awaiting confirmation");
            return Ok(());
        }
        if self.transition(run, RunStatus::Confirmed).await? {
            self.queue.enqueue_worker(&run.id).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Agent lane
    // ------------------------------------------------------------------

    /// Dispatch an agent status update by job type.
    ///
    /// Only plan and apply jobs report status; anything else is rejected
    /// without touching the Run.
    pub async fn handle_agent_status_update(
        &self,
        job_type: &str,
        update: &CommandStatusUpdate,
    ) -> Result<RunRecord> {
        match job_type.to_ascii_lowercase().parse::<JobType>() {
            Ok(JobType::Plan) => self.handle_plan_status_update(update).await,
            Ok(JobType::Apply) => self.handle_apply_status_update(update).await,
            Ok(other) => {
                warn!(run_id = %update.run_id, job_type = %other, "Rejected status update for job type");
                Err(Error::UnhandledStatus(format!("job type {}", other)))
            }
            Err(_) => {
                warn!(run_id = %update.run_id, job_type = %job_type, "Rejected status update for unknown job type");
                Err(Error::UnhandledStatus(format!("job type {}", job_type)))
            }
        }
    }

    /// Apply an agent's report on the Run's current Plan.
    #[instrument(skip(self, update), fields(run_id = %update.run_id, status = %update.status))]
    pub async fn handle_plan_status_update(
        &self,
        update: &CommandStatusUpdate,
    ) -> Result<RunRecord> {
        let mut run = self.get(&update.run_id).await?;
        let status = update.command_status()?;
        if self.ignore_update(&run).await? {
            return Ok(run);
        }
        expect_waiting_on(&run, JobType::Plan)?;
        let mut plan = Plan::latest(self.persistence.clone(), self.blobs.clone(), &run.id)
            .await?
            .ok_or_else(|| Error::UnhandledStatus(format!("run {} has no plan", run.id)))?;
        if status.is_terminal() {
            self.persistence
                .delete_agent_jobs(&run.id, JobType::Plan)
                .await?;
        }

        match status {
            CommandStatus::Pending => {
                return Err(Error::UnhandledStatus(status.to_string()));
            }
            CommandStatus::Running => {
                plan.update_status(status).await?;
                self.transition(&mut run, RunStatus::Planning).await?;
            }
            CommandStatus::Errored | CommandStatus::Unreachable => {
                plan.update_status(status).await?;
                self.transition(&mut run, RunStatus::Errored).await?;
            }
            CommandStatus::Canceled => {
                plan.update_status(status).await?;
                self.transition(&mut run, RunStatus::Canceled).await?;
            }
            CommandStatus::Finished => {
                plan.set_resources(update.resources()).await?;
                plan.update_status(status).await?;

                let speculative = self
                    .persistence
                    .get_configuration_version(&run.configuration_version_id)
                    .await?
                    .is_some_and(|cv| cv.speculative);
                if !plan.has_changes() || run.plan_only || speculative {
                    self.transition(&mut run, RunStatus::PlannedAndFinished)
                        .await?;
                } else if self.transition(&mut run, RunStatus::Planned).await? {
                    // The post-plan step creates the Apply if this fails
                    let created =
                        Apply::create(self.persistence.clone(), self.blobs.clone(), &run.id).await;
                    self.queue.enqueue_worker(&run.id).await?;
                    created?;
                }
            }
        }
        self.get(&run.id).await
    }

    /// Apply an agent's report on the Run's current Apply.
    #[instrument(skip(self, update), fields(run_id = %update.run_id, status = %update.status))]
    pub async fn handle_apply_status_update(
        &self,
        update: &CommandStatusUpdate,
    ) -> Result<RunRecord> {
        let mut run = self.get(&update.run_id).await?;
        let status = update.command_status()?;
        if self.ignore_update(&run).await? {
            return Ok(run);
        }
        expect_waiting_on(&run, JobType::Apply)?;
        let mut apply = Apply::latest(self.persistence.clone(), self.blobs.clone(), &run.id)
            .await?
            .ok_or_else(|| Error::UnhandledStatus(format!("run {} has no apply", run.id)))?;
        if status.is_terminal() {
            self.persistence
                .delete_agent_jobs(&run.id, JobType::Apply)
                .await?;
        }

        match status {
            CommandStatus::Pending => {
                return Err(Error::UnhandledStatus(status.to_string()));
            }
            CommandStatus::Running => {
                apply.update_status(status).await?;
                self.transition(&mut run, RunStatus::Applying).await?;
            }
            CommandStatus::Errored | CommandStatus::Unreachable => {
                apply.update_status(status).await?;
                self.transition(&mut run, RunStatus::Errored).await?;
            }
            CommandStatus::Canceled => {
                apply.update_status(status).await?;
                self.transition(&mut run, RunStatus::Canceled).await?;
            }
            CommandStatus::Finished => {
                apply.set_resources(update.resources()).await?;
                apply.update_status(status).await?;
                self.transition(&mut run, RunStatus::Applied).await?;
            }
        }
        self.get(&run.id).await
    }

    /// Updates for finished Runs are dropped. Canceled Runs also get their
    /// lock released if it is still held.
    async fn ignore_update(&self, run: &RunRecord) -> Result<bool> {
        if !run.status.is_terminal() {
            return Ok(false);
        }
        warn!(run_id = %run.id, status = %run.status, "Ignoring status update for finished run");
        if run.status.is_absorbing() {
            self.lock
                .release_on_terminal(&run.workspace_id, &run.id)
                .await?;
        }
        Ok(true)
    }

    /// Move `run` to `next`, keeping `run` in step with the store.
    ///
    /// Returns `false` when the move was refused, after refreshing `run`.
    async fn transition(&self, run: &mut RunRecord, next: RunStatus) -> Result<bool> {
        match self
            .persistence
            .transition_run(&run.id, next, Utc::now())
            .await?
        {
            Some(previous) => {
                info!(run_id = %run.id, from = %previous, to = %next, "Run transitioned");
                run.status = next;
                if next.is_terminal() {
                    self.lock
                        .release_on_terminal(&run.workspace_id, &run.id)
                        .await?;
                }
                Ok(true)
            }
            None => {
                *run = self.get(&run.id).await?;
                warn!(
                    run_id = %run.id,
                    from = %run.status,
                    to = %next,
                    "Run transition refused"
                );
                if run.status.is_absorbing() {
                    self.lock
                        .release_on_terminal(&run.workspace_id, &run.id)
                        .await?;
                }
                Ok(false)
            }
        }
    }
}

/// Reject a report for a command the Run is not waiting on.
fn expect_waiting_on(run: &RunRecord, job_type: JobType) -> Result<()> {
    let waiting = match job_type {
        JobType::Plan => matches!(run.status, RunStatus::PlanQueued | RunStatus::Planning),
        JobType::Apply => matches!(run.status, RunStatus::ApplyQueued | RunStatus::Applying),
        _ => false,
    };
    if waiting {
        return Ok(());
    }
    warn!(
        run_id = %run.id,
        status = %run.status,
        job_type = %job_type,
        "Rejected status update the run is not waiting for"
    );
    Err(Error::UnexpectedStatusUpdate {
        run_id: run.id.clone(),
        job_type: job_type.to_string(),
        status: run.status.to_string(),
    })
}

/// Status report for a finished local execution.
fn local_report(job_type: JobType, outcome: &ExecutionOutcome) -> (CommandStatus, Option<bool>) {
    match job_type {
        JobType::Plan => {
            let (status, has_changes) = outcome.plan_status();
            (status, Some(has_changes))
        }
        _ => (outcome.command_status(), None),
    }
}
