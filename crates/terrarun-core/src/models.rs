// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain records and status enums shared by the persistence layer and the engine.
//!
//! Every enum here is stored as snake_case text. Parsing goes through
//! [`parse_stored`] so an unknown value surfaces as [`CoreError::InvalidValue`]
//! instead of silently defaulting.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::error::CoreError;

/// Parse a stored enum value, naming the field on failure.
pub fn parse_stored<T: FromStr>(field: &'static str, value: &str) -> Result<T, CoreError> {
    value.parse().map_err(|_| CoreError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Generate a prefixed record id, e.g. `run-3f2a...`.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Run
// ============================================================================

/// Status of a Run.
///
/// ```text
/// pending ─► pre_plan_running ─► pre_plan_completed ─► queuing ─► plan_queued ─► planning
///                                                                                   │
///            ┌───────────────────────────── planned_and_finished ◄──────────────────┤
///            │                                                                      ▼
///            │   confirmed ◄── post_plan_completed ◄── post_plan_running ◄──── planned
///            │       │                    │
///            │       ▼                    └──► discarded
///            │   pre_apply_running ─► pre_apply_completed ─► apply_queued ─► applying ─► applied
///            │
///  any non-terminal ──► canceled ──► force_canceled        errors ──► errored
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Pending,
    PrePlanRunning,
    PrePlanCompleted,
    Queuing,
    PlanQueued,
    Planning,
    Planned,
    PostPlanRunning,
    PostPlanCompleted,
    Confirmed,
    PreApplyRunning,
    PreApplyCompleted,
    ApplyQueued,
    Applying,
    PlannedAndFinished,
    Applied,
    Discarded,
    Errored,
    Canceled,
    ForceCanceled,
}

impl RunStatus {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Terminal statuses end the Run and release its workspace lock.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PlannedAndFinished
                | Self::Applied
                | Self::Discarded
                | Self::Errored
                | Self::Canceled
                | Self::ForceCanceled
        )
    }

    /// Cancellation statuses swallow every later status update.
    pub fn is_absorbing(&self) -> bool {
        matches!(self, Self::Canceled | Self::ForceCanceled)
    }

    /// Whether a Run in this status may be moved to `next`.
    ///
    /// Any non-terminal Run may be canceled. Terminal statuses are final,
    /// with the single exception of escalating a cancel into a force-cancel.
    /// A plan or apply result may arrive without a prior running report, so
    /// the queued statuses may skip straight to the outcome.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;

        if self.is_terminal() {
            return *self == Canceled && next == ForceCanceled;
        }
        if next == Canceled {
            return true;
        }
        match self {
            Pending => next == PrePlanRunning,
            PrePlanRunning => matches!(next, PrePlanCompleted | Errored),
            PrePlanCompleted => next == Queuing,
            Queuing => next == PlanQueued,
            PlanQueued | Planning => {
                matches!(next, Planning | Planned | PlannedAndFinished | Errored) && next != *self
            }
            Planned => next == PostPlanRunning,
            PostPlanRunning => matches!(next, PostPlanCompleted | Errored),
            PostPlanCompleted => matches!(next, Confirmed | Discarded),
            Confirmed => next == PreApplyRunning,
            PreApplyRunning => matches!(next, PreApplyCompleted | Errored),
            PreApplyCompleted => next == ApplyQueued,
            ApplyQueued | Applying => matches!(next, Applying | Applied | Errored) && next != *self,
            PlannedAndFinished | Applied | Discarded | Errored | Canceled | ForceCanceled => false,
        }
    }
}

// ============================================================================
// Plan / Apply
// ============================================================================

/// Which terraform command a [`CommandRecord`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    Plan,
    Apply,
}

impl CommandKind {
    /// Table holding records of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Plan => "plans",
            Self::Apply => "applies",
        }
    }

    /// Audit subject for a record of this kind.
    pub fn audit_subject(&self, id: &str) -> AuditSubject {
        match self {
            Self::Plan => AuditSubject::Plan(id.to_string()),
            Self::Apply => AuditSubject::Apply(id.to_string()),
        }
    }
}

/// Status of a Plan or Apply.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Errored,
    Canceled,
    Finished,
    Unreachable,
}

impl CommandStatus {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Whether the command has stopped executing.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Resource counters reported by an agent for a finished Plan or Apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCounts {
    pub has_changes: bool,
    pub additions: i64,
    pub changes: i64,
    pub destructions: i64,
}

/// One Plan or Apply execution belonging to a Run.
#[derive(Debug, Clone)]
pub struct CommandRecord {
    pub id: String,
    pub run_id: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub resources: ResourceCounts,
    /// Blob path of the command's log output, once something was written.
    pub log_blob_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Job queue
// ============================================================================

/// Queue lane of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobLane {
    /// Internal continuation picked up by the worker poll loop.
    Worker,
    /// Terraform execution picked up by a remote agent.
    Agent,
}

impl JobLane {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Kind of work an AGENT-lane job asks for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    Plan,
    Apply,
    Policy,
    Assessment,
    Test,
}

impl JobType {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// A row of the shared job queue.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: i64,
    pub run_id: String,
    pub lane: JobLane,
    pub job_type: Option<JobType>,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An unassigned AGENT-lane job together with every level of its override chain.
///
/// The persistence layer only gathers the raw values; choosing which level
/// wins is the matcher's business.
#[derive(Debug, Clone)]
pub struct AgentJobCandidate {
    pub job_id: i64,
    pub run_id: String,
    pub job_type: JobType,
    pub organisation_id: String,
    pub workspace_execution_mode: Option<ExecutionMode>,
    pub project_execution_mode: Option<ExecutionMode>,
    pub organisation_execution_mode: ExecutionMode,
    pub workspace_agent_pool_id: Option<String>,
    pub project_agent_pool_id: Option<String>,
    pub environment_agent_pool_id: Option<String>,
    pub organisation_agent_pool_id: Option<String>,
}

/// Where a Run's plan and apply execute.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    Remote,
    Local,
    Agent,
}

impl ExecutionMode {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// A remote worker process.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub agent_pool_id: String,
    pub last_checkin_at: Option<DateTime<Utc>>,
}

/// A named group of agents, optionally scoped to one organisation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentPoolRecord {
    pub id: String,
    pub name: String,
    pub organisation_id: Option<String>,
}

// ============================================================================
// Run aggregate
// ============================================================================

/// One plan/apply request against a workspace.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub tool_id: String,
    pub status: RunStatus,
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

/// Input for [`crate::persistence::Persistence::create_run`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub tool_id: String,
    pub auto_apply: bool,
    pub plan_only: bool,
    pub refresh: bool,
    pub refresh_only: bool,
    pub is_destroy: bool,
    pub message: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Which actor column of a Run to fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunActor {
    Canceled,
    Discarded,
}

// ============================================================================
// Tasks
// ============================================================================

/// Integration checkpoint of a Run.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStageName {
    PrePlan,
    PostPlan,
    PreApply,
}

impl TaskStageName {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Status of a TaskStage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStageStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Canceled,
    Errored,
    Unreachable,
}

impl TaskStageStatus {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Status of a single TaskResult.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskResultStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Canceled,
    Errored,
    Unreachable,
}

impl TaskResultStatus {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Pending and running results still hold their stage open.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Whether a failing task blocks the Run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnforcementLevel {
    Advisory,
    Mandatory,
}

impl EnforcementLevel {
    /// Stored text form.
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// One integration checkpoint bound to a Run.
#[derive(Debug, Clone)]
pub struct TaskStageRecord {
    pub id: String,
    pub run_id: String,
    pub stage: TaskStageName,
    pub status: TaskStageStatus,
    pub created_at: DateTime<Utc>,
}

/// One external check instance, joined with the task it runs.
#[derive(Debug, Clone)]
pub struct TaskResultRecord {
    pub id: String,
    pub task_stage_id: String,
    pub workspace_task_id: String,
    pub task_name: String,
    /// Endpoint the check is dispatched to.
    pub task_url: String,
    /// Shared secret used to sign dispatch payloads.
    pub hmac_key: Option<String>,
    pub enforcement_level: EnforcementLevel,
    /// Opaque id authenticating the integration's callback.
    pub callback_id: String,
    pub status: TaskResultStatus,
    pub message: Option<String>,
    /// Details link reported back by the integration.
    pub result_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Partial update of a TaskResult. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default)]
pub struct TaskResultUpdate {
    pub status: Option<TaskResultStatus>,
    pub message: Option<String>,
    pub result_url: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Workspaces, projects, lifecycles
// ============================================================================

/// Snapshot of the configuration a Run plans against.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigurationVersionRecord {
    pub id: String,
    pub workspace_id: String,
    pub speculative: bool,
    /// Commit SHA of the VCS ingress, if the upload came from VCS.
    pub ingress_commit_sha: Option<String>,
    pub ingress_branch: Option<String>,
}

impl ConfigurationVersionRecord {
    /// Whether VCS ingress metadata is attached.
    pub fn has_ingress(&self) -> bool {
        self.ingress_commit_sha.is_some()
    }
}

/// A workspace and its execution overrides.
#[derive(Debug, Clone)]
pub struct WorkspaceRecord {
    pub id: String,
    pub name: String,
    pub organisation_id: String,
    pub project_id: String,
    pub environment_id: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    pub agent_pool_id: Option<String>,
    pub tool_id: Option<String>,
    pub auto_apply: bool,
    pub locked_by_run_id: Option<String>,
}

/// A project, the owner of a Lifecycle binding.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub organisation_id: String,
    pub lifecycle_id: Option<String>,
}

/// One ordered group of a promotion Lifecycle.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LifecycleGroupRecord {
    pub id: String,
    pub lifecycle_id: String,
    pub group_order: i32,
    pub minimum_runs: Option<i32>,
    pub minimum_successful_plans: Option<i32>,
    pub minimum_successful_applies: Option<i32>,
}

/// How one Run for a commit ended up, as far as promotion is concerned.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_status: RunStatus,
    pub plan_status: Option<CommandStatus>,
    pub apply_status: Option<CommandStatus>,
}

/// A terraform binary resolvable by version.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ToolRecord {
    pub id: String,
    pub tool_type: String,
    pub version: String,
    pub url: Option<String>,
    pub checksum: Option<String>,
}

// ============================================================================
// Audit log
// ============================================================================

/// Aggregate whose status changes are recorded in the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditSubject {
    Run(String),
    Plan(String),
    Apply(String),
    TaskStage(String),
    TaskResult(String),
}

impl AuditSubject {
    /// Stored object type.
    pub fn object_type(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Plan(_) => "plan",
            Self::Apply(_) => "apply",
            Self::TaskStage(_) => "task_stage",
            Self::TaskResult(_) => "task_result",
        }
    }

    /// Id of the audited object.
    pub fn object_id(&self) -> &str {
        match self {
            Self::Run(id)
            | Self::Plan(id)
            | Self::Apply(id)
            | Self::TaskStage(id)
            | Self::TaskResult(id) => id,
        }
    }
}

/// One immutable audit entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StatusTransition {
    pub id: i64,
    pub old_status: Option<String>,
    pub new_status: String,
    pub created_at: DateTime<Utc>,
}
