// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task stages and external integration checks.
//!
//! Every Run has three TaskStages (pre-plan, post-plan, pre-apply), created
//! together with the Run. Each stage holds one TaskResult per active
//! workspace task. The orchestrator:
//!
//! - dispatches a stage's pending results to their integrations
//!   ([`TaskOrchestrator::execute`]),
//! - decides on every worker poll whether the stage is done
//!   ([`TaskOrchestrator::check_status`]),
//! - records integration callbacks ([`TaskOrchestrator::handle_callback`]).
//!
//! Only MANDATORY results can stop a Run. ADVISORY failures are recorded and
//! otherwise ignored.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha512;
use terrarun_core::Persistence;
use terrarun_core::models::{
    CommandKind, CommandStatus, EnforcementLevel, RunRecord, RunStatus, TaskResultRecord,
    TaskResultStatus, TaskResultUpdate, TaskStageName, TaskStageRecord, TaskStageStatus,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::credentials::Credentials;
use crate::error::{Error, Result};

/// Header carrying the hex HMAC-SHA512 of the request body.
pub const SIGNATURE_HEADER: &str = "X-TFC-Task-Signature";

/// How long a dispatched task may run before it is marked errored.
pub const TASK_RESULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

// ============================================================================
// Dispatch transport
// ============================================================================

/// One outbound integration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub url: String,
    pub body: String,
    pub signature: Option<String>,
}

/// Delivers task requests to integrations.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Send one request and return the HTTP status the service answered with.
    ///
    /// `Err` means the service could not be reached at all.
    async fn deliver(&self, request: &TaskRequest) -> std::result::Result<u16, String>;
}

/// Dispatcher posting JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTaskDispatcher {
    client: reqwest::Client,
}

impl HttpTaskDispatcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TaskDispatcher for HttpTaskDispatcher {
    async fn deliver(&self, request: &TaskRequest) -> std::result::Result<u16, String> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Content-Type", "application/json")
            .body(request.body.clone());
        if let Some(signature) = &request.signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", request.url, e))?;
        Ok(response.status().as_u16())
    }
}

/// Dispatcher that records requests instead of sending them.
pub struct MockTaskDispatcher {
    requests: Mutex<Vec<TaskRequest>>,
    failures_left: Mutex<u32>,
    /// Status returned once the scripted failures are used up.
    pub status: u16,
}

impl Default for MockTaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTaskDispatcher {
    /// A dispatcher whose integrations always answer 200.
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failures_left: Mutex::new(0),
            status: 200,
        }
    }

    /// A dispatcher whose first `n` deliveries fail to connect.
    pub fn failing_times(n: u32) -> Self {
        Self {
            failures_left: Mutex::new(n),
            ..Self::new()
        }
    }

    /// A dispatcher whose integrations always answer `status`.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::new()
        }
    }

    /// Every request delivered so far, oldest first.
    pub async fn requests(&self) -> Vec<TaskRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl TaskDispatcher for MockTaskDispatcher {
    async fn deliver(&self, request: &TaskRequest) -> std::result::Result<u16, String> {
        self.requests.lock().await.push(request.clone());
        let mut failures_left = self.failures_left.lock().await;
        if *failures_left > 0 {
            *failures_left -= 1;
            return Err("connection refused".to_string());
        }
        Ok(self.status)
    }
}

/// Hex HMAC-SHA512 of `body` under `key`.
pub fn sign_payload(key: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha512>::new_from_slice(key.as_bytes())
        .map_err(|e| Error::InvalidCredential(format!("invalid HMAC key: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ============================================================================
// Payload
// ============================================================================

/// JSON body sent to an integration.
#[derive(Debug, Clone, Serialize)]
pub struct TaskPayload {
    pub payload_version: u32,
    pub stage: TaskStageName,
    /// Run-scoped token the integration may use to read run details.
    pub access_token: String,
    pub is_speculative: bool,
    pub task_result_id: String,
    pub task_result_enforcement_level: EnforcementLevel,
    pub task_result_callback_url: String,
    pub run_id: String,
    pub run_message: Option<String>,
    pub run_created_at: DateTime<Utc>,
    pub run_created_by: Option<String>,
    pub workspace_id: String,
    pub workspace_name: String,
    pub organization_id: String,
    pub configuration_version_id: String,
    pub vcs_commit_sha: Option<String>,
    pub vcs_branch: Option<String>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Dispatch tuning.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Public base URL used in callback URLs.
    pub base_url: String,
    pub callback_token_ttl: Duration,
    /// Delivery attempts per result.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url.clone(),
            callback_token_ttl: config.task_callback_token_ttl,
            attempts: config.task_dispatch_retries,
            retry_delay: config.task_dispatch_retry_delay,
        }
    }
}

/// Result of polling a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Every result finished and no mandatory check failed.
    Complete,
    /// Results are still outstanding; poll again later.
    Incomplete,
    /// A mandatory check failed. The Run must move to the given status.
    Halted(RunStatus),
}

/// Creates, dispatches and polls task results.
#[derive(Clone)]
pub struct TaskOrchestrator {
    persistence: Arc<dyn Persistence>,
    dispatcher: Arc<dyn TaskDispatcher>,
    credentials: Credentials,
    settings: DispatchSettings,
}

impl TaskOrchestrator {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        dispatcher: Arc<dyn TaskDispatcher>,
        credentials: Credentials,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            persistence,
            dispatcher,
            credentials,
            settings,
        }
    }

    /// Callback URL of a result.
    pub fn callback_url(&self, callback_id: &str) -> String {
        format!(
            "{}/api/v2/task-results/{}/callback",
            self.settings.base_url, callback_id
        )
    }

    async fn stage(&self, run_id: &str, stage: TaskStageName) -> Result<TaskStageRecord> {
        self.persistence
            .get_task_stage(run_id, stage)
            .await?
            .ok_or_else(|| {
                Error::Core(terrarun_core::CoreError::NotFound {
                    entity: "task_stage",
                    id: format!("{}/{}", run_id, stage),
                })
            })
    }

    /// Dispatch every pending result of `stage` and mark the stage running.
    #[instrument(skip(self, run), fields(run_id = %run.id, stage = %stage))]
    pub async fn execute(&self, run: &RunRecord, stage: TaskStageName) -> Result<()> {
        let stage_record = self.stage(&run.id, stage).await?;
        let results = self.persistence.list_task_results(&stage_record.id).await?;

        let workspace = self
            .persistence
            .get_workspace(&run.workspace_id)
            .await?
            .ok_or_else(|| {
                Error::Core(terrarun_core::CoreError::NotFound {
                    entity: "workspace",
                    id: run.workspace_id.clone(),
                })
            })?;
        let configuration_version = self
            .persistence
            .get_configuration_version(&run.configuration_version_id)
            .await?;

        for result in results
            .iter()
            .filter(|r| r.status == TaskResultStatus::Pending)
        {
            let payload = TaskPayload {
                payload_version: 1,
                stage,
                access_token: self
                    .credentials
                    .issue(&run.id, self.settings.callback_token_ttl)?,
                is_speculative: configuration_version
                    .as_ref()
                    .is_some_and(|cv| cv.speculative),
                task_result_id: result.id.clone(),
                task_result_enforcement_level: result.enforcement_level,
                task_result_callback_url: self.callback_url(&result.callback_id),
                run_id: run.id.clone(),
                run_message: run.message.clone(),
                run_created_at: run.created_at,
                run_created_by: run.created_by.clone(),
                workspace_id: workspace.id.clone(),
                workspace_name: workspace.name.clone(),
                organization_id: workspace.organisation_id.clone(),
                configuration_version_id: run.configuration_version_id.clone(),
                vcs_commit_sha: configuration_version
                    .as_ref()
                    .and_then(|cv| cv.ingress_commit_sha.clone()),
                vcs_branch: configuration_version
                    .as_ref()
                    .and_then(|cv| cv.ingress_branch.clone()),
            };
            self.dispatch(result, &payload).await?;
        }

        self.persistence
            .update_task_stage_status(&stage_record.id, TaskStageStatus::Running, Utc::now())
            .await?;
        Ok(())
    }

    async fn dispatch(&self, result: &TaskResultRecord, payload: &TaskPayload) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let signature = match result.hmac_key.as_deref() {
            Some(key) if !key.is_empty() => Some(sign_payload(key, body.as_bytes())?),
            _ => None,
        };
        let request = TaskRequest {
            url: result.task_url.clone(),
            body,
            signature,
        };

        let attempts = self.settings.attempts.max(1);
        let mut delivered = false;
        for attempt in 1..=attempts {
            match self.dispatcher.deliver(&request).await {
                Ok(200) => {
                    delivered = true;
                    break;
                }
                Ok(status) => warn!(
                    task_result_id = %result.id,
                    attempt,
                    status,
                    "Task integration rejected request"
                ),
                Err(e) => warn!(
                    task_result_id = %result.id,
                    attempt,
                    error = %e,
                    "Task integration unreachable"
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        let now = Utc::now();
        let update = if delivered {
            info!(task_result_id = %result.id, task = %result.task_name, "Dispatched task");
            TaskResultUpdate {
                status: Some(TaskResultStatus::Running),
                start_time: Some(now),
                ..Default::default()
            }
        } else {
            warn!(task_result_id = %result.id, task = %result.task_name, "Giving up on task dispatch");
            TaskResultUpdate {
                status: Some(TaskResultStatus::Failed),
                message: Some(format!("Failed to send request after {} attempts", attempts)),
                ..Default::default()
            }
        };
        self.persistence
            .update_task_result(&result.id, &update, now)
            .await?;
        Ok(())
    }

    /// Decide whether `stage` of `run` is finished.
    ///
    /// A mandatory failure marks the stage (and, for pre-plan, the Plan) and
    /// returns [`StageOutcome::Halted`] with the status the Run must take. A
    /// canceled mandatory result wins over failed ones wherever it sits.
    /// Results dispatched longer than [`TASK_RESULT_TIMEOUT`] ago are marked
    /// errored first.
    #[instrument(skip(self, run), fields(run_id = %run.id, stage = %stage))]
    pub async fn check_status(
        &self,
        run: &RunRecord,
        stage: TaskStageName,
        now: DateTime<Utc>,
    ) -> Result<StageOutcome> {
        let stage_record = self.stage(&run.id, stage).await?;
        let results = self.persistence.list_task_results(&stage_record.id).await?;

        // Timeouts are recorded for every result before any decision
        let mut outstanding = false;
        let mut mandatory = Vec::new();
        for result in &results {
            let mut status = result.status;

            if status.is_active()
                && let Some(start_time) = result.start_time
                && (now - start_time)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed > TASK_RESULT_TIMEOUT)
            {
                warn!(task_result_id = %result.id, task = %result.task_name, "Task timed out");
                self.persistence
                    .update_task_result(
                        &result.id,
                        &TaskResultUpdate {
                            status: Some(TaskResultStatus::Errored),
                            message: Some("Task timed out".to_string()),
                            ..Default::default()
                        },
                        now,
                    )
                    .await?;
                // An advisory timeout still holds the stage open for this poll
                if result.enforcement_level == EnforcementLevel::Advisory {
                    outstanding = true;
                    continue;
                }
                status = TaskResultStatus::Errored;
            }

            if status.is_active() {
                outstanding = true;
            }
            if result.enforcement_level == EnforcementLevel::Mandatory {
                mandatory.push((result, status));
            }
        }

        // A mandatory cancel outranks any mandatory failure
        let halt = mandatory
            .iter()
            .find(|(_, status)| *status == TaskResultStatus::Canceled)
            .or_else(|| mandatory.iter().find(|(_, status)| halt_for(*status).is_some()));
        if let Some((result, status)) = halt
            && let Some((stage_status, run_status, plan_status)) = halt_for(*status)
        {
            info!(
                task_result_id = %result.id,
                task = %result.task_name,
                status = %status,
                "Mandatory task stopped the run"
            );
            self.persistence
                .update_task_stage_status(&stage_record.id, stage_status, now)
                .await?;
            if stage == TaskStageName::PrePlan
                && let Some(plan) = self
                    .persistence
                    .latest_command(CommandKind::Plan, &run.id)
                    .await?
            {
                self.persistence
                    .update_command_status(CommandKind::Plan, &plan.id, plan_status, now)
                    .await?;
            }
            return Ok(StageOutcome::Halted(run_status));
        }

        if outstanding {
            debug!("Stage still waiting on tasks");
            return Ok(StageOutcome::Incomplete);
        }

        self.persistence
            .update_task_stage_status(&stage_record.id, TaskStageStatus::Passed, now)
            .await?;
        Ok(StageOutcome::Complete)
    }

    /// Record a callback from an integration.
    ///
    /// Authenticated by the result's own callback id. The status is written
    /// as-is; the next poll of the owning stage acts on it.
    #[instrument(skip(self, message, url))]
    pub async fn handle_callback(
        &self,
        callback_id: &str,
        status: &str,
        message: Option<&str>,
        url: Option<&str>,
    ) -> Result<TaskResultRecord> {
        let result = self
            .persistence
            .get_task_result_by_callback_id(callback_id)
            .await?
            .ok_or_else(|| Error::TaskResultNotFound(callback_id.to_string()))?;
        let status: TaskResultStatus = status
            .to_ascii_lowercase()
            .parse()
            .map_err(|_| Error::UnhandledStatus(status.to_string()))?;

        self.persistence
            .update_task_result(
                &result.id,
                &TaskResultUpdate {
                    status: Some(status),
                    message: message.map(String::from),
                    result_url: url.map(String::from),
                    start_time: None,
                },
                Utc::now(),
            )
            .await?;
        info!(task_result_id = %result.id, status = %status, "Task callback recorded");

        self.persistence
            .get_task_result_by_callback_id(callback_id)
            .await?
            .ok_or_else(|| Error::TaskResultNotFound(callback_id.to_string()))
    }
}

/// Stage, Run and pre-plan Plan statuses a halting mandatory result leads to.
fn halt_for(status: TaskResultStatus) -> Option<(TaskStageStatus, RunStatus, CommandStatus)> {
    match status {
        TaskResultStatus::Canceled => Some((
            TaskStageStatus::Canceled,
            RunStatus::Canceled,
            CommandStatus::Errored,
        )),
        TaskResultStatus::Failed => Some((
            TaskStageStatus::Failed,
            RunStatus::Errored,
            CommandStatus::Canceled,
        )),
        TaskResultStatus::Errored => Some((
            TaskStageStatus::Errored,
            RunStatus::Errored,
            CommandStatus::Canceled,
        )),
        TaskResultStatus::Unreachable => Some((
            TaskStageStatus::Unreachable,
            RunStatus::Errored,
            CommandStatus::Canceled,
        )),
        TaskResultStatus::Pending | TaskResultStatus::Running | TaskResultStatus::Passed => None,
    }
}
