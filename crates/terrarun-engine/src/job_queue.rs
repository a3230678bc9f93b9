// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job queue and agent matching.
//!
//! All dispatchable work lives in one queue table with two lanes. WORKER jobs
//! are internal continuations drained by the [`crate::worker::Worker`] loop.
//! AGENT jobs carry a [`JobType`] and wait for a remote agent to claim them.
//!
//! Which AGENT job an agent may take is decided by [`AgentMatcher`]:
//!
//! ```text
//! agent pool without organisation  -> serves REMOTE jobs of any organisation
//!                                     whose whole override chain has no pool
//! agent pool with organisation     -> serves AGENT jobs of that organisation
//!                                     whose effective pool is this pool
//! ```
//!
//! Execution mode resolves workspace -> project -> organisation; agent pool
//! resolves workspace -> project -> environment -> organisation. Matching is
//! deterministic: candidates are tried oldest first and the first one that
//! can be claimed wins.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use terrarun_core::Persistence;
use terrarun_core::models::{
    AgentJobCandidate, AgentPoolRecord, ExecutionMode, JobLane, JobType, RunRecord,
};
use tracing::{debug, info, instrument, warn};

use crate::credentials::Credentials;
use crate::error::{Error, Result};

/// First value that is set, walking from the most specific level outwards.
pub fn first_non_null<T: Clone>(levels: &[Option<T>]) -> Option<T> {
    levels.iter().find_map(|level| level.clone())
}

/// Execution mode of a candidate after applying overrides.
pub fn effective_execution_mode(candidate: &AgentJobCandidate) -> ExecutionMode {
    first_non_null(&[
        candidate.workspace_execution_mode,
        candidate.project_execution_mode,
    ])
    .unwrap_or(candidate.organisation_execution_mode)
}

/// Agent pool of a candidate after applying overrides.
pub fn effective_agent_pool(candidate: &AgentJobCandidate) -> Option<String> {
    first_non_null(&[
        candidate.workspace_agent_pool_id.clone(),
        candidate.project_agent_pool_id.clone(),
        candidate.environment_agent_pool_id.clone(),
        candidate.organisation_agent_pool_id.clone(),
    ])
}

/// Decides which queued AGENT jobs an agent pool may take.
#[derive(Debug, Clone)]
pub struct AgentMatcher {
    pool: AgentPoolRecord,
}

impl AgentMatcher {
    pub fn new(pool: AgentPoolRecord) -> Self {
        Self { pool }
    }

    /// Execution mode the pool's agents serve.
    pub fn serving_mode(&self) -> ExecutionMode {
        if self.pool.organisation_id.is_some() {
            ExecutionMode::Agent
        } else {
            ExecutionMode::Remote
        }
    }

    /// Whether an agent of this pool may take `candidate`.
    pub fn matches(&self, candidate: &AgentJobCandidate) -> bool {
        if effective_execution_mode(candidate) != self.serving_mode() {
            return false;
        }
        match &self.pool.organisation_id {
            Some(organisation_id) => {
                candidate.organisation_id == *organisation_id
                    && effective_agent_pool(candidate).as_deref() == Some(self.pool.id.as_str())
            }
            None => effective_agent_pool(candidate).is_none(),
        }
    }
}

/// Work handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentJob {
    pub job_id: i64,
    pub run_id: String,
    pub job_type: JobType,
    pub workspace_id: String,
    pub configuration_version_id: String,
    pub execution_mode: ExecutionMode,
    pub tool_version: String,
    pub tool_url: Option<String>,
    pub tool_checksum: Option<String>,
    /// Run-scoped bearer token for the agent's status updates.
    pub job_token: String,
}

/// Facade over the queue table.
#[derive(Clone)]
pub struct JobQueue {
    persistence: Arc<dyn Persistence>,
    credentials: Credentials,
    job_token_ttl: Duration,
}

impl JobQueue {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        credentials: Credentials,
        job_token_ttl: Duration,
    ) -> Self {
        Self {
            persistence,
            credentials,
            job_token_ttl,
        }
    }

    /// Queue a worker continuation for `run_id`.
    pub async fn enqueue_worker(&self, run_id: &str) -> Result<i64> {
        let id = self
            .persistence
            .enqueue_job(run_id, JobLane::Worker, None, Utc::now())
            .await?;
        debug!(run_id = %run_id, job_id = id, "Queued worker job");
        Ok(id)
    }

    /// Queue terraform work for an agent.
    pub async fn enqueue_agent(&self, run_id: &str, job_type: JobType) -> Result<i64> {
        let id = self
            .persistence
            .enqueue_job(run_id, JobLane::Agent, Some(job_type), Utc::now())
            .await?;
        info!(run_id = %run_id, job_id = id, job_type = %job_type, "Queued agent job");
        Ok(id)
    }

    /// Claim-and-delete the next WORKER job and return its Run.
    ///
    /// Never blocks. A job whose Run has vanished is dropped.
    pub async fn get_worker_job(&self) -> Result<Option<RunRecord>> {
        let Some(job) = self.persistence.claim_worker_job().await? else {
            return Ok(None);
        };
        let run = self.persistence.get_run(&job.run_id).await?;
        if run.is_none() {
            warn!(run_id = %job.run_id, job_id = job.id, "Dropping worker job for missing run");
        }
        Ok(run)
    }

    /// Claim the first AGENT job `agent_id` may take.
    ///
    /// Records the agent's check-in on every call. Returns `None` when nothing
    /// qualifies; the agent is expected to poll again later.
    #[instrument(skip(self, job_types), fields(agent_id = %agent_id))]
    pub async fn get_job_for_agent(
        &self,
        agent_id: &str,
        job_types: &[JobType],
    ) -> Result<Option<AgentJob>> {
        let agent = self
            .persistence
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        self.persistence.touch_agent(agent_id, Utc::now()).await?;

        let pool = self
            .persistence
            .get_agent_pool(&agent.agent_pool_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        let matcher = AgentMatcher::new(pool);

        if job_types.is_empty() {
            return Ok(None);
        }

        let candidates = self.persistence.list_agent_job_candidates(job_types).await?;
        for candidate in candidates.iter().filter(|c| matcher.matches(c)) {
            if !self
                .persistence
                .claim_agent_job(candidate.job_id, agent_id)
                .await?
            {
                debug!(job_id = candidate.job_id, "Job claimed by another agent");
                continue;
            }

            let job = self.describe(candidate, matcher.serving_mode()).await?;
            info!(
                run_id = %job.run_id,
                job_id = job.job_id,
                job_type = %job.job_type,
                execution_mode = %job.execution_mode,
                "Agent claimed job"
            );
            return Ok(Some(job));
        }

        debug!("No job for agent");
        Ok(None)
    }

    async fn describe(
        &self,
        candidate: &AgentJobCandidate,
        execution_mode: ExecutionMode,
    ) -> Result<AgentJob> {
        let run = self
            .persistence
            .get_run(&candidate.run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(candidate.run_id.clone()))?;
        let tool = self
            .persistence
            .get_tool(&run.tool_id)
            .await?
            .ok_or_else(|| Error::ToolNotConfigured(run.workspace_id.clone()))?;
        let job_token = self.credentials.issue(&run.id, self.job_token_ttl)?;

        Ok(AgentJob {
            job_id: candidate.job_id,
            run_id: run.id,
            job_type: candidate.job_type,
            workspace_id: run.workspace_id,
            configuration_version_id: run.configuration_version_id,
            execution_mode,
            tool_version: tool.version,
            tool_url: tool.url,
            tool_checksum: tool.checksum,
            job_token,
        })
    }
}
