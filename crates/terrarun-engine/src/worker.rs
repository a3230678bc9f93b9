// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker poll loop.
//!
//! Drains WORKER-lane jobs one at a time and hands each Run to the state
//! machine. Sleeps for the poll interval only when the lane is empty.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::run_state_machine::RunStateMachine;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls of an empty lane.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Background worker advancing Runs.
pub struct Worker {
    state_machine: RunStateMachine,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(state_machine: RunStateMachine, config: WorkerConfig) -> Self {
        Self {
            state_machine,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops [`Worker::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Claim and process one WORKER job.
    ///
    /// Returns whether a job was found. A failing handler leaves the Run in
    /// its status and queues a new worker job so a later poll retries it.
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(run) = self.state_machine.job_queue().get_worker_job().await? else {
            return Ok(false);
        };
        let run_id = run.id.clone();

        if let Err(e) = self.state_machine.handle_worker_job(run).await {
            error!(run_id = %run_id, error = %e, "Worker job failed, will retry");
            self.state_machine.job_queue().enqueue_worker(&run_id).await?;
        }
        Ok(true)
    }

    /// Run until the shutdown token is cancelled.
    pub async fn run(self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let idle = match self.poll_once().await {
                Ok(found) => !found,
                Err(e) => {
                    error!(error = %e, "Worker poll failed");
                    true
                }
            };
            if !idle {
                continue;
            }

            debug!("No worker jobs");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Worker shutting down");
    }
}
