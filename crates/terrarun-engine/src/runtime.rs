// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for terrarun-engine.
//!
//! [`EngineRuntime`] wires the state machine, job queue and task orchestrator
//! together and runs the worker poll loop as a background task. An API layer
//! embeds it and calls into [`EngineRuntime::state_machine`].
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use terrarun_core::SqlitePersistence;
//! use terrarun_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path("terrarun.db").await?);
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .secret_key("change-me")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve the API ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use terrarun_core::Persistence;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::command::{BlobStore, FsBlobStore};
use crate::config::Config;
use crate::credentials::Credentials;
use crate::executor::LocalExecution;
use crate::job_queue::JobQueue;
use crate::run_state_machine::RunStateMachine;
use crate::task_orchestrator::{
    DispatchSettings, HttpTaskDispatcher, TaskDispatcher, TaskOrchestrator,
};
use crate::worker::{Worker, WorkerConfig};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    dispatcher: Option<Arc<dyn TaskDispatcher>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    secret_key: Option<String>,
    base_url: String,
    data_dir: PathBuf,
    worker_poll_interval: Duration,
    agent_job_token_ttl: Duration,
    task_callback_token_ttl: Duration,
    task_dispatch_attempts: u32,
    task_dispatch_retry_delay: Duration,
    task_request_timeout: Duration,
    terraform_bin: String,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            dispatcher: None,
            blob_store: None,
            secret_key: None,
            base_url: "http://localhost:5000".to_string(),
            data_dir: PathBuf::from(".data"),
            worker_poll_interval: Duration::from_secs(1),
            agent_job_token_ttl: Duration::from_secs(3600),
            task_callback_token_ttl: Duration::from_secs(600),
            task_dispatch_attempts: 3,
            task_dispatch_retry_delay: Duration::from_secs(1),
            task_request_timeout: Duration::from_secs(30),
            terraform_bin: "terraform".to_string(),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every tunable from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.secret_key = Some(config.secret_key.clone());
        self.base_url = config.base_url.clone();
        self.data_dir = config.data_dir.clone();
        self.worker_poll_interval = config.worker_poll_interval;
        self.agent_job_token_ttl = config.agent_job_token_ttl;
        self.task_callback_token_ttl = config.task_callback_token_ttl;
        self.task_dispatch_attempts = config.task_dispatch_retries;
        self.task_dispatch_retry_delay = config.task_dispatch_retry_delay;
        self.terraform_bin = config.terraform_bin.clone();
        self
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the task dispatcher.
    ///
    /// Default: [`HttpTaskDispatcher`]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn TaskDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the blob store for command logs.
    ///
    /// Default: [`FsBlobStore`] rooted at the data directory.
    pub fn blob_store(mut self, blob_store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(blob_store);
        self
    }

    /// Set the secret signing run-scoped credentials (required).
    pub fn secret_key(mut self, secret_key: impl Into<String>) -> Self {
        self.secret_key = Some(secret_key.into());
        self
    }

    /// Default: `http://localhost:5000`
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Terraform binary for LOCAL-mode Runs.
    ///
    /// Default: `terraform`
    pub fn terraform_bin(mut self, program: impl Into<String>) -> Self {
        self.terraform_bin = program.into();
        self
    }

    /// Default: 1 second
    pub fn worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let secret_key = self
            .secret_key
            .ok_or_else(|| anyhow::anyhow!("secret_key is required"))?;
        let dispatcher: Arc<dyn TaskDispatcher> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(HttpTaskDispatcher::new(self.task_request_timeout)?),
        };
        let blob_store: Arc<dyn BlobStore> = match self.blob_store {
            Some(blob_store) => blob_store,
            None => Arc::new(FsBlobStore::new(self.data_dir.clone())),
        };

        let credentials = Credentials::new(&secret_key);
        let queue = JobQueue::new(
            persistence.clone(),
            credentials.clone(),
            self.agent_job_token_ttl,
        );
        let tasks = TaskOrchestrator::new(
            persistence.clone(),
            dispatcher,
            credentials.clone(),
            DispatchSettings {
                base_url: self.base_url.trim_end_matches('/').to_string(),
                callback_token_ttl: self.task_callback_token_ttl,
                attempts: self.task_dispatch_attempts,
                retry_delay: self.task_dispatch_retry_delay,
            },
        );
        let state_machine = RunStateMachine::new(persistence.clone(), blob_store, queue, tasks)
            .with_local_execution(LocalExecution {
                program: self.terraform_bin,
                work_root: self.data_dir.join("local"),
                env: Vec::new(),
                watch_interval: self.worker_poll_interval,
            });

        Ok(EngineRuntimeConfig {
            persistence,
            state_machine,
            credentials,
            worker_poll_interval: self.worker_poll_interval,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    state_machine: RunStateMachine,
    credentials: Credentials,
    worker_poll_interval: Duration,
}

impl EngineRuntimeConfig {
    /// Start the runtime, spawning the worker poll loop.
    pub async fn start(self) -> Result<EngineRuntime> {
        self.persistence.health_check_db().await?;

        let worker = Worker::new(
            self.state_machine.clone(),
            WorkerConfig {
                poll_interval: self.worker_poll_interval,
            },
        );
        let shutdown = worker.shutdown_token();
        let worker_handle = tokio::spawn(worker.run());

        info!(
            poll_interval_ms = self.worker_poll_interval.as_millis() as u64,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            worker_handle,
            shutdown,
            state_machine: self.state_machine,
            credentials: self.credentials,
        })
    }
}

/// A running terrarun engine.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    worker_handle: JoinHandle<()>,
    shutdown: CancellationToken,
    state_machine: RunStateMachine,
    credentials: Credentials,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Entry point for Run operations and agent callbacks.
    pub fn state_machine(&self) -> &RunStateMachine {
        &self.state_machine
    }

    /// Credential authority for verifying agent and task tokens.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Check if the worker loop is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }

    /// Stop the worker loop and wait for it to finish its current job.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");
        self.shutdown.cancel();

        if let Err(e) = self.worker_handle.await {
            error!("Worker task panicked: {}", e);
            return Err(anyhow::anyhow!("worker task panicked: {}", e));
        }
        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
