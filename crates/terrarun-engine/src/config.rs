// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for terrarun-engine.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`postgres://...` or `sqlite:...`).
    pub database_url: String,
    /// Public base URL, used to build task callback URLs.
    pub base_url: String,
    /// Secret signing run-scoped credentials.
    pub secret_key: String,
    /// Sleep between worker polls when the queue is empty.
    pub worker_poll_interval: Duration,
    /// Lifetime of the token handed to an agent with its job.
    pub agent_job_token_ttl: Duration,
    /// Lifetime of the access token sent with a task dispatch.
    pub task_callback_token_ttl: Duration,
    /// Delivery attempts per task dispatch.
    pub task_dispatch_retries: u32,
    /// Fixed delay between task dispatch attempts.
    pub task_dispatch_retry_delay: Duration,
    /// Root of the filesystem blob store.
    pub data_dir: PathBuf,
    /// Terraform binary for LOCAL-mode Runs.
    pub terraform_bin: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("TERRARUN_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("TERRARUN_DATABASE_URL"))?;

        let secret_key = env::var("TERRARUN_SECRET_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("TERRARUN_SECRET_KEY"))?;
        if secret_key.is_empty() {
            return Err(ConfigError::InvalidValue("TERRARUN_SECRET_KEY"));
        }

        let base_url = env::var("TERRARUN_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:5000".to_string())
            .trim_end_matches('/')
            .to_string();

        let worker_poll_interval =
            Duration::from_millis(parse_var("TERRARUN_WORKER_POLL_INTERVAL_MS", 1000)?);
        let agent_job_token_ttl =
            Duration::from_secs(parse_var("TERRARUN_AGENT_JOB_TOKEN_TTL_SECS", 3600)?);
        let task_callback_token_ttl =
            Duration::from_secs(parse_var("TERRARUN_TASK_CALLBACK_TOKEN_TTL_SECS", 600)?);
        let task_dispatch_retries = parse_var("TERRARUN_TASK_DISPATCH_RETRIES", 3u32)?;
        if task_dispatch_retries == 0 {
            return Err(ConfigError::InvalidValue("TERRARUN_TASK_DISPATCH_RETRIES"));
        }
        let task_dispatch_retry_delay =
            Duration::from_millis(parse_var("TERRARUN_TASK_DISPATCH_RETRY_DELAY_MS", 1000)?);

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| ".data".to_string()));
        let terraform_bin =
            env::var("TERRARUN_TERRAFORM_BIN").unwrap_or_else(|_| "terraform".to_string());
        if terraform_bin.is_empty() {
            return Err(ConfigError::InvalidValue("TERRARUN_TERRAFORM_BIN"));
        }

        Ok(Self {
            database_url,
            base_url,
            secret_key,
            worker_poll_interval,
            agent_job_token_ttl,
            task_callback_token_ttl,
            task_dispatch_retries,
            task_dispatch_retry_delay,
            data_dir,
            terraform_bin,
        })
    }

    /// Whether the database URL points at SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.database_url.starts_with("sqlite:")
    }
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be used.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
