// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for terrarun-engine.

use thiserror::Error;

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Discard was requested outside POST_PLAN_COMPLETED.
    #[error("Run '{run_id}' cannot be discarded in status '{status}'")]
    RunCannotBeDiscarded { run_id: String, status: String },

    /// Confirm was requested outside the post-plan window or twice.
    #[error("Run '{run_id}' cannot be confirmed in status '{status}'")]
    RunCannotBeConfirmed { run_id: String, status: String },

    /// Cancel was requested on a Run that already ended.
    #[error("Run '{run_id}' cannot be canceled in status '{status}'")]
    RunCannotBeCanceled { run_id: String, status: String },

    /// The workspace lock is held by a different Run.
    #[error("Failed to unlock workspace '{workspace_id}' for run '{run_id}'")]
    FailedToUnlockWorkspace { workspace_id: String, run_id: String },

    /// The promotion pipeline has not been satisfied by the parent group.
    #[error("Run creation rejected by promotion gate: {0}")]
    PromotionRejected(String),

    /// Neither the request nor the workspace names a usable terraform version.
    #[error("No terraform version configured for workspace '{0}'")]
    ToolNotConfigured(String),

    /// An agent reported on a Plan or Apply the Run is not waiting for.
    #[error("Run '{run_id}' in status '{status}' does not accept {job_type} updates")]
    UnexpectedStatusUpdate {
        run_id: String,
        job_type: String,
        status: String,
    },

    /// A status or job type no handler covers.
    #[error("Unhandled status: {0}")]
    UnhandledStatus(String),

    /// Run was not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// No TaskResult carries this callback id.
    #[error("Task result not found for callback: {0}")]
    TaskResultNotFound(String),

    /// Agent was not found.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// A run-scoped credential failed verification.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core persistence operation failed.
    #[error("Core error: {0}")]
    Core(#[from] terrarun_core::error::CoreError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Outbound HTTP call failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable code for the API layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::RunCannotBeDiscarded { .. } => "RUN_CANNOT_BE_DISCARDED",
            Error::RunCannotBeConfirmed { .. } => "RUN_CANNOT_BE_CONFIRMED",
            Error::RunCannotBeCanceled { .. } => "RUN_CANNOT_BE_CANCELED",
            Error::FailedToUnlockWorkspace { .. } => "FAILED_TO_UNLOCK_WORKSPACE",
            Error::PromotionRejected(_) => "PROMOTION_REJECTED",
            Error::ToolNotConfigured(_) => "TOOL_NOT_CONFIGURED",
            Error::UnexpectedStatusUpdate { .. } => "UNEXPECTED_STATUS_UPDATE",
            Error::UnhandledStatus(_) => "UNHANDLED_STATUS",
            Error::RunNotFound(_) => "RUN_NOT_FOUND",
            Error::TaskResultNotFound(_) => "TASK_RESULT_NOT_FOUND",
            Error::AgentNotFound(_) => "AGENT_NOT_FOUND",
            Error::InvalidCredential(_) => "INVALID_CREDENTIAL",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Core(e) => e.error_code(),
            Error::Database(_) => "DATABASE_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
        }
    }
}

/// Result type using engine Error.
pub type Result<T> = std::result::Result<T, Error>;
