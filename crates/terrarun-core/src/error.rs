// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for terrarun-core.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A referenced record does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound {
        /// Kind of record, e.g. "workspace".
        entity: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// The workspace is already locked by another Run.
    #[error("Workspace '{workspace_id}' is locked by run '{locked_by}'")]
    WorkspaceLocked {
        /// The workspace that could not be locked.
        workspace_id: String,
        /// Run currently holding the lock.
        locked_by: String,
    },

    /// A stored value could not be mapped to its domain type.
    #[error("Invalid value for '{field}': '{value}'")]
    InvalidValue {
        /// Column or field name.
        field: String,
        /// The offending value.
        value: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::WorkspaceLocked { .. } => "WORKSPACE_LOCKED",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: &str) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}
