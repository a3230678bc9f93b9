// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace lock.
//!
//! The lock is taken inside the Run creation transaction and released when
//! the Run reaches a terminal status.

use std::sync::Arc;

use terrarun_core::Persistence;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct WorkspaceLock {
    persistence: Arc<dyn Persistence>,
}

impl WorkspaceLock {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }

    /// Release the lock `run_id` holds on `workspace_id`.
    ///
    /// Fails with [`Error::FailedToUnlockWorkspace`] if another Run holds it.
    /// Releasing an already free lock succeeds.
    pub async fn release(&self, workspace_id: &str, run_id: &str) -> Result<()> {
        if self
            .persistence
            .release_workspace_lock(workspace_id, run_id)
            .await?
        {
            info!(workspace_id = %workspace_id, run_id = %run_id, "Released workspace lock");
            Ok(())
        } else {
            Err(Error::FailedToUnlockWorkspace {
                workspace_id: workspace_id.to_string(),
                run_id: run_id.to_string(),
            })
        }
    }

    /// Release on terminal status. A lock held by another Run is left alone.
    pub async fn release_on_terminal(&self, workspace_id: &str, run_id: &str) -> Result<()> {
        match self.release(workspace_id, run_id).await {
            Err(Error::FailedToUnlockWorkspace { .. }) => {
                warn!(
                    workspace_id = %workspace_id,
                    run_id = %run_id,
                    "Workspace locked by another run, leaving lock in place"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Clear the lock regardless of holder. Authorization is the caller's.
    pub async fn force_unlock(&self, workspace_id: &str) -> Result<()> {
        self.persistence.force_unlock_workspace(workspace_id).await?;
        warn!(workspace_id = %workspace_id, "Workspace force-unlocked");
        Ok(())
    }
}
