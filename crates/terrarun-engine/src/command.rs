// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plans, Applies and their output logs.
//!
//! [`Plan`] and [`Apply`] are the two terraform command executions of a Run.
//! Both implement [`ExecutableCommand`], the small capability the executor and
//! the state machine drive. Command output is kept in a [`BlobStore`] under
//! `plans/<id>/log` and `applies/<id>/log`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use terrarun_core::Persistence;
use terrarun_core::models::{CommandKind, CommandRecord, CommandStatus, ResourceCounts};
use tokio::io::AsyncWriteExt;

use crate::error::Result;

// ============================================================================
// Blob store
// ============================================================================

/// Path-addressed object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object. `None` if it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace an object.
    async fn put(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Append to an object, creating it if needed.
    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut current = self.get(path).await?.unwrap_or_default();
        current.extend_from_slice(data);
        self.put(path, &current).await
    }
}

/// Blob store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Store objects below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("blob path escapes store root: {}", path),
            )
            .into());
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;
        tokio::fs::write(full, data).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(full)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Executable commands
// ============================================================================

/// Capability shared by Plans and Applies.
#[async_trait]
pub trait ExecutableCommand: Send + Sync {
    fn kind(&self) -> CommandKind;

    fn id(&self) -> &str;

    fn run_id(&self) -> &str;

    /// Status as last read or written through this handle.
    fn status(&self) -> CommandStatus;

    /// Persist a new status (audited by the persistence layer).
    async fn update_status(&mut self, status: CommandStatus) -> Result<()>;

    /// Append a chunk of terraform output to the command log.
    async fn append_output(&mut self, data: &[u8]) -> Result<()>;

    /// Full command log so far.
    async fn output(&self) -> Result<Vec<u8>>;
}

/// Blob path of a command's log.
pub fn log_path(kind: CommandKind, id: &str) -> String {
    format!("{}/{}/log", kind.table(), id)
}

/// State shared by both command types.
struct CommandHandle {
    record: CommandRecord,
    persistence: Arc<dyn Persistence>,
    blobs: Arc<dyn BlobStore>,
}

impl CommandHandle {
    async fn update_status(&mut self, status: CommandStatus) -> Result<()> {
        self.persistence
            .update_command_status(self.record.kind, &self.record.id, status, Utc::now())
            .await?;
        self.record.status = status;
        Ok(())
    }

    async fn append_output(&mut self, data: &[u8]) -> Result<()> {
        let path = log_path(self.record.kind, &self.record.id);
        self.blobs.append(&path, data).await?;
        if self.record.log_blob_path.as_deref() != Some(path.as_str()) {
            self.persistence
                .set_command_log_blob(self.record.kind, &self.record.id, &path)
                .await?;
            self.record.log_blob_path = Some(path);
        }
        Ok(())
    }

    async fn output(&self) -> Result<Vec<u8>> {
        match &self.record.log_blob_path {
            Some(path) => Ok(self.blobs.get(path).await?.unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn set_resources(&mut self, resources: ResourceCounts) -> Result<()> {
        self.persistence
            .update_command_resources(self.record.kind, &self.record.id, &resources)
            .await?;
        self.record.resources = resources;
        Ok(())
    }
}

macro_rules! command_type {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        pub struct $name {
            inner: CommandHandle,
        }

        impl $name {
            /// Create a new command for `run_id`, status PENDING.
            pub async fn create(
                persistence: Arc<dyn Persistence>,
                blobs: Arc<dyn BlobStore>,
                run_id: &str,
            ) -> Result<Self> {
                let record = persistence.create_command($kind, run_id, Utc::now()).await?;
                Ok(Self {
                    inner: CommandHandle {
                        record,
                        persistence,
                        blobs,
                    },
                })
            }

            /// The current (last created) command of `run_id`, if any.
            pub async fn latest(
                persistence: Arc<dyn Persistence>,
                blobs: Arc<dyn BlobStore>,
                run_id: &str,
            ) -> Result<Option<Self>> {
                let record = persistence.latest_command($kind, run_id).await?;
                Ok(record.map(|record| Self {
                    inner: CommandHandle {
                        record,
                        persistence,
                        blobs,
                    },
                }))
            }

            pub fn record(&self) -> &CommandRecord {
                &self.inner.record
            }

            /// Store the resource counters reported by an agent.
            pub async fn set_resources(&mut self, resources: ResourceCounts) -> Result<()> {
                self.inner.set_resources(resources).await
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("record", &self.inner.record)
                    .finish_non_exhaustive()
            }
        }

        #[async_trait]
        impl ExecutableCommand for $name {
            fn kind(&self) -> CommandKind {
                $kind
            }

            fn id(&self) -> &str {
                &self.inner.record.id
            }

            fn run_id(&self) -> &str {
                &self.inner.record.run_id
            }

            fn status(&self) -> CommandStatus {
                self.inner.record.status
            }

            async fn update_status(&mut self, status: CommandStatus) -> Result<()> {
                self.inner.update_status(status).await
            }

            async fn append_output(&mut self, data: &[u8]) -> Result<()> {
                self.inner.append_output(data).await
            }

            async fn output(&self) -> Result<Vec<u8>> {
                self.inner.output().await
            }
        }
    };
}

command_type!(
    /// A terraform plan of a Run.
    Plan,
    CommandKind::Plan
);

command_type!(
    /// A terraform apply of a Run. Created only after a Plan with changes.
    Apply,
    CommandKind::Apply
);

impl Plan {
    /// Whether the plan found anything to change.
    pub fn has_changes(&self) -> bool {
        self.inner.record.resources.has_changes
    }

    pub fn resource_additions(&self) -> i64 {
        self.inner.record.resources.additions
    }

    pub fn resource_changes(&self) -> i64 {
        self.inner.record.resources.changes
    }

    pub fn resource_destructions(&self) -> i64 {
        self.inner.record.resources.destructions
    }
}

impl Apply {
    pub fn resource_additions(&self) -> i64 {
        self.inner.record.resources.additions
    }

    pub fn resource_changes(&self) -> i64 {
        self.inner.record.resources.changes
    }

    pub fn resource_destructions(&self) -> i64 {
        self.inner.record.resources.destructions
    }
}
