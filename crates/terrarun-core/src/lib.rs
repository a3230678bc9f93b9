// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terrarun Core - run records and their storage
//!
//! This crate holds the durable side of the run orchestration engine: the
//! typed status model, the [`persistence::Persistence`] repository and its
//! PostgreSQL and SQLite backends, and the embedded schema migrations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      terrarun-engine                         │
//! │   RunStateMachine · JobQueue · TaskOrchestrator · Promotion   │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ Arc<dyn Persistence>
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 terrarun-core (This Crate)                   │
//! │       models · Persistence · PostgresPersistence · Sqlite    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 PostgreSQL  /  SQLite                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Shared tables
//!
//! | Table | Shape |
//! |-------|-------|
//! | `run_queue` | One row per dispatchable job. WORKER rows are deleted on claim, AGENT rows are assigned on claim and deleted once the agent reports a terminal status. |
//! | `audit_events` | Append-only `(object_type, object_id, old_status, new_status, created_at)`. Written in the same transaction as the status change it records. |
//!
//! # Status storage
//!
//! Every enum in [`models`] is stored as snake_case text. Reading back an
//! unknown value yields [`error::CoreError::InvalidValue`].

/// Error types.
pub mod error;

/// Embedded migrations for both dialects.
pub mod migrations;

/// Records and status enums.
pub mod models;

/// Repository trait and backends.
pub mod persistence;

pub use error::{CoreError, Result};
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
