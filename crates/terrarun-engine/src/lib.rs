// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terrarun Engine - run orchestration
//!
//! This crate drives plan/apply Runs from creation to a terminal status. It
//! owns no transport: an API layer calls the operations below and agents
//! report back through the same layer.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                      API layer (not in this crate)                     │
//! └───────────────────────────────────────────────────────────────────────┘
//!        │ create / cancel / confirm       │ agent poll + status updates
//!        ▼                                 ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                    terrarun-engine (This Crate)                        │
//! │  ┌────────────────┐  ┌────────────┐  ┌──────────────────┐              │
//! │  │ RunStateMachine│──│  JobQueue  │  │ TaskOrchestrator │──► task HTTP │
//! │  └────────────────┘  │ +Matcher   │  └──────────────────┘   callbacks  │
//! │     │       │        └────────────┘                                    │
//! │     │  PromotionGate · WorkspaceLock          Worker poll loop         │
//! └───────────────────────────────────────────────────────────────────────┘
//!                                 │ Arc<dyn Persistence>
//!                                 ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                 terrarun-core (PostgreSQL / SQLite)                    │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Operations
//!
//! | Operation | Entry point |
//! |-----------|-------------|
//! | Create a Run | [`run_state_machine::RunStateMachine::create`] |
//! | Cancel / force-cancel | [`run_state_machine::RunStateMachine::cancel`], [`run_state_machine::RunStateMachine::force_cancel`] |
//! | Confirm / discard | [`run_state_machine::RunStateMachine::confirm`], [`run_state_machine::RunStateMachine::discard`] |
//! | Agent poll | [`job_queue::JobQueue::get_job_for_agent`] |
//! | Agent status update | [`run_state_machine::RunStateMachine::handle_agent_status_update`] |
//! | Task callback | [`task_orchestrator::TaskOrchestrator::handle_callback`] |
//! | Force-unlock | [`workspace_lock::WorkspaceLock::force_unlock`] |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TERRARUN_DATABASE_URL` | Yes | - | `postgres://` or `sqlite:` URL |
//! | `TERRARUN_SECRET_KEY` | Yes | - | Signs run-scoped credentials |
//! | `TERRARUN_BASE_URL` | No | `http://localhost:5000` | Base of task callback URLs |
//! | `TERRARUN_WORKER_POLL_INTERVAL_MS` | No | `1000` | Idle worker sleep |
//! | `TERRARUN_AGENT_JOB_TOKEN_TTL_SECS` | No | `3600` | Agent job token lifetime |
//! | `TERRARUN_TASK_CALLBACK_TOKEN_TTL_SECS` | No | `600` | Task access token lifetime |
//! | `TERRARUN_TASK_DISPATCH_RETRIES` | No | `3` | Delivery attempts per task |
//! | `TERRARUN_TASK_DISPATCH_RETRY_DELAY_MS` | No | `1000` | Delay between attempts |
//! | `DATA_DIR` | No | `.data` | Root of the command log store |
//! | `TERRARUN_TERRAFORM_BIN` | No | `terraform` | Binary for LOCAL-mode Runs |

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Run-scoped bearer credentials.
pub mod credentials;

/// Plans, Applies and the blob store holding their logs.
pub mod command;

/// Job queue and agent matching.
pub mod job_queue;

/// Task stages and integration callbacks.
pub mod task_orchestrator;

/// Environment promotion gate.
pub mod promotion;

/// Workspace lock.
pub mod workspace_lock;

/// The Run state machine.
pub mod run_state_machine;

/// Worker poll loop.
pub mod worker;

/// In-process command execution.
pub mod executor;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::EngineRuntime;
