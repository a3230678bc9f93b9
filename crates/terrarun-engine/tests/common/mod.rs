// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for terrarun-engine integration tests.
//!
//! Every test gets its own in-memory SQLite database, a temporary log
//! directory and a [`MockTaskDispatcher`] in place of real integrations.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use terrarun_core::models::{
    CommandKind, CommandRecord, JobLane, JobType, RunStatus, TaskResultRecord, TaskStageName,
    TaskStageRecord,
};
use terrarun_core::{Persistence, SqlitePersistence, migrations};
use terrarun_engine::command::FsBlobStore;
use terrarun_engine::credentials::Credentials;
use terrarun_engine::executor::LocalExecution;
use terrarun_engine::job_queue::JobQueue;
use terrarun_engine::run_state_machine::RunStateMachine;
use terrarun_engine::task_orchestrator::{DispatchSettings, MockTaskDispatcher, TaskOrchestrator};
use terrarun_engine::worker::{Worker, WorkerConfig};

pub const BASE_URL: &str = "http://terrarun.test";
pub const SECRET: &str = "test-secret";

/// Engine wired against an in-memory database.
pub struct Harness {
    pub pool: SqlitePool,
    pub persistence: Arc<dyn Persistence>,
    pub dispatcher: Arc<MockTaskDispatcher>,
    pub blobs: Arc<FsBlobStore>,
    pub credentials: Credentials,
    pub state_machine: RunStateMachine,
    pub worker: Worker,
    _data_dir: TempDir,
}

impl Harness {
    /// Integrations always answer 200.
    pub async fn new() -> Self {
        Self::with_dispatcher(MockTaskDispatcher::new()).await
    }

    pub async fn with_dispatcher(dispatcher: MockTaskDispatcher) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool.clone()));
        let dispatcher = Arc::new(dispatcher);
        let data_dir = TempDir::new().expect("Failed to create temp dir");
        let blobs = Arc::new(FsBlobStore::new(data_dir.path()));
        let credentials = Credentials::new(SECRET);

        let queue = JobQueue::new(
            persistence.clone(),
            credentials.clone(),
            Duration::from_secs(3600),
        );
        let tasks = TaskOrchestrator::new(
            persistence.clone(),
            dispatcher.clone(),
            credentials.clone(),
            DispatchSettings {
                base_url: BASE_URL.to_string(),
                callback_token_ttl: Duration::from_secs(600),
                attempts: 3,
                retry_delay: Duration::from_millis(10),
            },
        );
        let state_machine =
            RunStateMachine::new(persistence.clone(), blobs.clone(), queue, tasks);
        let worker = Worker::new(
            state_machine.clone(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
            },
        );

        Self {
            pool,
            persistence,
            dispatcher,
            blobs,
            credentials,
            state_machine,
            worker,
            _data_dir: data_dir,
        }
    }

    /// Run LOCAL-mode Runs with `local`.
    pub fn with_local_execution(mut self, local: LocalExecution) -> Self {
        self.state_machine = self.state_machine.clone().with_local_execution(local);
        self.worker = Worker::new(
            self.state_machine.clone(),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
            },
        );
        self
    }

    pub fn data_dir(&self) -> &Path {
        self._data_dir.path()
    }

    /// Run `n` worker polls, asserting each found a job.
    pub async fn poll(&self, n: usize) {
        for i in 0..n {
            let found = self.worker.poll_once().await.expect("worker poll failed");
            assert!(found, "worker lane empty on poll {}", i + 1);
        }
    }

    /// Poll until the worker lane is empty. Returns how many jobs ran.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while self.worker.poll_once().await.expect("worker poll failed") {
            handled += 1;
            assert!(handled < 50, "worker lane never drained");
        }
        handled
    }

    pub async fn status(&self, run_id: &str) -> RunStatus {
        self.state_machine
            .get(run_id)
            .await
            .expect("run lookup failed")
            .status
    }

    pub async fn command(&self, kind: CommandKind, run_id: &str) -> CommandRecord {
        self.persistence
            .latest_command(kind, run_id)
            .await
            .expect("command lookup failed")
            .unwrap_or_else(|| panic!("run {} has no {}", run_id, kind))
    }

    pub async fn agent_jobs(&self, run_id: &str, job_type: JobType) -> i64 {
        self.persistence
            .count_jobs(run_id, JobLane::Agent, Some(job_type))
            .await
            .expect("count failed")
    }

    pub async fn worker_jobs(&self, run_id: &str) -> i64 {
        self.persistence
            .count_jobs(run_id, JobLane::Worker, None)
            .await
            .expect("count failed")
    }

    pub async fn stage(&self, run_id: &str, stage: TaskStageName) -> TaskStageRecord {
        self.persistence
            .get_task_stage(run_id, stage)
            .await
            .expect("stage lookup failed")
            .expect("stage missing")
    }

    pub async fn task_results(&self, run_id: &str, stage: TaskStageName) -> Vec<TaskResultRecord> {
        let stage = self.stage(run_id, stage).await;
        self.persistence
            .list_task_results(&stage.id)
            .await
            .expect("task result lookup failed")
    }

    pub async fn applies(&self, run_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM applies WHERE run_id = ?")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .expect("count failed")
    }

    pub async fn lock_holder(&self, workspace_id: &str) -> Option<String> {
        self.persistence
            .get_workspace(workspace_id)
            .await
            .expect("workspace lookup failed")
            .expect("workspace missing")
            .locked_by_run_id
    }
}

// ============================================================================
// Seeding
// ============================================================================

async fn exec(pool: &SqlitePool, sql: &str, args: &[Option<&str>]) {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = query.bind(arg.map(str::to_string));
    }
    query.execute(pool).await.expect("seed statement failed");
}

pub async fn insert_organisation(
    pool: &SqlitePool,
    id: &str,
    default_mode: &str,
    default_pool: Option<&str>,
) {
    exec(
        pool,
        "INSERT INTO organisations (id, name, default_execution_mode, default_agent_pool_id) VALUES (?, ?, ?, ?)",
        &[Some(id), Some(id), Some(default_mode), default_pool],
    )
    .await;
}

pub async fn insert_agent_pool(pool: &SqlitePool, id: &str, organisation_id: Option<&str>) {
    exec(
        pool,
        "INSERT INTO agent_pools (id, name, organisation_id) VALUES (?, ?, ?)",
        &[Some(id), Some(id), organisation_id],
    )
    .await;
}

pub async fn insert_agent(pool: &SqlitePool, id: &str, agent_pool_id: &str) {
    exec(
        pool,
        "INSERT INTO agents (id, name, agent_pool_id) VALUES (?, ?, ?)",
        &[Some(id), Some(id), Some(agent_pool_id)],
    )
    .await;
}

pub async fn insert_environment(pool: &SqlitePool, id: &str, organisation_id: &str) {
    exec(
        pool,
        "INSERT INTO environments (id, name, organisation_id) VALUES (?, ?, ?)",
        &[Some(id), Some(id), Some(organisation_id)],
    )
    .await;
}

pub async fn insert_project(pool: &SqlitePool, id: &str, organisation_id: &str) {
    exec(
        pool,
        "INSERT INTO projects (id, name, organisation_id) VALUES (?, ?, ?)",
        &[Some(id), Some(id), Some(organisation_id)],
    )
    .await;
}

pub async fn insert_tool(pool: &SqlitePool, id: &str, version: &str) {
    exec(
        pool,
        "INSERT INTO tools (id, version, url, checksum) VALUES (?, ?, 'https://releases.example/terraform.zip', 'abc123')",
        &[Some(id), Some(version)],
    )
    .await;
}

/// Workspace row with optional overrides.
#[derive(Default)]
pub struct WorkspaceSeed<'a> {
    pub id: &'a str,
    pub organisation_id: &'a str,
    pub project_id: &'a str,
    pub environment_id: Option<&'a str>,
    pub execution_mode: Option<&'a str>,
    pub agent_pool_id: Option<&'a str>,
    pub tool_id: Option<&'a str>,
}

pub async fn insert_workspace(pool: &SqlitePool, seed: WorkspaceSeed<'_>) {
    exec(
        pool,
        r#"
        INSERT INTO workspaces (id, name, organisation_id, project_id, environment_id,
                                execution_mode, agent_pool_id, tool_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        &[
            Some(seed.id),
            Some(seed.id),
            Some(seed.organisation_id),
            Some(seed.project_id),
            seed.environment_id,
            seed.execution_mode,
            seed.agent_pool_id,
            seed.tool_id,
        ],
    )
    .await;
}

pub async fn insert_configuration_version(
    pool: &SqlitePool,
    id: &str,
    workspace_id: &str,
    commit_sha: Option<&str>,
) {
    exec(
        pool,
        r#"
        INSERT INTO configuration_versions (id, workspace_id, ingress_commit_sha, created_at)
        VALUES (?, ?, ?, '2025-01-01T00:00:00Z')
        "#,
        &[Some(id), Some(workspace_id), commit_sha],
    )
    .await;
}

pub async fn set_speculative(pool: &SqlitePool, configuration_version_id: &str) {
    exec(
        pool,
        "UPDATE configuration_versions SET speculative = 1 WHERE id = ?",
        &[Some(configuration_version_id)],
    )
    .await;
}

/// Attach a task to a workspace stage. The task is named `task-{id}`.
pub async fn insert_workspace_task(
    pool: &SqlitePool,
    id: &str,
    workspace_id: &str,
    stage: &str,
    enforcement_level: &str,
) {
    let task_id = format!("task-{}", id);
    exec(
        pool,
        "INSERT INTO tasks (id, organisation_id, name, url) \
         SELECT ?, organisation_id, ?, 'http://tasks.example/hook' FROM workspaces WHERE id = ?",
        &[Some(task_id.as_str()), Some(task_id.as_str()), Some(workspace_id)],
    )
    .await;
    exec(
        pool,
        r#"
        INSERT INTO workspace_tasks (id, workspace_id, task_id, stage, enforcement_level, active)
        VALUES (?, ?, ?, ?, ?, 1)
        "#,
        &[
            Some(id),
            Some(workspace_id),
            Some(task_id.as_str()),
            Some(stage),
            Some(enforcement_level),
        ],
    )
    .await;
}

pub async fn set_task_hmac_key(pool: &SqlitePool, workspace_task_id: &str, key: &str) {
    exec(
        pool,
        "UPDATE tasks SET hmac_key = ? WHERE id = (SELECT task_id FROM workspace_tasks WHERE id = ?)",
        &[Some(key), Some(workspace_task_id)],
    )
    .await;
}

pub async fn insert_lifecycle(pool: &SqlitePool, id: &str, organisation_id: &str, project_id: &str) {
    exec(
        pool,
        "INSERT INTO lifecycles (id, name, organisation_id) VALUES (?, ?, ?)",
        &[Some(id), Some(id), Some(organisation_id)],
    )
    .await;
    exec(
        pool,
        "UPDATE projects SET lifecycle_id = ? WHERE id = ?",
        &[Some(id), Some(project_id)],
    )
    .await;
}

/// Thresholds left as `None` default to the group's size.
pub struct GroupSeed<'a> {
    pub id: &'a str,
    pub lifecycle_id: &'a str,
    pub order: i32,
    pub environment_ids: &'a [&'a str],
    pub minimum_runs: Option<i32>,
    pub minimum_successful_plans: Option<i32>,
    pub minimum_successful_applies: Option<i32>,
}

pub async fn insert_lifecycle_group(pool: &SqlitePool, seed: GroupSeed<'_>) {
    sqlx::query(
        r#"
        INSERT INTO lifecycle_environment_groups (id, lifecycle_id, group_order, minimum_runs,
                                                  minimum_successful_plans,
                                                  minimum_successful_applies)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(seed.id)
    .bind(seed.lifecycle_id)
    .bind(seed.order)
    .bind(seed.minimum_runs)
    .bind(seed.minimum_successful_plans)
    .bind(seed.minimum_successful_applies)
    .execute(pool)
    .await
    .expect("seed statement failed");

    for environment_id in seed.environment_ids {
        let member_id = format!("{}-{}", seed.id, environment_id);
        exec(
            pool,
            "INSERT INTO lifecycle_environments (id, lifecycle_environment_group_id, environment_id) VALUES (?, ?, ?)",
            &[Some(member_id.as_str()), Some(seed.id), Some(environment_id)],
        )
        .await;
    }
}

/// Organisation, project, tool, workspace and configuration version with
/// no overrides: `org-1`, `prj-1`, `tool-1`, `ws-1`, `cv-1`.
pub async fn seed_basic_workspace(pool: &SqlitePool) {
    insert_organisation(pool, "org-1", "remote", None).await;
    insert_project(pool, "prj-1", "org-1").await;
    insert_tool(pool, "tool-1", "1.5.7").await;
    insert_workspace(
        pool,
        WorkspaceSeed {
            id: "ws-1",
            organisation_id: "org-1",
            project_id: "prj-1",
            tool_id: Some("tool-1"),
            ..Default::default()
        },
    )
    .await;
    insert_configuration_version(pool, "cv-1", "ws-1", None).await;
}
