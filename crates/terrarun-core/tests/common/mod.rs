// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for terrarun-core integration tests.
//!
//! Seeds rows with raw SQL so tests do not depend on any API beyond the
//! `Persistence` trait under test.

#![allow(dead_code)]

use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use terrarun_core::SqlitePersistence;
use terrarun_core::migrations;
use terrarun_core::models::NewRun;

/// In-memory SQLite persistence with migrations applied.
pub async fn sqlite_persistence() -> SqlitePersistence {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    migrations::SQLITE
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    SqlitePersistence::new(pool)
}

/// Helper macro to skip tests if TEST_TERRARUN_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_TERRARUN_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_TERRARUN_DATABASE_URL not set");
            return;
        }
    };
}

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

pub async fn insert_environment(
    pool: &SqlitePool,
    id: &str,
    organisation_id: &str,
    agent_pool_id: Option<&str>,
) {
    exec(
        pool,
        "INSERT INTO environments (id, name, organisation_id, agent_pool_id) VALUES (?, ?, ?, ?)",
        &[Some(id), Some(id), Some(organisation_id), agent_pool_id],
    )
    .await;
}

pub async fn insert_project(
    pool: &SqlitePool,
    id: &str,
    organisation_id: &str,
    execution_mode: Option<&str>,
    agent_pool_id: Option<&str>,
) {
    exec(
        pool,
        "INSERT INTO projects (id, name, organisation_id, execution_mode, agent_pool_id) VALUES (?, ?, ?, ?, ?)",
        &[
            Some(id),
            Some(id),
            Some(organisation_id),
            execution_mode,
            agent_pool_id,
        ],
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

pub async fn insert_workspace_task(
    pool: &SqlitePool,
    id: &str,
    workspace_id: &str,
    stage: &str,
    enforcement_level: &str,
    active: bool,
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
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        &[
            Some(id),
            Some(workspace_id),
            Some(task_id.as_str()),
            Some(stage),
            Some(enforcement_level),
            Some(if active { "1" } else { "0" }),
        ],
    )
    .await;
}

/// Organisation, project, tool, workspace and configuration version with
/// no overrides: `org-1`, `prj-1`, `tool-1`, `ws-1`, `cv-1`.
pub async fn seed_basic_workspace(pool: &SqlitePool) {
    insert_organisation(pool, "org-1", "remote", None).await;
    insert_project(pool, "prj-1", "org-1", None, None).await;
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

pub fn new_run(id: &str, workspace_id: &str, configuration_version_id: &str) -> NewRun {
    NewRun {
        id: id.to_string(),
        workspace_id: workspace_id.to_string(),
        configuration_version_id: configuration_version_id.to_string(),
        tool_id: "tool-1".to_string(),
        auto_apply: false,
        plan_only: false,
        refresh: true,
        refresh_only: false,
        is_destroy: false,
        message: None,
        created_by: Some("user-1".to_string()),
        created_at: Utc::now(),
    }
}
