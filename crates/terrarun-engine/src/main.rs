// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terrarun Engine - run orchestration worker
//!
//! Runs the worker poll loop that advances plan/apply Runs:
//! - drains WORKER-lane jobs and drives the Run state machine
//! - dispatches task stages to their integrations
//! - queues plan and apply work for agents

use std::sync::Arc;
use tracing::{info, warn};

use terrarun_core::{Persistence, PostgresPersistence, SqlitePersistence, migrations};
use terrarun_engine::config::Config;
use terrarun_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "terrarun_engine=info,terrarun_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        base_url = %config.base_url,
        data_dir = %config.data_dir.display(),
        sqlite = config.is_sqlite(),
        "Starting Terrarun Engine"
    );

    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&config.database_url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Arc::new(SqlitePersistence::new(pool))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };

    info!("Database schema verified");

    let runtime = EngineRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .build()?
        .start()
        .await?;

    info!("Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Terrarun Engine shut down");

    Ok(())
}
