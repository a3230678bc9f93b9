// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the SQLite persistence backend.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use terrarun_core::Persistence;
use terrarun_core::models::{
    AuditSubject, CommandKind, CommandStatus, EnforcementLevel, ExecutionMode, JobLane, JobType,
    RunStatus, TaskResultStatus, TaskResultUpdate, TaskStageName,
};

use common::*;

#[tokio::test]
async fn test_task_results_created_for_active_tasks_only() {
    let p = sqlite_persistence().await;
    seed_basic_workspace(p.pool()).await;
    insert_workspace_task(p.pool(), "wstask-1", "ws-1", "pre_plan", "mandatory", true).await;
    insert_workspace_task(p.pool(), "wstask-2", "ws-1", "pre_plan", "advisory", true).await;
    insert_workspace_task(p.pool(), "wstask-3", "ws-1", "post_plan", "mandatory", false).await;

    p.create_run(&new_run("run-1", "ws-1", "cv-1")).await.unwrap();

    let pre_plan = p
        .get_task_stage("run-1", TaskStageName::PrePlan)
        .await
        .unwrap()
        .unwrap();
    let results = p.list_task_results(&pre_plan.id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == TaskResultStatus::Pending));
    assert!(results.iter().all(|r| r.start_time.is_none()));
    assert_eq!(results[0].enforcement_level, EnforcementLevel::Mandatory);
    assert_eq!(results[1].enforcement_level, EnforcementLevel::Advisory);
    assert_ne!(results[0].callback_id, results[1].callback_id);

    // The inactive post-plan task still leaves an (empty) stage behind.
    let post_plan = p
        .get_task_stage("run-1", TaskStageName::PostPlan)
        .await
        .unwrap()
        .unwrap();
    assert!(p.list_task_results(&post_plan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_audit_log_is_continuous() {
    let p = sqlite_persistence().await;
    seed_basic_workspace(p.pool()).await;
    p.create_run(&new_run("run-1", "ws-1", "cv-1")).await.unwrap();

    let start = Utc::now();
    let path = [
        RunStatus::PrePlanRunning,
        RunStatus::PrePlanCompleted,
        RunStatus::Queuing,
        RunStatus::PlanQueued,
        RunStatus::Planning,
        RunStatus::Errored,
    ];
    for (i, status) in path.iter().enumerate() {
        p.transition_run("run-1", *status, start + Duration::milliseconds(i as i64))
            .await
            .unwrap();
    }
    // Refused: errored is terminal.
    assert!(
        p.transition_run("run-1", RunStatus::Applied, Utc::now())
            .await
            .unwrap()
            .is_none()
    );

    let history = p
        .list_status_history(&AuditSubject::Run("run-1".to_string()))
        .await
        .unwrap();
    assert_eq!(history.len(), path.len() + 1);
    for pair in history.windows(2) {
        assert_eq!(pair[1].old_status.as_deref(), Some(pair[0].new_status.as_str()));
        assert!(pair[1].created_at >= pair[0].created_at);
    }
    assert_eq!(history.last().unwrap().new_status, "errored");
}

#[tokio::test]
async fn test_agent_job_candidates_carry_override_chain() {
    let p = sqlite_persistence().await;
    insert_organisation(p.pool(), "org-1", "remote", Some("pool-org")).await;
    insert_agent_pool(p.pool(), "pool-org", Some("org-1")).await;
    insert_agent_pool(p.pool(), "pool-env", Some("org-1")).await;
    insert_environment(p.pool(), "env-1", "org-1", Some("pool-env")).await;
    insert_project(p.pool(), "prj-1", "org-1", Some("agent"), None).await;
    insert_tool(p.pool(), "tool-1", "1.5.7").await;
    insert_workspace(
        p.pool(),
        WorkspaceSeed {
            id: "ws-1",
            organisation_id: "org-1",
            project_id: "prj-1",
            environment_id: Some("env-1"),
            tool_id: Some("tool-1"),
            ..Default::default()
        },
    )
    .await;
    insert_configuration_version(p.pool(), "cv-1", "ws-1", None).await;
    p.create_run(&new_run("run-1", "ws-1", "cv-1")).await.unwrap();

    p.enqueue_job("run-1", JobLane::Agent, Some(JobType::Plan), Utc::now())
        .await
        .unwrap();
    p.enqueue_job("run-1", JobLane::Agent, Some(JobType::Policy), Utc::now())
        .await
        .unwrap();

    let candidates = p
        .list_agent_job_candidates(&[JobType::Plan, JobType::Apply])
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert_eq!(c.job_type, JobType::Plan);
    assert_eq!(c.workspace_execution_mode, None);
    assert_eq!(c.project_execution_mode, Some(ExecutionMode::Agent));
    assert_eq!(c.organisation_execution_mode, ExecutionMode::Remote);
    assert_eq!(c.workspace_agent_pool_id, None);
    assert_eq!(c.environment_agent_pool_id.as_deref(), Some("pool-env"));
    assert_eq!(c.organisation_agent_pool_id.as_deref(), Some("pool-org"));
}

#[tokio::test]
async fn test_concurrent_agent_claims_assign_once() {
    let p = sqlite_persistence().await;
    seed_basic_workspace(p.pool()).await;
    insert_agent_pool(p.pool(), "pool-1", None).await;
    for i in 0..8 {
        insert_agent(p.pool(), &format!("agent-{}", i), "pool-1").await;
    }
    p.create_run(&new_run("run-1", "ws-1", "cv-1")).await.unwrap();
    let job_id = p
        .enqueue_job("run-1", JobLane::Agent, Some(JobType::Plan), Utc::now())
        .await
        .unwrap();

    let p = Arc::new(p);
    let mut handles = Vec::new();
    for i in 0..8 {
        let p = p.clone();
        handles.push(tokio::spawn(async move {
            p.claim_agent_job(job_id, &format!("agent-{}", i)).await.unwrap()
        }));
    }
    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert!(
        p.list_agent_job_candidates(&[JobType::Plan])
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        p.count_jobs("run-1", JobLane::Agent, Some(JobType::Plan))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_task_result_partial_update_keeps_unset_fields() {
    let p = sqlite_persistence().await;
    seed_basic_workspace(p.pool()).await;
    insert_workspace_task(p.pool(), "wstask-1", "ws-1", "post_plan", "advisory", true).await;
    p.create_run(&new_run("run-1", "ws-1", "cv-1")).await.unwrap();

    let stage = p
        .get_task_stage("run-1", TaskStageName::PostPlan)
        .await
        .unwrap()
        .unwrap();
    let result = p.list_task_results(&stage.id).await.unwrap().remove(0);

    let started = Utc::now();
    p.update_task_result(
        &result.id,
        &TaskResultUpdate {
            status: Some(TaskResultStatus::Running),
            start_time: Some(started),
            ..Default::default()
        },
        started,
    )
    .await
    .unwrap();
    p.update_task_result(
        &result.id,
        &TaskResultUpdate {
            message: Some("still going".to_string()),
            ..Default::default()
        },
        Utc::now(),
    )
    .await
    .unwrap();

    let updated = p
        .get_task_result_by_callback_id(&result.callback_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, TaskResultStatus::Running);
    assert_eq!(updated.message.as_deref(), Some("still going"));
    assert!(updated.start_time.is_some());

    let history = p
        .list_status_history(&AuditSubject::TaskResult(result.id.clone()))
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_commit_run_outcomes_report_latest_commands() {
    let p = sqlite_persistence().await;
    seed_basic_workspace(p.pool()).await;
    insert_configuration_version(p.pool(), "cv-sha", "ws-1", Some("abc123")).await;
    p.create_run(&new_run("run-1", "ws-1", "cv-sha")).await.unwrap();

    let plan = p
        .create_command(CommandKind::Plan, "run-1", Utc::now())
        .await
        .unwrap();
    p.update_command_status(CommandKind::Plan, &plan.id, CommandStatus::Finished, Utc::now())
        .await
        .unwrap();

    let outcomes = p.list_commit_run_outcomes("ws-1", "abc123").await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].plan_status, Some(CommandStatus::Finished));
    assert_eq!(outcomes[0].apply_status, None);

    assert!(
        p.list_commit_run_outcomes("ws-1", "other")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_delete_jobs_for_run() {
    let p = sqlite_persistence().await;
    seed_basic_workspace(p.pool()).await;
    p.create_run(&new_run("run-1", "ws-1", "cv-1")).await.unwrap();
    p.enqueue_job("run-1", JobLane::Agent, Some(JobType::Plan), Utc::now())
        .await
        .unwrap();

    assert_eq!(p.delete_jobs_for_run("run-1").await.unwrap(), 2);
    assert!(p.claim_worker_job().await.unwrap().is_none());
}
