// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle tests driven through the worker lane and agent updates.

mod common;

use terrarun_core::CoreError;
use terrarun_core::models::{CommandKind, CommandStatus, JobType, RunStatus};
use terrarun_engine::Error;
use terrarun_engine::run_state_machine::{CommandStatusUpdate, RunAttributes};

use common::*;

fn update(run_id: &str, status: &str) -> CommandStatusUpdate {
    CommandStatusUpdate {
        run_id: run_id.to_string(),
        status: status.to_string(),
        ..Default::default()
    }
}

fn finished_with_changes(run_id: &str) -> CommandStatusUpdate {
    CommandStatusUpdate {
        run_id: run_id.to_string(),
        status: "finished".to_string(),
        has_changes: Some(true),
        resource_additions: Some(2),
        resource_changes: Some(1),
        resource_destructions: Some(3),
    }
}

async fn setup() -> Harness {
    let h = Harness::new().await;
    seed_basic_workspace(&h.pool).await;
    insert_agent_pool(&h.pool, "pool-global", None).await;
    insert_agent(&h.pool, "agent-1", "pool-global").await;
    h
}

/// Create a Run and drive it to PLAN_QUEUED.
async fn queued_run(h: &Harness, attributes: RunAttributes) -> String {
    let run = h
        .state_machine
        .create("cv-1", Some("user-1"), attributes)
        .await
        .unwrap();
    h.poll(2).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PlanQueued);
    run.id
}

/// Drive a Run to POST_PLAN_COMPLETED with a plan that has changes.
async fn planned_run(h: &Harness) -> String {
    let run_id = queued_run(h, RunAttributes::default()).await;
    h.state_machine
        .handle_agent_status_update("plan", &update(&run_id, "running"))
        .await
        .unwrap();
    h.state_machine
        .handle_agent_status_update("plan", &finished_with_changes(&run_id))
        .await
        .unwrap();
    h.poll(2).await;
    assert_eq!(h.status(&run_id).await, RunStatus::PostPlanCompleted);
    run_id
}

#[tokio::test]
async fn test_create_run_starts_pending_and_locks_workspace() {
    let h = setup().await;

    let run = h
        .state_machine
        .create(
            "cv-1",
            Some("user-1"),
            RunAttributes {
                message: Some("first".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.tool_id, "tool-1");
    assert_eq!(run.created_by.as_deref(), Some("user-1"));
    assert_eq!(run.message.as_deref(), Some("first"));
    assert!(run.refresh);
    assert!(!run.plan_only);
    assert_eq!(h.lock_holder("ws-1").await.as_deref(), Some(run.id.as_str()));
    assert_eq!(h.worker_jobs(&run.id).await, 1);
}

#[tokio::test]
async fn test_second_run_rejected_while_workspace_locked() {
    let h = setup().await;
    h.state_machine
        .create("cv-1", None, RunAttributes::default())
        .await
        .unwrap();

    let err = h
        .state_machine
        .create("cv-1", None, RunAttributes::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Core(CoreError::WorkspaceLocked { .. })));
    assert_eq!(err.error_code(), "WORKSPACE_LOCKED");
}

#[tokio::test]
async fn test_create_requires_tool() {
    let h = Harness::new().await;
    insert_organisation(&h.pool, "org-1", "remote", None).await;
    insert_project(&h.pool, "prj-1", "org-1").await;
    insert_tool(&h.pool, "tool-1", "1.5.7").await;
    insert_workspace(
        &h.pool,
        WorkspaceSeed {
            id: "ws-bare",
            organisation_id: "org-1",
            project_id: "prj-1",
            ..Default::default()
        },
    )
    .await;
    insert_configuration_version(&h.pool, "cv-bare", "ws-bare", None).await;

    let err = h
        .state_machine
        .create("cv-bare", None, RunAttributes::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ToolNotConfigured(ref ws) if ws == "ws-bare"));

    let err = h
        .state_machine
        .create(
            "cv-bare",
            None,
            RunAttributes {
                terraform_version: Some("9.9.9".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ToolNotConfigured(_)));
    assert_eq!(h.lock_holder("ws-bare").await, None);

    let run = h
        .state_machine
        .create(
            "cv-bare",
            None,
            RunAttributes {
                terraform_version: Some("1.5.7".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(run.tool_id, "tool-1");
}

#[tokio::test]
async fn test_full_run_reaches_applied() {
    let h = setup().await;
    let run = h
        .state_machine
        .create("cv-1", Some("user-1"), RunAttributes::default())
        .await
        .unwrap();

    h.poll(1).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PrePlanRunning);
    assert_eq!(
        h.command(CommandKind::Plan, &run.id).await.status,
        CommandStatus::Pending
    );

    h.poll(1).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PlanQueued);
    assert_eq!(h.agent_jobs(&run.id, JobType::Plan).await, 1);
    assert_eq!(h.drain().await, 0);

    let job = h
        .state_machine
        .job_queue()
        .get_job_for_agent("agent-1", &[JobType::Plan, JobType::Apply])
        .await
        .unwrap()
        .expect("agent should receive the plan job");
    assert_eq!(job.run_id, run.id);
    assert_eq!(job.job_type, JobType::Plan);
    assert_eq!(job.tool_version, "1.5.7");
    assert_eq!(h.credentials.verify(&job.job_token).unwrap(), run.id);

    let planning = h
        .state_machine
        .handle_agent_status_update("plan", &update(&run.id, "running"))
        .await
        .unwrap();
    assert_eq!(planning.status, RunStatus::Planning);

    let planned = h
        .state_machine
        .handle_agent_status_update("plan", &finished_with_changes(&run.id))
        .await
        .unwrap();
    assert_eq!(planned.status, RunStatus::Planned);
    assert_eq!(h.agent_jobs(&run.id, JobType::Plan).await, 0);

    let plan = h.command(CommandKind::Plan, &run.id).await;
    assert_eq!(plan.status, CommandStatus::Finished);
    assert!(plan.resources.has_changes);
    assert_eq!(plan.resources.additions, 2);
    assert_eq!(plan.resources.changes, 1);
    assert_eq!(plan.resources.destructions, 3);
    assert_eq!(
        h.command(CommandKind::Apply, &run.id).await.status,
        CommandStatus::Pending
    );

    h.poll(2).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PostPlanCompleted);
    assert_eq!(h.drain().await, 0, "unconfirmed run must wait");

    let confirmed = h
        .state_machine
        .confirm(&run.id, Some("looks good"), Some("user-2"))
        .await
        .unwrap();
    assert_eq!(confirmed.status, RunStatus::Confirmed);
    assert!(confirmed.confirmed);
    assert_eq!(confirmed.confirmed_by.as_deref(), Some("user-2"));

    h.poll(2).await;
    assert_eq!(h.status(&run.id).await, RunStatus::ApplyQueued);
    assert_eq!(h.agent_jobs(&run.id, JobType::Apply).await, 1);

    let job = h
        .state_machine
        .job_queue()
        .get_job_for_agent("agent-1", &[JobType::Plan, JobType::Apply])
        .await
        .unwrap()
        .expect("agent should receive the apply job");
    assert_eq!(job.job_type, JobType::Apply);

    h.state_machine
        .handle_agent_status_update("APPLY", &update(&run.id, "RUNNING"))
        .await
        .unwrap();
    assert_eq!(h.status(&run.id).await, RunStatus::Applying);

    let applied = h
        .state_machine
        .handle_agent_status_update(
            "apply",
            &CommandStatusUpdate {
                run_id: run.id.clone(),
                status: "finished".into(),
                resource_additions: Some(2),
                resource_changes: Some(1),
                resource_destructions: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(applied.status, RunStatus::Applied);
    assert_eq!(h.lock_holder("ws-1").await, None);
    assert_eq!(h.agent_jobs(&run.id, JobType::Apply).await, 0);

    let apply = h.command(CommandKind::Apply, &run.id).await;
    assert_eq!(apply.status, CommandStatus::Finished);
    assert_eq!(apply.resources.destructions, 3);

    let history = h.state_machine.status_history(&run.id).await.unwrap();
    let statuses: Vec<&str> = history.iter().map(|t| t.new_status.as_str()).collect();
    assert_eq!(
        statuses,
        vec![
            "pending",
            "pre_plan_running",
            "pre_plan_completed",
            "queuing",
            "plan_queued",
            "planning",
            "planned",
            "post_plan_running",
            "post_plan_completed",
            "confirmed",
            "pre_apply_running",
            "pre_apply_completed",
            "apply_queued",
            "applying",
            "applied",
        ]
    );
    assert_eq!(history[0].old_status, None);
    for pair in history.windows(2) {
        assert_eq!(pair[1].old_status.as_deref(), Some(pair[0].new_status.as_str()));
    }
}

#[tokio::test]
async fn test_plan_without_changes_finishes_run() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    let run = h
        .state_machine
        .handle_plan_status_update(&CommandStatusUpdate {
            run_id: run_id.clone(),
            status: "finished".into(),
            has_changes: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::PlannedAndFinished);
    assert!(
        h.persistence
            .latest_command(CommandKind::Apply, &run_id)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(h.lock_holder("ws-1").await, None);
    assert_eq!(h.drain().await, 0);
}

#[tokio::test]
async fn test_plan_only_run_stops_after_plan() {
    let h = setup().await;
    let run_id = queued_run(
        &h,
        RunAttributes {
            plan_only: true,
            ..Default::default()
        },
    )
    .await;

    let run = h
        .state_machine
        .handle_plan_status_update(&finished_with_changes(&run_id))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::PlannedAndFinished);
}

#[tokio::test]
async fn test_speculative_configuration_forces_plan_only() {
    let h = setup().await;
    set_speculative(&h.pool, "cv-1").await;

    let run = h
        .state_machine
        .create("cv-1", None, RunAttributes::default())
        .await
        .unwrap();
    assert!(run.plan_only);

    h.poll(2).await;
    let run = h
        .state_machine
        .handle_plan_status_update(&finished_with_changes(&run.id))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::PlannedAndFinished);
}

#[tokio::test]
async fn test_auto_apply_skips_confirmation() {
    let h = setup().await;
    let run_id = queued_run(
        &h,
        RunAttributes {
            auto_apply: Some(true),
            ..Default::default()
        },
    )
    .await;
    h.state_machine
        .handle_plan_status_update(&finished_with_changes(&run_id))
        .await
        .unwrap();

    h.drain().await;
    assert_eq!(h.status(&run_id).await, RunStatus::ApplyQueued);
}

#[tokio::test]
async fn test_plan_error_fails_run_and_releases_lock() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    let run = h
        .state_machine
        .handle_plan_status_update(&update(&run_id, "errored"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Errored);
    assert_eq!(
        h.command(CommandKind::Plan, &run_id).await.status,
        CommandStatus::Errored
    );
    assert_eq!(h.agent_jobs(&run_id, JobType::Plan).await, 0);
    assert_eq!(h.lock_holder("ws-1").await, None);
}

#[tokio::test]
async fn test_unhandled_updates_are_rejected() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    for job_type in ["policy", "assessment", "test", "bogus"] {
        let err = h
            .state_machine
            .handle_agent_status_update(job_type, &update(&run_id, "running"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledStatus(_)), "{}", job_type);
    }

    for status in ["pending", "exploded"] {
        let err = h
            .state_machine
            .handle_agent_status_update("plan", &update(&run_id, status))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnhandledStatus(_)), "{}", status);
    }

    assert_eq!(h.status(&run_id).await, RunStatus::PlanQueued);
}

#[tokio::test]
async fn test_cancel_is_absorbing() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    let run = h
        .state_machine
        .cancel(&run_id, Some("user-9"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(run.canceled_by.as_deref(), Some("user-9"));
    assert_eq!(
        h.command(CommandKind::Plan, &run_id).await.status,
        CommandStatus::Canceled
    );
    assert_eq!(h.agent_jobs(&run_id, JobType::Plan).await, 0);
    assert_eq!(h.lock_holder("ws-1").await, None);

    // A late report from an agent changes nothing
    let run = h
        .state_machine
        .handle_plan_status_update(&finished_with_changes(&run_id))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert_eq!(
        h.command(CommandKind::Plan, &run_id).await.status,
        CommandStatus::Canceled
    );

    let err = h.state_machine.cancel(&run_id, None).await.unwrap_err();
    assert!(matches!(err, Error::RunCannotBeCanceled { .. }));

    let run = h
        .state_machine
        .force_cancel(&run_id, Some("admin"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::ForceCanceled);

    let err = h
        .state_machine
        .force_cancel(&run_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunCannotBeCanceled { .. }));
}

#[tokio::test]
async fn test_update_for_canceled_run_releases_stale_lock() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;
    h.state_machine.cancel(&run_id, None).await.unwrap();

    sqlx::query("UPDATE workspaces SET locked_by_run_id = ? WHERE id = 'ws-1'")
        .bind(&run_id)
        .execute(&h.pool)
        .await
        .unwrap();

    h.state_machine
        .handle_plan_status_update(&update(&run_id, "running"))
        .await
        .unwrap();
    assert_eq!(h.lock_holder("ws-1").await, None);
    assert_eq!(h.status(&run_id).await, RunStatus::Canceled);
}

#[tokio::test]
async fn test_force_cancel_requires_canceled_run() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    let err = h
        .state_machine
        .force_cancel(&run_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunCannotBeCanceled { .. }));
    assert_eq!(h.status(&run_id).await, RunStatus::PlanQueued);
}

#[tokio::test]
async fn test_terminal_run_cannot_be_canceled() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;
    h.state_machine
        .handle_plan_status_update(&update(&run_id, "errored"))
        .await
        .unwrap();

    let err = h.state_machine.cancel(&run_id, None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::RunCannotBeCanceled { ref status, .. } if status == "errored"
    ));
}

#[tokio::test]
async fn test_discard_after_post_plan() {
    let h = setup().await;
    let run_id = planned_run(&h).await;

    let run = h
        .state_machine
        .discard(&run_id, Some("user-3"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Discarded);
    assert_eq!(run.discarded_by.as_deref(), Some("user-3"));
    assert_eq!(
        h.command(CommandKind::Apply, &run_id).await.status,
        CommandStatus::Unreachable
    );
    assert_eq!(h.lock_holder("ws-1").await, None);
}

#[tokio::test]
async fn test_refused_discard_leaves_apply_and_actor_untouched() {
    let h = setup().await;
    let run_id = planned_run(&h).await;

    // Another writer keeps the run out of discarded
    sqlx::query(
        "CREATE TRIGGER hold_run_status BEFORE UPDATE OF status ON runs \
         WHEN NEW.status = 'discarded' BEGIN SELECT RAISE(IGNORE); END",
    )
    .execute(&h.pool)
    .await
    .unwrap();

    let err = h
        .state_machine
        .discard(&run_id, Some("user-3"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunCannotBeDiscarded { .. }));

    let run = h.state_machine.get(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::PostPlanCompleted);
    assert_eq!(run.discarded_by, None);
    assert_eq!(
        h.command(CommandKind::Apply, &run_id).await.status,
        CommandStatus::Pending
    );
    assert_eq!(h.lock_holder("ws-1").await.as_deref(), Some(run_id.as_str()));
}

#[tokio::test]
async fn test_discard_rejected_outside_post_plan() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    let err = h.state_machine.discard(&run_id, None).await.unwrap_err();
    assert!(matches!(err, Error::RunCannotBeDiscarded { .. }));
    assert_eq!(err.error_code(), "RUN_CANNOT_BE_DISCARDED");
    assert_eq!(h.status(&run_id).await, RunStatus::PlanQueued);
    assert_eq!(h.lock_holder("ws-1").await.as_deref(), Some(run_id.as_str()));
}

#[tokio::test]
async fn test_confirm_rejected_before_plan() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    let err = h
        .state_machine
        .confirm(&run_id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunCannotBeConfirmed { .. }));
}

#[tokio::test]
async fn test_early_confirm_carries_through_post_plan() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;
    h.state_machine
        .handle_plan_status_update(&finished_with_changes(&run_id))
        .await
        .unwrap();

    let run = h
        .state_machine
        .confirm(&run_id, Some("ship it"), Some("user-2"))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Planned);
    assert!(run.confirmed);

    let err = h
        .state_machine
        .confirm(&run_id, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunCannotBeConfirmed { .. }));

    h.drain().await;
    assert_eq!(h.status(&run_id).await, RunStatus::ApplyQueued);
}

#[tokio::test]
async fn test_failed_worker_step_is_retried() {
    let h = setup().await;
    let run = h
        .state_machine
        .create("cv-1", None, RunAttributes::default())
        .await
        .unwrap();
    h.poll(1).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PrePlanRunning);

    // Without its stage the pre-plan poll cannot complete
    sqlx::query("DELETE FROM task_stages WHERE run_id = ? AND stage = 'pre_plan'")
        .bind(&run.id)
        .execute(&h.pool)
        .await
        .unwrap();

    h.poll(1).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PrePlanRunning);
    assert_eq!(h.worker_jobs(&run.id).await, 1);
}

#[tokio::test]
async fn test_lost_agent_job_is_requeued() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    h.persistence
        .delete_agent_jobs(&run_id, JobType::Plan)
        .await
        .unwrap();
    h.state_machine.job_queue().enqueue_worker(&run_id).await.unwrap();
    h.poll(1).await;

    assert_eq!(h.agent_jobs(&run_id, JobType::Plan).await, 1);
    assert_eq!(h.status(&run_id).await, RunStatus::PlanQueued);
}

#[tokio::test]
async fn test_force_unlock_clears_lock() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;
    assert_eq!(h.lock_holder("ws-1").await.as_deref(), Some(run_id.as_str()));

    let err = h
        .state_machine
        .workspace_lock()
        .release("ws-1", "run-other")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FailedToUnlockWorkspace { .. }));

    h.state_machine
        .workspace_lock()
        .force_unlock("ws-1")
        .await
        .unwrap();
    assert_eq!(h.lock_holder("ws-1").await, None);
}

#[tokio::test]
async fn test_apply_report_cannot_skip_confirmation() {
    let h = setup().await;
    let run_id = planned_run(&h).await;

    let err = h
        .state_machine
        .handle_agent_status_update("apply", &update(&run_id, "finished"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnexpectedStatusUpdate { ref status, .. } if status == "post_plan_completed"
    ));
    assert_eq!(err.error_code(), "UNEXPECTED_STATUS_UPDATE");

    assert_eq!(h.status(&run_id).await, RunStatus::PostPlanCompleted);
    assert_eq!(
        h.command(CommandKind::Apply, &run_id).await.status,
        CommandStatus::Pending
    );
    assert_eq!(h.lock_holder("ws-1").await.as_deref(), Some(run_id.as_str()));
}

#[tokio::test]
async fn test_plan_report_cannot_skip_pre_plan_tasks() {
    let h = setup().await;
    let run = h
        .state_machine
        .create("cv-1", None, RunAttributes::default())
        .await
        .unwrap();
    h.poll(1).await;
    assert_eq!(h.status(&run.id).await, RunStatus::PrePlanRunning);

    let err = h
        .state_machine
        .handle_agent_status_update("plan", &update(&run.id, "running"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatusUpdate { .. }));

    assert_eq!(h.status(&run.id).await, RunStatus::PrePlanRunning);
    assert_eq!(
        h.command(CommandKind::Plan, &run.id).await.status,
        CommandStatus::Pending
    );
}

#[tokio::test]
async fn test_repeated_plan_report_creates_no_second_apply() {
    let h = setup().await;
    let run_id = planned_run(&h).await;
    assert_eq!(h.applies(&run_id).await, 1);

    let err = h
        .state_machine
        .handle_agent_status_update("plan", &finished_with_changes(&run_id))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatusUpdate { .. }));

    assert_eq!(h.status(&run_id).await, RunStatus::PostPlanCompleted);
    assert_eq!(h.applies(&run_id).await, 1);
    assert_eq!(h.worker_jobs(&run_id).await, 0);
}

#[tokio::test]
async fn test_duplicate_running_report_is_harmless() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;

    for _ in 0..2 {
        let run = h
            .state_machine
            .handle_agent_status_update("plan", &update(&run_id, "running"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Planning);
    }
    let history = h.state_machine.status_history(&run_id).await.unwrap();
    let planning = history
        .iter()
        .filter(|t| t.new_status == "planning")
        .count();
    assert_eq!(planning, 1);
}

#[tokio::test]
async fn test_planned_step_recreates_missing_apply() {
    let h = setup().await;
    let run_id = queued_run(&h, RunAttributes::default()).await;
    h.state_machine
        .handle_plan_status_update(&finished_with_changes(&run_id))
        .await
        .unwrap();
    sqlx::query("DELETE FROM applies WHERE run_id = ?")
        .bind(&run_id)
        .execute(&h.pool)
        .await
        .unwrap();

    h.poll(1).await;
    assert_eq!(h.status(&run_id).await, RunStatus::PostPlanRunning);
    assert_eq!(h.applies(&run_id).await, 1);
}
