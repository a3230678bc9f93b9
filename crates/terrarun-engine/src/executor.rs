// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local command executor.
//!
//! Runs a terraform process in-process for a Plan or Apply. Combined stdout
//! and stderr are appended to the command's log as they arrive. A companion
//! watcher polls the owning Run and kills the child once the Run is
//! canceled; the watcher itself is stopped through a [`CancellationToken`]
//! when the child exits.
//!
//! Runs whose execution mode resolves to LOCAL are executed this way by the
//! worker itself, using the [`LocalExecution`] settings of the state machine.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use terrarun_core::Persistence;
use terrarun_core::models::{CommandStatus, JobType, RunRecord};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::ExecutableCommand;
use crate::error::{Error, Result};

/// Plan file written by a local plan and consumed by the following apply.
const PLAN_FILE: &str = "terrarun.tfplan";

/// How the worker runs terraform for LOCAL-mode Runs.
#[derive(Debug, Clone)]
pub struct LocalExecution {
    /// Terraform binary to invoke.
    pub program: String,
    /// Each configuration version runs in `<work_root>/<configuration_version_id>`.
    pub work_root: PathBuf,
    /// Extra variables for every invocation.
    pub env: Vec<(String, String)>,
    /// How often the cancellation watcher reads the Run.
    pub watch_interval: Duration,
}

impl Default for LocalExecution {
    fn default() -> Self {
        Self {
            program: "terraform".to_string(),
            work_root: PathBuf::from(".data/local"),
            env: Vec::new(),
            watch_interval: Duration::from_secs(1),
        }
    }
}

impl LocalExecution {
    /// Build the terraform invocation for one step of `run`.
    ///
    /// Plans use `-detailed-exitcode` and save their plan file, which the
    /// apply then executes. The working directory is created if missing.
    pub async fn request(&self, run: &RunRecord, job_type: JobType) -> Result<ExecutionRequest> {
        let mut args: Vec<String> = match job_type {
            JobType::Plan => vec![
                "plan".into(),
                "-input=false".into(),
                "-no-color".into(),
                "-detailed-exitcode".into(),
                format!("-out={}", PLAN_FILE),
            ],
            JobType::Apply => vec![
                "apply".into(),
                "-input=false".into(),
                "-no-color".into(),
                "-auto-approve".into(),
            ],
            other => return Err(Error::UnhandledStatus(format!("job type {}", other))),
        };
        if job_type == JobType::Plan {
            if !run.refresh {
                args.push("-refresh=false".into());
            }
            if run.refresh_only {
                args.push("-refresh-only".into());
            }
            if run.is_destroy {
                args.push("-destroy".into());
            }
        } else {
            args.push(PLAN_FILE.into());
        }

        let working_dir = self.work_root.join(&run.configuration_version_id);
        tokio::fs::create_dir_all(&working_dir).await?;

        let mut env = vec![
            ("TF_IN_AUTOMATION".to_string(), "1".to_string()),
            ("TF_INPUT".to_string(), "0".to_string()),
        ];
        env.extend(self.env.iter().cloned());

        Ok(ExecutionRequest {
            program: self.program.clone(),
            args,
            working_dir: Some(working_dir),
            env,
        })
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// How a local execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Process exit code. `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// The watcher killed the process because the Run was canceled.
    pub canceled: bool,
}

impl ExecutionOutcome {
    /// Command status to report for this outcome.
    pub fn command_status(&self) -> CommandStatus {
        if self.canceled {
            CommandStatus::Canceled
        } else if self.exit_code == Some(0) {
            CommandStatus::Finished
        } else {
            CommandStatus::Errored
        }
    }

    /// Status of a `-detailed-exitcode` plan, and whether it has changes.
    ///
    /// Exit code 0 is a clean plan and 2 a plan with changes.
    pub fn plan_status(&self) -> (CommandStatus, bool) {
        match (self.canceled, self.exit_code) {
            (true, _) => (CommandStatus::Canceled, false),
            (false, Some(0)) => (CommandStatus::Finished, false),
            (false, Some(2)) => (CommandStatus::Finished, true),
            _ => (CommandStatus::Errored, false),
        }
    }
}

/// Runs commands as child processes of the engine.
#[derive(Clone)]
pub struct LocalExecutor {
    persistence: Arc<dyn Persistence>,
    poll_interval: Duration,
}

impl LocalExecutor {
    pub fn new(persistence: Arc<dyn Persistence>, poll_interval: Duration) -> Self {
        Self {
            persistence,
            poll_interval,
        }
    }

    /// Run `request` on behalf of `command`, streaming output into its log.
    pub async fn execute<C: ExecutableCommand>(
        &self,
        command: &mut C,
        request: &ExecutionRequest,
    ) -> Result<ExecutionOutcome> {
        let mut process = Command::new(&request.program);
        process
            .args(&request.args)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            process.current_dir(dir);
        }
        let mut child = process.spawn()?;
        info!(
            run_id = %command.run_id(),
            command_id = %command.id(),
            program = %request.program,
            pid = ?child.id(),
            "Started local execution"
        );

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, tx.clone()));
        }
        drop(tx);

        let stop_watcher = CancellationToken::new();
        let _stop_on_exit = stop_watcher.clone().drop_guard();
        let run_canceled = CancellationToken::new();
        let watcher = tokio::spawn(watch_run(
            self.persistence.clone(),
            command.run_id().to_string(),
            self.poll_interval,
            stop_watcher.clone(),
            run_canceled.clone(),
        ));

        let mut canceled = false;
        loop {
            tokio::select! {
                chunk = rx.recv() => match chunk {
                    Some(data) => command.append_output(&data).await?,
                    None => break,
                },
                _ = run_canceled.cancelled(), if !canceled => {
                    warn!(run_id = %command.run_id(), "Run canceled, killing local execution");
                    child.start_kill()?;
                    canceled = true;
                }
            }
        }

        let status = child.wait().await?;
        stop_watcher.cancel();
        if let Err(e) = watcher.await {
            warn!(error = %e, "Cancellation watcher panicked");
        }

        let outcome = ExecutionOutcome {
            exit_code: status.code(),
            canceled,
        };
        info!(
            run_id = %command.run_id(),
            command_id = %command.id(),
            exit_code = ?outcome.exit_code,
            canceled = outcome.canceled,
            "Local execution finished"
        );
        Ok(outcome)
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

/// Poll the Run until it is canceled or `stop` fires.
async fn watch_run(
    persistence: Arc<dyn Persistence>,
    run_id: String,
    poll_interval: Duration,
    stop: CancellationToken,
    run_canceled: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {
                match persistence.get_run(&run_id).await {
                    Ok(Some(run)) if run.status.is_absorbing() => {
                        debug!(run_id = %run_id, "Watcher saw cancellation");
                        run_canceled.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(run_id = %run_id, error = %e, "Watcher failed to read run"),
                }
            }
        }
    }
}
