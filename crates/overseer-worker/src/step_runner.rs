// Step runner: executes a run's steps as local subprocesses and streams
// their output back through the worker's outbound channel.

use anyhow::{Context, Result};
use overseer_common::messages::WorkerMessage;
use overseer_common::model::{BuildStep, RunOutcome, StepStatus};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of a single step execution.
enum StepEnd {
    Succeeded,
    Failed,
    Aborted,
}

/// Executes build steps for one run at a time.
pub struct StepRunner {
    work_directory: PathBuf,
}

impl StepRunner {
    pub fn new(work_directory: impl Into<PathBuf>) -> Self {
        Self {
            work_directory: work_directory.into(),
        }
    }

    /// Run all steps in order, streaming output and per-step statuses.
    ///
    /// A failing step fails the run; the remaining steps are not executed.
    /// Cancellation kills the current step's process and aborts the run.
    /// The caller sends the final `RunCompleted` from the returned outcome.
    pub async fn run(
        &self,
        run_id: Uuid,
        target: &str,
        steps: &[BuildStep],
        tx: mpsc::Sender<WorkerMessage>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        tracing::info!(
            "Starting run {} for '{}' ({} step(s))",
            run_id,
            target,
            steps.len()
        );

        for (step_index, step) in steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return RunOutcome::Aborted;
            }

            let end = match self
                .execute_step(run_id, step_index, step, &tx, &cancel)
                .await
            {
                Ok(end) => end,
                Err(e) => {
                    tracing::warn!("Step '{}' of run {} failed to start: {:#}", step.name, run_id, e);
                    let _ = tx
                        .send(WorkerMessage::StepOutput {
                            run_id,
                            step_index,
                            chunk: format!("failed to start step: {:#}", e),
                        })
                        .await;
                    StepEnd::Failed
                }
            };

            let status = match end {
                StepEnd::Succeeded => StepStatus::Succeeded,
                StepEnd::Failed | StepEnd::Aborted => StepStatus::Failed,
            };
            let _ = tx
                .send(WorkerMessage::StepCompleted {
                    run_id,
                    step_index,
                    status,
                })
                .await;

            match end {
                StepEnd::Succeeded => continue,
                StepEnd::Failed => return RunOutcome::Failure,
                StepEnd::Aborted => return RunOutcome::Aborted,
            }
        }

        RunOutcome::Success
    }

    /// Spawn one step's process and pump its output until it exits or the
    /// run is cancelled.
    async fn execute_step(
        &self,
        run_id: Uuid,
        step_index: usize,
        step: &BuildStep,
        tx: &mpsc::Sender<WorkerMessage>,
        cancel: &CancellationToken,
    ) -> Result<StepEnd> {
        std::fs::create_dir_all(&self.work_directory)
            .with_context(|| format!("Failed to create work directory {:?}", self.work_directory))?;

        tracing::debug!(
            "Run {} step {} '{}': {} {:?}",
            run_id,
            step_index,
            step.name,
            step.command,
            step.args
        );

        let mut child = tokio::process::Command::new(&step.command)
            .args(&step.args)
            .current_dir(&self.work_directory)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", step.command))?;

        let stdout = child
            .stdout
            .take()
            .context("Child process has no stdout handle")?;
        let stderr = child
            .stderr
            .take()
            .context("Child process has no stderr handle")?;

        let stdout_task = tokio::spawn(forward_lines(stdout, tx.clone(), run_id, step_index));
        let stderr_task = tokio::spawn(forward_lines(stderr, tx.clone(), run_id, step_index));

        let status = tokio::select! {
            status = child.wait() => {
                Some(status.context("Failed to wait for step process")?)
            }
            _ = cancel.cancelled() => {
                tracing::info!("Run {} cancelled — killing step process", run_id);
                let _ = child.kill().await;
                let _ = child.wait().await;
                None
            }
        };

        // Let the output pumps drain before reporting the step status.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        match status {
            None => Ok(StepEnd::Aborted),
            Some(status) if status.success() => Ok(StepEnd::Succeeded),
            Some(status) => {
                tracing::info!(
                    "Run {} step {} exited with {}",
                    run_id,
                    step_index,
                    status
                );
                Ok(StepEnd::Failed)
            }
        }
    }
}

/// Forward each line of `reader` as one step-output chunk.
async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::Sender<WorkerMessage>,
    run_id: Uuid,
    step_index: usize,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message = WorkerMessage::StepOutput {
            run_id,
            step_index,
            chunk: line,
        };
        if tx.send(message).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, script: &str) -> BuildStep {
        BuildStep {
            name: name.into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    async fn drain(rx: &mut mpsc::Receiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    #[tokio::test]
    async fn test_successful_run_streams_output() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StepRunner::new(dir.path());
        let (tx, mut rx) = mpsc::channel(64);

        let steps = vec![step("hello", "echo hello"), step("world", "echo world")];
        let outcome = runner
            .run(
                Uuid::new_v4(),
                "demo",
                &steps,
                tx,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, RunOutcome::Success);

        let messages = drain(&mut rx).await;
        let chunks: Vec<String> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::StepOutput { chunk, .. } => Some(chunk.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["hello".to_string(), "world".to_string()]);

        let statuses: Vec<StepStatus> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::StepCompleted { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![StepStatus::Succeeded, StepStatus::Succeeded]);
    }

    #[tokio::test]
    async fn test_failing_step_skips_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StepRunner::new(dir.path());
        let (tx, mut rx) = mpsc::channel(64);

        let steps = vec![
            step("bad", "exit 3"),
            step("never", "echo should-not-run"),
        ];
        let outcome = runner
            .run(
                Uuid::new_v4(),
                "demo",
                &steps,
                tx,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, RunOutcome::Failure);

        let messages = drain(&mut rx).await;
        let completed: Vec<usize> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::StepCompleted { step_index, .. } => Some(*step_index),
                _ => None,
            })
            .collect();
        // Only the failing step ran.
        assert_eq!(completed, vec![0]);
    }

    #[tokio::test]
    async fn test_unknown_command_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StepRunner::new(dir.path());
        let (tx, mut rx) = mpsc::channel(64);

        let steps = vec![BuildStep {
            name: "missing".into(),
            command: "definitely-not-a-real-binary".into(),
            args: vec![],
        }];
        let outcome = runner
            .run(
                Uuid::new_v4(),
                "demo",
                &steps,
                tx,
                CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, RunOutcome::Failure);

        let messages = drain(&mut rx).await;
        assert!(messages.iter().any(|m| matches!(
            m,
            WorkerMessage::StepCompleted {
                status: StepStatus::Failed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StepRunner::new(dir.path());
        let (tx, _rx) = mpsc::channel(64);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let steps = vec![step("sleepy", "sleep 30")];
        let outcome = runner
            .run(Uuid::new_v4(), "demo", &steps, tx, cancel)
            .await;
        assert_eq!(outcome, RunOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_cancel_mid_step_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let runner = StepRunner::new(dir.path());
        let (tx, _rx) = mpsc::channel(64);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let steps = vec![step("sleepy", "sleep 30")];
        let started = std::time::Instant::now();
        let outcome = runner
            .run(Uuid::new_v4(), "demo", &steps, tx, cancel)
            .await;
        assert_eq!(outcome, RunOutcome::Aborted);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
