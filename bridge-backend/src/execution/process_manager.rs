//! Worker process spawning and monitoring
//!
//! Spawns the worker described by a [`WorkerCommand`], streams its output to
//! UI sessions line by line, and records the exit on the owning execution.

use crate::execution::worker_command::WorkerCommand;
use crate::execution::ExecutionTable;
use crate::gateway::sessions::SessionRegistry;
use crate::models::execution::WorkerProcess;
use bridge_types::{ExecutionStatus, ServerMessage};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;

/// How long to keep draining output after the root process exits. Descendants
/// that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A freshly spawned worker, not yet monitored.
pub struct SpawnedWorker {
    pub process: WorkerProcess,
    child: Child,
    exit_tx: watch::Sender<bool>,
}

/// Spawn the worker. The environment is the inherited one plus `envs`.
pub fn spawn_worker(command: &WorkerCommand) -> std::io::Result<SpawnedWorker> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.workdir {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn()?;
    let pid = child.id().ok_or_else(|| {
        std::io::Error::other("worker exited before its pid could be read")
    })?;
    let (exit_tx, exit_rx) = watch::channel(false);

    Ok(SpawnedWorker {
        process: WorkerProcess::new(pid, exit_rx),
        child,
        exit_tx,
    })
}

impl SpawnedWorker {
    /// Hand the child to a background task that streams output and records
    /// the exit.
    pub fn monitor(
        self,
        execution_id: String,
        executions: ExecutionTable,
        sessions: Arc<SessionRegistry>,
    ) {
        tokio::spawn(monitor_worker(
            self.child,
            self.exit_tx,
            execution_id,
            executions,
            sessions,
        ));
    }
}

fn spawn_reader<R>(
    reader: Option<R>,
    stream: &'static str,
    execution_id: String,
    executions: ExecutionTable,
    sessions: Arc<SessionRegistry>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(reader) = reader else { return };
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(mut exec) = executions.get_mut(&execution_id) {
                exec.record_output(stream, line.clone());
            }
            sessions.broadcast_ui(&ServerMessage::ExecutionOutput {
                execution_id: execution_id.clone(),
                stream: stream.to_string(),
                line,
            });
        }
    })
}

async fn monitor_worker(
    mut child: Child,
    exit_tx: watch::Sender<bool>,
    execution_id: String,
    executions: ExecutionTable,
    sessions: Arc<SessionRegistry>,
) {
    let stdout_handle = spawn_reader(
        child.stdout.take(),
        "stdout",
        execution_id.clone(),
        executions.clone(),
        sessions.clone(),
    );
    let stderr_handle = spawn_reader(
        child.stderr.take(),
        "stderr",
        execution_id.clone(),
        executions.clone(),
        sessions.clone(),
    );

    let exit_status = child.wait().await;
    exit_tx.send_replace(true);

    let drain = async {
        let _ = stdout_handle.await;
        let _ = stderr_handle.await;
    };
    if tokio::time::timeout(OUTPUT_DRAIN_GRACE, drain).await.is_err() {
        log::debug!(
            "[EXECUTION] Output of {} still open after exit, detaching readers",
            execution_id
        );
    }

    let (exit_code, error) = match exit_status {
        Ok(status) => (status.code(), None),
        Err(e) => {
            log::error!("[EXECUTION] Waiting on worker for {} failed: {}", execution_id, e);
            (None, Some(e.to_string()))
        }
    };

    // Re-fetch: the execution may have been stopped or swept meanwhile.
    let transitioned = match executions.get_mut(&execution_id) {
        Some(mut exec) => {
            exec.exit_code = exit_code;
            if error.is_some() {
                exec.error = error.clone();
            }
            exec.transition(ExecutionStatus::Exited)
        }
        None => false,
    };

    log::info!(
        "[EXECUTION] Worker for {} exited with code {:?}",
        execution_id,
        exit_code
    );

    if transitioned {
        sessions.broadcast_ui(&ServerMessage::ExecutionStatus {
            execution_id,
            status: ExecutionStatus::Exited,
            exit_code,
            error,
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::execution::Execution;
    use bridge_types::StartExecutionRequest;
    use dashmap::DashMap;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            envs: HashMap::from([("BRIDGE_TEST_VALUE".to_string(), "hi".to_string())]),
            workdir: None,
        }
    }

    #[tokio::test]
    async fn test_output_is_streamed_and_exit_recorded() {
        let sessions = Arc::new(SessionRegistry::new());
        let (tx, mut rx) = mpsc::channel(100);
        let ui = sessions.register(tx);
        sessions.classify_ui(&ui);

        let executions: ExecutionTable = Arc::new(DashMap::new());
        let mut exec = Execution::new(StartExecutionRequest::default());
        exec.transition(ExecutionStatus::Running);
        let id = exec.id.clone();
        executions.insert(id.clone(), exec);

        let spawned = spawn_worker(&shell("echo $BRIDGE_TEST_VALUE; echo err >&2; exit 3")).unwrap();
        let mut process = spawned.process.clone();
        spawned.monitor(id.clone(), executions.clone(), sessions.clone());

        tokio::time::timeout(Duration::from_secs(5), process.wait_exit())
            .await
            .unwrap();
        // Give the monitor a moment to record the status after the exit flag.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exec = executions.get(&id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Exited);
        assert_eq!(exec.exit_code, Some(3));
        assert_eq!(exec.stdout_buffer.back().map(String::as_str), Some("hi"));
        assert_eq!(exec.stderr_buffer.back().map(String::as_str), Some("err"));
        drop(exec);

        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        assert!(frames.iter().any(|f| f.contains("execution-output") && f.contains("hi")));
        assert!(frames.iter().any(|f| f.contains("\"status\":\"exited\"")));
    }

    #[tokio::test]
    async fn test_exit_after_stop_keeps_stopped() {
        let sessions = Arc::new(SessionRegistry::new());
        let executions: ExecutionTable = Arc::new(DashMap::new());
        let mut exec = Execution::new(StartExecutionRequest::default());
        exec.transition(ExecutionStatus::Running);
        exec.transition(ExecutionStatus::Stopped);
        let id = exec.id.clone();
        executions.insert(id.clone(), exec);

        let spawned = spawn_worker(&shell("exit 0")).unwrap();
        let mut process = spawned.process.clone();
        spawned.monitor(id.clone(), executions.clone(), sessions);
        process.wait_exit().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(executions.get(&id).unwrap().status, ExecutionStatus::Stopped);
    }

    #[test]
    fn test_missing_binary_fails_to_spawn() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(async {
            spawn_worker(&WorkerCommand {
                program: "/nonexistent/worker-binary".into(),
                args: vec![],
                envs: HashMap::new(),
                workdir: None,
            })
        });
        assert!(result.is_err());
    }
}
