use crate::config::Config;
use crate::error::BridgeError;
use crate::execution::process_manager::{spawn_worker, SpawnedWorker};
use crate::execution::process_tree::{self, KillSignal};
use crate::execution::worker_command::build_worker_command;
use crate::execution::ExecutionTable;
use crate::gateway::sessions::SessionRegistry;
use crate::models::execution::{Execution, WorkerProcess};
use bridge_types::{ExecutionStatus, ExecutionSummary, ServerMessage, StartExecutionRequest};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a start request, reported back to the requesting UI.
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// Configuration frames owed to a worker that just said hello.
#[derive(Debug, Clone)]
pub struct WorkerConfiguration {
    pub rule_document: Value,
    pub extra_vars: Option<Value>,
    pub credentials: Option<Value>,
}

/// Owns the execution table and the single-running-worker invariant.
///
/// Starts are serialized through `start_lane`; stops never touch it so they
/// acknowledge immediately.
pub struct ExecutionManager {
    config: Arc<Config>,
    sessions: Arc<SessionRegistry>,
    executions: ExecutionTable,
    latest: RwLock<Option<String>>,
    detected_runtime: RwLock<Option<String>>,
    start_lane: Mutex<()>,
}

impl ExecutionManager {
    pub fn new(config: Arc<Config>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            sessions,
            executions: Arc::new(DashMap::new()),
            latest: RwLock::new(None),
            detected_runtime: RwLock::new(None),
            start_lane: Mutex::new(()),
        }
    }

    /// Record the container runtime found by the environment probe.
    pub fn set_detected_runtime(&self, runtime: Option<String>) {
        *self.detected_runtime.write() = runtime;
    }

    pub fn latest_execution_id(&self) -> Option<String> {
        self.latest.read().clone()
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.executions.get(execution_id).map(|e| e.status)
    }

    pub fn running_count(&self) -> usize {
        self.executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running)
            .count()
    }

    fn broadcast_status(&self, execution_id: &str) {
        let message = match self.executions.get(execution_id) {
            Some(exec) => ServerMessage::ExecutionStatus {
                execution_id: exec.id.clone(),
                status: exec.status,
                exit_code: exec.exit_code,
                error: exec.error.clone(),
            },
            None => return,
        };
        self.sessions.broadcast_ui(&message);
    }

    /// Mark an execution stopped and tell its worker to shut down. Returns the
    /// process that now needs terminating, if any.
    fn begin_stop(&self, execution_id: &str) -> Option<WorkerProcess> {
        let (process, worker_session) = {
            let mut exec = self.executions.get_mut(execution_id)?;
            if !exec.transition(ExecutionStatus::Stopped) {
                return None;
            }
            (exec.process.clone(), exec.worker_session.clone())
        };

        if let Some(session_id) = worker_session {
            self.sessions.send(
                &session_id,
                &ServerMessage::Shutdown {
                    execution_id: execution_id.to_string(),
                },
            );
        }
        self.broadcast_status(execution_id);
        log::info!("[EXECUTION] Execution {} stopped", execution_id);
        process
    }

    /// Graceful termination now, forced termination if still alive after the
    /// kill timeout. Resolves once the process has exited.
    async fn terminate_with_escalation(process: WorkerProcess, kill_timeout: std::time::Duration) {
        let mut process = process;
        if process.has_exited() {
            return;
        }
        process_tree::terminate_tree(process.pid, KillSignal::Graceful).await;
        if tokio::time::timeout(kill_timeout, process.wait_exit()).await.is_err() {
            log::warn!(
                "[EXECUTION] Worker pid {} ignored graceful stop, forcing",
                process.pid
            );
            process_tree::terminate_tree(process.pid, KillSignal::Forced).await;
            if tokio::time::timeout(kill_timeout, process.wait_exit()).await.is_err()
                && process_tree::is_alive(process.pid)
            {
                log::error!("[EXECUTION] Worker pid {} survived forced stop", process.pid);
            }
        }
    }

    /// Stop an execution without waiting for the OS to finish the job.
    pub fn stop(&self, execution_id: &str) -> Result<(), BridgeError> {
        if !self.executions.contains_key(execution_id) {
            return Err(BridgeError::ExecutionNotFound(execution_id.to_string()));
        }
        if let Some(process) = self.begin_stop(execution_id) {
            let kill_timeout = self.config.worker_kill_timeout;
            tokio::spawn(Self::terminate_with_escalation(process, kill_timeout));
        }
        Ok(())
    }

    /// Stop everything that is running (or still dying), create a new
    /// execution and spawn its worker.
    pub async fn start(&self, request: StartExecutionRequest) -> StartOutcome {
        let _lane = self.start_lane.lock().await;

        // Anything running gets stopped; anything with a live process (e.g.
        // stopped a moment ago) still has to be waited for.
        let predecessors: Vec<String> = self
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Running || e.has_live_process())
            .map(|e| e.id.clone())
            .collect();

        let mut to_wait = Vec::new();
        for id in &predecessors {
            let stopped = self.begin_stop(id);
            let process = stopped.or_else(|| self.executions.get(id).and_then(|e| e.process.clone()));
            if let Some(process) = process {
                to_wait.push(process);
            }
        }
        if !to_wait.is_empty() {
            log::info!(
                "[EXECUTION] Waiting for {} previous worker(s) to exit",
                to_wait.len()
            );
            let kill_timeout = self.config.worker_kill_timeout;
            join_all(
                to_wait
                    .into_iter()
                    .map(|p| Self::terminate_with_escalation(p, kill_timeout)),
            )
            .await;
            // Let the OS release the worker's fixed ports.
            tokio::time::sleep(self.config.worker_restart_settle).await;
        }

        let execution = Execution::new(request);
        let execution_id = execution.id.clone();
        let command = build_worker_command(
            &self.config,
            &execution.request,
            &execution_id,
            self.detected_runtime.read().as_deref(),
        );
        self.executions.insert(execution_id.clone(), execution);
        *self.latest.write() = Some(execution_id.clone());
        self.broadcast_status(&execution_id);

        let spawned = command
            .map_err(BridgeError::Spawn)
            .and_then(|command| {
                log::info!(
                    "[EXECUTION] Starting worker for {}: {}",
                    execution_id,
                    command.display()
                );
                spawn_worker(&command).map_err(|e| BridgeError::Spawn(e.to_string()))
            });

        let outcome = match spawned {
            Ok(spawned) => StartOutcome {
                execution_id: execution_id.clone(),
                status: self.adopt_worker(&execution_id, spawned),
                error: None,
            },
            Err(e) => {
                log::error!("[EXECUTION] {} for {}", e, execution_id);
                let message = e.to_string();
                if let Some(mut exec) = self.executions.get_mut(&execution_id) {
                    exec.error = Some(message.clone());
                    exec.transition(ExecutionStatus::Error);
                }
                StartOutcome {
                    execution_id: execution_id.clone(),
                    status: ExecutionStatus::Error,
                    error: Some(message),
                }
            }
        };
        self.broadcast_status(&execution_id);
        outcome
    }

    /// Attach a freshly spawned worker to its execution. An execution stopped
    /// while its worker was spawning gets the worker torn down right away.
    fn adopt_worker(&self, execution_id: &str, spawned: SpawnedWorker) -> ExecutionStatus {
        let process = spawned.process.clone();
        // Storing the handle and transitioning under one entry guard keeps a
        // concurrent stop from seeing one without the other.
        let running = match self.executions.get_mut(execution_id) {
            Some(mut exec) => {
                exec.process = Some(process.clone());
                exec.transition(ExecutionStatus::Running)
            }
            None => false,
        };
        spawned.monitor(
            execution_id.to_string(),
            self.executions.clone(),
            self.sessions.clone(),
        );

        if running {
            log::info!(
                "[EXECUTION] Worker for {} running (pid {})",
                execution_id,
                process.pid
            );
            return ExecutionStatus::Running;
        }

        log::warn!(
            "[EXECUTION] Execution {} was stopped while its worker spawned, terminating pid {}",
            execution_id,
            process.pid
        );
        tokio::spawn(Self::terminate_with_escalation(
            process,
            self.config.worker_kill_timeout,
        ));
        self.status(execution_id).unwrap_or(ExecutionStatus::Stopped)
    }

    /// Pick the execution a worker message belongs to: explicit id, then the
    /// sender's binding, then the most recently started execution.
    pub fn resolve_target(&self, explicit: Option<&str>, bound: Option<&str>) -> Option<String> {
        explicit
            .or(bound)
            .map(String::from)
            .or_else(|| self.latest_execution_id())
    }

    /// Append an event. False if the execution does not exist.
    pub fn record_event(&self, execution_id: &str, kind: &str, payload: Value) -> bool {
        match self.executions.get_mut(execution_id) {
            Some(mut exec) => {
                exec.record_event(kind, payload);
                true
            }
            None => false,
        }
    }

    /// Store a stats report and return the snapshot to broadcast.
    pub fn record_stats(
        &self,
        execution_id: &str,
        stats: Value,
        reported_at: Option<String>,
    ) -> Option<ServerMessage> {
        let mut exec = self.executions.get_mut(execution_id)?;
        let now = Utc::now();
        exec.stats = Some(stats.clone());
        exec.stats_reported_at = reported_at.clone();
        exec.last_heartbeat = Some(now);
        Some(ServerMessage::ExecutionStats {
            execution_id: execution_id.to_string(),
            stats,
            reported_at,
            last_heartbeat: Some(now.to_rfc3339()),
        })
    }

    /// Refresh the heartbeat and return the current stats snapshot.
    pub fn record_heartbeat(&self, execution_id: &str) -> Option<ServerMessage> {
        let mut exec = self.executions.get_mut(execution_id)?;
        let now = Utc::now();
        exec.last_heartbeat = Some(now);
        Some(ServerMessage::ExecutionStats {
            execution_id: execution_id.to_string(),
            stats: exec.stats.clone().unwrap_or(Value::Null),
            reported_at: exec.stats_reported_at.clone(),
            last_heartbeat: Some(now.to_rfc3339()),
        })
    }

    /// Bind a worker session and hand back the configuration it is owed.
    pub fn attach_worker(&self, execution_id: &str, session_id: &str) -> Option<WorkerConfiguration> {
        let mut exec = self.executions.get_mut(execution_id)?;
        exec.worker_session = Some(session_id.to_string());
        Some(WorkerConfiguration {
            rule_document: exec.request.rule_document.clone(),
            extra_vars: exec.request.extra_vars.clone(),
            credentials: exec.request.credentials.clone(),
        })
    }

    /// Clear the worker-connected flag. Status is left alone: the link
    /// closing says nothing about the process.
    pub fn detach_worker(&self, execution_id: &str, session_id: &str) -> bool {
        match self.executions.get_mut(execution_id) {
            Some(mut exec) if exec.worker_session.as_deref() == Some(session_id) => {
                exec.worker_session = None;
                true
            }
            _ => false,
        }
    }

    /// Drop terminal executions older than the retention window, killing any
    /// process that somehow outlived its execution.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.execution_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));

        let expired: Vec<(String, Option<WorkerProcess>)> = self
            .executions
            .iter()
            .filter(|e| e.is_expired(now, max_age))
            .map(|e| (e.id.clone(), e.process.clone()))
            .collect();

        for (id, process) in &expired {
            if let Some(process) = process.as_ref().filter(|p| !p.has_exited()) {
                log::warn!(
                    "[EXECUTION] Swept execution {} still had pid {}, killing",
                    id,
                    process.pid
                );
                process_tree::terminate_tree_blocking(process.pid, KillSignal::Forced);
            }
            self.executions.remove(id);
        }

        {
            let mut latest = self.latest.write();
            if latest.as_deref().map(|id| !self.executions.contains_key(id)).unwrap_or(false) {
                *latest = None;
            }
        }

        if !expired.is_empty() {
            log::info!("[EXECUTION] Swept {} expired execution(s)", expired.len());
        }
        expired.len()
    }

    pub fn snapshot(&self) -> Vec<ExecutionSummary> {
        let mut summaries: Vec<ExecutionSummary> =
            self.executions.iter().map(|e| e.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Force-terminate every live worker tree. Used at shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .executions
            .iter()
            .filter(|e| !e.status.is_terminal() || e.has_live_process())
            .map(|e| e.id.clone())
            .collect();
        let mut processes = Vec::new();
        for id in ids {
            let stopped = self.begin_stop(&id);
            if let Some(p) = stopped.or_else(|| self.executions.get(&id).and_then(|e| e.process.clone())) {
                processes.push(p);
            }
        }
        join_all(processes.into_iter().map(|p| async move {
            if !p.has_exited() {
                process_tree::terminate_tree(p.pid, KillSignal::Forced).await;
            }
        }))
        .await;
    }

    #[cfg(test)]
    pub(crate) fn table(&self) -> ExecutionTable {
        self.executions.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bridge_types::ExecutionMode;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[cfg(unix)]
    fn write_script(body: &str) -> String {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let mut file = tempfile::Builder::new()
            .prefix("bridge-fake-worker-")
            .suffix(".sh")
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))
            .unwrap();
        // Closed before anything execs it.
        let (handle, path) = file.keep().unwrap();
        drop(handle);
        path.to_string_lossy().into_owned()
    }

    /// A worker stand-in that ignores its flags and idles until signalled.
    #[cfg(unix)]
    pub(crate) fn fake_worker_script() -> String {
        use std::sync::OnceLock;
        static SCRIPT: OnceLock<String> = OnceLock::new();
        SCRIPT
            .get_or_init(|| write_script("#!/bin/sh\nexec sleep 30\n"))
            .clone()
    }

    /// Like `fake_worker_script`, but SIGTERM is ignored by it and its children.
    #[cfg(unix)]
    fn stubborn_worker_script() -> String {
        write_script("#!/bin/sh\ntrap '' TERM\nwhile :; do sleep 1; done\n")
    }

    pub(crate) fn test_config() -> Arc<Config> {
        Arc::new(Config {
            worker_kill_timeout: Duration::from_millis(500),
            worker_restart_settle: Duration::from_millis(10),
            ..Config::default()
        })
    }

    #[cfg(unix)]
    pub(crate) fn fake_request() -> StartExecutionRequest {
        StartExecutionRequest {
            rule_document: serde_json::json!([{"name": "demo"}]),
            extra_vars: Some(serde_json::json!({"x": 1})),
            execution_mode: ExecutionMode::Custom,
            worker_path: Some(fake_worker_script()),
            ..Default::default()
        }
    }

    fn manager() -> (ExecutionManager, mpsc::Receiver<String>) {
        let sessions = Arc::new(SessionRegistry::new());
        let (tx, rx) = mpsc::channel(1000);
        let ui = sessions.register(tx);
        sessions.classify_ui(&ui);
        (ExecutionManager::new(test_config(), sessions), rx)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_runs_worker() {
        let (manager, _rx) = manager();
        let outcome = manager.start(fake_request()).await;
        assert_eq!(outcome.status, ExecutionStatus::Running);
        assert_eq!(manager.status(&outcome.execution_id), Some(ExecutionStatus::Running));
        assert_eq!(manager.latest_execution_id(), Some(outcome.execution_id.clone()));
        manager.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_start_supersedes_first() {
        let (manager, _rx) = manager();
        let first = manager.start(fake_request()).await;
        let first_pid = manager.table().get(&first.execution_id).unwrap().process.clone().unwrap();

        let second = manager.start(fake_request()).await;
        assert_ne!(first.execution_id, second.execution_id);
        assert_eq!(manager.status(&first.execution_id), Some(ExecutionStatus::Stopped));
        assert_eq!(manager.status(&second.execution_id), Some(ExecutionStatus::Running));
        assert_eq!(manager.running_count(), 1);
        // The predecessor was fully gone before the successor spawned.
        assert!(first_pid.has_exited());
        manager.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_starts_keep_one_running() {
        let (manager, _rx) = manager();
        let manager = Arc::new(manager);
        let a = tokio::spawn({
            let m = manager.clone();
            async move { m.start(fake_request()).await }
        });
        let b = tokio::spawn({
            let m = manager.clone();
            async move { m.start(fake_request()).await }
        });
        let _ = a.await.unwrap();
        let _ = b.await.unwrap();
        assert_eq!(manager.running_count(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_error() {
        let (manager, mut rx) = manager();
        let outcome = manager
            .start(StartExecutionRequest {
                execution_mode: ExecutionMode::Custom,
                worker_path: Some("/nonexistent/worker".into()),
                ..Default::default()
            })
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(outcome.error.is_some());
        assert_eq!(manager.status(&outcome.execution_id), Some(ExecutionStatus::Error));

        let mut saw_error = false;
        while let Ok(frame) = rx.try_recv() {
            saw_error |= frame.contains("\"status\":\"error\"");
        }
        assert!(saw_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_acks_then_process_exits() {
        let (manager, _rx) = manager();
        let outcome = manager.start(fake_request()).await;
        let mut process = manager
            .table()
            .get(&outcome.execution_id)
            .unwrap()
            .process
            .clone()
            .unwrap();

        manager.stop(&outcome.execution_id).unwrap();
        assert_eq!(manager.status(&outcome.execution_id), Some(ExecutionStatus::Stopped));

        tokio::time::timeout(Duration::from_secs(5), process.wait_exit())
            .await
            .unwrap();
        // Exit after stop does not rewrite the terminal state.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.status(&outcome.execution_id), Some(ExecutionStatus::Stopped));

        // Stopping again is a no-op success.
        assert!(manager.stop(&outcome.execution_id).is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_forces_worker_that_ignores_sigterm() {
        let (manager, _rx) = manager();
        let outcome = manager
            .start(StartExecutionRequest {
                worker_path: Some(stubborn_worker_script()),
                ..fake_request()
            })
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Running);
        let mut process = manager
            .table()
            .get(&outcome.execution_id)
            .unwrap()
            .process
            .clone()
            .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let kill_timeout = manager.config.worker_kill_timeout;
        let stopped_at = std::time::Instant::now();
        manager.stop(&outcome.execution_id).unwrap();
        tokio::time::timeout(Duration::from_secs(5), process.wait_exit())
            .await
            .expect("forced termination should follow the ignored SIGTERM");
        assert!(stopped_at.elapsed() >= kill_timeout);
        assert_eq!(manager.status(&outcome.execution_id), Some(ExecutionStatus::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_while_spawning_terminates_worker() {
        let (manager, _rx) = manager();
        let exec = Execution::new(fake_request());
        let id = exec.id.clone();
        let command = build_worker_command(&manager.config, &exec.request, &id, None).unwrap();
        manager.table().insert(id.clone(), exec);

        // The stop lands while the execution is still waiting on its worker.
        manager.stop(&id).unwrap();
        assert_eq!(manager.status(&id), Some(ExecutionStatus::Stopped));

        let spawned = spawn_worker(&command).unwrap();
        let mut process = spawned.process.clone();
        assert_eq!(manager.adopt_worker(&id, spawned), ExecutionStatus::Stopped);

        tokio::time::timeout(Duration::from_secs(5), process.wait_exit())
            .await
            .expect("worker of a stopped execution should not survive");
        assert_eq!(manager.status(&id), Some(ExecutionStatus::Stopped));
        assert_eq!(manager.running_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sweep_kills_process_left_behind() {
        let sessions = Arc::new(SessionRegistry::new());
        let config = Arc::new(Config {
            execution_retention: Duration::from_secs(60),
            ..Config::default()
        });
        let manager = ExecutionManager::new(config.clone(), sessions.clone());

        let mut exec = Execution::new(fake_request());
        let id = exec.id.clone();
        let command = build_worker_command(&config, &exec.request, &id, None).unwrap();
        let spawned = spawn_worker(&command).unwrap();
        let mut process = spawned.process.clone();
        exec.process = Some(process.clone());
        exec.transition(ExecutionStatus::Running);
        exec.transition(ExecutionStatus::Stopped);
        exec.ended_at = Some(Utc::now() - chrono::Duration::minutes(5));
        manager.table().insert(id.clone(), exec);
        spawned.monitor(id.clone(), manager.table(), sessions);

        assert_eq!(manager.sweep(), 1);
        assert!(manager.status(&id).is_none());
        tokio::time::timeout(Duration::from_secs(5), process.wait_exit())
            .await
            .expect("swept execution's worker should be killed");
    }

    #[test]
    fn test_stop_unknown_execution() {
        let sessions = Arc::new(SessionRegistry::new());
        let manager = ExecutionManager::new(test_config(), sessions);
        assert!(matches!(
            manager.stop("missing"),
            Err(BridgeError::ExecutionNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_target_fallbacks() {
        let sessions = Arc::new(SessionRegistry::new());
        let manager = ExecutionManager::new(test_config(), sessions);
        assert_eq!(manager.resolve_target(None, None), None);
        *manager.latest.write() = Some("latest".into());
        assert_eq!(manager.resolve_target(None, None).as_deref(), Some("latest"));
        assert_eq!(manager.resolve_target(None, Some("bound")).as_deref(), Some("bound"));
        assert_eq!(
            manager.resolve_target(Some("explicit"), Some("bound")).as_deref(),
            Some("explicit")
        );
    }

    #[test]
    fn test_record_event_unknown_execution_is_rejected() {
        let sessions = Arc::new(SessionRegistry::new());
        let manager = ExecutionManager::new(test_config(), sessions);
        assert!(!manager.record_event("X", "event", serde_json::json!({})));
    }

    #[test]
    fn test_attach_and_detach_worker() {
        let sessions = Arc::new(SessionRegistry::new());
        let manager = ExecutionManager::new(test_config(), sessions);
        let mut exec = Execution::new(StartExecutionRequest {
            rule_document: serde_json::json!({"rules": []}),
            credentials: Some(serde_json::json!({"token": "t"})),
            ..Default::default()
        });
        exec.transition(ExecutionStatus::Running);
        let id = exec.id.clone();
        manager.table().insert(id.clone(), exec);

        let config = manager.attach_worker(&id, "sess-1").unwrap();
        assert_eq!(config.rule_document, serde_json::json!({"rules": []}));
        assert!(config.extra_vars.is_none());
        assert!(config.credentials.is_some());

        assert!(!manager.detach_worker(&id, "someone-else"));
        assert!(manager.detach_worker(&id, "sess-1"));
        assert_eq!(manager.status(&id), Some(ExecutionStatus::Running));
    }

    #[test]
    fn test_sweep_removes_only_old_terminal() {
        let sessions = Arc::new(SessionRegistry::new());
        let config = Arc::new(Config {
            execution_retention: Duration::from_secs(60),
            ..Config::default()
        });
        let manager = ExecutionManager::new(config, sessions);

        let mut old = Execution::new(StartExecutionRequest::default());
        old.transition(ExecutionStatus::Exited);
        old.ended_at = Some(Utc::now() - chrono::Duration::minutes(5));
        let old_id = old.id.clone();

        let mut fresh = Execution::new(StartExecutionRequest::default());
        fresh.transition(ExecutionStatus::Stopped);
        let fresh_id = fresh.id.clone();

        let mut running = Execution::new(StartExecutionRequest::default());
        running.transition(ExecutionStatus::Running);
        running.created_at = Utc::now() - chrono::Duration::hours(5);
        let running_id = running.id.clone();

        manager.table().insert(old_id.clone(), old);
        manager.table().insert(fresh_id.clone(), fresh);
        manager.table().insert(running_id.clone(), running);
        *manager.latest.write() = Some(old_id.clone());

        assert_eq!(manager.sweep(), 1);
        assert!(manager.status(&old_id).is_none());
        assert!(manager.status(&fresh_id).is_some());
        assert!(manager.status(&running_id).is_some());
        assert_eq!(manager.latest_execution_id(), None);
    }

    #[test]
    fn test_record_stats_updates_heartbeat() {
        let sessions = Arc::new(SessionRegistry::new());
        let manager = ExecutionManager::new(test_config(), sessions);
        let exec = Execution::new(StartExecutionRequest::default());
        let id = exec.id.clone();
        manager.table().insert(id.clone(), exec);

        let snapshot = manager
            .record_stats(&id, serde_json::json!({"eventsProcessed": 3}), Some("now".into()))
            .unwrap();
        assert!(matches!(snapshot, ServerMessage::ExecutionStats { .. }));
        let exec = manager.table();
        let exec = exec.get(&id).unwrap();
        assert!(exec.last_heartbeat.is_some());
        assert_eq!(exec.stats.as_ref().unwrap()["eventsProcessed"], 3);
    }
}
