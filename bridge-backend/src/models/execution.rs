use bridge_types::{ExecutionMode, ExecutionStatus, ExecutionSummary, StartExecutionRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use tokio::sync::watch;

/// Max events kept per execution.
pub const MAX_EVENT_LOG: usize = 10_000;

/// Max output lines kept per stream.
pub const MAX_OUTPUT_BUFFER: usize = 1000;

/// Events included in an execution snapshot.
const RECENT_EVENTS_IN_SUMMARY: usize = 20;

/// A message the worker reported, with its arrival time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    pub kind: String,
    pub received_at: DateTime<Utc>,
    pub payload: Value,
}

/// OS handle of a spawned worker.
///
/// The monitor task owns the `Child`; everyone else watches `exited`.
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    pub pid: u32,
    exited: watch::Receiver<bool>,
}

impl WorkerProcess {
    pub fn new(pid: u32, exited: watch::Receiver<bool>) -> Self {
        Self { pid, exited }
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolve once the process has exited (or its monitor went away).
    pub async fn wait_exit(&mut self) {
        // An Err means the sender dropped, which only happens after exit.
        let _ = self.exited.wait_for(|exited| *exited).await;
    }
}

/// One run of the worker.
#[derive(Debug)]
pub struct Execution {
    pub id: String,
    pub status: ExecutionStatus,
    pub request: StartExecutionRequest,
    pub process: Option<WorkerProcess>,
    pub events: VecDeque<RecordedEvent>,
    pub stdout_buffer: VecDeque<String>,
    pub stderr_buffer: VecDeque<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub stats: Option<Value>,
    pub stats_reported_at: Option<String>,
    pub worker_session: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(request: StartExecutionRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: ExecutionStatus::Waiting,
            request,
            process: None,
            events: VecDeque::new(),
            stdout_buffer: VecDeque::new(),
            stderr_buffer: VecDeque::new(),
            last_heartbeat: None,
            stats: None,
            stats_reported_at: None,
            worker_session: None,
            exit_code: None,
            error: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.request.execution_mode
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            log::debug!(
                "[EXECUTION] Ignoring {} -> {} for {}",
                self.status,
                next,
                self.id
            );
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        true
    }

    /// Whether the OS process (if any) might still be around.
    pub fn has_live_process(&self) -> bool {
        self.process.as_ref().map(|p| !p.has_exited()).unwrap_or(false)
    }

    pub fn record_event(&mut self, kind: &str, payload: Value) {
        if self.events.len() >= MAX_EVENT_LOG {
            self.events.pop_front();
        }
        self.events.push_back(RecordedEvent {
            kind: kind.to_string(),
            received_at: Utc::now(),
            payload,
        });
    }

    pub fn record_output(&mut self, stream: &str, line: String) {
        let buffer = if stream == "stderr" {
            &mut self.stderr_buffer
        } else {
            &mut self.stdout_buffer
        };
        if buffer.len() >= MAX_OUTPUT_BUFFER {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    /// Terminal and idle for longer than `max_age`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        if !self.status.is_terminal() {
            return false;
        }
        let since = self.ended_at.unwrap_or(self.created_at);
        now - since > max_age
    }

    /// Most recent output lines, stderr tagged.
    pub fn recent_output(&self, lines: usize) -> Vec<String> {
        let mut output: Vec<String> = self
            .stdout_buffer
            .iter()
            .rev()
            .take(lines)
            .cloned()
            .collect();
        output.extend(
            self.stderr_buffer
                .iter()
                .rev()
                .take(lines)
                .map(|l| format!("[stderr] {}", l)),
        );
        output.truncate(lines);
        output.reverse();
        output
    }

    /// Most recent recorded events, oldest first.
    pub fn recent_events(&self, count: usize) -> Vec<Value> {
        let skip = self.events.len().saturating_sub(count);
        self.events
            .iter()
            .skip(skip)
            .filter_map(|event| serde_json::to_value(event).ok())
            .collect()
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            execution_id: self.id.clone(),
            status: self.status,
            execution_mode: self.mode(),
            pid: self.process.as_ref().map(|p| p.pid),
            created_at: self.created_at.to_rfc3339(),
            ended_at: self.ended_at.map(|t| t.to_rfc3339()),
            last_heartbeat: self.last_heartbeat.map(|t| t.to_rfc3339()),
            stats: self.stats.clone(),
            event_count: self.events.len(),
            worker_connected: self.worker_session.is_some(),
            exit_code: self.exit_code,
            error: self.error.clone(),
            recent_output: self.recent_output(50),
            recent_events: self.recent_events(RECENT_EVENTS_IN_SUMMARY),
        }
    }
}
