//! Shared types for the bridge session protocol.
//!
//! Every frame on the session channel is a JSON object with a `type`
//! discriminator. Inbound frames (UI or worker → bridge) deserialize into
//! [`ClientMessage`]; outbound frames (bridge → UI or worker) serialize from
//! [`ServerMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

// =====================================================
// Domain Types
// =====================================================

/// Lifecycle state of one worker execution.
///
/// `waiting → running → {stopped | exited | error}`; the three right-hand
/// states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Waiting,
    Running,
    Stopped,
    Exited,
    Error,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Exited | Self::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (Self::Waiting, Self::Running) => true,
            (Self::Waiting | Self::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// How the worker binary is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Binary from the private environment (or PATH).
    #[default]
    Local,
    /// `podman run` / `docker run` of the worker image.
    Container,
    /// Binary at a caller-supplied path.
    Custom,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Container => write!(f, "container"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Payload of a `start-execution` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    /// The rule document handed to the worker verbatim.
    pub rule_document: Value,
    #[serde(default)]
    pub extra_vars: Option<Value>,
    /// Credential / context fields pushed to the worker after the rule document.
    #[serde(default)]
    pub credentials: Option<Value>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Image for `container` mode; falls back to the configured image.
    #[serde(default)]
    pub container_image: Option<String>,
    /// `podman` or `docker`; falls back to the detected runtime.
    #[serde(default)]
    pub container_runtime: Option<String>,
    /// Binary path for `custom` mode.
    #[serde(default)]
    pub worker_path: Option<String>,
    /// Seconds between worker heartbeats.
    #[serde(default)]
    pub heartbeat_interval: Option<u64>,
    /// Free-form extra CLI arguments; quoted substrings stay together.
    #[serde(default)]
    pub extra_args: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// One active webhook port as seen by a (re)connecting UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSnapshot {
    pub port: u16,
    pub public_url: Option<String>,
    pub tunnel_id: Option<String>,
    pub forward_to: Option<u16>,
    pub created_at: String,
}

/// Broadcast to UI sessions for every request landing on a webhook listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    pub port: u16,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Value,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forwarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_to: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_status: Option<u16>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forward_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward_error: Option<String>,
}

/// Point-in-time view of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub execution_mode: ExecutionMode,
    pub pid: Option<u32>,
    pub created_at: String,
    pub ended_at: Option<String>,
    pub last_heartbeat: Option<String>,
    pub stats: Option<Value>,
    pub event_count: usize,
    pub worker_connected: bool,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(default)]
    pub recent_output: Vec<String>,
    #[serde(default)]
    pub recent_events: Vec<Value>,
}

// =====================================================
// Inbound Messages
// =====================================================

/// Every message the bridge accepts, keyed by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    RegisterUi,
    WorkerHello {
        execution_id: String,
    },
    StartExecution(Box<StartExecutionRequest>),
    StopExecution {
        execution_id: String,
    },
    Event {
        #[serde(default)]
        execution_id: Option<String>,
    },
    Job {
        #[serde(default)]
        execution_id: Option<String>,
    },
    Action {
        #[serde(default)]
        execution_id: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        execution_id: Option<String>,
    },
    SessionStats {
        #[serde(default)]
        execution_id: Option<String>,
        #[serde(default)]
        stats: Value,
        #[serde(default)]
        reported_at: Option<String>,
    },
    Heartbeat {
        #[serde(default)]
        execution_id: Option<String>,
    },
    CreateTunnel {
        port: u16,
        #[serde(default)]
        forward_to: Option<u16>,
        #[serde(default)]
        provider_token: Option<String>,
    },
    DeleteTunnel {
        port: u16,
    },
    UpdateTunnelForwarding {
        port: u16,
        #[serde(default)]
        forward_to: Option<u16>,
    },
    GetTunnelState,
    GetExecutionState,
    SendWebhook {
        port: u16,
        #[serde(default)]
        payload: Value,
    },
    RefreshEnvironment,
}

impl ClientMessage {
    /// The wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterUi => "register-ui",
            Self::WorkerHello { .. } => "worker-hello",
            Self::StartExecution(_) => "start-execution",
            Self::StopExecution { .. } => "stop-execution",
            Self::Event { .. } => "event",
            Self::Job { .. } => "job",
            Self::Action { .. } => "action",
            Self::Shutdown { .. } => "shutdown",
            Self::SessionStats { .. } => "session-stats",
            Self::Heartbeat { .. } => "heartbeat",
            Self::CreateTunnel { .. } => "create-tunnel",
            Self::DeleteTunnel { .. } => "delete-tunnel",
            Self::UpdateTunnelForwarding { .. } => "update-tunnel-forwarding",
            Self::GetTunnelState => "get-tunnel-state",
            Self::GetExecutionState => "get-execution-state",
            Self::SendWebhook { .. } => "send-webhook",
            Self::RefreshEnvironment => "refresh-environment",
        }
    }
}

// =====================================================
// Outbound Messages
// =====================================================

/// Every message the bridge emits, keyed by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    UiRegistered {
        session_id: String,
        worker_available: bool,
        worker_version: Option<String>,
        container_runtime: Option<String>,
        tunnel_available: bool,
        log_level: String,
    },
    RuleDocument {
        data: Value,
    },
    ExtraVars {
        data: Value,
    },
    Credentials {
        data: Value,
    },
    EndOfConfiguration,
    Shutdown {
        execution_id: String,
    },
    ExecutionStarted {
        execution_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ExecutionStopped {
        execution_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ExecutionStatus {
        execution_id: String,
        status: ExecutionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ExecutionOutput {
        execution_id: String,
        stream: String,
        line: String,
    },
    ExecutionStats {
        execution_id: String,
        stats: Value,
        reported_at: Option<String>,
        last_heartbeat: Option<String>,
    },
    ExecutionState {
        executions: Vec<ExecutionSummary>,
    },
    WorkerConnection {
        execution_id: String,
        connected: bool,
    },
    HeartbeatAck,
    TunnelCreated {
        port: u16,
        success: bool,
        public_url: Option<String>,
        tunnel_id: Option<String>,
        forward_to: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelDeleted {
        port: u16,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelForwardingUpdated {
        port: u16,
        forward_to: Option<u16>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TunnelState {
        tunnels: Vec<TunnelSnapshot>,
    },
    WebhookResponse {
        success: bool,
        status: Option<u16>,
        body: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WebhookReceived(WebhookNotification),
}
