use std::fmt;

/// Failures raised by the orchestration layer.
///
/// Handlers turn these into typed `success: false` replies; the router only
/// logs what reaches it.
#[derive(Debug)]
pub enum BridgeError {
    ExecutionNotFound(String),
    Spawn(String),
    TunnelNotFound(u16),
    InvalidForwarding { port: u16, reason: String },
    Listener { port: u16, source: std::io::Error },
    Provider(String),
    Forward(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecutionNotFound(id) => write!(f, "Execution {} not found", id),
            Self::Spawn(msg) => write!(f, "Failed to spawn worker: {}", msg),
            Self::TunnelNotFound(port) => write!(f, "No tunnel exists for port {}", port),
            Self::InvalidForwarding { port, reason } => {
                write!(f, "Invalid forwarding for port {}: {}", port, reason)
            }
            Self::Listener { port, source } => {
                write!(f, "Failed to start listener on port {}: {}", port, source)
            }
            Self::Provider(msg) => write!(f, "Tunnel provider error: {}", msg),
            Self::Forward(msg) => write!(f, "Forwarding failed: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Listener { source, .. } => Some(source),
            _ => None,
        }
    }
}
