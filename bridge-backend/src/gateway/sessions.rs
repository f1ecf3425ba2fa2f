use bridge_types::ServerMessage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound queue depth per session before frames are dropped.
pub const SESSION_QUEUE_SIZE: usize = 1000;

/// What a connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRole {
    Unclassified,
    Ui,
    Worker { execution_id: String },
}

impl SessionRole {
    pub fn worker_execution(&self) -> Option<&str> {
        match self {
            Self::Worker { execution_id } => Some(execution_id),
            _ => None,
        }
    }
}

struct SessionEntry {
    role: SessionRole,
    sender: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
}

/// Owns every live connection and its classification.
///
/// Each session gets a bounded queue of serialized frames; the connection
/// task drains it into the socket. Sending never blocks: a full queue drops
/// the frame, a closed queue drops the session.
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a new unclassified session and return its id.
    pub fn register(&self, sender: mpsc::Sender<String>) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                role: SessionRole::Unclassified,
                sender,
                connected_at: Utc::now(),
            },
        );
        log::debug!("[SESSIONS] Session {} registered", session_id);
        session_id
    }

    /// Mark a session as UI. Returns false if it is unknown or already a worker.
    pub fn classify_ui(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => match entry.role {
                SessionRole::Unclassified => {
                    entry.role = SessionRole::Ui;
                    true
                }
                SessionRole::Ui => true,
                SessionRole::Worker { .. } => false,
            },
            None => false,
        }
    }

    /// Bind a session to the execution it serves. Only unclassified sessions
    /// can become workers.
    pub fn classify_worker(&self, session_id: &str, execution_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) if entry.role == SessionRole::Unclassified => {
                entry.role = SessionRole::Worker {
                    execution_id: execution_id.to_string(),
                };
                true
            }
            _ => false,
        }
    }

    pub fn role(&self, session_id: &str) -> Option<SessionRole> {
        self.sessions.get(session_id).map(|e| e.role.clone())
    }

    pub fn connected_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(session_id).map(|e| e.connected_at)
    }

    /// Drop a session, returning the role it had.
    pub fn remove(&self, session_id: &str) -> Option<SessionRole> {
        self.sessions.remove(session_id).map(|(_, e)| e.role)
    }

    pub fn send(&self, session_id: &str, message: &ServerMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(json) => self.send_text(session_id, json),
            Err(e) => {
                log::error!("[SESSIONS] Failed to serialize message: {}", e);
                false
            }
        }
    }

    fn send_text(&self, session_id: &str, json: String) -> bool {
        let sender = match self.sessions.get(session_id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };
        match sender.try_send(json) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("[SESSIONS] Queue full for session {}, dropping frame", session_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.sessions.remove(session_id);
                false
            }
        }
    }

    /// Send to every UI session independently. Returns how many accepted it.
    pub fn broadcast_ui(&self, message: &ServerMessage) -> usize {
        match serde_json::to_string(message) {
            Ok(json) => self.broadcast_text(json),
            Err(e) => {
                log::error!("[SESSIONS] Failed to serialize broadcast: {}", e);
                0
            }
        }
    }

    /// Rebroadcast a frame verbatim to every UI session.
    pub fn broadcast_ui_value(&self, value: &Value) -> usize {
        self.broadcast_text(value.to_string())
    }

    fn broadcast_text(&self, json: String) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.sessions.iter() {
            if entry.value().role != SessionRole::Ui {
                continue;
            }
            match entry.value().sender.try_send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "[SESSIONS] Queue full for UI session {}, dropping broadcast",
                        entry.key()
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(entry.key().clone());
                }
            }
        }

        // Removal must happen after iteration releases its shard locks.
        for session_id in closed {
            self.sessions.remove(&session_id);
            log::debug!("[SESSIONS] Removed disconnected session {}", session_id);
        }

        delivered
    }

    pub fn ui_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().role == SessionRole::Ui)
            .count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
