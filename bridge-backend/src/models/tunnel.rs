use bridge_types::TunnelSnapshot;
use chrono::{DateTime, Utc};

/// One declared webhook port and its public tunnel, if any.
///
/// The listener and the forwarding target live in their own tables so that
/// forwarding can change without touching either.
#[derive(Debug, Clone)]
pub struct TunnelRoute {
    pub port: u16,
    pub public_url: Option<String>,
    pub tunnel_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TunnelRoute {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            public_url: None,
            tunnel_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_public(&self) -> bool {
        self.tunnel_id.is_some()
    }

    pub fn snapshot(&self, forward_to: Option<u16>) -> TunnelSnapshot {
        TunnelSnapshot {
            port: self.port,
            public_url: self.public_url.clone(),
            tunnel_id: self.tunnel_id.clone(),
            forward_to,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}
