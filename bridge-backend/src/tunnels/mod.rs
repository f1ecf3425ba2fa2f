//! Tunnel & webhook forwarding
//!
//! A tunnel route ties together three independently mutable pieces of state
//! for one webhook port: the local listener, the optional public tunnel, and
//! the optional forwarding target. Setup is listener first, tunnel second;
//! teardown runs in reverse.

pub mod forward;
pub mod listener;
pub mod provider;

use crate::config::Config;
use crate::error::BridgeError;
use crate::gateway::sessions::SessionRegistry;
use crate::models::tunnel::TunnelRoute;
use bridge_types::TunnelSnapshot;
use dashmap::DashMap;
use listener::{start_listener, ListenerState, WebhookListener};
use provider::TunnelProvider;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct TunnelManager {
    config: Arc<Config>,
    sessions: Arc<SessionRegistry>,
    provider: Arc<dyn TunnelProvider>,
    listeners: DashMap<u16, WebhookListener>,
    routes: DashMap<u16, TunnelRoute>,
    /// Shared with every listener; read per request.
    forwarding: Arc<DashMap<u16, u16>>,
    /// Serializes create/delete so a port is never half set up twice.
    lane: Mutex<()>,
}

fn validate_forwarding(port: u16, forward_to: u16) -> Result<(), BridgeError> {
    if forward_to == 0 {
        return Err(BridgeError::InvalidForwarding {
            port,
            reason: "target port must be non-zero".to_string(),
        });
    }
    if forward_to == port {
        return Err(BridgeError::InvalidForwarding {
            port,
            reason: "a port cannot forward to itself".to_string(),
        });
    }
    Ok(())
}

impl TunnelManager {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionRegistry>,
        provider: Arc<dyn TunnelProvider>,
    ) -> Self {
        Self {
            config,
            sessions,
            provider,
            listeners: DashMap::new(),
            routes: DashMap::new(),
            forwarding: Arc::new(DashMap::new()),
            lane: Mutex::new(()),
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Make sure a live listener is bound to `port`. Returns true if one was
    /// started by this call.
    async fn ensure_listener(&self, port: u16) -> Result<bool, BridgeError> {
        if self.listeners.get(&port).map(|l| l.is_running()).unwrap_or(false) {
            return Ok(false);
        }
        if let Some((_, stale)) = self.listeners.remove(&port) {
            log::warn!("[TUNNEL] Replacing dead listener on port {}", port);
            stale.stop().await;
        }

        let listener = start_listener(
            &self.config,
            ListenerState {
                port,
                forwarding: self.forwarding.clone(),
                sessions: self.sessions.clone(),
                forward_timeout: self.config.webhook_forward_timeout,
            },
        )?;
        self.listeners.insert(port, listener);
        Ok(true)
    }

    async fn drop_listener(&self, port: u16) {
        if let Some((_, listener)) = self.listeners.remove(&port) {
            listener.stop().await;
        }
    }

    fn snapshot_of(&self, port: u16) -> Option<TunnelSnapshot> {
        let forward_to = self.forwarding.get(&port).map(|t| *t);
        self.routes.get(&port).map(|r| r.snapshot(forward_to))
    }

    /// Create (or complete) the route for `port`. Without a provider token the
    /// route stays local: listener and forwarding only.
    pub async fn create(
        &self,
        port: u16,
        forward_to: Option<u16>,
        provider_token: Option<&str>,
    ) -> Result<TunnelSnapshot, BridgeError> {
        if let Some(target) = forward_to {
            validate_forwarding(port, target)?;
        }
        let token = provider_token.map(str::trim).filter(|t| !t.is_empty());

        let _lane = self.lane.lock().await;

        let already_public = self.routes.get(&port).map(|r| r.is_public()).unwrap_or(false);
        let listener_alive = self.listeners.get(&port).map(|l| l.is_running()).unwrap_or(false);
        if already_public && listener_alive {
            if let Some(target) = forward_to {
                self.forwarding.insert(port, target);
            }
            log::info!("[TUNNEL] Port {} already has a public tunnel, reusing it", port);
            return self.snapshot_of(port).ok_or(BridgeError::TunnelNotFound(port));
        }

        let created_listener = self.ensure_listener(port).await?;

        let tunnel = match token {
            Some(token) if !already_public => match self.provider.open(port, token).await {
                Ok(tunnel) => Some(tunnel),
                Err(e) => {
                    if created_listener {
                        self.drop_listener(port).await;
                    }
                    return Err(BridgeError::Provider(e.to_string()));
                }
            },
            _ => None,
        };

        {
            let mut route = self
                .routes
                .entry(port)
                .or_insert_with(|| TunnelRoute::new(port));
            if let Some(tunnel) = tunnel {
                route.public_url = Some(tunnel.public_url);
                route.tunnel_id = Some(tunnel.tunnel_id);
            }
        }
        if let Some(target) = forward_to {
            self.forwarding.insert(port, target);
        }

        log::info!(
            "[TUNNEL] Route for port {} ready (forwarding: {:?})",
            port,
            forward_to
        );
        self.snapshot_of(port).ok_or(BridgeError::TunnelNotFound(port))
    }

    /// Close the public tunnel, then the listener, then forget the port.
    pub async fn delete(&self, port: u16) -> Result<(), BridgeError> {
        let _lane = self.lane.lock().await;

        let route = self.routes.remove(&port).map(|(_, r)| r);
        if route.is_none() && !self.listeners.contains_key(&port) {
            return Err(BridgeError::TunnelNotFound(port));
        }
        self.forwarding.remove(&port);

        if let Some(tunnel_id) = route.and_then(|r| r.tunnel_id) {
            if let Err(e) = self.provider.close(&tunnel_id).await {
                log::warn!("[TUNNEL] Closing tunnel {} for port {}: {}", tunnel_id, port, e);
            }
        }
        self.drop_listener(port).await;
        log::info!("[TUNNEL] Route for port {} deleted", port);
        Ok(())
    }

    /// Retarget forwarding for an existing route. `None` turns it off.
    pub fn update_forwarding(&self, port: u16, forward_to: Option<u16>) -> Result<(), BridgeError> {
        // Holding the route entry keeps a concurrent delete from interleaving.
        let _route = self
            .routes
            .get(&port)
            .ok_or(BridgeError::TunnelNotFound(port))?;
        match forward_to {
            Some(target) => {
                validate_forwarding(port, target)?;
                self.forwarding.insert(port, target);
                log::info!("[TUNNEL] Port {} now forwards to {}", port, target);
            }
            None => {
                self.forwarding.remove(&port);
                log::info!("[TUNNEL] Port {} forwarding cleared", port);
            }
        }
        Ok(())
    }

    pub fn state(&self) -> Vec<TunnelSnapshot> {
        let mut tunnels: Vec<TunnelSnapshot> = self
            .routes
            .iter()
            .map(|r| r.snapshot(self.forwarding.get(r.key()).map(|t| *t)))
            .collect();
        tunnels.sort_by_key(|t| t.port);
        tunnels
    }

    /// Tear down every route. Used at shutdown.
    pub async fn shutdown_all(&self) {
        let mut ports: Vec<u16> = self.routes.iter().map(|r| *r.key()).collect();
        ports.extend(self.listeners.iter().map(|l| *l.key()));
        ports.sort_unstable();
        ports.dedup();
        for port in ports {
            if let Err(e) = self.delete(port).await {
                log::debug!("[TUNNEL] Shutdown of port {}: {}", port, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::shared_client;
    use listener::tests::free_port;
    use provider::MockTunnelProvider;
    use std::time::Duration;

    fn manager(provider: Arc<MockTunnelProvider>) -> TunnelManager {
        TunnelManager::new(
            Arc::new(Config::default()),
            Arc::new(SessionRegistry::new()),
            provider,
        )
    }

    #[actix_web::test]
    async fn test_create_then_delete_leaves_nothing() {
        let provider = Arc::new(MockTunnelProvider::default());
        let tunnels = manager(provider.clone());
        let port = free_port();

        let snapshot = tunnels.create(port, Some(port + 1), Some("token")).await.unwrap();
        assert_eq!(snapshot.public_url, Some(format!("https://{}.tunnel.test", port)));
        assert_eq!(snapshot.forward_to, Some(port + 1));
        assert!(tunnels.listeners.contains_key(&port));

        tunnels.delete(port).await.unwrap();
        assert!(!tunnels.routes.contains_key(&port));
        assert!(!tunnels.listeners.contains_key(&port));
        assert!(!tunnels.forwarding.contains_key(&port));
        assert!(provider.open_tunnels.is_empty());
        assert!(tunnels.state().is_empty());
    }

    #[actix_web::test]
    async fn test_provider_failure_tears_down_new_listener() {
        let provider = Arc::new(MockTunnelProvider::failing("invalid token"));
        let tunnels = manager(provider);
        let port = free_port();

        let err = tunnels.create(port, None, Some("bad")).await.unwrap_err();
        assert!(matches!(err, BridgeError::Provider(_)));
        assert!(!tunnels.listeners.contains_key(&port));
        assert!(!tunnels.routes.contains_key(&port));
    }

    #[actix_web::test]
    async fn test_provider_failure_keeps_existing_listener() {
        let provider = Arc::new(MockTunnelProvider::failing("quota exceeded"));
        let tunnels = manager(provider);
        let port = free_port();

        // Local-only route first.
        tunnels.create(port, None, None).await.unwrap();
        assert!(tunnels.create(port, None, Some("token")).await.is_err());
        assert!(tunnels.listeners.get(&port).unwrap().is_running());
        assert!(tunnels.routes.contains_key(&port));

        tunnels.shutdown_all().await;
        assert!(tunnels.listeners.is_empty());
    }

    #[actix_web::test]
    async fn test_create_is_idempotent_for_public_tunnels() {
        let provider = Arc::new(MockTunnelProvider::default());
        let tunnels = manager(provider.clone());
        let port = free_port();

        let first = tunnels.create(port, None, Some("token")).await.unwrap();
        let second = tunnels.create(port, Some(9100), Some("token")).await.unwrap();
        assert_eq!(first.tunnel_id, second.tunnel_id);
        assert_eq!(second.forward_to, Some(9100));
        assert_eq!(provider.open_tunnels.len(), 1);

        tunnels.shutdown_all().await;
    }

    #[actix_web::test]
    async fn test_create_replaces_dead_listener() {
        let tunnels = manager(Arc::new(MockTunnelProvider::default()));
        let port = free_port();
        tunnels.create(port, None, None).await.unwrap();

        // The server goes away without the manager being told.
        let handle = tunnels.listeners.get(&port).unwrap().server_handle();
        handle.stop(true).await;
        for _ in 0..50 {
            if !tunnels.listeners.get(&port).unwrap().is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!tunnels.listeners.get(&port).unwrap().is_running());

        let mut recreated = false;
        for _ in 0..20 {
            match tunnels.create(port, None, None).await {
                Ok(_) => {
                    recreated = true;
                    break;
                }
                // The old socket can linger briefly after its server stops.
                Err(BridgeError::Listener { .. }) => {
                    tokio::time::sleep(Duration::from_millis(50)).await
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert!(recreated);
        assert!(tunnels.listeners.get(&port).unwrap().is_running());

        let response = shared_client()
            .post(format!("http://127.0.0.1:{}/hook", port))
            .json(&serde_json::json!({"a": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        tunnels.shutdown_all().await;
    }

    #[test]
    fn test_update_forwarding_without_tunnel_is_rejected() {
        let tunnels = manager(Arc::new(MockTunnelProvider::default()));
        let err = tunnels.update_forwarding(7000, Some(7001)).unwrap_err();
        assert!(matches!(err, BridgeError::TunnelNotFound(7000)));
        assert!(tunnels.forwarding.is_empty());
        assert!(tunnels.routes.is_empty());
    }

    #[test]
    fn test_update_forwarding_changes_only_the_mapping() {
        let tunnels = manager(Arc::new(MockTunnelProvider::default()));
        tunnels.routes.insert(7000, TunnelRoute::new(7000));

        tunnels.update_forwarding(7000, Some(7001)).unwrap();
        assert_eq!(tunnels.state()[0].forward_to, Some(7001));

        assert!(matches!(
            tunnels.update_forwarding(7000, Some(7000)),
            Err(BridgeError::InvalidForwarding { .. })
        ));
        assert_eq!(tunnels.state()[0].forward_to, Some(7001));

        tunnels.update_forwarding(7000, None).unwrap();
        assert_eq!(tunnels.state()[0].forward_to, None);
    }

    #[actix_web::test]
    async fn test_delete_unknown_port() {
        let tunnels = manager(Arc::new(MockTunnelProvider::default()));
        assert!(matches!(
            tunnels.delete(7000).await,
            Err(BridgeError::TunnelNotFound(7000))
        ));
    }
}
