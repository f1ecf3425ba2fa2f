pub mod actix_ws;
pub mod methods;
pub mod router;
pub mod sessions;

use crate::config::Config;
use crate::execution::ExecutionManager;
use crate::gateway::sessions::SessionRegistry;
use crate::probe::{probe_environment, EnvironmentStatus};
use crate::tunnels::provider::{NgrokAgentProvider, TunnelProvider};
use crate::tunnels::TunnelManager;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Owns every table the handlers work on: sessions, executions, tunnel
/// routes, and the last environment probe.
pub struct Gateway {
    config: Arc<Config>,
    sessions: Arc<SessionRegistry>,
    executions: Arc<ExecutionManager>,
    tunnels: Arc<TunnelManager>,
    environment: RwLock<EnvironmentStatus>,
}

impl Gateway {
    pub fn new(config: Arc<Config>) -> Self {
        let provider = Arc::new(NgrokAgentProvider::new(
            config.tunnel_binary.clone(),
            config.tunnel_start_timeout,
        ));
        Self::with_provider(config, provider)
    }

    /// Create a Gateway with a specific tunnel provider
    pub fn with_provider(config: Arc<Config>, provider: Arc<dyn TunnelProvider>) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let executions = Arc::new(ExecutionManager::new(config.clone(), sessions.clone()));
        let tunnels = Arc::new(TunnelManager::new(config.clone(), sessions.clone(), provider));
        Self {
            config,
            sessions,
            executions,
            tunnels,
            environment: RwLock::new(EnvironmentStatus::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn executions(&self) -> &Arc<ExecutionManager> {
        &self.executions
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn environment(&self) -> EnvironmentStatus {
        self.environment.read().clone()
    }

    /// Re-run the environment probe and publish the result.
    pub async fn refresh_environment(&self) -> EnvironmentStatus {
        let status = probe_environment(&self.config).await;
        self.executions
            .set_detected_runtime(status.container_runtime.clone());
        *self.environment.write() = status.clone();
        status
    }

    /// Probe in the background so startup never waits on external binaries.
    pub fn spawn_environment_probe(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            gateway.refresh_environment().await;
        });
    }

    /// Periodically drop expired executions until `cancel` fires.
    pub fn spawn_retention_sweep(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let executions = Arc::clone(&self.executions);
        let period = self
            .config
            .execution_sweep_interval
            .max(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; nothing can be expired yet.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let executions = Arc::clone(&executions);
                        if let Err(e) = tokio::task::spawn_blocking(move || executions.sweep()).await {
                            log::error!("[GATEWAY] Retention sweep failed: {}", e);
                        }
                    }
                }
            }
            log::debug!("[GATEWAY] Retention sweep stopped");
        })
    }

    /// Delete every tunnel route and force-kill every live worker.
    pub async fn shutdown(&self) {
        log::info!("[GATEWAY] Shutting down: closing tunnels and workers");
        self.tunnels.shutdown_all().await;
        self.executions.shutdown().await;
    }
}
