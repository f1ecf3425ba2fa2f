//! Session classification and status methods
//!
//! `register-ui`, `worker-hello`, `heartbeat`, `refresh-environment`, and the
//! disconnect hook.

use crate::error::BridgeError;
use crate::gateway::sessions::SessionRole;
use crate::gateway::Gateway;
use bridge_types::ServerMessage;

fn ui_registered(gateway: &Gateway, session_id: &str) -> ServerMessage {
    let env = gateway.environment();
    ServerMessage::UiRegistered {
        session_id: session_id.to_string(),
        worker_available: env.worker_available,
        worker_version: env.worker_version,
        container_runtime: env.container_runtime,
        tunnel_available: env.tunnel_available,
        log_level: gateway.config().log_level.clone(),
    }
}

/// Handle `register-ui`
pub async fn handle_register_ui(gateway: &Gateway, session_id: &str) -> Result<(), BridgeError> {
    if !gateway.sessions().classify_ui(session_id) {
        log::warn!(
            "[ROUTER] Session {} is a worker session, ignoring register-ui",
            session_id
        );
        return Ok(());
    }
    log::info!(
        "[GATEWAY] UI session {} registered ({} UI sessions)",
        session_id,
        gateway.sessions().ui_count()
    );
    gateway
        .sessions()
        .send(session_id, &ui_registered(gateway, session_id));
    Ok(())
}

/// Handle `worker-hello`: bind the session and push the configuration.
pub async fn handle_worker_hello(
    gateway: &Gateway,
    session_id: &str,
    execution_id: String,
) -> Result<(), BridgeError> {
    let sessions = gateway.sessions();
    if !sessions.classify_worker(session_id, &execution_id) {
        log::warn!(
            "[ROUTER] Session {} already classified, ignoring worker-hello for {}",
            session_id,
            execution_id
        );
        return Ok(());
    }

    let Some(config) = gateway.executions().attach_worker(&execution_id, session_id) else {
        log::warn!(
            "[GATEWAY] Worker session {} claims unknown execution {}",
            session_id,
            execution_id
        );
        return Ok(());
    };

    log::info!(
        "[GATEWAY] Worker for {} connected on session {}",
        execution_id,
        session_id
    );
    sessions.send(
        session_id,
        &ServerMessage::RuleDocument {
            data: config.rule_document,
        },
    );
    if let Some(data) = config.extra_vars {
        sessions.send(session_id, &ServerMessage::ExtraVars { data });
    }
    if let Some(data) = config.credentials {
        sessions.send(session_id, &ServerMessage::Credentials { data });
    }
    sessions.send(session_id, &ServerMessage::EndOfConfiguration);

    sessions.broadcast_ui(&ServerMessage::WorkerConnection {
        execution_id,
        connected: true,
    });
    Ok(())
}

/// Handle `heartbeat`. Worker heartbeats also refresh the execution's stats.
pub async fn handle_heartbeat(
    gateway: &Gateway,
    session_id: &str,
    execution_id: Option<String>,
) -> Result<(), BridgeError> {
    let role = gateway.sessions().role(session_id);
    let bound = role.as_ref().and_then(SessionRole::worker_execution);
    if let Some(target) = execution_id.as_deref().or(bound) {
        if let Some(snapshot) = gateway.executions().record_heartbeat(target) {
            gateway.sessions().broadcast_ui(&snapshot);
        }
    }
    gateway
        .sessions()
        .send(session_id, &ServerMessage::HeartbeatAck);
    Ok(())
}

/// Handle `refresh-environment`: re-probe and answer with fresh status flags.
pub async fn handle_refresh_environment(
    gateway: &Gateway,
    session_id: &str,
) -> Result<(), BridgeError> {
    gateway.refresh_environment().await;
    gateway
        .sessions()
        .send(session_id, &ui_registered(gateway, session_id));
    Ok(())
}

/// Connection closed. A worker's link dropping says nothing about its
/// process, so execution status is left alone.
pub fn handle_disconnect(gateway: &Gateway, session_id: &str) {
    match gateway.sessions().remove(session_id) {
        Some(SessionRole::Worker { execution_id }) => {
            if gateway.executions().detach_worker(&execution_id, session_id) {
                gateway
                    .sessions()
                    .broadcast_ui(&ServerMessage::WorkerConnection {
                        execution_id: execution_id.clone(),
                        connected: false,
                    });
            }
            log::info!(
                "[GATEWAY] Worker session {} for {} disconnected",
                session_id,
                execution_id
            );
        }
        Some(role) => log::debug!("[GATEWAY] Session {} ({:?}) removed", session_id, role),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::execution::Execution;
    use crate::tunnels::provider::MockTunnelProvider;
    use bridge_types::{ExecutionStatus, StartExecutionRequest};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn gateway() -> Gateway {
        Gateway::with_provider(
            Arc::new(Config::default()),
            Arc::new(MockTunnelProvider::default()),
        )
    }

    fn connect(gateway: &Gateway) -> (String, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(100);
        (gateway.sessions().register(tx), rx)
    }

    fn frames(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).unwrap());
        }
        out
    }

    fn running_execution(gateway: &Gateway) -> String {
        let mut exec = Execution::new(StartExecutionRequest {
            rule_document: json!([{"name": "ruleset"}]),
            extra_vars: Some(json!({"threshold": 3})),
            ..Default::default()
        });
        exec.transition(ExecutionStatus::Running);
        let id = exec.id.clone();
        gateway.executions().table().insert(id.clone(), exec);
        id
    }

    #[tokio::test]
    async fn test_register_ui_replies_with_session_id() {
        let gateway = gateway();
        let (session, mut rx) = connect(&gateway);
        handle_register_ui(&gateway, &session).await.unwrap();

        let reply = frames(&mut rx).remove(0);
        assert_eq!(reply["type"], "ui-registered");
        assert_eq!(reply["sessionId"], session.as_str());
        assert_eq!(reply["logLevel"], "info");
    }

    #[tokio::test]
    async fn test_worker_hello_pushes_configuration_in_order() {
        let gateway = gateway();
        let id = running_execution(&gateway);
        let (ui, mut ui_rx) = connect(&gateway);
        handle_register_ui(&gateway, &ui).await.unwrap();
        frames(&mut ui_rx);

        let (worker, mut rx) = connect(&gateway);
        handle_worker_hello(&gateway, &worker, id.clone()).await.unwrap();

        let types: Vec<String> = frames(&mut rx)
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(types, vec!["rule-document", "extra-vars", "end-of-configuration"]);

        let ui_frames = frames(&mut ui_rx);
        assert_eq!(ui_frames[0]["type"], "worker-connection");
        assert_eq!(ui_frames[0]["connected"], true);
    }

    #[tokio::test]
    async fn test_worker_disconnect_keeps_status() {
        let gateway = gateway();
        let id = running_execution(&gateway);
        let (worker, _rx) = connect(&gateway);
        handle_worker_hello(&gateway, &worker, id.clone()).await.unwrap();

        handle_disconnect(&gateway, &worker);
        assert_eq!(gateway.executions().status(&id), Some(ExecutionStatus::Running));
        assert!(gateway.sessions().role(&worker).is_none());
        let summary = gateway.executions().snapshot().remove(0);
        assert!(!summary.worker_connected);
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let gateway = gateway();
        let (session, mut rx) = connect(&gateway);
        handle_heartbeat(&gateway, &session, None).await.unwrap();
        assert_eq!(frames(&mut rx)[0]["type"], "heartbeat-ack");
    }
}
