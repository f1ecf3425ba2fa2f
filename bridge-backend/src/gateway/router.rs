//! Inbound message routing
//!
//! Frames are parsed into [`ClientMessage`] and dispatched through one
//! exhaustive match. Anything that does not parse is dropped; handler errors
//! and panics are logged and never reach the connection.

use crate::error::BridgeError;
use crate::gateway::methods;
use crate::gateway::Gateway;
use bridge_types::ClientMessage;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;

/// Parse a text frame. Returns the typed message and the raw JSON, which some
/// handlers rebroadcast verbatim.
pub fn parse_inbound(text: &str) -> Option<(ClientMessage, Value)> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(e) => {
            log::debug!("[ROUTER] Dropping unparseable frame: {}", e);
            return None;
        }
    };
    let Some(kind) = raw.get("type").and_then(Value::as_str) else {
        log::debug!("[ROUTER] Dropping frame without a type");
        return None;
    };
    match serde_json::from_value::<ClientMessage>(raw.clone()) {
        Ok(message) => Some((message, raw)),
        Err(e) => {
            log::debug!("[ROUTER] Dropping '{}' frame: {}", kind, e);
            None
        }
    }
}

async fn route(
    gateway: &Gateway,
    session_id: &str,
    message: ClientMessage,
    raw: Value,
) -> Result<(), BridgeError> {
    match message {
        ClientMessage::RegisterUi => methods::handle_register_ui(gateway, session_id).await,
        ClientMessage::WorkerHello { execution_id } => {
            methods::handle_worker_hello(gateway, session_id, execution_id).await
        }
        ClientMessage::StartExecution(request) => {
            methods::handle_start_execution(gateway, session_id, *request).await
        }
        ClientMessage::StopExecution { execution_id } => {
            methods::handle_stop_execution(gateway, session_id, execution_id).await
        }
        ClientMessage::Event { execution_id } => {
            methods::handle_worker_message(gateway, session_id, "event", execution_id, raw).await
        }
        ClientMessage::Job { execution_id } => {
            methods::handle_worker_message(gateway, session_id, "job", execution_id, raw).await
        }
        ClientMessage::Action { execution_id } => {
            methods::handle_worker_message(gateway, session_id, "action", execution_id, raw).await
        }
        ClientMessage::Shutdown { execution_id } => {
            methods::handle_worker_message(gateway, session_id, "shutdown", execution_id, raw)
                .await
        }
        ClientMessage::SessionStats {
            execution_id,
            stats,
            reported_at,
        } => {
            methods::handle_session_stats(gateway, session_id, execution_id, stats, reported_at, raw)
                .await
        }
        ClientMessage::Heartbeat { execution_id } => {
            methods::handle_heartbeat(gateway, session_id, execution_id).await
        }
        ClientMessage::CreateTunnel {
            port,
            forward_to,
            provider_token,
        } => methods::handle_create_tunnel(gateway, session_id, port, forward_to, provider_token).await,
        ClientMessage::DeleteTunnel { port } => {
            methods::handle_delete_tunnel(gateway, session_id, port).await
        }
        ClientMessage::UpdateTunnelForwarding { port, forward_to } => {
            methods::handle_update_tunnel_forwarding(gateway, session_id, port, forward_to).await
        }
        ClientMessage::GetTunnelState => methods::handle_get_tunnel_state(gateway, session_id).await,
        ClientMessage::GetExecutionState => {
            methods::handle_get_execution_state(gateway, session_id).await
        }
        ClientMessage::SendWebhook { port, payload } => {
            methods::handle_send_webhook(gateway, session_id, port, payload).await
        }
        ClientMessage::RefreshEnvironment => {
            methods::handle_refresh_environment(gateway, session_id).await
        }
    }
}

/// Run the handler for one message. Never fails.
pub async fn dispatch(gateway: &Gateway, session_id: &str, message: ClientMessage, raw: Value) {
    let kind = message.kind();
    log::debug!("[ROUTER] {} from {}", kind, session_id);

    match AssertUnwindSafe(route(gateway, session_id, message, raw))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("[ROUTER] '{}' handler failed for {}: {}", kind, session_id, e),
        Err(_) => log::error!("[ROUTER] '{}' handler panicked for {}", kind, session_id),
    }
}

/// Parse and dispatch one text frame.
pub async fn handle_frame(gateway: &Gateway, session_id: &str, text: &str) {
    if let Some((message, raw)) = parse_inbound(text) {
        dispatch(gateway, session_id, message, raw).await;
    }
}
