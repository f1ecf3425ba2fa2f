//! Tunnel route methods and the same-origin webhook proxy

use crate::error::BridgeError;
use crate::gateway::Gateway;
use crate::http::shared_client;
use bridge_types::ServerMessage;
use serde_json::Value;

/// Handle `create-tunnel`
pub async fn handle_create_tunnel(
    gateway: &Gateway,
    session_id: &str,
    port: u16,
    forward_to: Option<u16>,
    provider_token: Option<String>,
) -> Result<(), BridgeError> {
    let reply = match gateway
        .tunnels()
        .create(port, forward_to, provider_token.as_deref())
        .await
    {
        Ok(snapshot) => ServerMessage::TunnelCreated {
            port,
            success: true,
            public_url: snapshot.public_url,
            tunnel_id: snapshot.tunnel_id,
            forward_to: snapshot.forward_to,
            error: None,
        },
        Err(e) => {
            log::warn!("[TUNNEL] create-tunnel for port {} failed: {}", port, e);
            ServerMessage::TunnelCreated {
                port,
                success: false,
                public_url: None,
                tunnel_id: None,
                forward_to,
                error: Some(e.to_string()),
            }
        }
    };
    gateway.sessions().send(session_id, &reply);
    Ok(())
}

/// Handle `delete-tunnel`
pub async fn handle_delete_tunnel(
    gateway: &Gateway,
    session_id: &str,
    port: u16,
) -> Result<(), BridgeError> {
    let error = gateway.tunnels().delete(port).await.err().map(|e| e.to_string());
    gateway.sessions().send(
        session_id,
        &ServerMessage::TunnelDeleted {
            port,
            success: error.is_none(),
            error,
        },
    );
    Ok(())
}

/// Handle `update-tunnel-forwarding`
pub async fn handle_update_tunnel_forwarding(
    gateway: &Gateway,
    session_id: &str,
    port: u16,
    forward_to: Option<u16>,
) -> Result<(), BridgeError> {
    let error = gateway
        .tunnels()
        .update_forwarding(port, forward_to)
        .err()
        .map(|e| e.to_string());
    gateway.sessions().send(
        session_id,
        &ServerMessage::TunnelForwardingUpdated {
            port,
            forward_to,
            success: error.is_none(),
            error,
        },
    );
    Ok(())
}

/// Handle `get-tunnel-state`
pub async fn handle_get_tunnel_state(gateway: &Gateway, session_id: &str) -> Result<(), BridgeError> {
    gateway.sessions().send(
        session_id,
        &ServerMessage::TunnelState {
            tunnels: gateway.tunnels().state(),
        },
    );
    Ok(())
}

/// Handle `send-webhook`: POST the payload to the local listener on `port`
/// on behalf of a browser that cannot make the request itself.
pub async fn handle_send_webhook(
    gateway: &Gateway,
    session_id: &str,
    port: u16,
    payload: Value,
) -> Result<(), BridgeError> {
    let url = format!("http://localhost:{}/", port);
    let result = shared_client()
        .post(&url)
        .json(&payload)
        .timeout(gateway.config().webhook_forward_timeout)
        .send()
        .await;

    let reply = match result {
        Ok(response) => {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
            ServerMessage::WebhookResponse {
                success: status.is_success(),
                status: Some(status.as_u16()),
                body: Some(body),
                error: None,
            }
        }
        Err(e) => {
            log::warn!("[WEBHOOK] send-webhook to {} failed: {}", url, e);
            ServerMessage::WebhookResponse {
                success: false,
                status: None,
                body: None,
                error: Some(BridgeError::Forward(e.to_string()).to_string()),
            }
        }
    };
    gateway.sessions().send(session_id, &reply);
    Ok(())
}
