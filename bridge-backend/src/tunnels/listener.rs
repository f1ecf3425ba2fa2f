//! Per-port webhook listeners
//!
//! Every declared webhook port gets its own single-worker actix server. A
//! request is buffered, announced to UI sessions, and either relayed to the
//! port's forwarding target or acknowledged locally.

use crate::config::Config;
use crate::error::BridgeError;
use crate::gateway::sessions::SessionRegistry;
use crate::http::shared_client;
use crate::tunnels::forward::{self, joined_headers};
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use bridge_types::{ServerMessage, WebhookNotification};
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// What every request handler on a listener needs.
#[derive(Clone)]
pub struct ListenerState {
    pub port: u16,
    pub forwarding: Arc<DashMap<u16, u16>>,
    pub sessions: Arc<SessionRegistry>,
    pub forward_timeout: Duration,
}

/// A running listener. Dropping it leaves the server running; call `stop`.
pub struct WebhookListener {
    pub port: u16,
    handle: ServerHandle,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl WebhookListener {
    /// False once the server task has finished, for whatever reason.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    #[cfg(test)]
    pub(crate) fn server_handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub async fn stop(self) {
        self.handle.stop(true).await;
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("[WEBHOOK] Listener on port {} ended with error: {}", self.port, e),
            Err(e) => log::warn!("[WEBHOOK] Listener task for port {} failed: {}", self.port, e),
        }
        log::info!("[WEBHOOK] Listener on port {} stopped", self.port);
    }
}

/// Bind and start a listener. Must run inside the actix system.
pub fn start_listener(config: &Config, state: ListenerState) -> Result<WebhookListener, BridgeError> {
    let port = state.port;
    let body_limit = config.webhook_body_limit;
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::PayloadConfig::new(body_limit))
            .default_service(web::to(handle_webhook))
    })
    .workers(1)
    .disable_signals()
    .client_request_timeout(config.webhook_request_timeout)
    .keep_alive(config.webhook_keep_alive)
    .bind((config.webhook_bind_address.as_str(), port))
    .map_err(|source| BridgeError::Listener { port, source })?
    .run();

    let handle = server.handle();
    let task = actix_web::rt::spawn(server);
    log::info!(
        "[WEBHOOK] Listening on {}:{}",
        config.webhook_bind_address,
        port
    );
    Ok(WebhookListener { port, handle, task })
}

/// JSON if it parses, raw text otherwise.
fn decode_payload(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

async fn handle_webhook(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<ListenerState>,
) -> HttpResponse {
    let port = state.port;
    let method = req.method().as_str().to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut notification = WebhookNotification {
        port,
        method: method.clone(),
        path: req.path().to_string(),
        headers: joined_headers(req.headers()).into_iter().collect::<BTreeMap<_, _>>(),
        payload: decode_payload(&body),
        timestamp: Utc::now().to_rfc3339(),
        forwarded: false,
        forward_to: None,
        forward_status: None,
        forward_failed: false,
        forward_error: None,
    };

    let forward_to = state.forwarding.get(&port).map(|target| *target);
    log::info!(
        "[WEBHOOK] {} {} on port {}{}",
        method,
        path_and_query,
        port,
        forward_to
            .map(|t| format!(" -> {}", t))
            .unwrap_or_default()
    );

    let response = match forward_to {
        None => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "message": "Webhook received",
            "port": port,
        })),
        Some(target) => {
            notification.forward_to = Some(target);
            let headers = forward::forward_request_headers(req.headers(), target);
            match forward::forward(
                shared_client(),
                &method,
                &path_and_query,
                &headers,
                body,
                target,
                state.forward_timeout,
            )
            .await
            {
                Ok(upstream) => {
                    notification.forwarded = true;
                    notification.forward_status = Some(upstream.status);
                    let status = actix_web::http::StatusCode::from_u16(upstream.status)
                        .unwrap_or(actix_web::http::StatusCode::BAD_GATEWAY);
                    let mut builder = HttpResponse::build(status);
                    for (name, value) in &upstream.headers {
                        builder.append_header((name.as_str(), value.as_str()));
                    }
                    builder.body(upstream.body)
                }
                Err(e) => {
                    log::warn!("[WEBHOOK] Port {}: {}", port, e);
                    notification.forward_failed = true;
                    notification.forward_error = Some(e.to_string());
                    HttpResponse::BadGateway().json(serde_json::json!({
                        "success": false,
                        "error": e.to_string(),
                        "forwardTo": target,
                    }))
                }
            }
        }
    };

    state
        .sessions
        .broadcast_ui(&ServerMessage::WebhookReceived(notification));
    response
}
