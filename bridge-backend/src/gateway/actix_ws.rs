//! Actix-Web WebSocket handler for the session channel
//! UI and worker connections share this endpoint; a session's role is decided
//! by the first identifying message it sends.

use crate::gateway::methods::handle_disconnect;
use crate::gateway::router;
use crate::gateway::sessions::SESSION_QUEUE_SIZE;
use crate::gateway::Gateway;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::AggregatedMessage;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Rule documents can be large; the actix-ws default of 64 KiB is not enough.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// WebSocket handler for Actix-Web
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let gateway = gateway.get_ref().clone();
    actix_web::rt::spawn(handle_ws_connection(session, msg_stream, gateway));

    Ok(response)
}

async fn handle_ws_connection(
    mut session: actix_ws::Session,
    msg_stream: actix_ws::MessageStream,
    gateway: Arc<Gateway>,
) {
    let mut msg_stream = msg_stream
        .max_frame_size(MAX_FRAME_SIZE)
        .aggregate_continuations()
        .max_continuation_size(MAX_FRAME_SIZE);

    // Outbound frames from any handler or broadcast go through this queue.
    let (tx, mut rx) = mpsc::channel::<String>(SESSION_QUEUE_SIZE);
    let session_id = gateway.sessions().register(tx);
    log::info!(
        "[GATEWAY] Session {} connected ({} total)",
        session_id,
        gateway.sessions().len()
    );

    let mut send_session = session.clone();
    let send_id = session_id.clone();
    let send_task = actix_web::rt::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if send_session.text(msg).await.is_err() {
                log::debug!("[GATEWAY] Session {} closed while sending", send_id);
                break;
            }
        }
    });

    // Messages from one session are handled strictly in arrival order.
    while let Some(msg_result) = msg_stream.next().await {
        match msg_result {
            Ok(AggregatedMessage::Text(text)) => {
                router::handle_frame(&gateway, &session_id, &text).await;
            }
            Ok(AggregatedMessage::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => router::handle_frame(&gateway, &session_id, text).await,
                Err(_) => log::debug!("[ROUTER] Dropping non-UTF-8 binary frame from {}", session_id),
            },
            Ok(AggregatedMessage::Ping(data)) => {
                if session.pong(&data).await.is_err() {
                    break;
                }
            }
            Ok(AggregatedMessage::Close(_)) => {
                break;
            }
            Ok(AggregatedMessage::Pong(_)) => {}
            Err(e) => {
                log::error!("[GATEWAY] WebSocket error on {}: {:?}", session_id, e);
                break;
            }
        }
    }

    // Cleanup
    let connected_for = gateway
        .sessions()
        .connected_at(&session_id)
        .map(|since| (chrono::Utc::now() - since).num_seconds())
        .unwrap_or_default();
    handle_disconnect(&gateway, &session_id);
    send_task.abort();
    let _ = session.close(None).await;
    log::info!(
        "[GATEWAY] Session {} disconnected after {}s",
        session_id,
        connected_for
    );
}
