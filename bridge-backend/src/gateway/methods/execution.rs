//! Execution lifecycle methods and worker message ingestion

use crate::error::BridgeError;
use crate::gateway::sessions::SessionRole;
use crate::gateway::Gateway;
use bridge_types::{ServerMessage, StartExecutionRequest};
use serde_json::Value;

/// Handle `start-execution`
pub async fn handle_start_execution(
    gateway: &Gateway,
    session_id: &str,
    request: StartExecutionRequest,
) -> Result<(), BridgeError> {
    log::info!(
        "[EXECUTION] Start requested by {} ({} mode)",
        session_id,
        request.execution_mode
    );
    let outcome = gateway.executions().start(request).await;
    gateway.sessions().send(
        session_id,
        &ServerMessage::ExecutionStarted {
            success: outcome.error.is_none(),
            execution_id: outcome.execution_id,
            error: outcome.error,
        },
    );
    Ok(())
}

/// Handle `stop-execution`. Acknowledges before the process is gone.
pub async fn handle_stop_execution(
    gateway: &Gateway,
    session_id: &str,
    execution_id: String,
) -> Result<(), BridgeError> {
    let reply = match gateway.executions().stop(&execution_id) {
        Ok(()) => ServerMessage::ExecutionStopped {
            execution_id,
            success: true,
            error: None,
        },
        Err(e) => {
            log::warn!("[EXECUTION] Stop failed: {}", e);
            ServerMessage::ExecutionStopped {
                execution_id,
                success: false,
                error: Some(e.to_string()),
            }
        }
    };
    gateway.sessions().send(session_id, &reply);
    Ok(())
}

/// Pick the execution a worker-originated message belongs to.
fn target_execution(gateway: &Gateway, session_id: &str, explicit: Option<&str>) -> Option<String> {
    let role = gateway.sessions().role(session_id);
    let bound = role.as_ref().and_then(SessionRole::worker_execution);
    gateway.executions().resolve_target(explicit, bound)
}

/// Record the raw frame against its execution and rebroadcast it. Returns the
/// execution id, or `None` if the message was discarded.
fn ingest(
    gateway: &Gateway,
    session_id: &str,
    kind: &str,
    explicit: Option<&str>,
    raw: Value,
) -> Option<String> {
    let Some(target) = target_execution(gateway, session_id, explicit) else {
        log::warn!("[ROUTER] Discarding {} from {}: no execution to attach it to", kind, session_id);
        return None;
    };
    if !gateway.executions().record_event(&target, kind, raw.clone()) {
        log::warn!(
            "[ROUTER] Discarding {} from {}: execution {} does not exist",
            kind,
            session_id,
            target
        );
        return None;
    }

    let mut frame = raw;
    if let Some(obj) = frame.as_object_mut() {
        obj.entry("executionId")
            .or_insert_with(|| Value::String(target.clone()));
    }
    gateway.sessions().broadcast_ui_value(&frame);
    Some(target)
}

/// Handle `event`, `job`, `action` and worker-side `shutdown`.
pub async fn handle_worker_message(
    gateway: &Gateway,
    session_id: &str,
    kind: &str,
    execution_id: Option<String>,
    raw: Value,
) -> Result<(), BridgeError> {
    ingest(gateway, session_id, kind, execution_id.as_deref(), raw);
    Ok(())
}

/// Handle `session-stats`: ingest, then publish the stats snapshot.
pub async fn handle_session_stats(
    gateway: &Gateway,
    session_id: &str,
    execution_id: Option<String>,
    stats: Value,
    reported_at: Option<String>,
    raw: Value,
) -> Result<(), BridgeError> {
    let Some(target) = ingest(gateway, session_id, "session-stats", execution_id.as_deref(), raw)
    else {
        return Ok(());
    };
    if let Some(snapshot) = gateway.executions().record_stats(&target, stats, reported_at) {
        gateway.sessions().broadcast_ui(&snapshot);
    }
    Ok(())
}

/// Handle `get-execution-state`
pub async fn handle_get_execution_state(
    gateway: &Gateway,
    session_id: &str,
) -> Result<(), BridgeError> {
    gateway.sessions().send(
        session_id,
        &ServerMessage::ExecutionState {
            executions: gateway.executions().snapshot(),
        },
    );
    Ok(())
}
