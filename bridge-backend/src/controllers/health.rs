use actix_web::{web, HttpResponse, Responder};
use std::sync::Arc;

use crate::gateway::Gateway;

/// Version from Cargo.toml, available at compile time
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/health").route(web::get().to(health_check)));
    cfg.service(web::resource("/api/version").route(web::get().to(get_version)));
    cfg.service(
        web::resource("/api/health/environment").route(web::get().to(get_environment_status)),
    );
}

async fn health_check(gateway: web::Data<Arc<Gateway>>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "version": VERSION,
        "sessions": gateway.sessions().len(),
        "uiSessions": gateway.sessions().ui_count(),
        "runningExecutions": gateway.executions().running_count(),
        "tunnels": gateway.tunnels().state().len(),
    }))
}

async fn get_version() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "version": VERSION
    }))
}

async fn get_environment_status(gateway: web::Data<Arc<Gateway>>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "environment": gateway.environment(),
        "tunnelProvider": gateway.tunnels().provider_name(),
        "logLevel": gateway.config().log_level,
    }))
}
