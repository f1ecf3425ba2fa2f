use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use dotenv::dotenv;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod config;
mod controllers;
mod error;
mod execution;
mod gateway;
mod http;
mod models;
mod probe;
mod tunnels;

use config::Config;
use gateway::Gateway;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Arc::new(Config::from_env());
    let bind_address = config.bind_address.clone();
    let port = config.port;

    log::info!("Initializing gateway");
    let gateway = Arc::new(Gateway::new(config.clone()));

    // Binary checks run in the background; UI sessions get whatever is known
    // when they register and can ask for a refresh.
    gateway.spawn_environment_probe();

    let sweep_cancel = CancellationToken::new();
    let sweep = gateway.spawn_retention_sweep(sweep_cancel.clone());

    log::info!(
        "Session endpoint at ws://{}:{}/ws (workers dial back on {})",
        bind_address,
        port,
        config.public_ws_url
    );

    let app_gateway = Arc::clone(&gateway);
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(Arc::clone(&app_gateway)))
            .wrap(Logger::default())
            .wrap(cors)
            .configure(controllers::health::config)
            .route("/ws", web::get().to(gateway::actix_ws::ws_handler))
    })
    .bind((bind_address.as_str(), port))?
    .run();

    let result = server.await;

    sweep_cancel.cancel();
    let _ = sweep.await;
    gateway.shutdown().await;
    log::info!("Shutdown complete");

    result
}
