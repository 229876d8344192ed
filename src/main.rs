use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Context;
use sentry_gate::api;
use sentry_gate::config::GatewayConfig;
use sentry_gate::engine::Gateway;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentry_gate=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = GatewayConfig::from_env().context("load gateway config")?;

    let engine = Gateway::bootstrap(&cfg).await?;
    let shared_engine = Arc::new(engine);

    let bind_addr: SocketAddr = cfg.server.bind_addr.parse().with_context(|| {
        format!(
            "invalid GATEWAY_BIND '{}': expected host:port",
            cfg.server.bind_addr
        )
    })?;

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(web::Data::from(shared_engine.clone()))
            .configure(api::configure)
    })
    .bind(bind_addr)?
    .workers(cfg.server.workers)
    .run()
    .await?;

    Ok(())
}
