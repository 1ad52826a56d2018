//! tally-daemon entry point.
//!
//! Thin: sets up tracing, boots the engine from layered config, wires
//! middleware, and starts the HTTP server. Route handlers live in
//! `routes.rs`; shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use tally_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience).
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths = tally_runtime::config_paths(&[]);
    let (loaded, engine) = tally_runtime::boot(&paths)
        .with_context(|| format!("engine boot failed (config: {})", paths.join(",")))?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");

    let server = engine.config.server.clone();
    let shared = Arc::new(state::AppState::new(engine.coordinator));

    state::spawn_heartbeat(
        shared.bus.clone(),
        Duration::from_secs(server.heartbeat_secs.max(1)),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors(&server.cors_origins));

    let addr: SocketAddr = match bind_addr_from_env() {
        Some(a) => a,
        None => server
            .bind_addr
            .parse()
            .with_context(|| format!("CONFIG_INVALID /server/bind_addr: '{}'", server.bind_addr))?,
    };
    info!("tally-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("TALLY_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS restricted to the configured origins. Webhooks are server-to-server
/// and unaffected; this only gates browser clients of the totals/stream API.
fn cors(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
