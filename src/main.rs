//! UTXOracle Live: real-time Bitcoin price oracle derived from mempool
//! flow, alongside a whale-transaction signal feed.

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utxoracle_live::config::{self, Config};
use utxoracle_live::orchestrator::{self, PipelineHandles};
use utxoracle_live::ws;
use utxoracle_live::{api, middleware as app_middleware};

#[tokio::main]
async fn main() -> Result<()> {
    config::load_env();
    init_tracing();

    let config = Arc::new(Config::from_env().context("failed to load configuration")?);
    info!(
        ws_port = config.ws_port,
        http_port = config.http_port,
        "starting utxoracle-live"
    );

    let handles = Arc::new(
        orchestrator::spawn_pipeline(config.clone())
            .await
            .context("failed to start pipeline")?,
    );

    {
        let handles = handles.clone();
        let cancel_rx = handles.cancel.subscribe();
        tokio::spawn(ws::run_liveness_sweep(handles, Duration::from_secs(90), cancel_rx));
    }

    let ws_app = Router::new()
        .route("/ws/:stream", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(handles.clone());

    let api_app = Router::new()
        .route("/health", get(api::health))
        .route("/prices/latest", get(api::prices_latest))
        .route("/prices/historical", get(api::prices_historical))
        .route("/whale/transactions", get(api::whale_transactions))
        .route("/whale/summary", get(api::whale_summary))
        .route("/whale/transaction/:txid", get(api::whale_transaction))
        .layer(axum::middleware::from_fn(app_middleware::request_logging))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(handles.clone());

    let ws_addr: SocketAddr = format!("{}:{}", config.ws_host, config.ws_port)
        .parse()
        .context("invalid WS_HOST/WS_PORT")?;
    let http_addr: SocketAddr = format!("{}:{}", config.ws_host, config.http_port)
        .parse()
        .context("invalid WS_HOST/HTTP_PORT")?;

    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("failed to bind websocket listener on {ws_addr}"))?;
    let http_listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {http_addr}"))?;

    info!(%ws_addr, %http_addr, "listening");

    let ws_shutdown = shutdown_signal(handles.clone());
    let http_shutdown = shutdown_signal(handles.clone());

    let ws_server = axum::serve(
        ws_listener,
        ws_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(ws_shutdown);

    let http_server = axum::serve(
        http_listener,
        api_app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(http_shutdown);

    let (ws_result, http_result) = tokio::join!(ws_server, http_server);
    if let Err(e) = ws_result {
        error!(component = "orchestrator", error = %e, "websocket server exited with error");
    }
    if let Err(e) = http_result {
        error!(component = "orchestrator", error = %e, "http server exited with error");
    }

    Ok(())
}

/// Resolves once either ctrl-c is received or another part of the
/// pipeline has already requested shutdown (§5 cancellation token).
async fn shutdown_signal(handles: Arc<PipelineHandles>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(component = "orchestrator", "shutdown signal received, draining");
    let _ = handles.cancel.send(true);
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
