//! Axum-based HTTP gateway: the `/ws` chat socket plus the read-only query surface.
//!
//! The socket carries the live relay; the REST routes only read the session
//! directory and never mutate it.

pub mod api;
pub mod ws;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::broker::Broker;
use crate::config::schema::is_loopback_host;
use crate::config::Config;
use crate::observability::BrokerMetrics;
use crate::sessions::create_session_store;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let metrics = Arc::new(BrokerMetrics::new()?);
        let broker = Broker::new(create_session_store(), config.broker.clone(), metrics);
        Ok(Self {
            broker,
            config: Arc::new(config),
            started_at: Instant::now(),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let gateway = &state.config.gateway;

    let mut query = Router::new()
        .route("/chat/sessions", get(api::handle_list_sessions))
        .route("/chat/sessions/{id}", get(api::handle_get_session))
        .route("/health", get(api::handle_health))
        .route("/metrics", get(api::handle_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(gateway.max_body_bytes))
                .layer(TimeoutLayer::new(Duration::from_secs(
                    gateway.request_timeout_secs.max(1),
                ))),
        );
    if gateway.cors_allow_any_origin {
        query = query.layer(CorsLayer::permissive());
    }

    Router::new()
        .route("/ws", get(ws::handle_ws_upgrade))
        .merge(query)
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let _sweeper = state.broker.spawn_background();
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server error")
}

/// Bind `host:port` and run until Ctrl-C.
pub async fn run_gateway(host: &str, port: u16, config: Config) -> Result<()> {
    if !config.gateway.allow_public_bind && !is_loopback_host(host) {
        anyhow::bail!(
            "refusing to bind {host}: not a loopback address; set gateway.allow_public_bind = true"
        );
    }

    let listener = TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr = listener.local_addr()?;
    let state = AppState::new(config)?;

    info!(%addr, "chat broker listening");
    info!("  WS   /ws                  chat socket (visitor + admin legs)");
    info!("  GET  /chat/sessions       list sessions (?q= searches ended ones)");
    info!("  GET  /chat/sessions/{{id}}  one session with transcript");
    info!("  GET  /health              liveness + session counts");
    info!("  GET  /metrics             Prometheus exposition");

    serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
    })
    .await
}
