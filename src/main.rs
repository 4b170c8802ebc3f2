use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skyplanner_realtime::alerts::{Alert, AlertDispatcher};
use skyplanner_realtime::audit::InMemoryAuditLog;
use skyplanner_realtime::auth::InMemoryBlacklist;
use skyplanner_realtime::config::Config;
use skyplanner_realtime::hub::{self, Hub};
use skyplanner_realtime::presence::PresenceManager;
use skyplanner_realtime::registry::ConnectionRegistry;
use skyplanner_realtime::repository::InMemoryWebhookRepository;
use skyplanner_realtime::webhook::DeliveryEngine;

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections_active": hub.connection_count(),
    }))
}

// ─── CORS configuration ─────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        warn!("CORS: permissive mode (allow all origins) — not suitable for production");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("authorization"),
            ])
            .allow_credentials(true)
    }
}

// ─── Entry point ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Load .env before anything else so SKYPLANNER_LOG_LEVEL is available.
    let _ = dotenvy::dotenv();

    let log_level =
        std::env::var("SKYPLANNER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log_level)),
        )
        .init();

    let config = Config::from_env();

    // ── Webhook delivery plane ──────────────────────────────────────────
    // The application's API layer shares this repository and engine through
    // `webhook::WebhookService`; the background loop lives here.
    let repository = Arc::new(InMemoryWebhookRepository::new());
    let engine = DeliveryEngine::new(repository);
    let _engine_handle = engine.spawn(Duration::from_secs(config.delivery_sweep_secs));

    // ── Operator alerting ───────────────────────────────────────────────
    let alerts = AlertDispatcher::from_config(&config);

    // ── Realtime hub ────────────────────────────────────────────────────
    let registry = Arc::new(ConnectionRegistry::new());
    let presence = Arc::new(PresenceManager::new(registry.clone()));
    let blacklist = Arc::new(InMemoryBlacklist::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let hub = Hub::new(&config, registry, presence, blacklist, audit);
    hub.spawn_heartbeat();

    // ── Router ──────────────────────────────────────────────────────────
    let cors = build_cors_layer(&config.allowed_origins);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(hub::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(hub.clone());

    // ── Serve ───────────────────────────────────────────────────────────
    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            alerts.dispatch(Alert::system_error(format!(
                "realtime service failed to bind {}: {e}",
                config.bind_addr
            )));
            panic!("failed to bind {}: {e}", config.bind_addr);
        }
    };
    info!("SkyPlanner realtime listening on http://{}", config.bind_addr);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    hub.shutdown();

    if let Err(e) = result {
        alerts.dispatch(Alert::system_error(format!("realtime server error: {e}")));
        panic!("server error: {e}");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
