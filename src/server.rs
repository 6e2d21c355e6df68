use crate::api;
use crate::config::AppConfig;
use crate::forms::FormSession;
use crate::settings::SettingsStore;
use crate::tracker::{Tracker, TrackerEvent};
use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler. The tracker sits behind a single
/// lock so tracker calls run one at a time.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: SettingsStore,
    pub tracker: Arc<Mutex<Tracker>>,
    pub forms: Arc<Mutex<HashMap<String, FormSession>>>,
    pub events: broadcast::Sender<TrackerEvent>,
}

impl AppState {
    pub fn new(config: AppConfig, tracker: Tracker) -> Self {
        let store = tracker.settings().clone();
        let events = tracker.event_sender();
        Self {
            config,
            store,
            tracker: Arc::new(Mutex::new(tracker)),
            forms: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let enable_cors = state.config.enable_cors;
    let router = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/api/settings",
            get(api::get_settings)
                .put(api::put_settings)
                .patch(api::patch_settings)
                .delete(api::delete_settings),
        )
        .route("/api/settings/validate", get(api::validate_settings))
        .route("/api/settings/sdk", get(api::get_sdk_config))
        .route("/api/settings/user", get(api::get_user_data))
        .route("/api/settings/event", get(api::get_event_data))
        .route(
            "/api/settings/field/{key}",
            get(api::get_field).put(api::put_field),
        )
        .route("/api/tracker/status", get(api::tracker_status))
        .route("/api/tracker/initialize", post(api::initialize))
        .route("/api/tracker/identify", post(api::identify))
        .route("/api/tracker/track", post(api::track))
        .route("/api/tracker/page", post(api::page))
        .route("/api/tracker/reset", post(api::reset))
        .route("/api/tracker/convert", post(api::convert_anonymous))
        .route("/api/tracker/test-connection", post(api::test_connection))
        .route("/api/forms/{form_id}/view", post(api::form_view))
        .route("/api/forms/{form_id}/focus", post(api::form_focus))
        .route("/api/forms/{form_id}/blur", post(api::form_blur))
        .route("/api/forms/{form_id}/submit", post(api::form_submit))
        .route("/api/forms/{form_id}/abandon", post(api::form_abandon))
        .route("/api/events", get(api::stream_events))
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

pub async fn run(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
