//! Docket server library logic.

pub mod api_audit;
pub mod api_logs;
pub mod api_ops;
pub mod api_ws;
pub mod auth;
pub mod background;
pub mod config;
pub mod middleware;
pub mod responses;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};

use docket_audit::AuditService;
use docket_bus::EventBus;
use docket_db::DbPool;
use docket_notify::{LocalAdapter, Notifier};

use auth::TokenService;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Durable event bus.
    pub bus: Arc<EventBus>,
    /// Audit ledger.
    pub audit: Arc<AuditService>,
    /// This instance's notifier registry.
    pub notifier: Arc<Notifier>,
    /// Cluster adapter for notifier fan-out.
    pub adapter: LocalAdapter,
    /// Bearer-token issuance and verification.
    pub tokens: TokenService,
    /// Login credentials accepted by `/auth/login`: (username, password).
    pub credentials: (String, String),
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/logs", post(api_logs::submit_log_handler))
        .route("/logs/bulk", post(api_logs::submit_bulk_handler))
        .route("/logs/search", get(api_logs::search_handler))
        .route("/logs/summary/{agent_id}", get(api_logs::summary_handler))
        .route("/logs/{agent_id}", get(api_logs::list_by_agent_handler))
        .route(
            "/logs/{agent_id}/{step_id}",
            get(api_logs::get_log_handler).put(api_logs::update_review_handler),
        )
        .route("/audit/proof/{agent_id}/{step_id}", get(api_audit::proof_handler))
        .route("/audit/pack", get(api_audit::export_pack_handler))
        .route("/audit/verify", post(api_audit::verify_pack_handler))
        .layer(axum::middleware::from_fn(middleware::auth_middleware));

    let api = Router::new()
        .route("/auth/login", post(auth::login_handler))
        .merge(protected_routes);

    Router::new()
        .route("/healthz", get(api_ops::healthz_handler))
        .route("/readyz", get(api_ops::readyz_handler))
        .route("/metrics", get(api_ops::metrics_handler))
        .nest("/api/v1", api)
        .route("/ws", get(api_ws::ws_handler))
        .layer(Extension(Arc::new(state)))
}
