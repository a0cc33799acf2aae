//! Docket server binary — the ingestion-to-audit pipeline in one process.
//!
//! Starts the axum HTTP/WebSocket server with structured logging, database
//! migrations, the event bus, the log worker, the audit ledger, the notifier
//! feed, background rollover/retention tasks, and graceful shutdown on
//! SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use docket_audit::AuditService;
use docket_bus::{BusConfig, EventBus};
use docket_notify::{LocalAdapter, Notifier};
use docket_server::auth::TokenService;
use docket_server::{app, background, config, AppState};
use docket_types::RetentionBounds;
use docket_worker::{LogWorker, WorkerConfig};

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("DOCKET_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration — the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );
    background::log_delegated_features(
        config.features.compression,
        config.features.rate_limiting,
    );

    // Initialize database
    let pool = docket_db::create_pool(
        &config.database.path,
        docket_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool — check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = docket_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Event bus
    let bus = Arc::new(EventBus::new(
        pool.clone(),
        BusConfig {
            max_deliver: config.bus.max_deliver,
            handler_deadline: Duration::from_secs(config.bus.handler_deadline_secs),
            publish_deadline: Duration::from_secs(config.bus.publish_deadline_secs),
            poll_interval: Duration::from_millis(config.bus.poll_interval_ms),
            ..BusConfig::default()
        },
    ));

    // Audit ledger (restores chain tail and open windows)
    let audit = Arc::new(
        AuditService::open(pool.clone(), config.audit.window_ms)
            .expect("failed to open audit ledger — inspect the integrity error before restart"),
    );

    // Log worker on the shared queue group
    let retention = RetentionBounds {
        hot_days: config.retention.hot_days,
        warm_days: config.retention.warm_days,
    };
    let worker = LogWorker::new(
        pool.clone(),
        bus.clone(),
        audit.clone(),
        WorkerConfig {
            retention,
            ..WorkerConfig::default()
        },
    );
    worker.start();

    // Notifier: bus feed -> adapter -> this instance
    let adapter = LocalAdapter::new(config.notifier.adapter_capacity);
    let notifier = Arc::new(Notifier::new(config.notifier.max_room_size));
    let instance_id = uuid::Uuid::new_v4().to_string();
    docket_notify::start_bus_feed(&bus, adapter.clone(), &instance_id);
    docket_notify::start_delivery(notifier.clone(), &adapter);

    // Application state and background tasks
    let state = AppState {
        pool: pool.clone(),
        bus: bus.clone(),
        audit: audit.clone(),
        notifier: notifier.clone(),
        adapter: adapter.clone(),
        tokens: TokenService::new(&config.auth.token_secret, config.auth.token_expiry_secs),
        credentials: (config.auth.username.clone(), config.auth.password.clone()),
    };

    let shared = Arc::new(state.clone());
    tokio::spawn(background::start_rollover_task(
        shared.clone(),
        config.audit.rollover_interval_secs,
    ));
    tokio::spawn(background::start_retention_task(
        shared,
        retention,
        config.retention.cold_expiry_days,
        config.retention.sweep_interval_secs,
    ));

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting docket server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address — is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("docket server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
