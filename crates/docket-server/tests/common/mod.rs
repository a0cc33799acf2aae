//! Shared fixture for server integration tests: a full pipeline (bus, worker,
//! audit, notifier) over a temporary database, plus request helpers.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use docket_audit::AuditService;
use docket_bus::{BusConfig, EventBus};
use docket_db::DbPool;
use docket_notify::{LocalAdapter, Notifier};
use docket_server::auth::TokenService;
use docket_server::{app, AppState};
use docket_types::DecisionLog;
use docket_worker::{LogWorker, WorkerConfig};

pub struct TestApp {
    pub app: Router,
    pub pool: DbPool,
    pub audit: Arc<AuditService>,
    pub notifier: Arc<Notifier>,
    pub token: String,
    _dir: tempfile::TempDir,
}

/// Builds the full pipeline with test-speed bus timings and starts the
/// worker and notifier feeds.
pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("docket.db");
    let pool = docket_db::create_pool(
        path.to_str().unwrap(),
        docket_db::DbRuntimeSettings::default(),
    )
    .unwrap();
    {
        let conn = pool.get().unwrap();
        docket_db::run_migrations(&conn).unwrap();
    }

    let bus = Arc::new(EventBus::new(
        pool.clone(),
        BusConfig {
            backoff: vec![Duration::from_millis(10)],
            poll_interval: Duration::from_millis(10),
            ..BusConfig::default()
        },
    ));
    let audit = Arc::new(AuditService::open(pool.clone(), docket_audit::DEFAULT_WINDOW_MS).unwrap());

    let worker = LogWorker::new(
        pool.clone(),
        bus.clone(),
        audit.clone(),
        WorkerConfig::default(),
    );
    worker.start();

    let adapter = LocalAdapter::new(64);
    let notifier = Arc::new(Notifier::new(1000));
    docket_notify::start_bus_feed(&bus, adapter.clone(), "test");
    docket_notify::start_delivery(notifier.clone(), &adapter);

    let tokens = TokenService::new("integration-test-secret", 3600);
    let token = tokens.issue("tester");

    let state = AppState {
        pool: pool.clone(),
        bus,
        audit: audit.clone(),
        notifier: notifier.clone(),
        adapter,
        tokens,
        credentials: ("auditor".to_string(), "hunter2".to_string()),
    };

    TestApp {
        app: app(state),
        pool,
        audit,
        notifier,
        token,
        _dir: dir,
    }
}

impl TestApp {
    /// Sends one request with the fixture's bearer token.
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        self.request_with_token(method, uri, Some(&self.token.clone()), body)
            .await
    }

    /// Sends one request with an explicit (or no) bearer token.
    pub async fn request_with_token(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }

        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    /// Polls the store until the worker has applied the log.
    pub async fn wait_for_log(&self, agent_id: &str, step_id: i64) -> DecisionLog {
        self.wait_for(agent_id, step_id, |_| true).await
    }

    /// Polls until the log exists and satisfies a predicate.
    pub async fn wait_for(
        &self,
        agent_id: &str,
        step_id: i64,
        predicate: impl Fn(&DecisionLog) -> bool,
    ) -> DecisionLog {
        for _ in 0..200 {
            {
                let conn = self.pool.get().unwrap();
                if let Some(log) = docket_store::get_log(&conn, agent_id, step_id).unwrap() {
                    if predicate(&log) {
                        return log;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for log {agent_id}:{step_id}");
    }

    /// Counts audit entries of one type.
    pub fn audit_entry_count(&self, entry_type: &str) -> i64 {
        let conn = self.pool.get().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM audit_entries WHERE entry_type = ?1",
            [entry_type],
            |row| row.get(0),
        )
        .unwrap()
    }
}
