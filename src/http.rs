use crate::alerts::AlertRule;
use crate::collectors::process::ProcessSortMode;
use crate::layout::{Layout, LayoutStore};
use crate::metrics::Metrics;
use crate::poller::{AlertCommand, TickSettings, MIN_INTERVAL_MS};
use crate::state::SharedState;
use crate::storage::{self, SnapshotRecord, StorageEngine};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: SharedState,
    pub storage: Option<Arc<StorageEngine>>,
    pub layout: Arc<LayoutStore>,
    /// Live tick settings; the poller reads them at the start of every tick.
    pub settings: Option<Arc<watch::Sender<TickSettings>>>,
    /// Rule changes for the running poller.
    pub alerts: Option<mpsc::Sender<AlertCommand>>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_range")]
    pub range: String,
}

fn default_range() -> String {
    "1h".to_string()
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub range: String,
    pub from: chrono::DateTime<chrono::Utc>,
    pub to: chrono::DateTime<chrono::Utc>,
    pub records: Vec<SnapshotRecord>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SettingsView {
    pub interval_ms: u64,
    pub top_processes: usize,
    pub process_sort: ProcessSortMode,
}

impl From<TickSettings> for SettingsView {
    fn from(s: TickSettings) -> Self {
        Self {
            interval_ms: s.interval.as_millis() as u64,
            top_processes: s.top_processes,
            process_sort: s.process_sort,
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub interval_ms: Option<u64>,
    pub top_processes: Option<usize>,
    pub process_sort: Option<ProcessSortMode>,
}

pub fn build_router(app: HttpAppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/history", get(history_handler))
        .route("/api/layout", get(get_layout).put(put_layout))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/alerts/rules", get(list_rules).post(add_rule).delete(remove_rule))
        .route("/api/alerts/clear", post(clear_alert))
        .with_state(app)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> Response {
    let guard = state.state.read().await;
    Json(&*guard).into_response()
}

async fn history_handler(
    State(state): State<HttpAppState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let Some(store) = state.storage.clone() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "history storage is disabled").into_response();
    };
    let range = if storage::HISTORY_RANGES.contains(&query.range.as_str()) {
        query.range
    } else {
        default_range()
    };
    let (from, to) = storage::time_range(&range, chrono::Utc::now());

    match tokio::task::spawn_blocking(move || store.query(from, to)).await {
        Ok(Ok(records)) => Json(HistoryResponse {
            range,
            from,
            to,
            records,
        })
        .into_response(),
        Ok(Err(err)) => {
            warn!(error = %err, "history query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn get_layout(State(state): State<HttpAppState>) -> Json<Layout> {
    let store = state.layout.clone();
    let layout = tokio::task::spawn_blocking(move || store.load())
        .await
        .unwrap_or_default();
    Json(layout)
}

async fn put_layout(State(state): State<HttpAppState>, Json(layout): Json<Layout>) -> StatusCode {
    let store = state.layout.clone();
    match tokio::task::spawn_blocking(move || store.save(&layout)).await {
        Ok(true) => StatusCode::NO_CONTENT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn poller_unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "poller is not running").into_response()
}

async fn get_settings(State(state): State<HttpAppState>) -> Response {
    match &state.settings {
        Some(tx) => Json(SettingsView::from(*tx.borrow())).into_response(),
        None => poller_unavailable(),
    }
}

async fn put_settings(State(state): State<HttpAppState>, Json(update): Json<SettingsUpdate>) -> Response {
    let Some(tx) = state.settings.clone() else {
        return poller_unavailable();
    };
    if update.interval_ms.is_some_and(|ms| ms < MIN_INTERVAL_MS) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("interval_ms must be >= {MIN_INTERVAL_MS}"),
        )
            .into_response();
    }

    let mut next = *tx.borrow();
    if let Some(ms) = update.interval_ms {
        next.interval = Duration::from_millis(ms);
    }
    if let Some(top) = update.top_processes {
        next.top_processes = top;
    }
    if let Some(sort) = update.process_sort {
        next.process_sort = sort;
    }
    tx.send_replace(next);
    info!(
        interval_ms = next.interval.as_millis() as u64,
        top_processes = next.top_processes,
        process_sort = ?next.process_sort,
        "tick settings updated"
    );
    Json(SettingsView::from(next)).into_response()
}

/// Sends one command to the poller and waits for its reply. `None` when the
/// poller is not running or went away before answering.
async fn ask_poller<T>(
    alerts: Option<&mpsc::Sender<AlertCommand>>,
    command: impl FnOnce(oneshot::Sender<T>) -> AlertCommand,
) -> Option<T> {
    let alerts = alerts?;
    let (reply, answer) = oneshot::channel();
    alerts.send(command(reply)).await.ok()?;
    answer.await.ok()
}

async fn list_rules(State(state): State<HttpAppState>) -> Response {
    match ask_poller(state.alerts.as_ref(), AlertCommand::List).await {
        Some(rules) => Json(rules).into_response(),
        None => poller_unavailable(),
    }
}

async fn add_rule(State(state): State<HttpAppState>, Json(rule): Json<AlertRule>) -> Response {
    match ask_poller(state.alerts.as_ref(), |reply| AlertCommand::Add(rule, reply)).await {
        Some(Ok(())) => (StatusCode::CREATED, Json(rule)).into_response(),
        Some(Err(err)) => (StatusCode::UNPROCESSABLE_ENTITY, err.to_string()).into_response(),
        None => poller_unavailable(),
    }
}

async fn remove_rule(State(state): State<HttpAppState>, Json(rule): Json<AlertRule>) -> Response {
    match ask_poller(state.alerts.as_ref(), |reply| AlertCommand::Remove(rule, reply)).await {
        Some(true) => StatusCode::NO_CONTENT.into_response(),
        Some(false) => (StatusCode::NOT_FOUND, "no such rule").into_response(),
        None => poller_unavailable(),
    }
}

async fn clear_alert(State(state): State<HttpAppState>, Json(rule): Json<AlertRule>) -> Response {
    let Some(alerts) = &state.alerts else {
        return poller_unavailable();
    };
    match alerts.send(AlertCommand::Clear(rule)).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => poller_unavailable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertEngine;
    use crate::poller::PollingOrchestrator;
    use crate::sensors::matchers::SensorMatchers;
    use crate::sensors::testing::{cpu, FakeBackend};
    use crate::sensors::{HardwareSnapshot, SensorReader};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tempfile::tempdir;
    use tower::ServiceExt;

    fn app_state(storage: Option<Arc<StorageEngine>>, layout: LayoutStore) -> HttpAppState {
        HttpAppState {
            metrics: Metrics::new().expect("metrics init"),
            state: SharedState::new(10),
            storage,
            layout: Arc::new(layout),
            settings: None,
            alerts: None,
        }
    }

    async fn send_json(app: Router, method: &str, uri: &str, body: serde_json::Value) -> (StatusCode, String) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    /// Runs a real poller over a fake backend with a long interval, so rule
    /// commands are served while it sleeps.
    fn running_poller() -> (mpsc::Sender<AlertCommand>, watch::Sender<bool>) {
        let reader = Arc::new(SensorReader::new(SensorMatchers::default(), None));
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let orch = PollingOrchestrator::new(reader, AlertEngine::default()).with_commands(cmd_rx);
        let settings = TickSettings {
            interval: Duration::from_secs(3600),
            ..TickSettings::default()
        };
        let (_settings_tx, settings_rx) = watch::channel(settings);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backend = FakeBackend::new(vec![cpu("cpu", 50.0, 10.0)]);
        tokio::spawn(orch.run(vec![Box::new(backend)], settings_rx, shutdown_rx));
        (cmd_tx, shutdown_tx)
    }

    async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let dir = tempdir().unwrap();
        let app = build_router(app_state(None, LayoutStore::new(dir.path().join("l.json"))));

        let (status, body) = get_text(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let dir = tempdir().unwrap();
        let app = build_router(app_state(None, LayoutStore::new(dir.path().join("l.json"))));

        let (status, body) = get_text(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hw_uptime_seconds"));
        assert!(body.contains("hw_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn api_state_returns_json() {
        let dir = tempdir().unwrap();
        let app = build_router(app_state(None, LayoutStore::new(dir.path().join("l.json"))));

        let (status, body) = get_text(app, "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["started_at_unix"], 10);
        assert_eq!(json["status"]["state"], "initializing");
    }

    #[tokio::test]
    async fn history_reads_the_store() {
        let dir = tempdir().unwrap();
        let store = Arc::new(StorageEngine::open_in_memory().unwrap());
        let now = chrono::Utc::now();
        store
            .save_snapshot_at(&HardwareSnapshot::default(), now - chrono::Duration::hours(3))
            .unwrap();
        store
            .save_snapshot_at(&HardwareSnapshot::default(), now - chrono::Duration::minutes(5))
            .unwrap();
        let state = app_state(Some(store), LayoutStore::new(dir.path().join("l.json")));

        let (status, body) = get_text(build_router(state.clone()), "/api/history").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["range"], "1h");
        assert_eq!(json["records"].as_array().map(Vec::len), Some(1));

        let (_, body) = get_text(build_router(state.clone()), "/api/history?range=24h").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["records"].as_array().map(Vec::len), Some(2));

        let (_, body) = get_text(build_router(state), "/api/history?range=forever").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["range"], "1h");
    }

    #[tokio::test]
    async fn history_without_storage_is_unavailable() {
        let dir = tempdir().unwrap();
        let app = build_router(app_state(None, LayoutStore::new(dir.path().join("l.json"))));
        let (status, _) = get_text(app, "/api/history?range=7d").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn settings_update_reaches_the_poller() {
        let dir = tempdir().unwrap();
        let (tx, rx) = watch::channel(TickSettings::default());
        let mut state = app_state(None, LayoutStore::new(dir.path().join("l.json")));
        state.settings = Some(Arc::new(tx));

        let (status, body) = get_text(build_router(state.clone()), "/api/settings").await;
        assert_eq!(status, StatusCode::OK);
        let view: SettingsView = serde_json::from_str(&body).unwrap();
        assert_eq!(view.interval_ms, 1000);

        let update = serde_json::json!({ "interval_ms": 250, "process_sort": "memory" });
        let (status, body) = send_json(build_router(state.clone()), "PUT", "/api/settings", update).await;
        assert_eq!(status, StatusCode::OK);
        let view: SettingsView = serde_json::from_str(&body).unwrap();
        assert_eq!(view.top_processes, 10);

        let current = *rx.borrow();
        assert_eq!(current.interval, Duration::from_millis(250));
        assert_eq!(current.process_sort, ProcessSortMode::ByMemory);
        assert_eq!(current.top_processes, 10);
    }

    #[tokio::test]
    async fn settings_reject_too_short_interval() {
        let dir = tempdir().unwrap();
        let (tx, rx) = watch::channel(TickSettings::default());
        let mut state = app_state(None, LayoutStore::new(dir.path().join("l.json")));
        state.settings = Some(Arc::new(tx));

        let update = serde_json::json!({ "interval_ms": 10 });
        let (status, _) = send_json(build_router(state), "PUT", "/api/settings", update).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(rx.borrow().interval, Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn alert_rules_are_managed_through_the_poller() {
        let dir = tempdir().unwrap();
        let (alerts, shutdown) = running_poller();
        let mut state = app_state(None, LayoutStore::new(dir.path().join("l.json")));
        state.alerts = Some(alerts);
        let rule = serde_json::json!({ "metric": "gpu_temp", "threshold": 75.0, "direction": "above" });

        let (status, _) = send_json(build_router(state.clone()), "POST", "/api/alerts/rules", rule.clone()).await;
        assert_eq!(status, StatusCode::CREATED);

        let bad = serde_json::json!({ "metric": "cpu_usage", "threshold": 140.0, "direction": "above" });
        let (status, body) = send_json(build_router(state.clone()), "POST", "/api/alerts/rules", bad).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("outside"));

        let (status, body) = get_text(build_router(state.clone()), "/api/alerts/rules").await;
        assert_eq!(status, StatusCode::OK);
        let rules: Vec<AlertRule> = serde_json::from_str(&body).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].threshold, 75.0);

        let (status, _) = send_json(build_router(state.clone()), "POST", "/api/alerts/clear", rule.clone()).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = send_json(build_router(state.clone()), "DELETE", "/api/alerts/rules", rule.clone()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send_json(build_router(state.clone()), "DELETE", "/api/alerts/rules", rule).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn rule_routes_without_poller_are_unavailable() {
        let dir = tempdir().unwrap();
        let (alerts, gone) = mpsc::channel(1);
        drop(gone);
        let mut state = app_state(None, LayoutStore::new(dir.path().join("l.json")));

        let (status, _) = get_text(build_router(state.clone()), "/api/alerts/rules").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let (status, _) = get_text(build_router(state.clone()), "/api/settings").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.alerts = Some(alerts);
        let rule = serde_json::json!({ "metric": "cpu_temp", "threshold": 90.0, "direction": "above" });
        let (status, _) = send_json(build_router(state), "POST", "/api/alerts/rules", rule).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn layout_put_then_get() {
        let dir = tempdir().unwrap();
        let state = app_state(None, LayoutStore::new(dir.path().join("ui").join("layout.json")));

        let (_, body) = get_text(build_router(state.clone()), "/api/layout").await;
        let initial: Layout = serde_json::from_str(&body).unwrap();
        assert_eq!(initial, Layout::default());

        let mut changed = Layout::default();
        changed.cards[0].is_visible = false;
        let response = build_router(state.clone())
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/layout")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&changed).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let (_, body) = get_text(build_router(state), "/api/layout").await;
        let saved: Layout = serde_json::from_str(&body).unwrap();
        assert_eq!(saved, changed);
    }
}
