//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod snapshot;
mod table;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))
        // Source tables
        .route("/api/tables", get(table::list_tables))
        .route("/api/tables/{table}/schema", get(table::get_schema))
        // Snapshots
        .route(
            "/api/snapshots",
            post(snapshot::take_snapshot).delete(snapshot::clear),
        )
        .route("/api/snapshots/{table}/versions", get(snapshot::list_versions))
        .route("/api/snapshots/{table}/diff", get(snapshot::diff_from_previous))
        .route("/api/snapshots/{table}/prune", post(snapshot::prune))
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SnapshotEngine, SnapshotOptions};
    use crate::source::SqliteSource;
    use crate::state::AppState;
    use crate::store::LocalStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, SqliteSource) {
        let source = SqliteSource::in_memory().unwrap();
        source
            .execute_batch(
                "CREATE TABLE emp (id INTEGER PRIMARY KEY, name TEXT, age INTEGER);
                 INSERT INTO emp VALUES (1, 'kawasima', 3);",
            )
            .unwrap();
        let engine = SnapshotEngine::new(
            Arc::new(source.clone()),
            LocalStore::in_memory().unwrap(),
            SnapshotOptions::default(),
        )
        .await
        .unwrap();
        let settings =
            Settings::from_lookup(|key| (key == "SOURCE_URL").then(|| "sqlite::memory:".to_string()))
                .unwrap();
        (
            create_router(Arc::new(AppState::new(engine)), &settings),
            source,
        )
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_reports_success() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn take_then_diff_over_http() {
        let (app, source) = app().await;

        let (status, body) = send(&app, "GET", "/api/snapshots/emp/diff", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NO_VERSION");

        let (status, _) = send(&app, "POST", "/api/snapshots", Some(r#"{"tables":["emp"]}"#)).await;
        assert_eq!(status, StatusCode::OK);
        source
            .execute_batch("UPDATE emp SET age = 17 WHERE id = 1;")
            .unwrap();
        send(&app, "POST", "/api/snapshots", Some(r#"{"tables":["emp"]}"#)).await;

        let (status, body) = send(&app, "GET", "/api/snapshots/emp/diff", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!({
                "headers": ["id", "name", "age"],
                "add": [],
                "modify": [["1", "kawasima", ["3", "17"]]],
                "delete": []
            })
        );

        let (_, body) = send(&app, "GET", "/api/snapshots/emp/versions", None).await;
        assert_eq!(body["versions"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn empty_take_is_a_bad_request() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "POST", "/api/snapshots", Some(r#"{"tables":[]}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn tables_and_schema_are_listed() {
        let (app, _) = app().await;
        let (_, body) = send(&app, "GET", "/api/tables?kind=table", None).await;
        assert_eq!(body["tables"], serde_json::json!(["emp"]));

        let (status, body) = send(&app, "GET", "/api/tables/emp/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["schema"]["columns"][0]["primaryKey"], true);
    }
}
