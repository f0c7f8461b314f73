/*!
HTTP surface of the kernel

- `POST /api/report`: agent samples, bearer token required
- `GET /api/overview`: every configured node with liveness and traffic
- `GET /api/charts?id=&start=&end=`: one node's history (0 means omitted)
- `GET /health`: liveness probe

Errors come back as plain text with the matching status code.
*/

use crate::aggregate::{Aggregator, Charts, Overview, QueryError};
use crate::ingest::{IngestError, Ingestor};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub aggregator: Arc<Aggregator>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Ingest(IngestError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ApiError::Ingest(IngestError::Decode(_) | IngestError::MissingNodeId) => StatusCode::BAD_REQUEST,
            ApiError::Ingest(IngestError::Persistence(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Query(QueryError::MissingNodeId | QueryError::InvalidRange { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Query(QueryError::Storage(_) | QueryError::Aborted(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ChartsParams {
    #[serde(default)]
    id: String,
    start: Option<i64>,
    end: Option<i64>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/report", post(report))
        .route("/api/overview", get(overview))
        .route("/api/charts", get(charts))
        .with_state(app_state)
}

// POST /api/report
async fn report(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<&'static str, ApiError> {
    let auth = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    app.ingestor.ingest(auth, &body).await?;
    Ok("ok")
}

// GET /api/overview
async fn overview(State(app): State<AppState>) -> Result<Json<Arc<Overview>>, ApiError> {
    Ok(Json(app.aggregator.overview().await?))
}

// GET /api/charts
async fn charts(
    State(app): State<AppState>,
    Query(params): Query<ChartsParams>,
) -> Result<Json<Arc<Charts>>, ApiError> {
    let start = params.start.filter(|v| *v != 0);
    let end = params.end.filter(|v| *v != 0);
    Ok(Json(app.aggregator.charts(&params.id, start, end).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::unix_now;
    use crate::config::NodeConfig;
    use crate::state::LiveCache;
    use crate::store::MeasureStore;
    use axum::body::{self, Body};
    use axum::http::Request;
    use devkit::SampleBuilder;
    use tower::ServiceExt; // for `oneshot`

    struct Harness {
        app: Router,
        store: Arc<MeasureStore>,
    }

    fn harness() -> Harness {
        devkit::init_test_logging();
        let cache = Arc::new(LiveCache::new());
        let store = Arc::new(MeasureStore::open_in_memory().unwrap());
        let nodes = vec![
            NodeConfig { id: "fra-1".into(), label: "Frankfurt".into(), location: "DE".into(), reset_day: Some(1) },
            NodeConfig { id: "sgp-1".into(), label: "Singapore".into(), location: "SG".into(), reset_day: None },
        ];
        let state = AppState {
            ingestor: Arc::new(Ingestor::new("s3cret".into(), cache.clone(), store.clone())),
            aggregator: Arc::new(Aggregator::new(cache, store.clone(), nodes, 60)),
        };
        Harness { app: build_router(state), store }
    }

    fn report_request(token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/report")
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn get_text(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_is_open() {
        let h = harness();
        assert_eq!(get_text(&h.app, "/health").await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn report_status_codes() {
        let h = harness();
        let body = SampleBuilder::new("fra-1").report_time(unix_now()).to_json();

        let resp = h.app.clone().oneshot(report_request("s3cret", body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = h.app.clone().oneshot(report_request("wrong", body.clone())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = h.app.clone().oneshot(report_request("s3cret", b"[1,2".to_vec())).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        assert_eq!(h.store.measure_count(None).unwrap(), 1);

        h.store.close().unwrap();
        let resp = h.app.clone().oneshot(report_request("s3cret", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn overview_after_report() {
        let h = harness();
        let body = SampleBuilder::new("fra-1").report_time(unix_now()).traffic(500, 50).to_json();
        h.app.clone().oneshot(report_request("s3cret", body)).await.unwrap();

        let (status, text) = get_text(&h.app, "/api/overview").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        let nodes = json["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0]["id"], "fra-1");
        assert_eq!(nodes[0]["alive"], true);
        assert_eq!(nodes[0]["sample"]["network"]["send"], 500);
        assert_eq!(nodes[1]["alive"], false);
        assert!(nodes[1].get("sample").is_none());
    }

    #[tokio::test]
    async fn charts_validation_and_payload() {
        let h = harness();
        let now = unix_now();
        let body = SampleBuilder::new("fra-1")
            .report_time(now - 10)
            .cpu(33.333)
            .temperature("coretemp-isa-0000", 45.0)
            .to_json();
        h.app.clone().oneshot(report_request("s3cret", body)).await.unwrap();

        let (status, _) = get_text(&h.app, "/api/charts").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, text) = get_text(&h.app, "/api/charts?id=fra-1&start=20&end=10").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(text.contains("after"));

        let (status, text) = get_text(&h.app, "/api/charts?id=fra-1&start=0&end=0").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["cpu"][0]["value"], 33.33);
        assert_eq!(json["temperature"]["coretemp-isa-0000"][0]["value"], 45.0);
        assert_eq!(json["end"].as_i64().unwrap() - json["start"].as_i64().unwrap(), 3_600);
    }

    #[tokio::test]
    async fn query_failure_is_a_server_error() {
        let h = harness();
        h.store.close().unwrap();
        let (status, _) = get_text(&h.app, "/api/overview").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
