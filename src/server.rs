//! HTTP surface: `POST /check?url=...`, `/health` and `/metrics`

use crate::{Analyzer, ErrorKind, FullReport, VitalsError};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<Analyzer>,
    pub prometheus: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
pub struct CheckParams {
    pub url: Option<String>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Error body for failed requests
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<VitalsError> for ApiError {
    fn from(err: VitalsError) -> Self {
        let status = match err.kind() {
            ErrorKind::Input => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });

        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/check", post(check))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Serve until `shutdown` resolves. In-flight analyses are dropped with their
/// connections, which aborts their probes.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), VitalsError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn check(
    State(state): State<AppState>,
    Query(params): Query<CheckParams>,
) -> Result<Json<FullReport>, ApiError> {
    let url = params
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing url parameter"))?;

    let report = state.analyzer.analyze(&url).await?;

    Ok(Json(report))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        BrowserResult, LinkHealth, MockBrowserProbe, MockLinkProber, MockNetworkProbe, NetworkStats,
        VitalsMetrics,
    };
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(network: MockNetworkProbe, browser: MockBrowserProbe) -> AppState {
        let mut links = MockLinkProber::new();
        links
            .expect_check()
            .returning(|url| LinkHealth::reachable(url.to_string(), 200, Duration::from_millis(1)));

        AppState {
            analyzer: Arc::new(Analyzer::with_probes(
                Arc::new(network),
                Arc::new(browser),
                Arc::new(links),
                10,
                Arc::new(VitalsMetrics::new()),
            )),
            prometheus: None,
        }
    }

    fn unused_probes() -> AppState {
        let mut network = MockNetworkProbe::new();
        network.expect_probe().never();
        let mut browser = MockBrowserProbe::new();
        browser.expect_probe().never();
        state(network, browser)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_check_without_url_is_bad_request() {
        let response = build_router(unused_probes()).oneshot(post_request("/check")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("url"));
    }

    #[tokio::test]
    async fn test_check_with_empty_url_is_bad_request() {
        let response = build_router(unused_probes()).oneshot(post_request("/check?url=")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_returns_report() {
        let mut network = MockNetworkProbe::new();
        network.expect_probe().returning(|url| {
            Ok(NetworkStats {
                url: url.to_string(),
                status_code: 200,
                ..Default::default()
            })
        });
        let mut browser = MockBrowserProbe::new();
        browser.expect_probe().returning(|_| {
            Ok(BrowserResult {
                fcp: 99.5,
                links: vec!["https://example.com/about".to_string()],
            })
        });

        let response = build_router(state(network, browser))
            .oneshot(post_request("/check?url=https%3A%2F%2Fexample.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["network"]["url"], "https://example.com");
        assert_eq!(json["browser"]["fcp"], 99.5);
        assert_eq!(json["links_health"][0]["status_code"], 200);
    }

    #[tokio::test]
    async fn test_analysis_failure_is_server_error() {
        let mut network = MockNetworkProbe::new();
        network
            .expect_probe()
            .returning(|_| Err(VitalsError::Transport("connection refused".into())));
        let mut browser = MockBrowserProbe::new();
        browser
            .expect_probe()
            .returning(|_| Ok(BrowserResult::default()));

        let response = build_router(state(network, browser))
            .oneshot(post_request("/check?url=https://example.com"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_health() {
        let response = build_router(unused_probes())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let response = build_router(unused_probes())
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
