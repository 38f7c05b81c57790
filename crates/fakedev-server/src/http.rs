//! HTTP scrape endpoint.
//!
//! One fixed path answers GET with the exposition text; every scrape drives
//! a full engine pass. The engine lock is held for the whole pass plus
//! encoding, so two concurrent scrapes serialize completely.

use std::io;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

use fakedev_engine::SimulationEngine;

pub const METRIC_PATH: &str = "/metrics";

pub type SharedEngine = Arc<Mutex<SimulationEngine>>;

/// Builds the scrape router. The router itself answers other paths with
/// 404 and other methods on the metrics path with 405.
pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route(METRIC_PATH, get(scrape))
        .with_state(engine)
}

async fn scrape(State(engine): State<SharedEngine>, body: Bytes) -> Response {
    if !body.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let text = engine.lock().await.scrape().await;
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response()
}

/// Binds the scrape address and serves until the process exits.
pub async fn listen_metrics(address: &str, engine: SharedEngine) -> io::Result<()> {
    let listener = TcpListener::bind(address).await?;
    info!(address, path = METRIC_PATH, "listening for metric queries");
    axum::serve(listener, router(engine)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{self, Body};
    use axum::http::Request;
    use fakedev_config::{DevInfo, MetricLimit};
    use fakedev_engine::admission_queue;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt; // for `oneshot`

    fn shared_engine() -> SharedEngine {
        let mut metric_limits = BTreeMap::new();
        metric_limits.insert("busy".to_string(), MetricLimit { min: 0.0, max: 100.0 });
        let devinfo = Arc::new(DevInfo {
            device_labels: vec![Vec::new()],
            metric_limits,
            device_map: [("card0".to_string(), 0)].into(),
            metric_labels: Default::default(),
            output: vec!["busy".to_string()],
        });
        let (_tx, rx) = admission_queue();
        Arc::new(Mutex::new(SimulationEngine::new(
            devinfo,
            rx,
            Some(7),
            Duration::from_secs(86400),
        )))
    }

    #[tokio::test]
    async fn get_metrics_returns_exposition_text() {
        let app = router(shared_engine());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(METRIC_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(text.to_vec()).unwrap();
        assert!(text.starts_with("# fakedev-exporter v"), "got: {text}");
        assert!(text.contains("busy{} 0"), "got: {text}");
    }

    #[tokio::test]
    async fn wrong_method_is_405() {
        let app = router(shared_engine());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(METRIC_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn wrong_path_is_404() {
        let app = router(shared_engine());
        let resp = app
            .oneshot(Request::builder().uri("/other").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_empty_body_is_400() {
        let app = router(shared_engine());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(METRIC_PATH)
                    .body(Body::from("junk"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
