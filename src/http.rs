//! HTTP surface: scoring, liveness, status and metrics.

use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::detection::InferenceResponse;
use crate::scoring::{Outcome, ScoringCoordinator};
use crate::twin::ReportedStatus;

pub const PROCESSING_ERROR: &str = "Exception occured while processing the image.";

#[derive(Clone)]
pub struct HttpState {
    pub scoring: Arc<ScoringCoordinator>,
}

pub fn router(state: HttpState, max_image_bytes: usize) -> Router {
    Router::new()
        .route("/", get(healthy))
        .route("/score", post(score))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(max_image_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("🌐 Inference API listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))
}

async fn healthy() -> &'static str {
    "Healthy"
}

async fn score(State(st): State<HttpState>, body: Result<Bytes, BytesRejection>) -> Response {
    // oversized or truncated bodies fail like any other bad image
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Could not read image body");
            crate::metrics::SCORE_REJECTED.inc();
            return processing_error();
        }
    };

    match st.scoring.handle_score(body.to_vec()).await {
        Outcome::Detected(result) => {
            Json(InferenceResponse::from(result.detections.as_slice())).into_response()
        }
        Outcome::Empty => StatusCode::NO_CONTENT.into_response(),
        Outcome::Rejected(_) => processing_error(),
    }
}

fn processing_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, PROCESSING_ERROR).into_response()
}

async fn status(State(st): State<HttpState>) -> impl IntoResponse {
    let snapshot = st.scoring.shared().snapshot();
    Json(json!({
        "reported": ReportedStatus::from(&snapshot.model),
        "configuration": snapshot.configuration,
        "model": snapshot.model,
        "timestamp": snapshot.timestamp,
    }))
}

async fn metrics() -> String {
    crate::metrics::export_metrics()
}
