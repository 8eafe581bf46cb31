//! HTTP control surface for the periodic trigger.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::pipeline::content::{content_hash, hashed_filename, sanitize_filename, validate_document};
use crate::pipeline::runner::{PipelineRunner, RunOutcome};
use crate::pipeline::types::{Origin, ResolvedDocument};
use crate::sink::DocumentSink;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<PipelineRunner>,
    /// Destination for manually uploaded documents.
    pub sink: Arc<dyn DocumentSink>,
}

/// Build the Axum router with the control endpoints.
pub fn control_routes(runner: Arc<PipelineRunner>, sink: Arc<dyn DocumentSink>) -> Router {
    let state = AppState { runner, sink };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/process", post(process))
        .route("/upload", post(upload))
        .route("/job/start", post(start_job))
        .route("/job/stop", post(stop_job))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "invoice-sync"
    }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runner.status().await)
}

#[derive(Debug, Default, Deserialize)]
struct ProcessParams {
    /// Return immediately and run in the background.
    #[serde(default)]
    background: bool,
}

async fn process(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
) -> impl IntoResponse {
    if params.background {
        if state.runner.is_running() {
            return (
                StatusCode::CONFLICT,
                Json(serde_json::json!({"outcome": "already_running"})),
            );
        }
        let runner = Arc::clone(&state.runner);
        tokio::spawn(async move {
            if let Err(e) = runner.try_run().await {
                error!(error = %e, "Background pipeline run failed");
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"outcome": "started"})),
        );
    }

    match state.runner.try_run().await {
        Ok(outcome @ RunOutcome::Completed { .. }) => (StatusCode::OK, Json(serde_json::json!(outcome))),
        Ok(outcome @ RunOutcome::AlreadyRunning) => {
            (StatusCode::CONFLICT, Json(serde_json::json!(outcome)))
        }
        Err(e) => {
            error!(error = %e, "Pipeline run failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    filename: Option<String>,
}

/// Accept a PDF body directly, bypassing the mailbox.
async fn upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(content_type) = validate_document("application/pdf", &body) else {
        warn!(size = body.len(), "Rejected upload that is not a PDF");
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "Only PDF documents are accepted"})),
        );
    };

    let hash = content_hash(&body);
    let filename = params
        .filename
        .filter(|f| !f.trim().is_empty())
        .map(|f| sanitize_filename(&f))
        .unwrap_or_else(|| hashed_filename(&hash));

    let document = ResolvedDocument {
        source_message_id: "upload".into(),
        origin: Origin::Attachment,
        provenance: vec![filename.clone()],
        content: body.to_vec(),
        content_type: content_type.to_string(),
        suggested_filename: filename,
        content_hash: hash,
    };

    match state.sink.accept(&document).await {
        Ok(receipt) => {
            info!(filename = %receipt.filename, "Uploaded document accepted");
            (StatusCode::OK, Json(serde_json::json!(receipt)))
        }
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

async fn start_job(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runner.start_scheduler().await)
}

async fn stop_job(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runner.stop_scheduler().await)
}
