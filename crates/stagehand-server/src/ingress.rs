//! HTTP ingress and health
//!
//! Two routes: `POST /v1/process` registers a staging file and fans the
//! parse task out to the slaves; `GET /health` (stand-alone modes only)
//! reports the service health document.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    compression::CompressionLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::config::WarehouseMode;
use crate::error::AppError;
use crate::notifier::{Notifier, StagingFileTask};
use crate::warehouse::models::StagingFileDescriptor;
use crate::warehouse::store::UploadStore;
use crate::warehouse::worker::WorkerHub;
use std::sync::Arc;

/// State shared across ingress handlers
#[derive(Clone)]
pub struct AppState {
    pub store: UploadStore,
    pub notifier: Notifier,
    pub hub: Arc<WorkerHub>,
    pub mode: WarehouseMode,
}

/// Build the ingress router. The health route is only mounted for
/// stand-alone modes; embedded hosts own their health surface.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new().route("/v1/process", post(process_staging_file));

    if state.mode.is_standalone() {
        router = router.route("/health", get(health));
    }

    router
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Register a staging file
///
/// POST /v1/process — body is a staging-file descriptor. Malformed JSON is
/// rejected with 400 by the extractor; insert failures are a 500, not a
/// process abort.
async fn process_staging_file(
    State(state): State<AppState>,
    Json(descriptor): Json<StagingFileDescriptor>,
) -> Result<Response, AppError> {
    validate_descriptor(&descriptor)?;

    let id = state
        .store
        .create_staging_file(&descriptor)
        .await
        .map_err(|e| AppError::Internal(format!("failed to register staging file: {e}")))?;

    // The row is persisted either way; a failed notify only delays parsing
    // until a slave rescans
    let task = StagingFileTask {
        staging_file_id: id,
        location: descriptor.location.clone(),
    };
    if let Err(e) = state.notifier.publish_staging_file(&task).await {
        tracing::warn!(staging_file_id = id, error = %e, "failed to publish parse task");
    }

    tracing::debug!(
        staging_file_id = id,
        source_id = %descriptor.source,
        destination_id = %descriptor.destination,
        "staging file registered"
    );

    Ok((StatusCode::OK, Json(json!({ "stagingFileId": id }))).into_response())
}

fn validate_descriptor(descriptor: &StagingFileDescriptor) -> Result<(), AppError> {
    if descriptor.location.is_empty() {
        return Err(AppError::Validation("location cannot be empty".to_string()));
    }
    if descriptor.source.is_empty() || descriptor.destination.is_empty() {
        return Err(AppError::Validation(
            "source and destination cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Health document
///
/// GET /health — always 200; the body carries the database verdict.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_up = state.store.ping().await.is_ok();
    if !db_up {
        tracing::error!("metadata database health check failed");
    }

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    (
        StatusCode::OK,
        Json(json!({
            "server": "UP",
            "db": if db_up { "UP" } else { "DOWN" },
            "acceptingEvents": true,
            "warehouseMode": state.mode.as_str(),
            "host": host,
            "workersInUse": state.hub.slots_in_use(),
        })),
    )
}
