//! Thin HTTP service: trigger downloads and serve saved exports.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cpls_core::RunStatus;
use cpls_sync::{JobPipeline, SourceReport, SyncConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cpls-web";

pub struct AppState {
    pipeline: JobPipeline,
}

impl AppState {
    pub fn new(config: SyncConfig) -> anyhow::Result<Self> {
        Ok(Self {
            pipeline: JobPipeline::new(config)?,
        })
    }

    fn run_token(&self) -> &str {
        &self.pipeline.config().run_token
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .route("/files/{filename}", get(file_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let port = config.port;
    let state = AppState::new(config)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving download service");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()).await
}

fn check_token(expected: &str, provided: Option<&str>) -> Result<(), Response> {
    if expected.is_empty() {
        warn!("RUN_TOKEN is not set; authenticated endpoints reject all requests");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "RUN_TOKEN is not configured on the server"})),
        )
            .into_response());
    }
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid or missing token"})),
        )
            .into_response()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": err.to_string()})),
    )
        .into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

async fn run_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let provided = headers
        .get("x-auth-token")
        .and_then(|value| value.to_str().ok());
    if let Err(response) = check_token(state.run_token(), provided) {
        return response;
    }

    info!("starting export downloads");
    match state.pipeline.run_downloads().await {
        Ok(reports) => {
            let flags: Vec<bool> = reports.iter().map(|report| report.ok).collect();
            let status = RunStatus::aggregate(&flags);
            let results: serde_json::Map<String, serde_json::Value> = reports
                .iter()
                .map(|report| (report.source_id.clone(), source_json(report)))
                .collect();
            info!(status = status.as_str(), "downloads completed");
            Json(json!({
                "status": status.as_str(),
                "saved_to": state.pipeline.config().data_dir.display().to_string(),
                "results": results,
            }))
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

fn source_json(report: &SourceReport) -> serde_json::Value {
    json!({
        "file": report.file,
        "bytes": report.ok.then_some(report.bytes),
        "url": report.file.as_ref().map(|file| format!("/files/{file}")),
        "error": report.error,
    })
}

#[derive(Debug, Deserialize, Default)]
struct FileQuery {
    token: Option<String>,
}

async fn file_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(filename): AxumPath<String>,
    Query(query): Query<FileQuery>,
) -> Response {
    if let Err(response) = check_token(state.run_token(), query.token.as_deref()) {
        return response;
    }

    // Simple filenames only, no directory traversal.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": "Invalid filename"})),
        )
            .into_response();
    }

    let path = state.pipeline.config().data_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            info!(path = %path.display(), "serving saved export");
            (
                [
                    (
                        header::CONTENT_TYPE,
                        "text/csv; charset=utf-8".to_string(),
                    ),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "File not found"})),
        )
            .into_response(),
    }
}
