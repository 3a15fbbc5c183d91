use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{
    net::TcpListener,
    signal,
    sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError},
};
use tracing::{info, warn};
use tutor_core::{
    CancellationToken, ConfigLoader, Coordinator, ImageAttachment, ProblemContext, SolveReport,
    TelemetryOptions, TextbookSource, TutorError, init_metrics_from_env, init_telemetry,
};

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    request_permits: Arc<Semaphore>,
    max_requests: usize,
    shutdown: CancellationToken,
}

impl AppState {
    fn new(coordinator: Coordinator, max_requests: usize) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            request_permits: Arc::new(Semaphore::new(max_requests)),
            max_requests,
            shutdown: CancellationToken::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::load_or_default(None)?;
    init_telemetry(TelemetryOptions::default().with_default_level(&config.logging.level))?;
    init_metrics_from_env("tutor-api")?;

    let addr: SocketAddr = std::env::var("TUTOR_API_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("invalid TUTOR_API_ADDR")?;

    let request_limit = std::env::var("TUTOR_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|limit| *limit > 0)
        .unwrap_or(5);

    let state = AppState::new(config.build_coordinator()?, request_limit);
    let shutdown = state.shutdown.clone();
    let app = router(state);

    info!(model = %config.model.model, "tutor API listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

/// Textbook text plus base64 images can be large.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/solve", post(handle_solve))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

/// Waits for Ctrl+C or SIGTERM, then cancels every in-flight solve.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(%err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, cancelling in-flight requests");
    shutdown.cancel();
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<TutorError> for AppError {
    fn from(error: TutorError) -> Self {
        let status = match &error {
            TutorError::Precondition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            TutorError::Generation { .. } => StatusCode::BAD_GATEWAY,
            TutorError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, error.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

fn acquire_request_permit(state: &AppState) -> ApiResult<OwnedSemaphorePermit> {
    match state.request_permits.clone().try_acquire_owned() {
        Ok(permit) => Ok(permit),
        Err(TryAcquireError::NoPermits) => Err(AppError::new(
            StatusCode::TOO_MANY_REQUESTS,
            "request capacity reached; retry once a slot frees up",
        )),
        Err(TryAcquireError::Closed) => Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "solver unavailable",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct SolveRequest {
    #[serde(default)]
    problem_text: String,
    #[serde(default)]
    sources: Vec<SourcePayload>,
    #[serde(default)]
    images: Vec<ImagePayload>,
}

#[derive(Debug, Deserialize)]
struct SourcePayload {
    label: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ImagePayload {
    mime_type: String,
    /// Base64 (standard alphabet) image bytes.
    data: String,
}

impl SolveRequest {
    fn into_context(self) -> ApiResult<ProblemContext> {
        let images = self
            .images
            .into_iter()
            .enumerate()
            .map(|(idx, image)| {
                BASE64
                    .decode(image.data.as_bytes())
                    .map(|payload| ImageAttachment::new(payload, image.mime_type))
                    .map_err(|err| {
                        AppError::new(
                            StatusCode::BAD_REQUEST,
                            format!("image {idx} is not valid base64: {err}"),
                        )
                    })
            })
            .collect::<ApiResult<Vec<_>>>()?;

        Ok(ProblemContext {
            problem_text: self.problem_text,
            images,
            textbook_sources: self
                .sources
                .into_iter()
                .map(|source| TextbookSource::new(source.label, source.text))
                .collect(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CapacityReport {
    max_requests: usize,
    available_requests: usize,
    active_requests: usize,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
    capacity: CapacityReport,
}

fn capacity_report(state: &AppState) -> CapacityReport {
    let available = state.request_permits.available_permits();
    let active = state.max_requests.saturating_sub(available);
    CapacityReport {
        max_requests: state.max_requests,
        available_requests: available,
        active_requests: active,
    }
}

async fn handle_health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    Ok(Json(HealthResponse {
        status: "ok",
        model: state.coordinator.model_id().to_string(),
        capacity: capacity_report(&state),
    }))
}

async fn handle_solve(
    State(state): State<AppState>,
    Json(request): Json<SolveRequest>,
) -> ApiResult<Json<SolveReport>> {
    let _permit = acquire_request_permit(&state)?;
    let context = request.into_context()?;

    let cancel = state.shutdown.child_token();
    let report = state
        .coordinator
        .solve_with_report(&context, &cancel)
        .await
        .inspect_err(|err| warn!(%err, "solve request failed"))?;

    info!(
        request_id = %report.request_id,
        steps = report.solution.steps.len(),
        "solve request served"
    );
    Ok(Json(report))
}
