//! HTTP front-end: ingestion, selfie lookup, listing, health and metrics.

pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::ingest::source::parse_url_list;
use crate::models::{MatchResult, RunReport};
use crate::query;

pub use state::AppContext;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/process_urls", post(process_urls))
        .route("/upload_selfie", post(upload_selfie))
        .route("/all_photos", get(all_photos))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve until `cancel` fires, then drain in-flight requests.
pub async fn serve(
    ctx: Arc<AppContext>,
    host: &str,
    port: u16,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let address = format!("{}:{}", host, port);
    let addr: SocketAddr = address
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: address.clone(),
            source,
        })?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
    tracing::info!("photofinder listening on http://{}", addr);

    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|source| ServerError::Serve { source })?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "photofinder API",
        "endpoints": [
            {
                "path": "/process_urls",
                "method": "POST",
                "description": "Process a file containing Google Drive URLs"
            },
            {
                "path": "/upload_selfie",
                "method": "POST",
                "description": "Upload a selfie and find matching photos"
            },
            {
                "path": "/all_photos",
                "method": "GET",
                "description": "Get all photos, including both processed and failed ones"
            },
            {
                "path": "/healthz",
                "method": "GET",
                "description": "Service and vector store health"
            },
            {
                "path": "/metrics",
                "method": "GET",
                "description": "Prometheus metrics"
            }
        ]
    }))
}

async fn healthz(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    match ctx.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "store": ctx.store.backend_name() })),
        ),
        Err(e) => {
            tracing::warn!("Health check: store unavailable: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "store": ctx.store.backend_name(),
                    "error": e.to_string(),
                })),
            )
        }
    }
}

async fn metrics(State(ctx): State<Arc<AppContext>>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        ctx.metrics.to_prometheus(),
    )
}

/// Collected multipart form: the `file` part plus plain text fields.
#[derive(Default)]
struct UploadForm {
    file: Option<Vec<u8>>,
    fields: Vec<(String, String)>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(format!("malformed multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(format!("cannot read field `{}`: {}", name, e)))?;
            if name == "file" {
                form.file = Some(data.to_vec());
            } else {
                form.fields
                    .push((name, String::from_utf8_lossy(&data).trim().to_string()));
            }
        }
        Ok(form)
    }

    fn take_file(&mut self) -> Result<Vec<u8>, AppError> {
        self.file
            .take()
            .ok_or_else(|| AppError::BadRequest("missing form field `file`".into()))
    }

    fn parse<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T, AppError> {
        match self.fields.iter().find(|(n, _)| n == name) {
            None => Ok(default),
            Some((_, v)) if v.is_empty() => Ok(default),
            Some((_, v)) => v
                .parse()
                .map_err(|_| AppError::BadRequest(format!("invalid value for `{}`: {}", name, v))),
        }
    }
}

async fn process_urls(
    State(ctx): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<RunReport>, AppError> {
    let run = ctx.limits.try_acquire_run()?;

    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file()?;
    let batch_size: usize = form.parse("batch_size", ctx.config.ingest.batch_size)?;
    if batch_size == 0 {
        return Err(AppError::BadRequest("batch_size must be at least 1".into()));
    }

    let text = String::from_utf8(file)
        .map_err(|_| AppError::BadRequest("URL list must be UTF-8 text".into()))?;
    let items = parse_url_list(&text);

    // Detached so a dropped connection cannot cut the run short
    let run_ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let _run = run;
        run_ctx.ingest(items, batch_size).await
    });
    let summary = handle
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("ingestion task failed: {}", e)))??;
    Ok(Json(summary.report()))
}

#[derive(Serialize)]
struct SelfieResponse {
    success: bool,
    matches: Vec<MatchResult>,
    match_count: usize,
}

async fn upload_selfie(
    State(ctx): State<Arc<AppContext>>,
    multipart: Multipart,
) -> Result<Json<SelfieResponse>, AppError> {
    let started = Instant::now();
    let mut form = UploadForm::read(multipart).await?;
    let file = form.take_file()?;
    let threshold: f32 = form.parse("threshold", ctx.config.query.threshold)?;
    let limit: usize = form.parse("limit", ctx.config.query.limit)?;

    let matches = query::find_by_selfie(
        &ctx.extractor,
        ctx.store.as_ref(),
        &ctx.store_circuit,
        file,
        threshold,
        limit,
    )
    .await?;

    ctx.metrics
        .record_query(started.elapsed().as_micros() as usize);

    Ok(Json(SelfieResponse {
        success: true,
        match_count: matches.len(),
        matches,
    }))
}

async fn all_photos(State(ctx): State<Arc<AppContext>>) -> Result<impl IntoResponse, AppError> {
    let listing = query::list_photos(&ctx.store, &ctx.audit_path).await?;
    Ok(Json(json!({
        "success": true,
        "processed_count": listing.processed_count,
        "failed_count": listing.failed_count,
        "photos": listing.photos,
    })))
}
