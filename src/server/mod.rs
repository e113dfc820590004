pub mod callback;
pub mod uploads;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{error, info};

use crate::db::models::GenerationRow;
use crate::generation::GenerationTracker;

pub use callback::signed_callback_url;
pub use uploads::UploadStore;

const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Tells users about settled jobs. Callbacks only decide what happened;
/// reaching the user is left to the implementation.
pub trait Notifier: Clone + Send + Sync + 'static {
    fn video_ready(
        &self,
        job: GenerationRow,
        video_url: String,
    ) -> impl Future<Output = ()> + Send;

    fn generation_failed(
        &self,
        job: GenerationRow,
        reason: Option<String>,
    ) -> impl Future<Output = ()> + Send;
}

pub struct ServerState<N> {
    pub tracker: GenerationTracker,
    pub notifier: N,
    pub uploads: UploadStore,
    pub callback_url: String,
    pub callback_secret: Option<String>,
}

pub fn build_router<N: Notifier>(state: ServerState<N>) -> Router {
    let body_limit = state.uploads.max_bytes() + MULTIPART_OVERHEAD_BYTES;
    Router::new()
        .route("/", get(index::<N>))
        .route("/health", get(health::<N>))
        .route("/kie_callback", post(callback::kie_callback::<N>))
        .route("/api/upload", post(uploads::upload_image::<N>))
        .route("/uploads/{filename}", get(uploads::serve_upload::<N>))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

pub async fn run_server<N: Notifier>(addr: SocketAddr, state: ServerState<N>) -> anyhow::Result<()> {
    let upload_dir = state.uploads.dir().display().to_string();
    let callback_url = state.callback_url.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Callback server listening on {addr}");
    info!("Callback URL: {callback_url}");
    info!("Upload directory: {upload_dir}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index<N: Notifier>(State(state): State<Arc<ServerState<N>>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "Bot is running",
        "webhook_url": state.callback_url,
    }))
}

async fn health<N: Notifier>(State(state): State<Arc<ServerState<N>>>) -> Response {
    match state.tracker.pending_count().await {
        Ok(pending) => Json(json!({
            "status": "healthy",
            "pending_generations": pending,
        }))
        .into_response(),
        Err(err) => {
            error!("Health check failed: {err}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "error": err.to_string() })),
            )
                .into_response()
        }
    }
}
