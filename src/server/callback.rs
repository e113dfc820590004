use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

use crate::generation::CallbackResolution;
use crate::kie::parse_callback;
use crate::server::{Notifier, ServerState};

#[derive(Debug, Deserialize)]
pub(crate) struct CallbackParams {
    token: Option<String>,
}

/// Appends the shared secret to the callback URL handed to the provider.
pub fn signed_callback_url(base: &str, secret: Option<&str>) -> anyhow::Result<String> {
    let mut url = Url::parse(base)?;
    if let Some(secret) = secret {
        url.query_pairs_mut().append_pair("token", secret);
    }
    Ok(url.to_string())
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub(crate) async fn kie_callback<N: Notifier>(
    State(state): State<Arc<ServerState<N>>>,
    Query(params): Query<CallbackParams>,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.callback_secret {
        if params.token.as_deref() != Some(secret.as_str()) {
            warn!("Rejected callback with missing or wrong token");
            return json_error(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
    }

    let event = match parse_callback(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!("Error processing callback: {err}");
            return json_error(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    match state.tracker.handle_callback(event).await {
        Ok(CallbackResolution::Unknown { task_id }) => {
            warn!("Unknown generation_id: {task_id}");
            json_error(StatusCode::BAD_REQUEST, "Unknown generation_id")
        }
        Ok(CallbackResolution::Deliver { job, video_url }) => {
            let notifier = state.notifier.clone();
            tokio::spawn(async move { notifier.video_ready(job, video_url).await });
            Json(json!({ "status": "ok" })).into_response()
        }
        Ok(CallbackResolution::Refunded { job, reason }) => {
            let notifier = state.notifier.clone();
            tokio::spawn(async move { notifier.generation_failed(job, reason).await });
            Json(json!({ "status": "ok" })).into_response()
        }
        Ok(CallbackResolution::StillPending { task_id }) => {
            info!("Generation {task_id} is still in progress");
            Json(json!({ "status": "ok" })).into_response()
        }
        Ok(CallbackResolution::Duplicate { task_id }) => {
            info!("Generation {task_id} was already settled");
            Json(json!({ "status": "ok" })).into_response()
        }
        Err(err) => {
            error!("Error processing callback: {err}");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}
