//! HTTP handlers

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use stkbridge_core::{Error, ProgrammingState, ProgressSnapshot};

use super::control::AbortOnDrop;
use super::error::{Result, ServerError};
use super::AppState;

/// Chunk size used when replaying a stored image into the session
const STORED_CHUNK: usize = 1024;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    /// Seconds since the bridge started
    pub uptime: u64,
}

fn busy_response() -> Response {
    let body = Json(json!({
        "status": "flashing",
        "message": "Upload in progress",
    }));
    (StatusCode::ACCEPTED, body).into_response()
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Start a session, or `None` when one is already running
async fn begin(app: &AppState, total: usize) -> Result<Option<AbortOnDrop>> {
    match app.control.begin(total).await {
        Ok(()) => Ok(Some(AbortOnDrop::new(app.control.clone()))),
        Err(ServerError::Session(Error::Busy)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// End the upload, wait for the session to finish and report the outcome
async fn finish(app: &AppState, upload: Option<Vec<u8>>) -> Response {
    if let Err(e) = app.control.end().await {
        log::debug!("Upload end refused: {}", e);
    }

    let snapshot = app.control.wait_terminal().await;
    if snapshot.state != ProgrammingState::Complete {
        let body = Json(json!({
            "status": "error",
            "message": snapshot.error_message.as_str(),
            "bytesWritten": snapshot.bytes_written,
        }));
        return (StatusCode::INTERNAL_SERVER_ERROR, body).into_response();
    }

    if let Some(data) = upload {
        persist(app, data).await;
    }

    Json(json!({
        "status": "success",
        "message": "Firmware flashed and verified",
        "bytesWritten": snapshot.bytes_written,
    }))
    .into_response()
}

async fn persist(app: &AppState, data: Vec<u8>) {
    let (Some(store), Some(name)) = (app.store.clone(), app.persist_name.clone()) else {
        return;
    };

    match tokio::task::spawn_blocking(move || store.store(&name, &data)).await {
        Ok(Ok(image)) => log::info!(
            "Persisted upload as {} version {}",
            image.name,
            image.version
        ),
        Ok(Err(e)) => log::error!("Failed to persist upload: {}", e),
        Err(e) => log::error!("Persist task failed: {}", e),
    }
}

/// POST /flash
/// Stream the request body into a new programming session
pub async fn flash(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let total = content_length(&headers).ok_or(ServerError::LengthRequired)?;
    let Some(mut guard) = begin(&app, total).await? else {
        return Ok(busy_response());
    };
    log::info!("Upload of {} bytes started", total);

    let mut upload = app.persist_name.as_ref().map(|_| Vec::with_capacity(total));
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                log::warn!("Upload body failed: {}", e);
                app.control.abort();
                break;
            }
        };

        if let Some(upload) = upload.as_mut() {
            upload.extend_from_slice(&chunk);
        }
        if let Err(e) = app.control.chunk(chunk.to_vec()).await {
            log::debug!("Chunk refused: {}", e);
            break;
        }
    }

    guard.disarm();
    Ok(finish(&app, upload).await)
}

/// POST /flash/stored/:name
/// Program the latest stored version of an image
pub async fn flash_stored(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response> {
    let store = app.store.clone().ok_or(ServerError::NoStore)?;
    let (image, data) = tokio::task::spawn_blocking(move || store.load(&name))
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))??;

    let Some(mut guard) = begin(&app, data.len()).await? else {
        return Ok(busy_response());
    };
    log::info!("Flashing stored {} version {}", image.name, image.version);

    for chunk in data.chunks(STORED_CHUNK) {
        if let Err(e) = app.control.chunk(chunk.to_vec()).await {
            log::debug!("Chunk refused: {}", e);
            break;
        }
    }

    guard.disarm();
    Ok(finish(&app, None).await)
}

/// GET /status
pub async fn status(State(app): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        progress: app.control.snapshot(),
        uptime: app.started.elapsed().as_secs(),
    })
}

/// POST /reset
pub async fn reset(State(app): State<AppState>) -> Result<Json<Value>> {
    app.control.reset().await?;
    Ok(Json(json!({
        "status": "ok",
        "message": "Peer reset",
    })))
}

/// POST /abort
pub async fn abort(State(app): State<AppState>) -> Json<Value> {
    app.control.abort();
    Json(json!({
        "status": "ok",
        "message": "Abort requested",
    }))
}

/// POST /relay
/// Forward the body to the peer's application
pub async fn relay(State(app): State<AppState>, body: Bytes) -> Result<Json<Value>> {
    let len = body.len();
    app.control.relay(body.to_vec()).await?;
    Ok(Json(json!({
        "status": "ok",
        "bytes": len,
    })))
}
