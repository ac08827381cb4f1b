// SPDX-License-Identifier: AGPL-3.0
// Courier HTTP - Upload test server
//
// A standard-server backend to run transfers against: multipart uploads on
// POST /upload land in <root>/files, GET serves them back, DELETE removes them.

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, get_service, post},
    Json, Router,
};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    net::TcpListener,
};
use tower_http::services::ServeDir;

/// Subdirectory of the root holding uploaded files
pub const FILES_DIR: &str = "files";

/// Server state shared across handlers
pub struct ServerState {
    /// Directory served statically; uploads go to its `files` subdirectory
    pub root: PathBuf,
}

impl ServerState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }
}

/// Reply to a successful upload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReply {
    /// Name the client sent
    pub file: String,
    /// Name stored under `files/`
    pub saved_as: String,
    pub size: u64,
    /// Non-file form fields
    pub fields: BTreeMap<String, String>,
}

/// Create the Axum router for the upload server
pub fn create_router(state: Arc<ServerState>) -> Router {
    // ServeDir sees the full `/files/<name>` path, so it is rooted one level up
    let files = get_service(ServeDir::new(&state.root)).delete(delete_handler);

    Router::new()
        .route("/health", get(health_handler))
        .route("/upload", post(upload_handler))
        .route("/files/{name}", files)
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve on an already bound listener until the task is dropped
pub async fn serve(listener: TcpListener, state: Arc<ServerState>) -> std::io::Result<()> {
    tokio::fs::create_dir_all(state.files_dir()).await?;
    let app = create_router(state);
    axum::serve(listener, app).await
}

/// Bind to all interfaces on `port` and serve
pub async fn start_server(state: Arc<ServerState>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting server on port {}", port);

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        std::io::Error::new(e.kind(), format!("Failed to bind to port {}: {}", port, e))
    })?;
    serve(listener, state).await
}

/// Stored form of an uploaded filename: word characters kept, runs of
/// anything else collapsed to `-`, lowercased. The extension is kept as is.
pub fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or(fallback);

    let (stem, ext) = split_file_name(base);
    let mut clean = String::with_capacity(stem.len());
    let mut in_run = false;
    for c in stem.chars() {
        if c.is_alphanumeric() || c == '_' {
            clean.extend(c.to_lowercase());
            in_run = false;
        } else if !in_run {
            clean.push('-');
            in_run = true;
        }
    }
    if clean.is_empty() || clean == "-" {
        clean = fallback.to_string();
    }

    if ext.is_empty() {
        clean
    } else {
        format!("{}.{}", clean, ext.to_lowercase())
    }
}

fn split_file_name(name: &str) -> (&str, &str) {
    if let Some((stem, ext)) = name.rsplit_once('.') {
        if !stem.is_empty() {
            return (stem, ext);
        }
    }
    (name, "")
}

async fn open_unique_file(dir: &Path, base_name: &str) -> Result<(PathBuf, File), std::io::Error> {
    let (stem, ext) = split_file_name(base_name);

    for index in 0..1000 {
        let candidate = if index == 0 {
            base_name.to_string()
        } else if ext.is_empty() {
            format!("{}-{}", stem, index)
        } else {
            format!("{}-{}.{}", stem, index, ext)
        };

        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        "Too many filename conflicts",
    ))
}

fn error_reply(status: StatusCode, message: String) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message })))
}

/// Health check endpoint
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "app": "courier-test-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Store the file part of a multipart upload
async fn upload_handler(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let files_dir = state.files_dir();
    if let Err(e) = tokio::fs::create_dir_all(&files_dir).await {
        tracing::error!("Failed to create files directory: {}", e);
        return error_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to create files directory: {}", e),
        );
    }

    let mut fields = BTreeMap::new();
    let mut stored: Option<(String, String, u64)> = None;

    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_reply(StatusCode::BAD_REQUEST, format!("Bad form: {}", e)),
        };
        let name = field.name().unwrap_or_default().to_string();

        let Some(original) = field.file_name().map(|n| n.to_string()) else {
            match field.text().await {
                Ok(value) => {
                    fields.insert(name, value);
                }
                Err(e) => {
                    return error_reply(StatusCode::BAD_REQUEST, format!("Bad field: {}", e))
                }
            }
            continue;
        };

        let safe_name = sanitize_file_name(&original, "upload");
        let (path, mut file) = match open_unique_file(&files_dir, &safe_name).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Failed to create file: {}", e);
                return error_reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to create file: {}", e),
                );
            }
        };

        let mut size: u64 = 0;
        loop {
            match field.chunk().await {
                Ok(Some(data)) => {
                    if let Err(e) = file.write_all(&data).await {
                        drop(file);
                        let _ = tokio::fs::remove_file(&path).await;
                        return error_reply(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            format!("Failed to write: {}", e),
                        );
                    }
                    size += data.len() as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&path).await;
                    return error_reply(StatusCode::BAD_REQUEST, format!("Stream error: {}", e));
                }
            }
        }
        if let Err(e) = file.flush().await {
            tracing::error!("Failed to flush file: {}", e);
        }

        let saved_as = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&safe_name)
            .to_string();
        tracing::info!("Uploaded file {} saved as {} ({} bytes)", original, saved_as, size);
        stored = Some((original, saved_as, size));
    }

    match stored {
        Some((file, saved_as, size)) => {
            let reply = UploadReply {
                file,
                saved_as,
                size,
                fields,
            };
            (
                StatusCode::OK,
                Json(serde_json::to_value(reply).unwrap_or_default()),
            )
        }
        None => error_reply(StatusCode::BAD_REQUEST, "No file part in upload".to_string()),
    }
}

async fn delete_handler(
    State(state): State<Arc<ServerState>>,
    UrlPath(name): UrlPath<String>,
) -> impl IntoResponse {
    let safe_name = sanitize_file_name(&name, "");
    if safe_name != name {
        return error_reply(StatusCode::BAD_REQUEST, format!("Bad file name {}", name));
    }

    match tokio::fs::remove_file(state.files_dir().join(&name)).await {
        Ok(()) => {
            tracing::info!("Deleted {}", name);
            (StatusCode::OK, Json(serde_json::json!({ "deleted": name })))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            error_reply(StatusCode::NOT_FOUND, format!("{} not found", name))
        }
        Err(e) => error_reply(StatusCode::INTERNAL_SERVER_ERROR, format!("Delete failed: {}", e)),
    }
}
