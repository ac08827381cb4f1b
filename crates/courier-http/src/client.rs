// SPDX-License-Identifier: AGPL-3.0
// Courier HTTP - reqwest transport
//
// Each issued request runs as a task on the given tokio runtime. Progress,
// completion and failure come back on an async channel keyed by handle.
// Download bodies are streamed into a staging file the manager moves later.

use async_channel::{Receiver, Sender};
use bytes::Bytes;
use courier_core::{
    Method, RequestBody, RequestDescription, TransferError, Transport, TransportError,
    TransportErrorKind, TransportEvent, TransportHandle, TransportPayload, TransportResponse,
};
use futures::StreamExt;
use reqwest::{multipart, Body, Client, RequestBuilder};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{fs::File, io::AsyncWriteExt, runtime::Handle, task::AbortHandle};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Progress is reported at most once per this many bytes
const PROGRESS_STEP: u64 = 32 * 1024;

type ActiveMap = Arc<Mutex<HashMap<TransportHandle, AbortHandle>>>;

/// [`Transport`] backed by a shared reqwest client
pub struct HttpTransport {
    http_client: Client,
    runtime: Handle,
    next_handle: AtomicU64,
    active: ActiveMap,
    event_tx: Sender<TransportEvent>,
    staging_dir: PathBuf,
}

impl HttpTransport {
    /// Transport running on `runtime`, plus the receiver its events arrive on
    pub fn new(runtime: Handle) -> Result<(Self, Receiver<TransportEvent>), TransferError> {
        let http_client = Client::builder()
            // No global timeout - large file transfers can take a long time
            // Use read_timeout to detect stalled connections instead
            .read_timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                TransferError::InvalidConfig(format!("Failed to create HTTP client: {}", e))
            })?;

        let (event_tx, event_rx) = async_channel::unbounded();
        let transport = Self {
            http_client,
            runtime,
            next_handle: AtomicU64::new(0),
            active: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            staging_dir: std::env::temp_dir().join("courier-staging"),
        };
        Ok((transport, event_rx))
    }

    /// Directory for in-flight download bodies
    pub fn with_staging_dir(mut self, staging_dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = staging_dir.into();
        self
    }

    /// Operations issued and not yet finished
    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

impl Transport for HttpTransport {
    fn issue(&self, request: RequestDescription) -> Result<TransportHandle, TransferError> {
        let handle = TransportHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        if !request.background {
            tracing::trace!("{} requested foreground execution", handle);
        }
        tracing::debug!("Issuing {} {} as {}", request.method, request.url, handle);

        let client = self.http_client.clone();
        let event_tx = self.event_tx.clone();
        let active = self.active.clone();
        let staging_dir = self.staging_dir.clone();

        // Held until the abort handle is stored, so the task's own removal
        // always comes after the insert
        let mut active_map = lock(&self.active);
        let task = self.runtime.spawn(async move {
            let sink = Some((handle, &event_tx));
            let event = match perform(&client, request, sink, &staging_dir).await {
                Ok(response) => TransportEvent::Completed { handle, response },
                Err(error) => TransportEvent::Failed { handle, error },
            };
            lock(&active).remove(&handle);
            if event_tx.send(event).await.is_err() {
                tracing::debug!("No listener for the outcome of {}", handle);
            }
        });

        active_map.insert(handle, task.abort_handle());
        Ok(handle)
    }

    fn cancel(&self, handle: TransportHandle) {
        if let Some(task) = lock(&self.active).remove(&handle) {
            tracing::info!("Cancelling {}", handle);
            task.abort();
        }
    }

    /// Runs the request on the transport's runtime and parks the calling
    /// thread until it answers. Panics if called from inside that runtime.
    fn execute_blocking(
        &self,
        request: RequestDescription,
    ) -> Result<TransportResponse, TransportError> {
        let client = self.http_client.clone();
        let staging_dir = self.staging_dir.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        self.runtime.spawn(async move {
            let result = perform(&client, request, None, &staging_dir).await;
            let _ = tx.send(result);
        });

        rx.blocking_recv().map_err(|_| {
            TransportError::new(TransportErrorKind::Other, "request task ended without a result")
        })?
    }
}

fn lock(active: &ActiveMap) -> std::sync::MutexGuard<'_, HashMap<TransportHandle, AbortHandle>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

/// Progress sink for one issued request
type ProgressSink<'a> = Option<(TransportHandle, &'a Sender<TransportEvent>)>;

async fn perform(
    client: &Client,
    request: RequestDescription,
    progress: ProgressSink<'_>,
    staging_dir: &Path,
) -> Result<TransportResponse, TransportError> {
    let stage_body = request.source_file().is_none() && request.method != Method::Delete;
    let url = request.url.clone();

    let builder = build(client, request, progress).await?;
    let response = builder.send().await.map_err(|e| classify(&url, e))?;
    let status = response.status().as_u16();

    if !(200..300).contains(&status) || !stage_body {
        let body = response.bytes().await.map_err(|e| classify(&url, e))?;
        tracing::debug!("{} answered {} ({} bytes)", url, status, body.len());
        return Ok(TransportResponse {
            status,
            payload: TransportPayload::Body(body.to_vec()),
        });
    }

    let total = response.content_length().unwrap_or(0);
    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| io_error("Failed to create staging dir", e))?;
    // Declared before the file so the file is closed first on every exit,
    // including the task being aborted
    let staged = StagedFile::new(staging_dir.join(format!("{}.part", Uuid::new_v4())));
    let mut file = File::create(staged.path())
        .await
        .map_err(|e| io_error("Failed to create staging file", e))?;

    let mut received: u64 = 0;
    let mut last_report: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let data = chunk.map_err(|e| classify(&url, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| io_error("Failed to write staging file", e))?;
        received += data.len() as u64;
        if received - last_report >= PROGRESS_STEP || received == total {
            last_report = received;
            report(progress, received, total);
        }
    }

    file.flush()
        .await
        .map_err(|e| io_error("Failed to flush staging file", e))?;
    drop(file);
    let staged = staged.keep();
    tracing::debug!("{} staged {} bytes at {}", url, received, staged.display());

    Ok(TransportResponse {
        status,
        payload: TransportPayload::File(staged),
    })
}

/// Download body on disk, removed when dropped unless kept
struct StagedFile {
    path: PathBuf,
    keep: bool,
}

impl StagedFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the file over to whoever receives the response
    fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn build(
    client: &Client,
    request: RequestDescription,
    progress: ProgressSink<'_>,
) -> Result<RequestBuilder, TransportError> {
    request.check_body()?;
    let method = match request.method {
        Method::Get => reqwest::Method::GET,
        Method::Put => reqwest::Method::PUT,
        Method::Post => reqwest::Method::POST,
        Method::Delete => reqwest::Method::DELETE,
    };
    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let builder = match request.body {
        RequestBody::Empty => builder,
        RequestBody::Bytes(bytes) => builder.body(bytes),
        RequestBody::File(path) => {
            let (body, _) = file_body(&path, progress).await?;
            builder.body(body)
        }
        RequestBody::Multipart(form) => {
            let mut multipart_form = multipart::Form::new();
            for (name, value) in form.fields {
                multipart_form = multipart_form.text(name, value);
            }

            let (body, size) = file_body(&form.file.path, progress).await?;
            let part = multipart::Part::stream_with_length(body, size)
                .file_name(form.file.filename)
                .mime_str(&form.file.content_type)
                .map_err(|e| {
                    TransportError::new(
                        TransportErrorKind::Malformed,
                        format!("Bad content type {}: {}", form.file.content_type, e),
                    )
                })?;
            builder.multipart(multipart_form.part(form.file.field_name, part))
        }
    };
    Ok(builder)
}

/// Streaming body over a local file that reports bytes as they are read
async fn file_body(path: &Path, progress: ProgressSink<'_>) -> Result<(Body, u64), TransportError> {
    let file = File::open(path)
        .await
        .map_err(|e| io_error("Failed to open file", e))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| io_error("Failed to get file metadata", e))?
        .len();

    let sink = progress.map(|(handle, tx)| (handle, tx.clone()));
    let sent = Arc::new(AtomicU64::new(0));
    let last_update = Arc::new(AtomicU64::new(0));

    let stream = ReaderStream::new(file).inspect(move |chunk: &Result<Bytes, std::io::Error>| {
        let (Ok(chunk), Some((handle, tx))) = (chunk, &sink) else {
            return;
        };
        let new_total = sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
        let last = last_update.load(Ordering::SeqCst);

        // Throttle updates to avoid flooding
        if new_total - last >= PROGRESS_STEP || new_total == file_size {
            last_update.store(new_total, Ordering::SeqCst);
            report(Some((*handle, tx)), new_total, file_size);
        }
    });

    Ok((Body::wrap_stream(stream), file_size))
}

fn report(progress: ProgressSink<'_>, bytes_done: u64, bytes_total: u64) {
    if let Some((handle, tx)) = progress {
        let _ = tx.try_send(TransportEvent::Progress {
            handle,
            bytes_done,
            bytes_total,
        });
    }
}

fn classify(url: &str, e: reqwest::Error) -> TransportError {
    let kind = if e.is_connect() {
        TransportErrorKind::Connect
    } else if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_builder() {
        TransportErrorKind::Malformed
    } else if e.is_body() || e.is_decode() {
        TransportErrorKind::Io
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, format!("Request to {} failed: {}", url, e))
}

fn io_error(context: &str, e: std::io::Error) -> TransportError {
    TransportError::new(TransportErrorKind::Io, format!("{}: {}", context, e))
}
