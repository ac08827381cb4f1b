// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Transfer manager
//
// Public entry point. Resolves paths and URLs, asks the factory for an
// adapter, tracks the task, hands the request to the transport and routes
// transport events back through the registry to the delegate.

use crate::adapter::AdapterFactory;
use crate::events::{ProgressReport, TransferEvents};
use crate::registry::{RestoreReport, TaskRegistry};
use crate::settings::TransferSettings;
use crate::snapshot::SnapshotStore;
use crate::task::{TaskStatus, TransferTask};
use crate::transport::{
    RequestDescription, Transport, TransportEvent, TransportHandle, TransportPayload,
    TransportResponse,
};
use crate::types::{Direction, Params, TransferError, TransportError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct TransferManager {
    settings: TransferSettings,
    registry: TaskRegistry,
    transport: Arc<dyn Transport>,
    factory: AdapterFactory,
    events: TransferEvents,
    /// Held from `issue` until the handle is bound. Event handling passes
    /// through it first, so no event is looked up before its binding exists.
    dispatch_lock: Mutex<()>,
}

impl TransferManager {
    pub fn new(
        settings: TransferSettings,
        transport: Arc<dyn Transport>,
        events: TransferEvents,
        store: Arc<dyn SnapshotStore>,
        factory: AdapterFactory,
    ) -> Result<Self, TransferError> {
        settings.validate()?;
        let registry = TaskRegistry::new(store, settings.duplicate_marker_policy);
        Ok(Self {
            settings,
            registry,
            transport,
            factory,
            events,
            dispatch_lock: Mutex::new(()),
        })
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Restore tasks left by a previous process. They come back PendingRetry
    /// and go out again on the next retry tick.
    pub fn initialize(&self) -> Result<RestoreReport, TransferError> {
        self.registry.restore_state()
    }

    /// Stop every live operation without forgetting it. The snapshot keeps
    /// the tasks, so the next `initialize` resumes them.
    pub fn shutdown(&self) {
        let handles = self.registry.detach_handles();
        tracing::info!("Shutting down with {} live transfers", handles.len());
        for handle in handles {
            self.transport.cancel(handle);
        }
    }

    /// Cancel everything and clear all state, in memory and on disk.
    /// No completions are reported.
    pub fn reset(&self) {
        for task in self.registry.current_state() {
            if let Some(handle) = task.transport_handle {
                self.transport.cancel(handle);
            }
        }
        self.registry.reset();
        tracing::info!("Transfer state reset");
    }

    /// Give every tracked task its full attempt budget back
    pub fn reset_retries(&self) {
        self.registry.reset_retries();
        tracing::info!("Retry counts reset");
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    /// Start uploading `local_path` to `remote_url`. Returns once the request
    /// is dispatched; the outcome arrives through the delegate.
    pub fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        remote_url: &str,
        marker: &str,
        params: Params,
    ) -> Result<TransferTask, TransferError> {
        let local_path = resolve_local(&self.settings.upload_dir, local_path.as_ref());
        let remote_url = self.resolve_remote(remote_url);

        let adapter = self.factory.instance_for(&remote_url)?;
        let request = adapter.upload_request(&local_path, &remote_url, &params)?;
        tracing::info!(
            "Uploading {} to {} as {} ({})",
            local_path.display(),
            remote_url,
            marker,
            adapter.kind()
        );
        self.start(Direction::Upload, &remote_url, local_path, marker, params, request)
    }

    /// Start downloading `remote_url` into `local_path`
    pub fn download_file(
        &self,
        remote_url: &str,
        local_path: impl AsRef<Path>,
        marker: &str,
        params: Params,
    ) -> Result<TransferTask, TransferError> {
        let local_path = resolve_local(&self.settings.download_dir, local_path.as_ref());
        let remote_url = self.resolve_remote(remote_url);

        let adapter = self.factory.instance_for(&remote_url)?;
        let request = adapter.build_download_request(&remote_url, &params)?;
        tracing::info!(
            "Downloading {} to {} as {} ({})",
            remote_url,
            local_path.display(),
            marker,
            adapter.kind()
        );
        self.start(Direction::Download, &remote_url, local_path, marker, params, request)
    }

    /// Delete a remote file, waiting for the response. No task is tracked.
    ///
    /// Blocks the calling thread; from async code run it on a blocking pool.
    pub fn delete_file(&self, remote_url: &str) -> Result<(), TransferError> {
        let remote_url = self.resolve_remote(remote_url);
        let adapter = self.factory.instance_for(&remote_url)?;
        adapter.delete_file(&remote_url, self.transport.as_ref())
    }

    /// Stop a transfer and report it as cancelled. Events that arrive for it
    /// afterwards are ignored.
    pub fn cancel_transfer(&self, marker: &str) -> Result<(), TransferError> {
        let task = self.registry.remove(marker)?;
        if let Some(handle) = task.transport_handle {
            self.transport.cancel(handle);
        }
        self.events.completed(marker, Err(TransferError::Cancelled));
        Ok(())
    }

    /// Issue a tracked transfer again from the start. The attempt count is
    /// left alone.
    pub fn restart_transfer(&self, marker: &str) -> Result<TransferTask, TransferError> {
        let task = self.registry.task_for_marker(marker)?;
        let request = self.build_request(&task)?;
        if let Some(handle) = task.transport_handle {
            self.registry.unbind(handle);
            self.transport.cancel(handle);
        }
        tracing::info!("Restarting {}", marker);

        match self.dispatch(marker, request) {
            Ok(task) => Ok(task),
            Err(e) => self.recover_dispatch(marker, e),
        }
    }

    /// Dispatch every task waiting for a retry, once each. Returns how many
    /// went back in flight. Concurrent callers never send the same task
    /// twice: each one has to claim a task before issuing it.
    pub fn retry_pending(&self) -> usize {
        let pending = self.registry.pending_tasks();
        if pending.is_empty() {
            return 0;
        }
        tracing::info!("Retrying {} pending transfers", pending.len());

        let mut dispatched = 0;
        for task in pending {
            let Ok(task) = self.registry.claim_retry(&task.marker) else {
                tracing::debug!("{} already taken off the retry queue", task.marker);
                continue;
            };
            let result = self
                .build_request(&task)
                .and_then(|request| self.dispatch(&task.marker, request));
            match result {
                Ok(_) => dispatched += 1,
                Err(TransferError::NotFound(_)) => {}
                // A retry that never reached the network still used its attempt
                Err(e) => self.settle_failure(&task, e),
            }
        }
        dispatched
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    /// Every tracked task in the order it was started
    pub fn current_state(&self) -> Vec<TransferTask> {
        self.registry.current_state()
    }

    /// One line naming the tasks waiting for a retry
    pub fn pending_summary(&self) -> String {
        let pending = self.registry.pending_tasks();
        if pending.is_empty() {
            return "No pending transfers".to_string();
        }
        let items: Vec<String> = pending
            .iter()
            .map(|t| format!("{} ({}, attempt {})", t.marker, t.describe_direction(), t.attempt_count))
            .collect();
        format!("{} pending: {}", pending.len(), items.join(", "))
    }

    // =========================================================================
    // Retry scheduling
    // =========================================================================

    /// Interval before the next retry tick
    pub fn retry_delay(&self) -> Duration {
        let attempt = u32::try_from(self.registry.retry_timer_count()).unwrap_or(u32::MAX);
        self.events
            .timeout_for(attempt)
            .unwrap_or_else(|| Duration::from_millis(self.settings.retry_delay_ms))
    }

    /// Called by the owner's retry timer. Counts the tick and retries what is
    /// pending; the count starts over once nothing is left to retry.
    pub fn on_retry_tick(&self) -> usize {
        if self.registry.pending_tasks().is_empty() {
            if self.registry.retry_timer_count() > 0 {
                self.registry.reset_retry_timer_count();
            }
            return 0;
        }
        let tick = self.registry.update_retry_timer_count();
        tracing::debug!("Retry tick {}", tick);
        self.retry_pending()
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    /// Route transport events until the channel closes
    pub async fn run(&self, receiver: async_channel::Receiver<TransportEvent>) {
        while let Ok(event) = receiver.recv().await {
            self.handle_event(event);
        }
        tracing::debug!("Transport event channel closed");
    }

    pub fn handle_event(&self, event: TransportEvent) {
        // Wait out any dispatch that has issued but not yet bound
        drop(self.dispatch_lock.lock().unwrap_or_else(|e| e.into_inner()));

        match event {
            TransportEvent::Progress {
                handle,
                bytes_done,
                bytes_total,
            } => match self.registry.record_progress(handle, bytes_done, bytes_total) {
                Ok(task) => self.events.progress(&ProgressReport {
                    marker: task.marker.clone(),
                    bytes_written: bytes_done,
                    bytes_total,
                    percent: task.percent_complete(),
                }),
                Err(_) => tracing::trace!("Progress for unknown handle {}", handle),
            },
            TransportEvent::Completed { handle, response } => self.on_completed(handle, response),
            TransportEvent::Failed { handle, error } => match self.registry.unbind(handle) {
                Some(marker) => self.fail_attempt(&marker, error.into()),
                None => tracing::debug!("Ignoring failure for unknown handle {}", handle),
            },
        }
    }

    fn on_completed(&self, handle: TransportHandle, response: TransportResponse) {
        let task = match self.registry.task_for_handle(handle) {
            Ok(task) => task,
            Err(_) => {
                tracing::debug!("Ignoring completion for unknown handle {}", handle);
                discard_staged(&response.payload);
                return;
            }
        };

        if !response.is_success() {
            discard_staged(&response.payload);
            self.registry.unbind(handle);
            let error = TransportError::status(
                response.status,
                format!("{} returned HTTP {}", task.remote_url, response.status),
            );
            self.fail_attempt(&task.marker, error.into());
            return;
        }

        let result = match task.direction {
            Direction::Upload => Ok(()),
            Direction::Download => self.place_download(&task, response.payload),
        };

        // Removal decides the race with cancel_transfer
        if self.registry.remove(&task.marker).is_ok() {
            self.events.completed(&task.marker, result);
        }
    }

    fn place_download(
        &self,
        task: &TransferTask,
        payload: TransportPayload,
    ) -> Result<(), TransferError> {
        self.registry
            .update_status(&task.marker, TaskStatus::DownloadFileReady)?;
        let destination = &task.local_file_path;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        match payload {
            TransportPayload::File(staged) => move_file(&staged, destination),
            TransportPayload::Body(bytes) => fs::write(destination, bytes).map_err(|e| {
                TransferError::FileSystem(format!("cannot write {}: {}", destination.display(), e))
            }),
        }?;
        tracing::debug!("Download {} placed at {}", task.marker, destination.display());
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn start(
        &self,
        direction: Direction,
        remote_url: &str,
        local_path: PathBuf,
        marker: &str,
        params: Params,
        request: RequestDescription,
    ) -> Result<TransferTask, TransferError> {
        let tracked = self
            .registry
            .track(direction, remote_url, local_path, marker, params)?;
        if let Some(old) = tracked.superseded {
            tracing::info!("Transfer {} superseded", old.marker);
            if let Some(handle) = old.transport_handle {
                self.transport.cancel(handle);
            }
            self.events.completed(&old.marker, Err(TransferError::Cancelled));
        }

        match self.dispatch(marker, self.prepare(request)) {
            Ok(task) => Ok(task),
            Err(e) => self.recover_dispatch(marker, e),
        }
    }

    fn prepare(&self, mut request: RequestDescription) -> RequestDescription {
        request.background = !self.settings.foreground_transfer_only;
        request
    }

    fn build_request(&self, task: &TransferTask) -> Result<RequestDescription, TransferError> {
        let adapter = self.factory.instance_for(&task.remote_url)?;
        let request = match task.direction {
            Direction::Upload => {
                adapter.upload_request(&task.local_file_path, &task.remote_url, &task.params)?
            }
            Direction::Download => adapter.build_download_request(&task.remote_url, &task.params)?,
        };
        Ok(self.prepare(request))
    }

    /// Issue and bind under the dispatch lock. An operation the task was
    /// still bound to is cancelled.
    fn dispatch(
        &self,
        marker: &str,
        request: RequestDescription,
    ) -> Result<TransferTask, TransferError> {
        let _guard = self.dispatch_lock.lock().unwrap_or_else(|e| e.into_inner());
        let handle = self.transport.issue(request)?;
        match self.registry.begin_attempt(marker, handle) {
            Ok(attempt) => {
                if let Some(old) = attempt.replaced {
                    tracing::debug!("{} moved off {}", marker, old);
                    self.transport.cancel(old);
                }
                tracing::debug!("{} dispatched on {}", marker, handle);
                Ok(attempt.task)
            }
            Err(e) => {
                // Cancelled while the request was being issued
                self.transport.cancel(handle);
                Err(e)
            }
        }
    }

    /// A first dispatch or restart the transport refused. Retryable refusals
    /// park the task; anything else drops it and goes back to the caller.
    fn recover_dispatch(
        &self,
        marker: &str,
        error: TransferError,
    ) -> Result<TransferTask, TransferError> {
        if let TransferError::NotFound(_) = error {
            return Err(error);
        }
        let task = self.registry.task_for_marker(marker)?;
        if error.is_retryable() && task.attempt_count < self.settings.max_attempts {
            let task = self.registry.queue_for_retry(marker)?;
            self.events.retrying(marker, task.attempt_count + 1, &error);
            return Ok(task);
        }
        let _ = self.registry.remove(marker);
        Err(error)
    }

    fn fail_attempt(&self, marker: &str, error: TransferError) {
        match self.registry.task_for_marker(marker) {
            Ok(task) => self.settle_failure(&task, error),
            Err(_) => tracing::debug!("{} went away before its failure was handled", marker),
        }
    }

    /// Queue for another attempt or give up and report
    fn settle_failure(&self, task: &TransferTask, error: TransferError) {
        let marker = task.marker.as_str();
        if error.is_retryable() && task.attempt_count < self.settings.max_attempts {
            if self.registry.queue_for_retry(marker).is_ok() {
                self.events.retrying(marker, task.attempt_count + 1, &error);
            }
            return;
        }

        if self.registry.update_status(marker, TaskStatus::Failed).is_err() {
            return;
        }
        if self.registry.remove(marker).is_ok() {
            self.events.completed(marker, Err(error));
        }
    }

    fn resolve_remote(&self, remote_url: &str) -> String {
        if url::Url::parse(remote_url).is_ok() {
            return remote_url.to_string();
        }
        match &self.settings.remote_url_base {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                remote_url.trim_start_matches('/')
            ),
            None => remote_url.to_string(),
        }
    }
}

fn resolve_local(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Rename, or copy and delete when the rename crosses filesystems
fn move_file(from: &Path, to: &Path) -> Result<(), TransferError> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| {
        TransferError::FileSystem(format!(
            "cannot move {} to {}: {}",
            from.display(),
            to.display(),
            e
        ))
    })?;
    if let Err(e) = fs::remove_file(from) {
        tracing::warn!("Could not remove staged file {}: {}", from.display(), e);
    }
    Ok(())
}

fn discard_staged(payload: &TransportPayload) {
    if let TransportPayload::File(staged) = payload {
        let _ = fs::remove_file(staged);
    }
}
