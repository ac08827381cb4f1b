// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Task registry
//
// Owns marker -> task, handle -> marker and the retry queue. All of it lives
// behind one mutex. Structural changes are written through to the snapshot
// store on a separate lane so that disk latency never holds the state lock.

use crate::settings::DuplicateMarkerPolicy;
use crate::snapshot::{PersistedState, SnapshotStore, SNAPSHOT_VERSION};
use crate::task::{TaskStatus, TransferTask};
use crate::transport::TransportHandle;
use crate::types::{Direction, Params, SnapshotError, TransferError};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// Result of [`TaskRegistry::track`]
#[derive(Debug, Clone)]
pub struct Tracked {
    pub task: TransferTask,
    /// Task displaced under [`DuplicateMarkerPolicy::Supersede`]; its
    /// transport operation, if any, is now unbound and should be cancelled
    pub superseded: Option<TransferTask>,
}

/// Result of [`TaskRegistry::begin_attempt`]
#[derive(Debug, Clone)]
pub struct Attempt {
    pub task: TransferTask,
    /// Handle the task was bound to before; its operation must be stopped
    pub replaced: Option<TransportHandle>,
}

/// Outcome of [`TaskRegistry::restore_state`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    /// Records that were malformed or duplicated
    pub skipped: usize,
    /// Terminal records left over from an interrupted write
    pub dropped_terminal: usize,
    /// Tasks that were in flight when the previous process stopped
    pub reclassified: usize,
    /// The whole snapshot was unreadable and was set aside
    pub quarantined: bool,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, TransferTask>,
    /// Markers in insertion order
    order: Vec<String>,
    handles: HashMap<TransportHandle, String>,
    retry_queue: VecDeque<String>,
    retry_timer_count: u64,
    generation: u64,
}

impl RegistryState {
    fn task_mut(&mut self, marker: &str) -> Result<&mut TransferTask, TransferError> {
        self.tasks
            .get_mut(marker)
            .ok_or_else(|| TransferError::NotFound(format!("no task with marker {}", marker)))
    }

    fn insert(&mut self, task: TransferTask) {
        self.order.push(task.marker.clone());
        self.tasks.insert(task.marker.clone(), task);
    }

    fn drop_task(&mut self, marker: &str) -> Option<TransferTask> {
        let task = self.tasks.remove(marker)?;
        self.order.retain(|m| m != marker);
        self.retry_queue.retain(|m| m != marker);
        if let Some(handle) = task.transport_handle {
            self.handles.remove(&handle);
        }
        Some(task)
    }

    /// Point `handle` at `marker`, dropping whatever either side was bound
    /// to. Returns the task's previous handle.
    fn bind(
        &mut self,
        marker: &str,
        handle: TransportHandle,
    ) -> Result<Option<TransportHandle>, TransferError> {
        let previous = self
            .task_mut(marker)?
            .transport_handle
            .replace(handle)
            .filter(|old| *old != handle);
        if let Some(old) = previous {
            self.handles.remove(&old);
        }
        if let Some(other) = self.handles.insert(handle, marker.to_string()) {
            if other != marker {
                tracing::warn!("Handle {} moved from {} to {}", handle, other, marker);
                if let Some(task) = self.tasks.get_mut(&other) {
                    task.transport_handle = None;
                }
            }
        }
        Ok(previous)
    }

    fn unbind_marker(&mut self, marker: &str) {
        if let Some(task) = self.tasks.get_mut(marker) {
            if let Some(handle) = task.transport_handle.take() {
                self.handles.remove(&handle);
            }
        }
    }

    fn ordered(&self) -> Vec<TransferTask> {
        self.order
            .iter()
            .filter_map(|m| self.tasks.get(m).cloned())
            .collect()
    }

    fn persisted(&self) -> PersistedState {
        let tasks = self
            .order
            .iter()
            .filter_map(|m| self.tasks.get(m))
            .filter_map(|task| match task.to_snapshot() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!("Not persisting task {}: {}", task.marker, e);
                    None
                }
            })
            .collect();

        PersistedState {
            version: SNAPSHOT_VERSION,
            retry_timer_count: self.retry_timer_count,
            tasks,
        }
    }
}

/// Shared registry of tracked transfers
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    store: Arc<dyn SnapshotStore>,
    policy: DuplicateMarkerPolicy,
    /// Generation of the last snapshot written; serializes store writes
    persist_lane: Mutex<u64>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, policy: DuplicateMarkerPolicy) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            store,
            policy,
            persist_lane: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a durable change, then write the resulting state outside the lock
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut RegistryState) -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        let (result, generation, snapshot) = {
            let mut state = self.lock();
            let result = f(&mut state)?;
            state.generation += 1;
            (result, state.generation, state.persisted())
        };
        self.persist(generation, snapshot);
        Ok(result)
    }

    fn persist(&self, generation: u64, snapshot: PersistedState) {
        let mut written = self.persist_lane.lock().unwrap_or_else(|e| e.into_inner());
        if generation <= *written {
            // A newer state already reached the store
            return;
        }
        match self.store.save(&snapshot) {
            Ok(()) => *written = generation,
            Err(e) => tracing::error!("Failed to persist transfer state: {}", e),
        }
    }

    /// Start tracking a transfer at attempt 0, InProgress, with no handle
    pub fn track(
        &self,
        direction: Direction,
        remote_url: &str,
        local_path: impl Into<PathBuf>,
        marker: &str,
        params: Params,
    ) -> Result<Tracked, TransferError> {
        let task = TransferTask::new(direction, remote_url, local_path, marker, params);
        let policy = self.policy;

        self.mutate(move |state| {
            let superseded = if state.tasks.contains_key(marker) {
                match policy {
                    DuplicateMarkerPolicy::Reject => {
                        return Err(TransferError::DuplicateMarker(marker.to_string()));
                    }
                    DuplicateMarkerPolicy::Supersede => state.drop_task(marker),
                }
            } else {
                None
            };

            state.insert(task.clone());
            tracing::debug!("Tracking {} {}", direction, marker);
            Ok(Tracked { task, superseded })
        })
    }

    /// Record the transport operation currently serving `marker`. Returns
    /// the handle it displaced, if any.
    pub fn bind(
        &self,
        marker: &str,
        handle: TransportHandle,
    ) -> Result<Option<TransportHandle>, TransferError> {
        self.lock().bind(marker, handle)
    }

    /// Forget a handle; the task's status is left for the caller to set.
    /// Returns the marker it belonged to.
    pub fn unbind(&self, handle: TransportHandle) -> Option<String> {
        let mut state = self.lock();
        let marker = state.handles.remove(&handle)?;
        if let Some(task) = state.tasks.get_mut(&marker) {
            if task.transport_handle == Some(handle) {
                task.transport_handle = None;
            }
        }
        Some(marker)
    }

    pub fn task_for_handle(&self, handle: TransportHandle) -> Result<TransferTask, TransferError> {
        let state = self.lock();
        state
            .handles
            .get(&handle)
            .and_then(|marker| state.tasks.get(marker))
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("no task for handle {}", handle)))
    }

    pub fn task_for_marker(&self, marker: &str) -> Result<TransferTask, TransferError> {
        self.lock()
            .tasks
            .get(marker)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("no task with marker {}", marker)))
    }

    /// Park a task until the next retry dispatch. Queuing twice keeps one entry.
    pub fn queue_for_retry(&self, marker: &str) -> Result<TransferTask, TransferError> {
        self.mutate(|state| {
            state.unbind_marker(marker);
            let task = state.task_mut(marker)?;
            task.status = TaskStatus::PendingRetry;
            let task = task.clone();
            if !state.retry_queue.iter().any(|m| m == marker) {
                state.retry_queue.push_back(marker.to_string());
            }
            Ok(task)
        })
    }

    /// Take a PendingRetry task for one retry: off the queue, InProgress and
    /// one attempt more. Fails with NotFound when the task is gone or someone
    /// else already claimed it.
    pub fn claim_retry(&self, marker: &str) -> Result<TransferTask, TransferError> {
        self.mutate(|state| {
            let task = state.task_mut(marker)?;
            if task.status != TaskStatus::PendingRetry {
                return Err(TransferError::NotFound(format!(
                    "{} is not waiting for a retry",
                    marker
                )));
            }
            task.status = TaskStatus::InProgress;
            task.attempt_count += 1;
            let task = task.clone();
            state.retry_queue.retain(|m| m != marker);
            Ok(task)
        })
    }

    /// Move a task to InProgress on a fresh handle and take it off the retry
    /// queue. The attempt count is left alone.
    pub fn begin_attempt(
        &self,
        marker: &str,
        handle: TransportHandle,
    ) -> Result<Attempt, TransferError> {
        self.mutate(|state| {
            let replaced = state.bind(marker, handle)?;
            state.retry_queue.retain(|m| m != marker);
            let task = state.task_mut(marker)?;
            task.status = TaskStatus::InProgress;
            task.bytes = Default::default();
            Ok(Attempt {
                task: task.clone(),
                replaced,
            })
        })
    }

    pub fn update_status(&self, marker: &str, status: TaskStatus) -> Result<(), TransferError> {
        self.mutate(|state| {
            state.task_mut(marker)?.status = status;
            match status {
                TaskStatus::PendingRetry => {
                    state.unbind_marker(marker);
                    if !state.retry_queue.iter().any(|m| m == marker) {
                        state.retry_queue.push_back(marker.to_string());
                    }
                }
                _ => state.retry_queue.retain(|m| m != marker),
            }
            Ok(())
        })
    }

    pub fn update_local_file_path(
        &self,
        marker: &str,
        local_file_path: impl Into<PathBuf>,
    ) -> Result<(), TransferError> {
        let local_file_path = local_file_path.into();
        self.mutate(|state| {
            state.task_mut(marker)?.local_file_path = local_file_path;
            Ok(())
        })
    }

    /// Byte counters from the transport. Kept in memory only.
    pub fn record_progress(
        &self,
        handle: TransportHandle,
        bytes_done: u64,
        bytes_total: u64,
    ) -> Result<TransferTask, TransferError> {
        let mut state = self.lock();
        let marker = state
            .handles
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(format!("no task for handle {}", handle)))?;
        let task = state.task_mut(&marker)?;
        match task.direction {
            Direction::Upload => {
                task.bytes.bytes_sent = bytes_done;
                task.bytes.bytes_expected_to_send = bytes_total;
            }
            Direction::Download => {
                task.bytes.bytes_received = bytes_done;
                task.bytes.bytes_expected_to_receive = bytes_total;
            }
        }
        Ok(task.clone())
    }

    /// Drop a task from every map and the retry queue
    pub fn remove(&self, marker: &str) -> Result<TransferTask, TransferError> {
        self.mutate(|state| {
            state
                .drop_task(marker)
                .ok_or_else(|| TransferError::NotFound(format!("no task with marker {}", marker)))
        })
    }

    /// Every tracked task in insertion order
    pub fn current_state(&self) -> Vec<TransferTask> {
        self.lock().ordered()
    }

    /// Tasks waiting for a retry, in queue order
    pub fn pending_tasks(&self) -> Vec<TransferTask> {
        let state = self.lock();
        state
            .retry_queue
            .iter()
            .filter_map(|m| state.tasks.get(m))
            .filter(|t| t.status == TaskStatus::PendingRetry)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unbind every live handle, returning them so their operations can be
    /// stopped. Tasks keep their status and resume after a restart.
    pub fn detach_handles(&self) -> Vec<TransportHandle> {
        let result = self.mutate(|state| {
            let handles: Vec<TransportHandle> = state.handles.keys().copied().collect();
            state.handles.clear();
            for task in state.tasks.values_mut() {
                task.transport_handle = None;
            }
            Ok(handles)
        });
        result.unwrap_or_default()
    }

    /// Load the last snapshot, replacing in-memory state.
    ///
    /// Nothing that was in flight survived the previous process, so
    /// InProgress and DownloadFileReady tasks come back as PendingRetry.
    /// Terminal and malformed records are skipped.
    ///
    /// A snapshot that cannot be parsed, or that a newer build wrote, is
    /// moved aside and the registry starts empty.
    pub fn restore_state(&self) -> Result<RestoreReport, TransferError> {
        let persisted = match self.store.load() {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return Ok(RestoreReport::default()),
            Err(e @ (SnapshotError::Malformed(_) | SnapshotError::UnsupportedVersion(_))) => {
                tracing::error!("Discarding unreadable snapshot: {}", e);
                let generation = {
                    let mut state = self.lock();
                    let generation = state.generation + 1;
                    *state = RegistryState {
                        generation,
                        ..Default::default()
                    };
                    generation
                };
                let mut written = self.persist_lane.lock().unwrap_or_else(|e| e.into_inner());
                self.store.quarantine()?;
                *written = generation;
                return Ok(RestoreReport {
                    quarantined: true,
                    ..Default::default()
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut report = RestoreReport::default();
        let mut restored = RegistryState {
            retry_timer_count: persisted.retry_timer_count,
            ..Default::default()
        };

        for record in &persisted.tasks {
            let mut task = match TransferTask::from_snapshot(record) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!("Skipping unreadable task record: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };

            if task.status.is_terminal() {
                report.dropped_terminal += 1;
                continue;
            }
            if restored.tasks.contains_key(&task.marker) {
                tracing::warn!("Skipping duplicate record for {}", task.marker);
                report.skipped += 1;
                continue;
            }

            if task.status != TaskStatus::PendingRetry {
                task.status = TaskStatus::PendingRetry;
                report.reclassified += 1;
            }
            restored.retry_queue.push_back(task.marker.clone());
            restored.insert(task);
            report.restored += 1;
        }

        let generation = {
            let mut state = self.lock();
            restored.generation = state.generation + 1;
            *state = restored;
            state.generation
        };
        tracing::info!(
            "Restored {} transfers ({} skipped, {} reclassified)",
            report.restored,
            report.skipped,
            report.reclassified
        );

        // Rewrite so the store no longer holds what was skipped
        if report.skipped > 0 || report.dropped_terminal > 0 || report.reclassified > 0 {
            let snapshot = self.lock().persisted();
            self.persist(generation, snapshot);
        }
        Ok(report)
    }

    /// Forget retry history: attempts back to 0 and the tick count cleared
    pub fn reset_retries(&self) {
        let _ = self.mutate(|state| {
            for task in state.tasks.values_mut() {
                task.attempt_count = 0;
            }
            state.retry_timer_count = 0;
            Ok(())
        });
    }

    /// Drop all state, in memory and in the store
    pub fn reset(&self) {
        let generation = {
            let mut state = self.lock();
            let generation = state.generation + 1;
            *state = RegistryState {
                generation,
                ..Default::default()
            };
            generation
        };
        let mut written = self.persist_lane.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.store.clear() {
            tracing::error!("Failed to clear transfer state: {}", e);
        }
        *written = generation;
    }

    /// Ticks of the caller's retry timer, persisted alongside the tasks
    pub fn retry_timer_count(&self) -> u64 {
        self.lock().retry_timer_count
    }

    pub fn update_retry_timer_count(&self) -> u64 {
        self.mutate(|state| {
            state.retry_timer_count += 1;
            Ok(state.retry_timer_count)
        })
        .unwrap_or_default()
    }

    pub fn reset_retry_timer_count(&self) {
        let _ = self.mutate(|state| {
            state.retry_timer_count = 0;
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MemorySnapshotStore;
    use serde_json::json;

    fn registry() -> (TaskRegistry, Arc<MemorySnapshotStore>) {
        let store = Arc::new(MemorySnapshotStore::new());
        (
            TaskRegistry::new(store.clone(), DuplicateMarkerPolicy::Reject),
            store,
        )
    }

    fn track(reg: &TaskRegistry, marker: &str) -> TransferTask {
        reg.track(
            Direction::Upload,
            "https://host/upload",
            format!("/tmp/{marker}.bin"),
            marker,
            Params::new(),
        )
        .unwrap()
        .task
    }

    fn markers(tasks: &[TransferTask]) -> Vec<&str> {
        tasks.iter().map(|t| t.marker.as_str()).collect()
    }

    #[test]
    fn test_track_creates_in_progress_task() {
        let (reg, store) = registry();
        let task = track(&reg, "m1");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.transport_handle, None);
        assert_eq!(store.saved().unwrap().tasks.len(), 1);
    }

    #[test]
    fn test_current_state_tracks_live_set_in_insertion_order() {
        let (reg, _) = registry();
        for m in ["a", "b", "c", "d"] {
            track(&reg, m);
        }
        reg.remove("b").unwrap();
        track(&reg, "e");
        reg.remove("a").unwrap();
        assert_eq!(markers(&reg.current_state()), vec!["c", "d", "e"]);

        // Re-adding a removed marker puts it at the end
        track(&reg, "a");
        assert_eq!(markers(&reg.current_state()), vec!["c", "d", "e", "a"]);
    }

    #[test]
    fn test_duplicate_marker_rejected_without_mutation() {
        let (reg, store) = registry();
        track(&reg, "m1");
        reg.bind("m1", TransportHandle::new(1)).unwrap();
        let saves = store.save_count();

        let err = reg
            .track(Direction::Download, "https://other", "/x", "m1", Params::new())
            .unwrap_err();
        assert_eq!(err, TransferError::DuplicateMarker("m1".into()));

        let task = reg.task_for_marker("m1").unwrap();
        assert_eq!(task.direction, Direction::Upload);
        assert_eq!(task.transport_handle, Some(TransportHandle::new(1)));
        assert_eq!(reg.len(), 1);
        assert_eq!(store.save_count(), saves);
    }

    #[test]
    fn test_duplicate_marker_supersedes_when_configured() {
        let store = Arc::new(MemorySnapshotStore::new());
        let reg = TaskRegistry::new(store, DuplicateMarkerPolicy::Supersede);
        track(&reg, "m1");
        reg.bind("m1", TransportHandle::new(5)).unwrap();

        let tracked = reg
            .track(Direction::Download, "https://other", "/x", "m1", Params::new())
            .unwrap();
        let old = tracked.superseded.unwrap();
        assert_eq!(old.transport_handle, Some(TransportHandle::new(5)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.task_for_marker("m1").unwrap().direction, Direction::Download);
        assert!(reg.task_for_handle(TransportHandle::new(5)).is_err());
    }

    #[test]
    fn test_bind_and_lookup() {
        let (reg, _) = registry();
        track(&reg, "m1");
        reg.bind("m1", TransportHandle::new(10)).unwrap();
        assert_eq!(reg.task_for_handle(TransportHandle::new(10)).unwrap().marker, "m1");

        // Rebinding replaces the old handle
        assert_eq!(
            reg.bind("m1", TransportHandle::new(11)).unwrap(),
            Some(TransportHandle::new(10))
        );
        assert!(matches!(
            reg.task_for_handle(TransportHandle::new(10)),
            Err(TransferError::NotFound(_))
        ));

        assert_eq!(reg.unbind(TransportHandle::new(11)), Some("m1".into()));
        assert_eq!(reg.task_for_marker("m1").unwrap().transport_handle, None);
        assert!(matches!(
            reg.task_for_marker("nope"),
            Err(TransferError::NotFound(_))
        ));
        assert!(reg.bind("nope", TransportHandle::new(1)).is_err());
    }

    #[test]
    fn test_queue_for_retry_is_idempotent() {
        let (reg, _) = registry();
        track(&reg, "m1");
        reg.bind("m1", TransportHandle::new(1)).unwrap();

        reg.queue_for_retry("m1").unwrap();
        let task = reg.queue_for_retry("m1").unwrap();
        assert_eq!(task.status, TaskStatus::PendingRetry);
        assert_eq!(task.transport_handle, None);
        assert_eq!(reg.pending_tasks().len(), 1);
        assert!(reg.task_for_handle(TransportHandle::new(1)).is_err());
    }

    #[test]
    fn test_claim_retry_counts_once() {
        let (reg, _) = registry();
        track(&reg, "m1");
        reg.queue_for_retry("m1").unwrap();

        let task = reg.claim_retry("m1").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.attempt_count, 1);
        assert!(reg.pending_tasks().is_empty());

        // Already claimed
        assert!(matches!(reg.claim_retry("m1"), Err(TransferError::NotFound(_))));
        assert!(matches!(reg.claim_retry("nope"), Err(TransferError::NotFound(_))));
        assert_eq!(reg.task_for_marker("m1").unwrap().attempt_count, 1);

        let attempt = reg.begin_attempt("m1", TransportHandle::new(2)).unwrap();
        assert_eq!(attempt.task.attempt_count, 1);
        assert_eq!(attempt.replaced, None);

        // A restart on a new handle reports the one it replaced
        let attempt = reg.begin_attempt("m1", TransportHandle::new(3)).unwrap();
        assert_eq!(attempt.task.attempt_count, 1);
        assert_eq!(attempt.replaced, Some(TransportHandle::new(2)));
        assert!(reg.task_for_handle(TransportHandle::new(2)).is_err());
    }

    #[test]
    fn test_concurrent_claims_take_a_task_once() {
        use std::thread;

        let (reg, _) = registry();
        for i in 0..20 {
            let marker = format!("m{i}");
            track(&reg, &marker);
            reg.queue_for_retry(&marker).unwrap();
        }
        let reg = Arc::new(reg);

        let claimed: usize = (0..4)
            .map(|_| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    (0..20)
                        .filter(|i| reg.claim_retry(&format!("m{i}")).is_ok())
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .sum();

        assert_eq!(claimed, 20);
        assert!(reg.current_state().iter().all(|t| t.attempt_count == 1));
    }

    #[test]
    fn test_remove_clears_every_map() {
        let (reg, _) = registry();
        track(&reg, "m1");
        reg.bind("m1", TransportHandle::new(7)).unwrap();
        reg.queue_for_retry("m1").unwrap();
        reg.bind("m1", TransportHandle::new(8)).unwrap();

        reg.remove("m1").unwrap();
        assert!(reg.task_for_handle(TransportHandle::new(8)).is_err());
        assert!(reg.pending_tasks().is_empty());
        assert!(reg.is_empty());
        assert!(matches!(reg.remove("m1"), Err(TransferError::NotFound(_))));
    }

    #[test]
    fn test_progress_updates_counters_in_memory_only() {
        let (reg, store) = registry();
        track(&reg, "m1");
        reg.bind("m1", TransportHandle::new(1)).unwrap();
        let saves = store.save_count();

        let task = reg.record_progress(TransportHandle::new(1), 50, 200).unwrap();
        assert_eq!(task.percent_complete(), 25);
        assert_eq!(store.save_count(), saves);
        assert!(reg.record_progress(TransportHandle::new(99), 1, 2).is_err());
    }

    #[test]
    fn test_mutations_write_through() {
        let (reg, store) = registry();
        track(&reg, "m1");
        reg.update_local_file_path("m1", "/tmp/moved.bin").unwrap();
        reg.update_status("m1", TaskStatus::PendingRetry).unwrap();

        let saved = store.saved().unwrap();
        let restored = TransferTask::from_snapshot(&saved.tasks[0]).unwrap();
        assert_eq!(restored.local_file_path, PathBuf::from("/tmp/moved.bin"));
        assert_eq!(restored.status, TaskStatus::PendingRetry);
        assert_eq!(reg.pending_tasks().len(), 1);
    }

    #[test]
    fn test_restore_reclassifies_in_flight_tasks() {
        let (reg, store) = registry();
        for m in ["running", "waiting", "done", "failed", "staged"] {
            track(&reg, m);
        }
        reg.bind("running", TransportHandle::new(1)).unwrap();
        reg.queue_for_retry("waiting").unwrap();
        reg.update_status("done", TaskStatus::Complete).unwrap();
        reg.update_status("failed", TaskStatus::Failed).unwrap();
        reg.update_status("staged", TaskStatus::DownloadFileReady).unwrap();
        reg.update_retry_timer_count();
        reg.update_retry_timer_count();

        // A new process over the same store
        let fresh = TaskRegistry::new(store.clone(), DuplicateMarkerPolicy::Reject);
        let report = fresh.restore_state().unwrap();
        assert_eq!(report.restored, 3);
        assert_eq!(report.dropped_terminal, 2);
        assert_eq!(report.reclassified, 2);

        let state = fresh.current_state();
        assert_eq!(markers(&state), vec!["running", "waiting", "staged"]);
        assert!(state.iter().all(|t| t.status == TaskStatus::PendingRetry));
        assert!(state.iter().all(|t| t.transport_handle.is_none()));
        assert_eq!(fresh.pending_tasks().len(), 3);
        assert_eq!(fresh.retry_timer_count(), 2);
        assert!(fresh.task_for_handle(TransportHandle::new(1)).is_err());

        // The store was rewritten without the terminal records
        assert_eq!(store.saved().unwrap().tasks.len(), 3);
    }

    #[test]
    fn test_restore_skips_bad_records() {
        let good = TransferTask::new(
            Direction::Download,
            "https://host/f",
            "/tmp/f",
            "good",
            Params::new(),
        );
        let state = PersistedState {
            version: SNAPSHOT_VERSION,
            retry_timer_count: 0,
            tasks: vec![
                json!({"marker": "broken"}),
                good.to_snapshot().unwrap(),
                json!(42),
                good.to_snapshot().unwrap(),
            ],
        };
        let store = Arc::new(MemorySnapshotStore::with_state(state));
        let reg = TaskRegistry::new(store, DuplicateMarkerPolicy::Reject);

        let report = reg.restore_state().unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.skipped, 3);
        assert_eq!(reg.task_for_marker("good").unwrap().status, TaskStatus::PendingRetry);
    }

    #[test]
    fn test_restore_sets_aside_unreadable_snapshot() {
        use crate::snapshot::FileSnapshotStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfers.json");
        let bad = r#"{"version":1,"retryTimerCount":0,"tasks":{"oops":1}}"#;
        std::fs::write(&path, bad).unwrap();

        let store = Arc::new(FileSnapshotStore::new(&path));
        let reg = TaskRegistry::new(store.clone(), DuplicateMarkerPolicy::Reject);
        let report = reg.restore_state().unwrap();
        assert!(report.quarantined);
        assert_eq!(report.restored, 0);
        assert!(reg.is_empty());
        assert_eq!(std::fs::read_to_string(store.quarantine_path()).unwrap(), bad);
        assert!(!path.exists());

        // Work continues on a fresh snapshot
        track(&reg, "m1");
        assert_eq!(store.load().unwrap().unwrap().tasks.len(), 1);
    }

    #[test]
    fn test_restore_with_empty_store() {
        let (reg, _) = registry();
        assert_eq!(reg.restore_state().unwrap(), RestoreReport::default());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reset_retries_and_reset() {
        let (reg, store) = registry();
        track(&reg, "m1");
        reg.queue_for_retry("m1").unwrap();
        reg.claim_retry("m1").unwrap();
        reg.begin_attempt("m1", TransportHandle::new(1)).unwrap();
        reg.update_retry_timer_count();

        reg.reset_retries();
        assert_eq!(reg.task_for_marker("m1").unwrap().attempt_count, 0);
        assert_eq!(reg.retry_timer_count(), 0);

        reg.reset();
        assert!(reg.is_empty());
        assert!(store.saved().is_none());
        assert!(reg.task_for_handle(TransportHandle::new(1)).is_err());
    }

    #[test]
    fn test_detach_handles() {
        let (reg, _) = registry();
        track(&reg, "a");
        track(&reg, "b");
        reg.bind("a", TransportHandle::new(1)).unwrap();
        reg.bind("b", TransportHandle::new(2)).unwrap();

        let mut handles = reg.detach_handles();
        handles.sort();
        assert_eq!(handles, vec![TransportHandle::new(1), TransportHandle::new(2)]);
        assert!(reg.current_state().iter().all(|t| t.transport_handle.is_none()));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_concurrent_mutation_keeps_maps_consistent() {
        use std::thread;

        let (reg, _) = registry();
        let reg = Arc::new(reg);
        let mut threads = Vec::new();
        for i in 0..8u64 {
            let reg = Arc::clone(&reg);
            threads.push(thread::spawn(move || {
                for j in 0..25u64 {
                    let marker = format!("t{i}-{j}");
                    let handle = TransportHandle::new(i * 1000 + j);
                    reg.track(Direction::Upload, "https://h/u", "/tmp/x", &marker, Params::new())
                        .unwrap();
                    reg.bind(&marker, handle).unwrap();
                    reg.record_progress(handle, j, 25).unwrap();
                    if j % 2 == 0 {
                        reg.remove(&marker).unwrap();
                    } else {
                        reg.queue_for_retry(&marker).unwrap();
                    }
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(reg.len(), 8 * 12);
        assert_eq!(reg.pending_tasks().len(), 8 * 12);
        assert!(reg.current_state().iter().all(|t| t.transport_handle.is_none()));
    }
}
