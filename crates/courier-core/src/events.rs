// SPDX-License-Identifier: AGPL-3.0
// Courier Core - Delegate notifications
//
// The manager reports to its owner through TransferEvents: a required
// completion hook plus optional progress, retry and backoff hooks. Hooks run
// on whatever thread delivered the transport event.

use crate::types::TransferError;
use async_channel::{Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type CompletedFn = dyn Fn(&str, Result<(), TransferError>) + Send + Sync;
type ProgressFn = dyn Fn(&ProgressReport) + Send + Sync;
type RetryingFn = dyn Fn(&str, u32, &TransferError) + Send + Sync;
type RetryTimeoutFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Progress of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub marker: String,
    pub bytes_written: u64,
    pub bytes_total: u64,
    pub percent: u8,
}

/// Event form of the delegate hooks, for [`TransferEvents::channel`]
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(ProgressReport),
    Retrying {
        marker: String,
        attempt: u32,
        error: TransferError,
    },
    Completed {
        marker: String,
        result: Result<(), TransferError>,
    },
}

/// Delegate hooks
#[derive(Clone)]
pub struct TransferEvents {
    on_completed: Arc<CompletedFn>,
    on_progress: Option<Arc<ProgressFn>>,
    on_retrying: Option<Arc<RetryingFn>>,
    retry_timeout: Option<Arc<RetryTimeoutFn>>,
}

impl TransferEvents {
    /// `on_completed` fires exactly once per asynchronous transfer
    pub fn new(
        on_completed: impl Fn(&str, Result<(), TransferError>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_completed: Arc::new(on_completed),
            on_progress: None,
            on_retrying: None,
            retry_timeout: None,
        }
    }

    pub fn on_progress(mut self, f: impl Fn(&ProgressReport) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }

    pub fn on_retrying(
        mut self,
        f: impl Fn(&str, u32, &TransferError) + Send + Sync + 'static,
    ) -> Self {
        self.on_retrying = Some(Arc::new(f));
        self
    }

    /// Backoff curve: delay before the retry tick that follows `attempt`
    pub fn retry_timeout(mut self, f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.retry_timeout = Some(Arc::new(f));
        self
    }

    /// Hooks that forward everything into an unbounded channel
    pub fn channel() -> (Self, Receiver<TransferEvent>) {
        let (tx, rx) = async_channel::unbounded::<TransferEvent>();

        let completed_tx = tx.clone();
        let progress_tx = tx.clone();
        let events = Self::new(move |marker, result| {
            send(
                &completed_tx,
                TransferEvent::Completed {
                    marker: marker.to_string(),
                    result,
                },
            )
        })
        .on_progress(move |report| send(&progress_tx, TransferEvent::Progress(report.clone())))
        .on_retrying(move |marker, attempt, error| {
            send(
                &tx,
                TransferEvent::Retrying {
                    marker: marker.to_string(),
                    attempt,
                    error: error.clone(),
                },
            )
        });

        (events, rx)
    }

    pub(crate) fn completed(&self, marker: &str, result: Result<(), TransferError>) {
        match &result {
            Ok(()) => tracing::info!("Transfer {} complete", marker),
            Err(TransferError::Cancelled) => tracing::info!("Transfer {} cancelled", marker),
            Err(e) => tracing::error!("Transfer {} failed: {}", marker, e),
        }
        (self.on_completed)(marker, result);
    }

    pub(crate) fn progress(&self, report: &ProgressReport) {
        if let Some(f) = &self.on_progress {
            f(report);
        }
    }

    pub(crate) fn retrying(&self, marker: &str, attempt: u32, error: &TransferError) {
        tracing::warn!("Transfer {} will retry (attempt {}): {}", marker, attempt, error);
        if let Some(f) = &self.on_retrying {
            f(marker, attempt, error);
        }
    }

    /// Delegate-supplied delay, if any
    pub(crate) fn timeout_for(&self, attempt: u32) -> Option<Duration> {
        self.retry_timeout.as_ref().map(|f| f(attempt))
    }
}

impl fmt::Debug for TransferEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEvents")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_retrying", &self.on_retrying.is_some())
            .field("retry_timeout", &self.retry_timeout.is_some())
            .finish()
    }
}

fn send(tx: &Sender<TransferEvent>, event: TransferEvent) {
    if tx.try_send(event).is_err() {
        tracing::debug!("Transfer event dropped, receiver closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_forwards_every_hook() {
        let (events, rx) = TransferEvents::channel();
        let report = ProgressReport {
            marker: "m".into(),
            bytes_written: 5,
            bytes_total: 10,
            percent: 50,
        };
        events.progress(&report);
        events.retrying("m", 1, &TransferError::NotFound("x".into()));
        events.completed("m", Ok(()));

        assert_eq!(rx.try_recv().unwrap(), TransferEvent::Progress(report));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TransferEvent::Retrying { attempt: 1, .. }
        ));
        assert_eq!(
            rx.try_recv().unwrap(),
            TransferEvent::Completed {
                marker: "m".into(),
                result: Ok(())
            }
        );
    }

    #[test]
    fn test_optional_hooks_default_to_nothing() {
        let events = TransferEvents::new(|_, _| {});
        assert_eq!(events.timeout_for(2), None);
        events.progress(&ProgressReport {
            marker: "m".into(),
            bytes_written: 0,
            bytes_total: 0,
            percent: 0,
        });

        let events = events.retry_timeout(|attempt| Duration::from_secs(u64::from(attempt) * 2));
        assert_eq!(events.timeout_for(3), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_closed_channel_is_harmless() {
        let (events, rx) = TransferEvents::channel();
        drop(rx);
        events.completed("m", Err(TransferError::Cancelled));
    }
}
