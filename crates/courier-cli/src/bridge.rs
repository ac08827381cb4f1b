// SPDX-License-Identifier: AGPL-3.0
// Courier CLI - Manager bridge
//
// Owns the tokio runtime the transport runs on, feeds transport events to
// the manager, drives the retry timer and lets the synchronous command code
// wait for completions.

use async_channel::Receiver;
use courier_core::{
    AdapterFactory, FileSnapshotStore, RequestAuthorizer, RestoreReport, TransferError,
    TransferEvent, TransferEvents, TransferManager, TransferSettings,
};
use courier_http::HttpTransport;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Authorizers for the object storage backends
#[derive(Default, Clone)]
pub struct Authorizers {
    pub s3: Option<Arc<dyn RequestAuthorizer>>,
    pub gcs: Option<Arc<dyn RequestAuthorizer>>,
}

/// How waiting for transfers ended
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// Every awaited marker completed, with its result
    Finished(BTreeMap<String, Result<(), TransferError>>),
    /// Interrupted; unfinished transfers stay in the snapshot
    Interrupted,
}

/// Bridge between the command line and the transfer manager
pub struct ManagerBridge {
    manager: Arc<TransferManager>,
    event_rx: Receiver<TransferEvent>,
    restored: RestoreReport,
    runtime: Runtime,
}

impl ManagerBridge {
    pub fn new(settings: TransferSettings, authorizers: Authorizers) -> Result<Self, TransferError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| {
                TransferError::InvalidConfig(format!("Failed to create Tokio runtime: {}", e))
            })?;

        let (transport, transport_rx) = HttpTransport::new(runtime.handle().clone())?;
        let (events, event_rx) = TransferEvents::channel();
        let store = Arc::new(FileSnapshotStore::new(settings.resolved_state_file()?));

        let mut factory = AdapterFactory::new(settings.backends.clone());
        if let Some(authorizer) = authorizers.s3 {
            factory = factory.with_s3_authorizer(authorizer);
        }
        if let Some(authorizer) = authorizers.gcs {
            factory = factory.with_gcs_authorizer(authorizer);
        }

        let manager = Arc::new(TransferManager::new(
            settings,
            Arc::new(transport),
            events,
            store,
            factory,
        )?);
        let restored = manager.initialize()?;
        if restored.quarantined {
            tracing::warn!("Saved transfers were unreadable; starting with none");
        }
        if restored.restored > 0 {
            tracing::info!("Resumed {} transfers from the last run", restored.restored);
        }

        // Route transport events to the manager
        let router = manager.clone();
        runtime.spawn(async move {
            router.run(transport_rx).await;
        });

        // Retry timer; the manager decides the interval on every round
        let ticker = manager.clone();
        runtime.spawn(async move {
            loop {
                tokio::time::sleep(ticker.retry_delay()).await;
                let dispatched = ticker.on_retry_tick();
                if dispatched > 0 {
                    tracing::debug!("Retry tick dispatched {} transfers", dispatched);
                }
            }
        });

        Ok(Self {
            manager,
            event_rx,
            restored,
            runtime,
        })
    }

    pub fn manager(&self) -> &TransferManager {
        &self.manager
    }

    pub fn restored(&self) -> &RestoreReport {
        &self.restored
    }

    /// Block until every marker in `markers` has completed or Ctrl-C is
    /// pressed. Progress and retries are printed as they arrive.
    pub fn wait_for(&self, markers: HashSet<String>) -> WaitOutcome {
        let mut remaining = markers;
        let mut results = BTreeMap::new();

        self.runtime.block_on(async {
            while !remaining.is_empty() {
                tokio::select! {
                    event = self.event_rx.recv() => {
                        match event {
                            Ok(TransferEvent::Progress(report)) => {
                                if remaining.contains(&report.marker) {
                                    println!(
                                        "{}: {}% ({}/{} bytes)",
                                        report.marker,
                                        report.percent,
                                        report.bytes_written,
                                        report.bytes_total
                                    );
                                }
                            }
                            Ok(TransferEvent::Retrying { marker, attempt, error }) => {
                                println!("{}: attempt {} failed, retrying: {}", marker, attempt, error);
                            }
                            Ok(TransferEvent::Completed { marker, result }) => {
                                if remaining.remove(&marker) {
                                    results.insert(marker, result);
                                }
                            }
                            Err(_) => break, // Channel closed
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        return WaitOutcome::Interrupted;
                    }
                }
            }
            WaitOutcome::Finished(results)
        })
    }

    /// Stop live transfers, keeping them in the snapshot for the next run
    pub fn shutdown(self) {
        self.manager.shutdown();
        self.runtime.shutdown_background();
    }
}
