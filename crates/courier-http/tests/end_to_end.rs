// SPDX-License-Identifier: AGPL-3.0
// Courier HTTP - Manager, transport and test server together

use async_channel::Receiver;
use courier_core::{
    AdapterFactory, FileSnapshotStore, Params, TransferError, TransferEvent, TransferEvents,
    TransferManager, TransferSettings, TransportErrorKind,
};
use courier_http::{serve, HttpTransport, ServerState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;

struct Setup {
    _dir: tempfile::TempDir,
    server_root: std::path::PathBuf,
    work_dir: std::path::PathBuf,
    addr: SocketAddr,
    manager: Arc<TransferManager>,
    events: Receiver<TransferEvent>,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let server_root = dir.path().join("static");
    let work_dir = dir.path().join("work");
    std::fs::create_dir_all(&work_dir).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(&server_root));
    tokio::spawn(serve(listener, state));

    let settings = TransferSettings {
        upload_dir: work_dir.clone(),
        download_dir: work_dir.join("downloads"),
        state_file: Some(dir.path().join("transfers.json")),
        ..TransferSettings::default()
    };
    let (transport, transport_rx) = HttpTransport::new(Handle::current()).unwrap();
    let transport = transport.with_staging_dir(dir.path().join("staging"));
    let (events, events_rx) = TransferEvents::channel();
    let store = Arc::new(FileSnapshotStore::new(dir.path().join("transfers.json")));
    let factory = AdapterFactory::new(settings.backends.clone());

    let manager =
        Arc::new(TransferManager::new(settings, Arc::new(transport), events, store, factory).unwrap());
    let runner = manager.clone();
    tokio::spawn(async move { runner.run(transport_rx).await });

    Setup {
        _dir: dir,
        server_root,
        work_dir,
        addr,
        manager,
        events: events_rx,
    }
}

async fn completion(events: &Receiver<TransferEvent>, marker: &str) -> Result<(), TransferError> {
    let wait = async {
        loop {
            match events.recv().await.unwrap() {
                TransferEvent::Completed { marker: m, result } if m == marker => return result,
                _ => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("no completion within 10s")
}

fn write_file(path: &Path, contents: &[u8]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_download_delete_round_trip() {
    let s = setup().await;
    let contents = b"not really a jpeg".repeat(4096);
    write_file(&s.work_dir.join("a.jpg"), &contents);

    let mut params = Params::new();
    params.insert("album".into(), serde_json::json!("holiday"));
    let upload_url = format!("http://{}/upload", s.addr);
    s.manager
        .upload_file("a.jpg", &upload_url, "up-1", params)
        .unwrap();
    assert_eq!(completion(&s.events, "up-1").await, Ok(()));

    let stored = s.server_root.join("files").join("a.jpg");
    assert_eq!(std::fs::read(&stored).unwrap(), contents);
    assert!(s.manager.current_state().is_empty());

    let file_url = format!("http://{}/files/a.jpg", s.addr);
    s.manager
        .download_file(&file_url, "copy/a.jpg", "down-1", Params::new())
        .unwrap();
    assert_eq!(completion(&s.events, "down-1").await, Ok(()));
    let downloaded = s.work_dir.join("downloads").join("copy").join("a.jpg");
    assert_eq!(std::fs::read(&downloaded).unwrap(), contents);

    let manager = s.manager.clone();
    let result = tokio::task::spawn_blocking(move || manager.delete_file(&file_url))
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
    assert!(!stored.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_remote_file_fails_without_retry() {
    let s = setup().await;
    let url = format!("http://{}/files/nothing.bin", s.addr);
    s.manager
        .download_file(&url, "nothing.bin", "down-404", Params::new())
        .unwrap();

    match completion(&s.events, "down-404").await {
        Err(TransferError::Transport(e)) => {
            assert_eq!(e.kind, TransportErrorKind::Status(404));
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(s.manager.current_state().is_empty());
    assert!(!s.work_dir.join("downloads").join("nothing.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_against_dead_server_is_connect_error() {
    let s = setup().await;
    let manager = s.manager.clone();
    let result = tokio::task::spawn_blocking(move || manager.delete_file("http://127.0.0.1:1/files/a.jpg"))
        .await
        .unwrap();

    match result {
        Err(TransferError::Transport(e)) => assert_eq!(e.kind, TransportErrorKind::Connect),
        other => panic!("unexpected result {:?}", other),
    }
    assert!(s.manager.current_state().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delete_of_missing_file_reports_status() {
    let s = setup().await;
    let url = format!("http://{}/files/gone.txt", s.addr);
    let manager = s.manager.clone();
    let result = tokio::task::spawn_blocking(move || manager.delete_file(&url))
        .await
        .unwrap();

    match result {
        Err(TransferError::Transport(e)) => assert_eq!(e.kind, TransportErrorKind::Status(404)),
        other => panic!("unexpected result {:?}", other),
    }
}
