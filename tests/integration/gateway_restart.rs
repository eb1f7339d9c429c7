//! Gateway restart: stored fixes survive, in-memory state does not.
//!
//! A gateway is run against a SQLite file, stopped, and a second gateway is
//! started on the same file.

use gateway::config::TcpConfig;
use gateway::guard::AbuseGuard;
use gateway::handler::HandlerContext;
use gateway::listener::Listener;
use gateway::session::SessionTable;
use gateway::sink::StorageWorker;
use gateway::storage::FixStore;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracker_test_utils::{GpsReport, MockTracker, login_frame};

const IMEI: &str = "354778345253671";

struct Running {
    addr: SocketAddr,
    guard: AbuseGuard,
    shutdown: watch::Sender<bool>,
    listener: JoinHandle<()>,
    worker: JoinHandle<()>,
}

async fn start(path: &Path) -> Running {
    let store = FixStore::open(path).unwrap().into_shared();
    let (storage, worker) = StorageWorker::new(store, 16);
    let worker = worker.spawn();
    let guard = AbuseGuard::default();
    let ctx = HandlerContext::new(SessionTable::new(), guard.clone(), Arc::new(storage));
    let cfg = TcpConfig {
        bind: IpAddr::from([127, 0, 0, 1]),
        port: 0,
        ..TcpConfig::default()
    };
    let listener = Listener::bind(&cfg, ctx).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let listener = tokio::spawn(listener.run(rx));
    Running {
        addr,
        guard,
        shutdown,
        listener,
        worker,
    }
}

async fn report(addr: SocketAddr, hour: u8) {
    let mut tracker = MockTracker::connect(addr).await.unwrap();
    tracker.send(&login_frame(IMEI, 1)).await.unwrap();
    tracker.recv_frame().await.unwrap();
    tracker
        .send(&GpsReport::new(-15.0, 28.0).time([25, 10, 28, hour, 0, 0]).encode(2))
        .await
        .unwrap();
    tracker.recv_frame().await.unwrap();
}

/// Stop accepting, let handlers finish, and wait for the worker to drain.
async fn stop(running: Running) {
    running.shutdown.send(true).unwrap();
    running.listener.await.unwrap();
    // Handler tasks drop their storage handle when their connection ends.
    tokio::time::timeout(Duration::from_secs(5), running.worker)
        .await
        .expect("storage worker did not drain")
        .unwrap();
}

#[tokio::test]
async fn fixes_survive_restart_and_blocks_do_not() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixes.sqlite3");

    let first = start(&path).await;
    report(first.addr, 8).await;
    for _ in 0..3 {
        first.guard.record_failure(IpAddr::from([127, 0, 0, 1])).await;
    }
    assert!(first.guard.is_blocked(IpAddr::from([127, 0, 0, 1])).await);
    stop(first).await;

    let second = start(&path).await;
    assert!(!second.guard.is_blocked(IpAddr::from([127, 0, 0, 1])).await);
    report(second.addr, 9).await;
    stop(second).await;

    let store = FixStore::open(&path).unwrap();
    let fixes = store.search(Some(IMEI), None, None, 10).unwrap();
    let hours: Vec<String> = fixes.iter().map(|f| f.gps_time.format("%H").to_string()).collect();
    assert_eq!(hours, vec!["09", "08"]);
}
