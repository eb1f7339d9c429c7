//! End-to-End Integration Harness: tracker device -> gateway -> SQLite -> query API.
//!
//! Tests the complete ingest pipeline:
//!   1. The gateway is assembled in-process the way the binary does it: file
//!      backed fix store, storage worker, listener and query API.
//!   2. A mock tracker (MockTracker) logs in and reports positions over TCP.
//!   3. The stored fixes are read back through the HTTP API with reqwest.
//!
//! # Coverage
//! - Acks for every frame type, in order, with echoed serials.
//! - Southern/western fixes keep their sign all the way to the API.
//! - A report without a GPS fix is acknowledged but never stored.
//! - Long-form frames are acknowledged in long form.

use gateway::config::TcpConfig;
use gateway::guard::AbuseGuard;
use gateway::handler::HandlerContext;
use gateway::http::{self, ApiState};
use gateway::listener::Listener;
use gateway::session::SessionTable;
use gateway::sink::StorageWorker;
use gateway::storage::{FixStore, SharedStore};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracker_test_utils::{GpsReport, MockTracker, heartbeat_frame, login_frame, status_frame};

const API_KEY: &str = "e2e-key";
const IMEI: &str = "868120145233604";

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

struct Harness {
    tracker_addr: SocketAddr,
    api_addr: SocketAddr,
    store: SharedStore,
    _dir: tempfile::TempDir,
    _shutdown: watch::Sender<bool>,
}

async fn start_harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = FixStore::open(&dir.path().join("fixes.sqlite3"))
        .unwrap()
        .into_shared();
    let (storage, worker) = StorageWorker::new(store.clone(), 128);
    worker.spawn();

    let (tx, rx) = watch::channel(false);
    let ctx = HandlerContext::new(SessionTable::new(), AbuseGuard::default(), Arc::new(storage));
    let cfg = TcpConfig {
        bind: IpAddr::from([127, 0, 0, 1]),
        port: 0,
        ..TcpConfig::default()
    };
    let listener = Listener::bind(&cfg, ctx).await.unwrap();
    let tracker_addr = listener.local_addr().unwrap();
    tokio::spawn(listener.run(rx.clone()));

    let mut api_rx = rx;
    let api_addr = http::serve(
        "127.0.0.1:0",
        ApiState::new(store.clone(), vec![API_KEY.to_owned()]),
        async move {
            let _ = api_rx.wait_for(|stop| *stop).await;
        },
    )
    .await
    .unwrap();

    Harness {
        tracker_addr,
        api_addr,
        store,
        _dir: dir,
        _shutdown: tx,
    }
}

async fn wait_for_fix_count(store: &SharedStore, expected: i64) {
    for _ in 0..100 {
        if store.lock().await.fix_count().unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} stored fixes", expected);
}

async fn api_get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let resp = reqwest::Client::new()
        .get(format!("http://{}{}", addr, path))
        .header("X-API-Key", API_KEY)
        .send()
        .await
        .expect("request failed");
    let status = resp.status().as_u16();
    let body = resp.json().await.expect("json body");
    (status, body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn device_session_reaches_the_api() {
    let h = start_harness().await;
    let mut tracker = MockTracker::connect(h.tracker_addr).await.unwrap();

    let frames = vec![
        login_frame(IMEI, 1),
        heartbeat_frame(2),
        GpsReport::new(-15.4167, 28.2833)
            .speed(42)
            .course(90)
            .time([25, 10, 28, 8, 0, 0])
            .encode(3),
        status_frame(4),
        GpsReport::new(-15.5, -28.5)
            .packet_type(0x22)
            .without_satellite_byte()
            .time([25, 10, 28, 9, 0, 0])
            .encode(5),
        GpsReport::new(10.0, 10.0).no_fix().encode(6),
        GpsReport::new(-15.6, 28.6)
            .long_form()
            .time([25, 10, 28, 10, 0, 0])
            .encode(7),
    ];
    for (i, frame) in frames.iter().enumerate() {
        tracker.send(frame).await.unwrap();
        let ack = tracker.recv_frame().await.unwrap();
        let (type_at, serial_at) = if ack[0] == 0x79 { (4, 5) } else { (3, 4) };
        let type_in = if frame[0] == 0x79 { frame[4] } else { frame[3] };
        assert_eq!(ack[type_at], type_in, "ack type for frame {}", i);
        assert_eq!(
            u16::from_be_bytes([ack[serial_at], ack[serial_at + 1]]),
            (i + 1) as u16,
            "ack serial for frame {}",
            i
        );
        assert_eq!(ack[0], frame[0], "ack form for frame {}", i);
    }

    wait_for_fix_count(&h.store, 3).await;

    let (status, body) = api_get(
        h.api_addr,
        &format!(
            "/api/tracking/history?imei={}&start=2025-10-28T00:00:00&end=2025-10-28T23:59:59",
            IMEI
        ),
    )
    .await;
    assert_eq!(status, 200);
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 3);
    let coords: Vec<(f64, f64)> = rows
        .iter()
        .map(|r| (r["lat"].as_f64().unwrap(), r["lng"].as_f64().unwrap()))
        .collect();
    assert!((coords[0].0 + 15.4167).abs() < 1e-6 && (coords[0].1 - 28.2833).abs() < 1e-6);
    assert!((coords[1].0 + 15.5).abs() < 1e-6 && (coords[1].1 + 28.5).abs() < 1e-6);
    assert!((coords[2].0 + 15.6).abs() < 1e-6 && (coords[2].1 - 28.6).abs() < 1e-6);
    assert_eq!(rows[0]["speed_kph"], 42.0);
    assert_eq!(rows[0]["course"], 90);
    assert!(rows[0]["raw_hex"].as_str().unwrap().starts_with("7878"));

    let (status, live) = api_get(h.api_addr, &format!("/api/tracking/live?imei={}", IMEI)).await;
    assert_eq!(status, 200);
    assert_eq!(live["gps_time"], "2025-10-28T10:00:00");
}

#[tokio::test]
async fn api_without_key_is_unauthorized() {
    let h = start_harness().await;
    let resp = reqwest::get(format!("http://{}/api/last?imeis={}", h.api_addr, IMEI))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"ok": false, "error": "unauthorized"}));
}
