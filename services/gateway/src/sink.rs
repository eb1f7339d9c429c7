//! Hand-off from connection handlers to persistence.
//!
//! Handlers never wait on storage: `FixSink` calls enqueue and return. The
//! storage worker drains the queue into SQLite on its own task; when the
//! queue is full the item is dropped and a warning logged.

use crate::storage::SharedStore;
use chrono::NaiveDateTime;
use gt06_core::{DecodedRecord, PositionFix};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One accepted position ready for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedFix {
    pub imei: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kph: f64,
    pub course: u16,
    pub acc: Option<u8>,
    pub battery_mv: Option<u32>,
    pub mileage_m: Option<u32>,
    pub gps_time: NaiveDateTime,
    pub raw_hex: Option<String>,
    pub received_at: NaiveDateTime,
}

impl PersistedFix {
    /// Build from a decoded record. Records without a device timestamp take
    /// the receive time.
    pub fn from_record(
        imei: &str,
        rec: &DecodedRecord,
        fix: &PositionFix,
        received_at: NaiveDateTime,
    ) -> Self {
        PersistedFix {
            imei: imei.to_owned(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            speed_kph: fix.speed_kph,
            course: fix.course,
            acc: rec.acc,
            battery_mv: rec.battery_mv,
            mileage_m: rec.mileage_m,
            gps_time: rec.gps_time.unwrap_or(received_at),
            raw_hex: Some(rec.raw_hex.clone()),
            received_at,
        }
    }
}

/// Bytes from a logged-in device that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub raw_hex: String,
    pub imei: Option<String>,
    pub peer: Option<String>,
    pub reason: String,
    pub received_at: NaiveDateTime,
}

/// Where handlers send what they extract. Calls must not block.
pub trait FixSink: Send + Sync {
    fn store_fix(&self, fix: PersistedFix);
    fn store_raw(&self, raw: RawPayload);
}

// ---------------------------------------------------------------------------
// Storage worker
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum StorageItem {
    Fix(PersistedFix),
    Raw(RawPayload),
}

/// Cloneable sender side of the storage queue.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageItem>,
}

impl StorageHandle {
    fn offer(&self, item: StorageItem) {
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                warn!(item = kind(&item), "storage queue full, dropping");
            }
            Err(TrySendError::Closed(item)) => {
                warn!(item = kind(&item), "storage worker stopped, dropping");
            }
        }
    }
}

fn kind(item: &StorageItem) -> &'static str {
    match item {
        StorageItem::Fix(_) => "fix",
        StorageItem::Raw(_) => "raw",
    }
}

impl FixSink for StorageHandle {
    fn store_fix(&self, fix: PersistedFix) {
        self.offer(StorageItem::Fix(fix));
    }

    fn store_raw(&self, raw: RawPayload) {
        self.offer(StorageItem::Raw(raw));
    }
}

/// Single task that owns writes to the fix store.
pub struct StorageWorker {
    rx: mpsc::Receiver<StorageItem>,
    store: SharedStore,
}

impl StorageWorker {
    pub fn new(store: SharedStore, queue_depth: usize) -> (StorageHandle, StorageWorker) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        (StorageHandle { tx }, StorageWorker { rx, store })
    }

    /// Drain the queue until every `StorageHandle` is dropped.
    pub async fn run(mut self) {
        while let Some(item) = self.rx.recv().await {
            let mut store = self.store.lock().await;
            match &item {
                StorageItem::Fix(fix) => match store.insert_fix(fix) {
                    Ok(id) => debug!(imei = %fix.imei, id, "fix persisted"),
                    Err(e) => error!(imei = %fix.imei, error = %e, "failed to persist fix"),
                },
                StorageItem::Raw(raw) => {
                    if let Err(e) = store.insert_raw(raw) {
                        error!(error = %e, "failed to persist raw payload");
                    }
                }
            }
        }
        debug!("storage worker stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Keeps everything in memory, in call order. Used by tests.
#[derive(Clone, Default)]
pub struct MemorySink {
    fixes: Arc<Mutex<Vec<PersistedFix>>>,
    raws: Arc<Mutex<Vec<RawPayload>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fixes(&self) -> Vec<PersistedFix> {
        self.fixes.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn raws(&self) -> Vec<RawPayload> {
        self.raws.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl FixSink for MemorySink {
    fn store_fix(&self, fix: PersistedFix) {
        if let Ok(mut v) = self.fixes.lock() {
            v.push(fix);
        }
    }

    fn store_raw(&self, raw: RawPayload) {
        if let Ok(mut v) = self.raws.lock() {
            v.push(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FixStore;
    use chrono::NaiveDate;
    use gt06_core::PacketType;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 28)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn sample_fix(imei: &str) -> PersistedFix {
        PersistedFix {
            imei: imei.to_owned(),
            latitude: -15.4,
            longitude: 28.3,
            speed_kph: 0.0,
            course: 0,
            acc: None,
            battery_mv: None,
            mileage_m: None,
            gps_time: ts(),
            raw_hex: None,
            received_at: ts(),
        }
    }

    #[test]
    fn missing_gps_time_falls_back_to_receive_time() {
        let mut rec = DecodedRecord::new("GT06", PacketType::GpsExtended, &[0x79, 0x79]);
        let fix = PositionFix {
            latitude: 1.0,
            longitude: 2.0,
            speed_kph: 3.0,
            course: 4,
            gps_valid: true,
        };
        rec.fix = Some(fix.clone());
        let persisted = PersistedFix::from_record("123", &rec, &fix, ts());
        assert_eq!(persisted.gps_time, ts());
        assert_eq!(persisted.raw_hex.as_deref(), Some("7979"));
        assert_eq!(persisted.course, 4);
    }

    #[tokio::test]
    async fn worker_persists_queued_items() {
        let store = FixStore::open_in_memory().unwrap().into_shared();
        let (handle, worker) = StorageWorker::new(store.clone(), 8);
        let task = worker.spawn();

        handle.store_fix(sample_fix("A"));
        handle.store_raw(RawPayload {
            raw_hex: "00".to_owned(),
            imei: None,
            peer: None,
            reason: "test".to_owned(),
            received_at: ts(),
        });
        drop(handle);
        task.await.unwrap();

        let store = store.lock().await;
        assert_eq!(store.fix_count().unwrap(), 1);
        assert_eq!(store.raw_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let store = FixStore::open_in_memory().unwrap().into_shared();
        let (handle, worker) = StorageWorker::new(store.clone(), 2);
        for i in 0..5 {
            handle.store_fix(sample_fix(&i.to_string()));
        }
        drop(handle);
        worker.run().await;
        assert_eq!(store.lock().await.fix_count().unwrap(), 2);
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.store_fix(sample_fix("A"));
        sink.store_fix(sample_fix("B"));
        let imeis: Vec<_> = sink.fixes().into_iter().map(|f| f.imei).collect();
        assert_eq!(imeis, vec!["A", "B"]);
        assert!(sink.raws().is_empty());
    }
}
