//! SQLite store for position fixes and undecodable payloads.
//!
//! # Schema
//! - `tracker_data`: one row per accepted fix, indexed by (imei, gps_time).
//! - `raw_messages`: frames from logged-in devices that could not be decoded.
//!
//! # SQLite settings
//! Applied at open: WAL, synchronous=NORMAL. PRAGMA integrity_check runs at
//! open; returns error if it fails.
//!
//! Timestamps are stored as naive ISO-8601 text (`%Y-%m-%dT%H:%M:%S`) so
//! range queries compare lexically.

use crate::sink::{PersistedFix, RawPayload};
use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Store handle shared by the storage worker and the query API.
pub type SharedStore = Arc<Mutex<FixStore>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),
}

/// A fix as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredFix {
    pub id: i64,
    pub imei: String,
    pub lat: f64,
    pub lng: f64,
    pub speed_kph: f64,
    pub course: u16,
    pub acc: Option<u8>,
    pub battery_mv: Option<u32>,
    pub mileage_m: Option<u32>,
    pub gps_time: NaiveDateTime,
    pub raw_hex: Option<String>,
    pub received_at: NaiveDateTime,
}

pub struct FixStore {
    conn: Connection,
}

impl FixStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        apply_schema(&conn)?;
        Ok(FixStore { conn })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(FixStore { conn })
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn insert_fix(&mut self, fix: &PersistedFix) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO tracker_data
                 (imei, lat, lng, speed_kph, course, acc, battery_mv, mileage_m,
                  gps_time, raw_hex, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                fix.imei,
                fix.latitude,
                fix.longitude,
                fix.speed_kph,
                fix.course,
                fix.acc,
                fix.battery_mv,
                fix.mileage_m,
                fix.gps_time.format(TIME_FORMAT).to_string(),
                fix.raw_hex,
                fix.received_at.format(TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_raw(&mut self, raw: &RawPayload) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO raw_messages (raw_hex, imei, peer, reason, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                raw.raw_hex,
                raw.imei,
                raw.peer,
                raw.reason,
                raw.received_at.format(TIME_FORMAT).to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Fixes matching every given filter, newest first.
    pub fn search(
        &self,
        imei: Option<&str>,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
        limit: usize,
    ) -> Result<Vec<StoredFix>, StoreError> {
        let from = from.map(|t| t.format(TIME_FORMAT).to_string());
        let to = to.map(|t| t.format(TIME_FORMAT).to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, imei, lat, lng, speed_kph, course, acc, battery_mv, mileage_m,
                    gps_time, raw_hex, received_at
             FROM tracker_data
             WHERE (?1 IS NULL OR imei = ?1)
               AND (?2 IS NULL OR gps_time >= ?2)
               AND (?3 IS NULL OR gps_time <= ?3)
             ORDER BY gps_time DESC, id DESC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![imei, from, to, limit], map_fix)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent fix for one device.
    pub fn latest(&self, imei: &str) -> Result<Option<StoredFix>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, imei, lat, lng, speed_kph, course, acc, battery_mv, mileage_m,
                        gps_time, raw_hex, received_at
                 FROM tracker_data
                 WHERE imei = ?1
                 ORDER BY gps_time DESC, id DESC
                 LIMIT 1",
                params![imei],
                map_fix,
            )
            .optional()?)
    }

    /// Most recent fix for each listed device that has one, in list order.
    pub fn latest_for(&self, imeis: &[String]) -> Result<Vec<StoredFix>, StoreError> {
        let mut out = Vec::with_capacity(imeis.len());
        for imei in imeis {
            if let Some(fix) = self.latest(imei)? {
                out.push(fix);
            }
        }
        Ok(out)
    }

    /// Fixes for one device within `[start, end]`, oldest first.
    pub fn history(
        &self,
        imei: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<StoredFix>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, imei, lat, lng, speed_kph, course, acc, battery_mv, mileage_m,
                    gps_time, raw_hex, received_at
             FROM tracker_data
             WHERE imei = ?1 AND gps_time >= ?2 AND gps_time <= ?3
             ORDER BY gps_time ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                imei,
                start.format(TIME_FORMAT).to_string(),
                end.format(TIME_FORMAT).to_string()
            ],
            map_fix,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn fix_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM tracker_data", [], |row| row.get(0))?)
    }

    pub fn raw_count(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM raw_messages", [], |row| row.get(0))?)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), StoreError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(StoreError::IntegrityCheckFailed(result));
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(include_str!("schema.sql"))?;
    Ok(())
}

fn time_column(row: &rusqlite::Row<'_>, idx: usize) -> Result<NaiveDateTime, rusqlite::Error> {
    let text: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&text, TIME_FORMAT)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn map_fix(row: &rusqlite::Row<'_>) -> Result<StoredFix, rusqlite::Error> {
    Ok(StoredFix {
        id: row.get(0)?,
        imei: row.get(1)?,
        lat: row.get(2)?,
        lng: row.get(3)?,
        speed_kph: row.get(4)?,
        course: row.get(5)?,
        acc: row.get(6)?,
        battery_mv: row.get(7)?,
        mileage_m: row.get(8)?,
        gps_time: time_column(row, 9)?,
        raw_hex: row.get(10)?,
        received_at: time_column(row, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 10, 28)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn fix(imei: &str, time: NaiveDateTime, lat: f64) -> PersistedFix {
        PersistedFix {
            imei: imei.to_owned(),
            latitude: lat,
            longitude: 28.28,
            speed_kph: 12.0,
            course: 180,
            acc: None,
            battery_mv: None,
            mileage_m: None,
            gps_time: time,
            raw_hex: Some("7878".to_owned()),
            received_at: time,
        }
    }

    #[test]
    fn insert_and_search_newest_first() {
        let mut store = FixStore::open_in_memory().unwrap();
        store.insert_fix(&fix("A", at(8, 0), -15.1)).unwrap();
        store.insert_fix(&fix("A", at(9, 0), -15.2)).unwrap();
        store.insert_fix(&fix("B", at(10, 0), -15.3)).unwrap();

        let all = store.search(None, None, None, 100).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].imei, "B");

        let a = store.search(Some("A"), None, None, 100).unwrap();
        assert_eq!(a.iter().map(|f| f.lat).collect::<Vec<_>>(), vec![-15.2, -15.1]);

        let windowed = store.search(None, Some(at(8, 30)), Some(at(9, 30)), 100).unwrap();
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].gps_time, at(9, 0));
        assert_eq!(windowed[0].course, 180);
        assert_eq!(windowed[0].raw_hex.as_deref(), Some("7878"));
    }

    #[test]
    fn search_honours_limit() {
        let mut store = FixStore::open_in_memory().unwrap();
        for m in 0..5 {
            store.insert_fix(&fix("A", at(8, m), 1.0)).unwrap();
        }
        let page = store.search(Some("A"), None, None, 2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].gps_time, at(8, 4));
    }

    #[test]
    fn latest_per_device_skips_unknown() {
        let mut store = FixStore::open_in_memory().unwrap();
        store.insert_fix(&fix("A", at(8, 0), 1.0)).unwrap();
        store.insert_fix(&fix("A", at(9, 0), 2.0)).unwrap();
        store.insert_fix(&fix("B", at(7, 0), 3.0)).unwrap();

        let latest = store
            .latest_for(&["B".to_owned(), "missing".to_owned(), "A".to_owned()])
            .unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!((latest[0].imei.as_str(), latest[0].lat), ("B", 3.0));
        assert_eq!((latest[1].imei.as_str(), latest[1].lat), ("A", 2.0));
        assert!(store.latest("missing").unwrap().is_none());
    }

    #[test]
    fn history_is_oldest_first_and_inclusive() {
        let mut store = FixStore::open_in_memory().unwrap();
        store.insert_fix(&fix("A", at(9, 0), 2.0)).unwrap();
        store.insert_fix(&fix("A", at(8, 0), 1.0)).unwrap();
        store.insert_fix(&fix("A", at(10, 0), 3.0)).unwrap();
        store.insert_fix(&fix("B", at(9, 0), 9.0)).unwrap();

        let hist = store.history("A", at(8, 0), at(9, 0)).unwrap();
        assert_eq!(hist.iter().map(|f| f.lat).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[test]
    fn raw_payloads_are_counted() {
        let mut store = FixStore::open_in_memory().unwrap();
        store
            .insert_raw(&RawPayload {
                raw_hex: "78780A8A".to_owned(),
                imei: Some("354778345253671".to_owned()),
                peer: Some("10.0.0.1:4000".to_owned()),
                reason: "unknown packet type 0x8A".to_owned(),
                received_at: at(8, 0),
            })
            .unwrap();
        assert_eq!(store.raw_count().unwrap(), 1);
        assert_eq!(store.fix_count().unwrap(), 0);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixes.sqlite3");
        {
            let mut store = FixStore::open(&path).unwrap();
            store.insert_fix(&fix("A", at(8, 0), 1.0)).unwrap();
        }
        let store = FixStore::open(&path).unwrap();
        assert_eq!(store.fix_count().unwrap(), 1);
    }
}
