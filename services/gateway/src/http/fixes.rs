use super::ApiState;
use super::response::{HttpResponse, bad_request, internal_error, not_found};
use crate::sink::PersistedFix;
use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_SEARCH_LIMIT: usize = 1000;

#[derive(Deserialize)]
pub struct SearchQuery {
    pub imei: Option<String>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct LastQuery {
    pub imeis: String,
}

#[derive(Deserialize)]
pub struct ImeiQuery {
    pub imei: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub imei: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Deserialize)]
pub struct PushRequest {
    pub imei: String,
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lng: f64,
    #[serde(default, alias = "speed")]
    pub speed_kph: f64,
    #[serde(default)]
    pub course: u16,
    pub acc: Option<u8>,
    pub battery_mv: Option<u32>,
    pub mileage_m: Option<u32>,
    pub gps_time: Option<NaiveDateTime>,
    pub raw_hex: Option<String>,
}

/// GET /api/tracker-data
pub async fn search(State(state): State<ApiState>, Query(q): Query<SearchQuery>) -> HttpResponse {
    let imei = q.imei.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let limit = q.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
    let store = state.store.lock().await;
    match store.search(imei, q.from, q.to, limit) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/last
pub async fn last(State(state): State<ApiState>, Query(q): Query<LastQuery>) -> HttpResponse {
    let imeis: Vec<String> = q
        .imeis
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect();
    if imeis.is_empty() {
        return bad_request("imeis must list at least one device");
    }
    let store = state.store.lock().await;
    match store.latest_for(&imeis) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /api/push
pub async fn push(State(state): State<ApiState>, Json(req): Json<PushRequest>) -> HttpResponse {
    let imei = req.imei.trim();
    if imei.is_empty() {
        return bad_request("imei is required");
    }
    if !(-90.0..=90.0).contains(&req.lat) || !(-180.0..=180.0).contains(&req.lng) {
        return bad_request("coordinates out of range");
    }
    let now = Utc::now().naive_utc();
    let fix = PersistedFix {
        imei: imei.to_owned(),
        latitude: req.lat,
        longitude: req.lng,
        speed_kph: req.speed_kph,
        course: req.course,
        acc: req.acc,
        battery_mv: req.battery_mv,
        mileage_m: req.mileage_m,
        gps_time: req.gps_time.unwrap_or(now),
        raw_hex: req.raw_hex,
        received_at: now,
    };
    let mut store = state.store.lock().await;
    match store.insert_fix(&fix) {
        Ok(_) => Json(json!({"ok": true})).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/tracking/live
pub async fn live(State(state): State<ApiState>, Query(q): Query<ImeiQuery>) -> HttpResponse {
    let store = state.store.lock().await;
    match store.latest(q.imei.trim()) {
        Ok(Some(fix)) => Json(fix).into_response(),
        Ok(None) => not_found(format!("no data for IMEI: {}", q.imei.trim())),
        Err(e) => internal_error(e),
    }
}

/// GET /api/tracking/history
pub async fn history(State(state): State<ApiState>, Query(q): Query<HistoryQuery>) -> HttpResponse {
    if q.start > q.end {
        return bad_request("start must not be after end");
    }
    let store = state.store.lock().await;
    match store.history(q.imei.trim(), q.start, q.end) {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => internal_error(e),
    }
}
