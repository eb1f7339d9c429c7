//! Query API over stored fixes.
//!
//! - `GET  /healthz`                                   — always 200, no key needed
//! - `GET  /api/tracker-data?imei=&from=&to=`          — search, newest first
//! - `GET  /api/last?imeis=a,b`                        — latest fix per device
//! - `POST /api/push`                                  — store a fix directly
//! - `GET  /api/tracking/live?imei=`                   — latest fix, 404 if none
//! - `GET  /api/tracking/history?imei=&start=&end=`    — oldest first
//!
//! Every `/api/*` route requires an `X-API-Key` header matching one of the
//! configured keys.

pub mod fixes;
pub mod response;

use crate::storage::SharedStore;
use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiState {
    pub store: SharedStore,
    pub api_keys: Arc<Vec<String>>,
}

impl ApiState {
    pub fn new(store: SharedStore, api_keys: Vec<String>) -> Self {
        ApiState {
            store,
            api_keys: Arc::new(api_keys),
        }
    }

    fn accepts(&self, key: &str) -> bool {
        let key = key.trim();
        !key.is_empty() && self.api_keys.iter().any(|k| k == key)
    }
}

pub fn build_router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/api/tracker-data", get(fixes::search))
        .route("/api/last", get(fixes::last))
        .route("/api/push", post(fixes::push))
        .route("/api/tracking/live", get(fixes::live))
        .route("/api/tracking/history", get(fixes::history))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api)
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn require_api_key(State(state): State<ApiState>, req: Request, next: Next) -> Response {
    let key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !state.accepts(key) {
        warn!(path = %req.uri().path(), "rejected API request: bad or missing key");
        return response::unauthorized();
    }
    next.run(req).await
}

/// Bind and serve the query API until `shutdown` resolves.
pub async fn serve(
    bind: &str,
    state: ApiState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    info!(addr = %addr, "query API listening");
    let app = build_router(state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "query API server stopped with error");
        }
    });
    Ok(addr)
}
