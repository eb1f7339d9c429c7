//! Connection → device binding.
//!
//! Each connection handler only ever touches its own key; the lock exists for
//! the map itself, not for cross-connection coordination.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Process-unique identifier of one accepted TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> ConnectionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which device IMEI each live connection has logged in as.
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<RwLock<HashMap<ConnectionId, String>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `conn` to `imei`, replacing any earlier binding.
    pub async fn bind(&self, conn: ConnectionId, imei: &str) {
        self.inner.write().await.insert(conn, imei.to_owned());
    }

    pub async fn lookup(&self, conn: ConnectionId) -> Option<String> {
        self.inner.read().await.get(&conn).cloned()
    }

    pub async fn remove(&self, conn: ConnectionId) -> Option<String> {
        self.inner.write().await.remove(&conn)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
