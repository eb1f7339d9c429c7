//! Per-connection protocol loop.
//!
//! # States
//! ```text
//! AwaitMagic --first frame--> Authenticating --login--> Bound(imei)
//!      \__________________________\___________________________\--> Closed
//! ```
//!
//! Before a device has logged in, framing errors close the connection and
//! count against the peer address; undecodable frames count against it and
//! close only once the address is blocked. After login the same bytes are
//! kept as raw payloads and the connection stays up.
//!
//! Every frame whose type has an acknowledgment gets it written before the
//! next read.

use crate::guard::AbuseGuard;
use crate::session::{ConnectionId, SessionTable};
use crate::sink::{FixSink, PersistedFix, RawPayload};
use chrono::{NaiveDateTime, Utc};
use gt06_core::{
    DecodeOutcome, DecodedRecord, DecoderRegistry, Frame, FrameBuffer, FrameError, Payload, detect,
};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const DEFAULT_READ_BUFFER: usize = 2048;

/// Shared collaborators every handler needs.
#[derive(Clone)]
pub struct HandlerContext {
    pub registry: Arc<DecoderRegistry>,
    pub sessions: SessionTable,
    pub guard: AbuseGuard,
    pub sink: Arc<dyn FixSink>,
    pub idle_timeout: Option<Duration>,
    pub read_buffer_bytes: usize,
}

impl HandlerContext {
    pub fn new(sessions: SessionTable, guard: AbuseGuard, sink: Arc<dyn FixSink>) -> Self {
        HandlerContext {
            registry: Arc::new(DecoderRegistry::default()),
            sessions,
            guard,
            sink,
            idle_timeout: None,
            read_buffer_bytes: DEFAULT_READ_BUFFER,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_read_buffer(mut self, bytes: usize) -> Self {
        self.read_buffer_bytes = bytes.max(1);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    AwaitMagic,
    Authenticating,
    Bound(String),
    Closed,
}

impl ConnState {
    fn imei(&self) -> Option<&str> {
        match self {
            ConnState::Bound(imei) => Some(imei),
            _ => None,
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    ReadFailed(io::ErrorKind),
    WriteFailed(io::ErrorKind),
    /// Framing error before login.
    BadFraming(FrameError),
    /// The peer address got blocked by the abuse guard.
    Blocked,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::ReadFailed(kind) => write!(f, "read failed: {}", kind),
            CloseReason::WriteFailed(kind) => write!(f, "ack write failed: {}", kind),
            CloseReason::BadFraming(e) => write!(f, "framing error before login: {}", e),
            CloseReason::Blocked => write!(f, "peer blocked"),
        }
    }
}

/// Run one connection to completion. Always removes the session entry.
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    conn_id: ConnectionId,
    ctx: HandlerContext,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection {
        stream,
        peer,
        id: conn_id,
        state: ConnState::AwaitMagic,
        frames: FrameBuffer::default(),
        ctx,
    };
    let reason = conn.run().await;
    conn.close(&reason).await;
    reason
}

struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    id: ConnectionId,
    state: ConnState,
    frames: FrameBuffer,
    ctx: HandlerContext,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self) -> CloseReason {
        let mut chunk = vec![0u8; self.ctx.read_buffer_bytes];
        loop {
            let n = match self.read(&mut chunk).await {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => n,
                Err(reason) => return reason,
            };
            self.frames.extend(&chunk[..n]);
            if let Err(reason) = self.drain_frames().await {
                return reason;
            }
        }
    }

    async fn read(&mut self, chunk: &mut [u8]) -> Result<usize, CloseReason> {
        let read = match self.ctx.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream.read(chunk))
                .await
                .map_err(|_| CloseReason::IdleTimeout)?,
            None => self.stream.read(chunk).await,
        };
        read.map_err(|e| CloseReason::ReadFailed(e.kind()))
    }

    async fn drain_frames(&mut self) -> Result<(), CloseReason> {
        loop {
            match self.frames.next_frame() {
                Ok(Some(frame)) => self.on_frame(&frame).await?,
                Ok(None) => return Ok(()),
                Err(e) => self.on_framing_error(e).await?,
            }
        }
    }

    async fn on_framing_error(&mut self, err: FrameError) -> Result<(), CloseReason> {
        let Some(imei) = self.state.imei().map(str::to_owned) else {
            let head = self.frames.take();
            warn!(
                conn_id = %self.id,
                peer = %self.peer,
                error = %err,
                detected = detect(&head),
                "framing error before login"
            );
            self.ctx.guard.record_failure(self.peer.ip()).await;
            return Err(CloseReason::BadFraming(err));
        };
        let dropped = self.frames.resync();
        warn!(conn_id = %self.id, peer = %self.peer, imei = %imei, error = %err, dropped = dropped.len(), "framing error, resyncing");
        self.ctx.sink.store_raw(RawPayload {
            raw_hex: hex::encode_upper(&dropped),
            imei: Some(imei),
            peer: Some(self.peer.to_string()),
            reason: err.to_string(),
            received_at: now(),
        });
        Ok(())
    }

    async fn on_frame(&mut self, frame: &[u8]) -> Result<(), CloseReason> {
        if self.state == ConnState::AwaitMagic {
            self.state = ConnState::Authenticating;
        }
        if let Ok(parsed) = Frame::parse(frame)
            && !parsed.checksum_matches()
        {
            debug!(conn_id = %self.id, crc = parsed.crc(), "checksum mismatch, processing anyway");
        }

        match self.ctx.registry.classify(frame) {
            DecodeOutcome::Decoded(rec) => self.on_record(rec).await,
            DecodeOutcome::Invalid(e) => self.on_undecodable(frame, e.to_string()).await?,
            DecodeOutcome::NotThisProtocol => {
                self.on_undecodable(frame, "no decoder claimed the frame".to_owned())
                    .await?
            }
        }

        if let Some(ack) = self.ctx.registry.build_ack(frame) {
            self.stream
                .write_all(&ack)
                .await
                .map_err(|e| CloseReason::WriteFailed(e.kind()))?;
        }
        Ok(())
    }

    async fn on_record(&mut self, rec: DecodedRecord) {
        match rec.payload() {
            Payload::Identity(imei) => {
                self.ctx.sessions.bind(self.id, imei).await;
                self.ctx.guard.record_success(self.peer.ip()).await;
                info!(conn_id = %self.id, peer = %self.peer, imei = %imei, "device logged in");
                self.state = ConnState::Bound(imei.to_owned());
            }
            Payload::Position(fix) => {
                let Some(imei) = self.ctx.sessions.lookup(self.id).await else {
                    warn!(conn_id = %self.id, peer = %self.peer, packet_type = %rec.packet_type, "position before login, dropped");
                    return;
                };
                let persisted = PersistedFix::from_record(&imei, &rec, fix, now());
                debug!(
                    conn_id = %self.id,
                    imei = %imei,
                    lat = persisted.latitude,
                    lng = persisted.longitude,
                    "fix accepted"
                );
                self.ctx.sink.store_fix(persisted);
            }
            Payload::Empty => {
                debug!(conn_id = %self.id, packet_type = %rec.packet_type, "frame without payload");
            }
        }
    }

    async fn on_undecodable(&mut self, frame: &[u8], reason: String) -> Result<(), CloseReason> {
        let raw_hex = hex::encode_upper(frame);
        match self.state.imei().map(str::to_owned) {
            Some(imei) => {
                warn!(conn_id = %self.id, imei = %imei, reason = %reason, "unrecognized frame, kept as raw");
                self.ctx.sink.store_raw(RawPayload {
                    raw_hex,
                    imei: Some(imei),
                    peer: Some(self.peer.to_string()),
                    reason,
                    received_at: now(),
                });
                Ok(())
            }
            None => {
                warn!(conn_id = %self.id, peer = %self.peer, reason = %reason, raw = %raw_hex, "unrecognized frame before login");
                if self.ctx.guard.record_failure(self.peer.ip()).await {
                    return Err(CloseReason::Blocked);
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self, reason: &CloseReason) {
        let imei = self.ctx.sessions.remove(self.id).await;
        self.state = ConnState::Closed;
        let _ = self.stream.shutdown().await;
        info!(
            conn_id = %self.id,
            peer = %self.peer,
            imei = imei.as_deref().unwrap_or("-"),
            reason = %reason,
            "connection closed"
        );
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}
