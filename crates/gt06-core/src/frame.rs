//! GT06 frame layout and stream reassembly.
//!
//! ```text
//! short: 78 78 [len:1]          [type:1] [payload...] [serial:2] [crc:2] 0D 0A
//! long:  79 79 [len_hi] [len_lo] [type:1] [payload...] [serial:2] [crc:2] 0D 0A
//! ```
//!
//! `len` counts the bytes from `type` through `crc` inclusive.

use crate::checksum::crc16_xmodem;
use thiserror::Error;

pub const SHORT_MAGIC: [u8; 2] = [0x78, 0x78];
pub const LONG_MAGIC: [u8; 2] = [0x79, 0x79];
pub const TERMINATOR: [u8; 2] = [0x0D, 0x0A];

/// Smallest structurally valid short frame: magic, len, type, serial, crc, stop.
pub const MIN_SHORT_FRAME: usize = 10;
/// Smallest structurally valid long frame.
pub const MIN_LONG_FRAME: usize = 11;

/// Largest frame the reassembly buffer will wait for.
pub const DEFAULT_MAX_FRAME: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame magic {0:02X?}")]
    BadMagic(Vec<u8>),
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("declared length {declared} does not match {actual} received bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("declared frame length {0} is below the minimum")]
    BadLength(usize),
    #[error("frame of {0} bytes exceeds the reassembly limit")]
    Oversized(usize),
    #[error("missing 0D 0A terminator")]
    BadTerminator,
}

/// Short (`78 78`) or long (`79 79`) framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Short,
    Long,
}

impl FrameKind {
    /// Classify a buffer by its first two bytes.
    pub fn from_magic(bytes: &[u8]) -> Option<FrameKind> {
        match bytes.get(..2)? {
            m if m == SHORT_MAGIC => Some(FrameKind::Short),
            m if m == LONG_MAGIC => Some(FrameKind::Long),
            _ => None,
        }
    }

    pub fn magic(self) -> [u8; 2] {
        match self {
            FrameKind::Short => SHORT_MAGIC,
            FrameKind::Long => LONG_MAGIC,
        }
    }

    /// Index of the type byte within a frame.
    pub fn type_index(self) -> usize {
        match self {
            FrameKind::Short => 3,
            FrameKind::Long => 4,
        }
    }

    fn min_len(self) -> usize {
        match self {
            FrameKind::Short => MIN_SHORT_FRAME,
            FrameKind::Long => MIN_LONG_FRAME,
        }
    }

    /// Total frame size implied by the length field, once enough of the
    /// header is present to read it.
    fn declared_total(self, bytes: &[u8]) -> Option<(usize, usize)> {
        match self {
            FrameKind::Short => bytes.get(2).map(|&len| (len as usize, len as usize + 5)),
            FrameKind::Long => bytes.get(2..4).map(|b| {
                let len = u16::from_be_bytes([b[0], b[1]]) as usize;
                (len, len + 6)
            }),
        }
    }
}

/// A borrowed view of one complete, structurally valid frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    bytes: &'a [u8],
    kind: FrameKind,
}

impl<'a> Frame<'a> {
    /// Validate magic, minimum length, length field and terminator.
    ///
    /// The checksum is not enforced here; see [`Frame::checksum_matches`].
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        let kind = FrameKind::from_magic(bytes)
            .ok_or_else(|| FrameError::BadMagic(bytes.iter().take(2).copied().collect()))?;
        if bytes.len() < kind.min_len() {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let (_, declared) = kind
            .declared_total(bytes)
            .ok_or(FrameError::TooShort(bytes.len()))?;
        if declared != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        if bytes[bytes.len() - 2..] != TERMINATOR {
            return Err(FrameError::BadTerminator);
        }
        Ok(Frame { bytes, kind })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn type_index(&self) -> usize {
        self.kind.type_index()
    }

    pub fn type_byte(&self) -> u8 {
        self.bytes[self.type_index()]
    }

    /// Bytes between the type byte and the serial number.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.type_index() + 1..self.serial_index()]
    }

    /// Index of the first serial byte (the two bytes before the CRC).
    pub fn serial_index(&self) -> usize {
        self.bytes.len() - 6
    }

    pub fn serial(&self) -> [u8; 2] {
        let i = self.serial_index();
        [self.bytes[i], self.bytes[i + 1]]
    }

    pub fn crc(&self) -> u16 {
        let i = self.bytes.len() - 4;
        u16::from_be_bytes([self.bytes[i], self.bytes[i + 1]])
    }

    /// Whether the trailing CRC equals CRC-16/XMODEM over type..serial.
    pub fn checksum_matches(&self) -> bool {
        crc16_xmodem(self.bytes, self.type_index(), self.bytes.len() - 4) == self.crc()
    }
}

// ---------------------------------------------------------------------------
// Stream reassembly
// ---------------------------------------------------------------------------

/// Accumulates socket reads and yields one delimited frame at a time.
///
/// TCP may split a frame across reads or coalesce several frames into one
/// read; the length field decides where each frame ends.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        FrameBuffer::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameBuffer {
    pub fn new(max_frame: usize) -> Self {
        FrameBuffer {
            buf: Vec::with_capacity(max_frame.min(4096)),
            max_frame,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. On `Err` the buffer is left
    /// untouched; call [`FrameBuffer::resync`] or drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let head = &self.buf[..self.buf.len().min(2)];
        let magic_ok = head
            .iter()
            .all(|&b| b == SHORT_MAGIC[0] || b == LONG_MAGIC[0])
            && head.windows(2).all(|w| w[0] == w[1]);
        if !magic_ok {
            return Err(FrameError::BadMagic(head.to_vec()));
        }
        let Some(kind) = FrameKind::from_magic(&self.buf) else {
            return Ok(None);
        };
        let Some((declared, total)) = kind.declared_total(&self.buf) else {
            return Ok(None);
        };
        if total < kind.min_len() {
            return Err(FrameError::BadLength(declared));
        }
        if total > self.max_frame {
            return Err(FrameError::Oversized(total));
        }
        if self.buf.len() < total {
            return Ok(None);
        }
        if self.buf[total - 2..total] != TERMINATOR {
            return Err(FrameError::BadTerminator);
        }
        Ok(Some(self.buf.drain(..total).collect()))
    }

    /// Discard bytes up to the next frame magic after the buffer head and
    /// return what was discarded.
    ///
    /// A trailing lone magic byte is kept; it may start a frame whose second
    /// byte has not arrived yet.
    pub fn resync(&mut self) -> Vec<u8> {
        let len = self.buf.len();
        let next = self
            .buf
            .windows(2)
            .skip(1)
            .position(|w| w == SHORT_MAGIC || w == LONG_MAGIC)
            .map(|p| p + 1)
            .unwrap_or_else(|| match self.buf.last() {
                Some(&b) if len > 1 && (b == SHORT_MAGIC[0] || b == LONG_MAGIC[0]) => len - 1,
                _ => len,
            });
        self.buf.drain(..next).collect()
    }

    /// Take everything still buffered.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
