//! Protocol detection and the ordered decoder registry.

use crate::decoder::Gt06Decoder;
use crate::frame::FrameError;
use crate::record::DecodedRecord;
use thiserror::Error;

pub const TAG_GT06: &str = "GT06";
pub const TAG_TELTONIKA: &str = "TELTONIKA";
pub const TAG_ASCII_IMEI: &str = "ASCII-IMEI";
pub const TAG_FALLBACK: &str = "FALLBACK";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),
    #[error("packet type 0x{packet_type:02X} needs {needed} bytes, got {len}")]
    Truncated {
        packet_type: u8,
        needed: usize,
        len: usize,
    },
    #[error("IMEI field contains non-BCD nibble 0x{0:X}")]
    BadImei(u8),
    #[error("no plausible coordinates at any candidate offset")]
    NoCoordinates,
}

/// Result of offering one packet to a decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// The packet does not belong to this decoder's family.
    NotThisProtocol,
    /// The decoder claims the packet but cannot extract it.
    Invalid(DecodeError),
    /// Decoded; inspect [`DecodedRecord::payload`] for what it carries.
    Decoded(DecodedRecord),
}

impl DecodeOutcome {
    pub fn into_record(self) -> Option<DecodedRecord> {
        match self {
            DecodeOutcome::Decoded(rec) => Some(rec),
            _ => None,
        }
    }
}

/// One protocol family.
pub trait FrameDecoder: Send + Sync {
    /// Tag stamped on every record this decoder produces.
    fn id(&self) -> &'static str;

    /// Decode one already-delimited packet.
    fn decode(&self, packet: &[u8]) -> DecodeOutcome;

    /// Reply the device expects for `packet`, if any.
    fn build_ack(&self, _packet: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Guess the protocol family from header bytes alone.
pub fn detect(prefix: &[u8]) -> &'static str {
    if prefix.len() < 4 {
        return TAG_FALLBACK;
    }
    if prefix[..2] == [0x78, 0x78] || prefix[..2] == [0x79, 0x79] {
        return TAG_GT06;
    }
    if prefix[0] == 0x00 && prefix.len() > 8 {
        return TAG_TELTONIKA;
    }
    let text = String::from_utf8_lossy(prefix);
    if text.to_ascii_lowercase().contains("imei") {
        return TAG_ASCII_IMEI;
    }
    TAG_FALLBACK
}

/// Decoders tried in registration order; the first that decodes wins.
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn FrameDecoder>>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = DecoderRegistry::empty();
        registry.register(Gt06Decoder);
        registry
    }
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        DecoderRegistry {
            decoders: Vec::new(),
        }
    }

    /// Append a decoder at the lowest priority.
    pub fn register(&mut self, decoder: impl FrameDecoder + 'static) {
        self.decoders.push(Box::new(decoder));
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.id()).collect()
    }

    /// Offer `packet` to each decoder in order.
    ///
    /// The first `Decoded` wins and is stamped with that decoder's tag. If
    /// none decodes, the first `Invalid` is returned so the caller learns why
    /// a claimed packet failed.
    pub fn classify(&self, packet: &[u8]) -> DecodeOutcome {
        let mut first_error = None;
        for decoder in &self.decoders {
            match decoder.decode(packet) {
                DecodeOutcome::Decoded(mut rec) => {
                    rec.protocol = decoder.id().to_owned();
                    return DecodeOutcome::Decoded(rec);
                }
                DecodeOutcome::Invalid(e) => {
                    first_error.get_or_insert(e);
                }
                DecodeOutcome::NotThisProtocol => {}
            }
        }
        match first_error {
            Some(e) => DecodeOutcome::Invalid(e),
            None => DecodeOutcome::NotThisProtocol,
        }
    }

    pub fn decode(&self, packet: &[u8]) -> Option<DecodedRecord> {
        self.classify(packet).into_record()
    }

    /// First acknowledgment any decoder produces for `packet`.
    pub fn build_ack(&self, packet: &[u8]) -> Option<Vec<u8>> {
        self.decoders.iter().find_map(|d| d.build_ack(packet))
    }
}
