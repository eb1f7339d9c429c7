//! GT06-family tracker protocol: framing, decoding and acknowledgments.
//!
//! Nothing in this crate performs I/O. The gateway service feeds it byte
//! chunks read from device sockets and writes back whatever
//! [`DecoderRegistry::build_ack`] returns.

pub mod ack;
pub mod checksum;
pub mod decoder;
pub mod frame;
pub mod record;
pub mod registry;

pub use ack::build_ack;
pub use checksum::crc16_xmodem;
pub use decoder::Gt06Decoder;
pub use frame::{Frame, FrameBuffer, FrameError, FrameKind};
pub use record::{DecodedRecord, PacketType, Payload, PositionFix};
pub use registry::{DecodeError, DecodeOutcome, DecoderRegistry, FrameDecoder, detect};
