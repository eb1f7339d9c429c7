//! Acknowledgment frames sent back to the device.

use crate::checksum::crc16_xmodem;
use crate::frame::{Frame, FrameKind, TERMINATOR};
use crate::record::PacketType;

/// Length field of every reply: type + serial + crc.
const ACK_LEN: u8 = 0x05;

/// Build the reply a device expects for `packet`.
///
/// Login, heartbeat, status and GPS frames are acknowledged by echoing the
/// type byte and serial number in a frame of the same short/long form. The
/// CRC covers the reply's type and serial bytes. Returns `None` for packets
/// that are not valid frames or whose type has no acknowledgment.
pub fn build_ack(packet: &[u8]) -> Option<Vec<u8>> {
    let frame = Frame::parse(packet).ok()?;
    let packet_type = PacketType::from_byte(frame.type_byte())?;
    Some(encode_ack(frame.kind(), packet_type, frame.serial()))
}

/// Encode a reply frame for `packet_type` with the given serial number.
pub fn encode_ack(kind: FrameKind, packet_type: PacketType, serial: [u8; 2]) -> Vec<u8> {
    let mut ack = Vec::with_capacity(11);
    ack.extend_from_slice(&kind.magic());
    match kind {
        FrameKind::Short => ack.push(ACK_LEN),
        FrameKind::Long => ack.extend_from_slice(&[0x00, ACK_LEN]),
    }
    let type_index = ack.len();
    ack.push(packet_type.as_byte());
    ack.extend_from_slice(&serial);
    let crc = crc16_xmodem(&ack, type_index, ack.len());
    ack.extend_from_slice(&crc.to_be_bytes());
    ack.extend_from_slice(&TERMINATOR);
    ack
}
