//! GT06 packet decoding.
//!
//! # Coordinates
//!
//! Latitude and longitude are 4-byte big-endian integers in units of
//! 1/1,800,000 degree. The sign comes from the course/status word, never from
//! a configured hemisphere:
//!
//! | bit      | meaning                          |
//! |----------|----------------------------------|
//! | `0x1000` | GPS fix valid                    |
//! | `0x0800` | set = west longitude             |
//! | `0x0400` | set = north latitude             |
//! | `0x03FF` | course in degrees                |
//!
//! # Offsets
//!
//! Most firmware puts a satellite-count byte between the timestamp and the
//! latitude; some omit it. The decoder tries the latitude at type+8 and then
//! type+7, taking the first candidate that yields a plausible, non-zero
//! pair. This is a heuristic, not a protocol guarantee.

use crate::ack::build_ack;
use crate::frame::{Frame, FrameKind};
use crate::record::{DecodedRecord, PacketType, PositionFix};
use crate::registry::{DecodeError, DecodeOutcome, FrameDecoder, TAG_GT06};
use chrono::{NaiveDate, NaiveDateTime};

const DEGREE_SCALE: f64 = 1_800_000.0;
/// Coordinates closer to zero than this are treated as misaligned reads.
const ZERO_EPSILON: f64 = 1e-6;

const FIX_VALID: u16 = 0x1000;
const WEST: u16 = 0x0800;
const NORTH: u16 = 0x0400;
const COURSE_MASK: u16 = 0x03FF;

/// Latitude, longitude, speed and course/status: 4 + 4 + 1 + 2 bytes.
const POSITION_BLOCK: usize = 11;
const IMEI_BYTES: usize = 8;
const EXTENDED_SCAN_START: usize = 14;
const EXTENDED_MAX_SPEED: u8 = 200;

/// Decoder for `78 78` / `79 79` framed trackers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gt06Decoder;

impl FrameDecoder for Gt06Decoder {
    fn id(&self) -> &'static str {
        TAG_GT06
    }

    fn decode(&self, packet: &[u8]) -> DecodeOutcome {
        if FrameKind::from_magic(packet).is_none() {
            return DecodeOutcome::NotThisProtocol;
        }
        match decode_frame(packet) {
            Ok(rec) => DecodeOutcome::Decoded(rec),
            Err(e) => DecodeOutcome::Invalid(e),
        }
    }

    fn build_ack(&self, packet: &[u8]) -> Option<Vec<u8>> {
        build_ack(packet)
    }
}

fn decode_frame(packet: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let frame = Frame::parse(packet)?;
    let type_byte = frame.type_byte();
    let packet_type = PacketType::from_byte(type_byte).ok_or(DecodeError::UnknownType(type_byte))?;
    let mut rec = DecodedRecord::new(TAG_GT06, packet_type, packet);

    match packet_type {
        PacketType::Login => {
            let payload = frame.payload();
            if payload.len() < IMEI_BYTES {
                return Err(DecodeError::Truncated {
                    packet_type: type_byte,
                    needed: IMEI_BYTES,
                    len: payload.len(),
                });
            }
            rec.imei = Some(decode_imei(&payload[..IMEI_BYTES])?);
        }
        PacketType::Heartbeat | PacketType::Status => {}
        PacketType::Gps | PacketType::GpsLbs => {
            let (gps_time, fix) = decode_gps(&frame)?;
            rec.gps_time = gps_time;
            rec.fix = fix;
        }
        PacketType::GpsExtended => {
            rec.fix = Some(scan_extended(&frame)?);
        }
    }
    Ok(rec)
}

/// Unpack an 8-byte BCD IMEI.
///
/// `0xF` nibbles pad odd-length numbers and are dropped; the leading zero
/// nibble that pads a 15-digit IMEI to 16 nibbles is stripped.
pub fn decode_imei(bcd: &[u8]) -> Result<String, DecodeError> {
    let mut digits = String::with_capacity(bcd.len() * 2);
    for &b in bcd {
        for nibble in [b >> 4, b & 0x0F] {
            match nibble {
                0x0F => {}
                0..=9 => digits.push(char::from(b'0' + nibble)),
                other => return Err(DecodeError::BadImei(other)),
            }
        }
    }
    if digits.len() == bcd.len() * 2 && digits.starts_with('0') {
        digits.remove(0);
    }
    if digits.is_empty() {
        return Err(DecodeError::BadImei(0x0F));
    }
    Ok(digits)
}

/// Six binary bytes: years since 2000, month, day, hour, minute, second.
fn device_time(b: &[u8]) -> Option<NaiveDateTime> {
    let &[yy, mo, dd, hh, mi, ss] = b else {
        return None;
    };
    NaiveDate::from_ymd_opt(2000 + i32::from(yy), u32::from(mo), u32::from(dd))?.and_hms_opt(
        u32::from(hh),
        u32::from(mi),
        u32::from(ss),
    )
}

#[derive(Debug, Clone, Copy)]
struct RawPosition {
    lat_deg: f64,
    lng_deg: f64,
    speed: u8,
    course_status: u16,
}

impl RawPosition {
    fn course(&self) -> u16 {
        self.course_status & COURSE_MASK
    }

    fn fix_valid(&self) -> bool {
        self.course_status & FIX_VALID != 0
    }

    fn into_fix(self) -> PositionFix {
        let latitude = if self.course_status & NORTH != 0 {
            self.lat_deg
        } else {
            -self.lat_deg
        };
        let longitude = if self.course_status & WEST != 0 {
            -self.lng_deg
        } else {
            self.lng_deg
        };
        PositionFix {
            latitude,
            longitude,
            speed_kph: f64::from(self.speed),
            course: self.course(),
            gps_valid: self.fix_valid(),
        }
    }
}

fn int_at(b: &[u8], off: usize) -> i32 {
    i32::from_be_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Read a position block at `off` if it fits before `end` and looks like a
/// real coordinate pair.
fn read_position(bytes: &[u8], off: usize, end: usize) -> Option<RawPosition> {
    if off + POSITION_BLOCK > end {
        return None;
    }
    let lat_deg = f64::from(int_at(bytes, off)).abs() / DEGREE_SCALE;
    let lng_deg = f64::from(int_at(bytes, off + 4)).abs() / DEGREE_SCALE;
    let plausible = (lat_deg > ZERO_EPSILON || lng_deg > ZERO_EPSILON)
        && lat_deg <= 90.0
        && lng_deg <= 180.0;
    if !plausible {
        return None;
    }
    Some(RawPosition {
        lat_deg,
        lng_deg,
        speed: bytes[off + 8],
        course_status: u16::from_be_bytes([bytes[off + 9], bytes[off + 10]]),
    })
}

fn decode_gps(frame: &Frame<'_>) -> Result<(Option<NaiveDateTime>, Option<PositionFix>), DecodeError> {
    let bytes = frame.bytes();
    let t = frame.type_index();
    let end = frame.serial_index();
    // Timestamp plus at least the shorter of the two candidate layouts.
    let needed = 6 + POSITION_BLOCK;
    if end < t + 1 + needed {
        return Err(DecodeError::Truncated {
            packet_type: frame.type_byte(),
            needed,
            len: frame.payload().len(),
        });
    }

    let gps_time = device_time(&bytes[t + 1..t + 7]);
    // No fix, or nothing plausible at either offset: the report is kept but
    // carries no position.
    let fix = [t + 8, t + 7]
        .into_iter()
        .find_map(|off| read_position(bytes, off, end))
        .filter(RawPosition::fix_valid)
        .map(RawPosition::into_fix);
    Ok((gps_time, fix))
}

/// Best-effort scan for a position block in a 0x94 information packet.
fn scan_extended(frame: &Frame<'_>) -> Result<PositionFix, DecodeError> {
    let bytes = frame.bytes();
    let end = frame.serial_index();
    (EXTENDED_SCAN_START..end)
        .filter_map(|off| read_position(bytes, off, end))
        .find(|raw| raw.fix_valid() && raw.speed <= EXTENDED_MAX_SPEED && raw.course() <= 360)
        .map(RawPosition::into_fix)
        .ok_or(DecodeError::NoCoordinates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DecodeOutcome;
    use chrono::NaiveDate;

    fn decode_hex(s: &str) -> DecodeOutcome {
        Gt06Decoder.decode(&hex::decode(s).unwrap())
    }

    fn record(s: &str) -> DecodedRecord {
        match decode_hex(s) {
            DecodeOutcome::Decoded(rec) => rec,
            other => panic!("expected a decoded record, got {:?}", other),
        }
    }

    #[test]
    fn imei_from_documented_login_bytes() {
        let imei = decode_imei(&[0x03, 0x54, 0x77, 0x83, 0x45, 0x25, 0x36, 0x71]).unwrap();
        assert_eq!(imei, "354778345253671");
        assert_eq!(imei.len(), 15);
    }

    #[test]
    fn imei_with_trailing_padding_nibble() {
        let imei = decode_imei(&[0x35, 0x47, 0x78, 0x34, 0x52, 0x53, 0x67, 0x1F]).unwrap();
        assert_eq!(imei, "354778345253671");
    }

    #[test]
    fn imei_rejects_hex_digits() {
        assert_eq!(
            decode_imei(&[0x03, 0x54, 0x7A, 0x83, 0x45, 0x25, 0x36, 0x71]),
            Err(DecodeError::BadImei(0x0A))
        );
        assert_eq!(decode_imei(&[0xFF; 8]), Err(DecodeError::BadImei(0x0F)));
    }

    #[test]
    fn login_record_carries_only_identity() {
        let rec = record("78780D010354778345253671008C4B9F0D0A");
        assert_eq!(rec.packet_type, PacketType::Login);
        assert_eq!(rec.imei.as_deref(), Some("354778345253671"));
        assert!(rec.fix.is_none());
        assert!(rec.gps_time.is_none());
        assert!(rec.acc.is_none() && rec.battery_mv.is_none() && rec.mileage_m.is_none());
        assert_eq!(rec.raw_hex, "78780D010354778345253671008C4B9F0D0A");
    }

    #[test]
    fn truncated_login_is_invalid() {
        // Type 0x01 with only two payload bytes.
        let mut raw = vec![0x78, 0x78, 0x07, 0x01, 0x03, 0x54, 0x00, 0x01];
        let crc = crate::checksum::crc16_xmodem(&raw, 3, 8);
        raw.extend_from_slice(&crc.to_be_bytes());
        raw.extend_from_slice(&[0x0D, 0x0A]);
        assert!(matches!(
            Gt06Decoder.decode(&raw),
            DecodeOutcome::Invalid(DecodeError::Truncated { packet_type: 0x01, .. })
        ));
    }

    #[test]
    fn heartbeat_and_status_decode_empty() {
        let hb = record("78780A1340040400010002B0F80D0A");
        assert_eq!(hb.packet_type, PacketType::Heartbeat);
        assert!(hb.imei.is_none() && hb.fix.is_none() && hb.gps_time.is_none());

        let st = record("78780A234004040001000586C30D0A");
        assert_eq!(st.packet_type, PacketType::Status);
        assert!(st.imei.is_none() && st.fix.is_none());
    }

    #[test]
    fn gps_north_east_uses_wire_hemisphere_bits() {
        // Course/status 0x148F: fix valid, north bit set, east.
        let rec = record(
            "78781F120B081D112E10CC027AC7E50C46584900148F01CC00287D001FB8000336CB0D0A",
        );
        let fix = rec.fix.unwrap();
        assert!((fix.latitude - 23.111665).abs() < 1e-6);
        assert!((fix.longitude - 114.409285).abs() < 1e-6);
        assert_eq!(fix.course, 0x8F);
        assert_eq!(fix.speed_kph, 0.0);
        assert!(fix.gps_valid);
        assert_eq!(
            rec.gps_time,
            NaiveDate::from_ymd_opt(2011, 8, 29).unwrap().and_hms_opt(17, 46, 16)
        );
    }

    #[test]
    fn gps_north_bit_clear_is_southern_hemisphere() {
        // Course/status 0x105A: fix valid, north bit clear, east, course 90.
        let rec = record(
            "78781F22190A1C091E00CC01A76EAC0308D2F42A105A01CC00287D001FB800049BB60D0A",
        );
        assert_eq!(rec.packet_type, PacketType::GpsLbs);
        let fix = rec.fix.unwrap();
        assert!((fix.latitude + 15.4167).abs() < 1e-6);
        assert!((fix.longitude - 28.2833).abs() < 1e-6);
        assert_eq!(fix.speed_kph, 42.0);
        assert_eq!(fix.course, 90);
    }

    #[test]
    fn gps_west_bit_negates_longitude() {
        // No satellite byte: latitude sits at type+7. Status 0x1D0E is
        // fix valid, west, north, course 270.
        let rec = record(
            "78781E12190A1C091E0001A76EAC0308D2F40A1D0E01CC00287D001FB800062EE10D0A",
        );
        let fix = rec.fix.unwrap();
        assert!((fix.latitude - 15.4167).abs() < 1e-6);
        assert!((fix.longitude + 28.2833).abs() < 1e-6);
        assert_eq!(fix.course, 270);
        assert_eq!(fix.speed_kph, 10.0);
    }

    #[test]
    fn gps_without_fix_bit_has_no_position() {
        let rec = record(
            "78781F12190A1C091E00CC01A76EAC0308D2F400005A01CC00287D001FB8000500830D0A",
        );
        assert_eq!(rec.packet_type, PacketType::Gps);
        assert!(rec.fix.is_none());
        assert!(rec.gps_time.is_some());
    }

    fn gps_frame(lat: i32, lng: i32, course_status: u16) -> Vec<u8> {
        let mut raw = vec![0x78, 0x78, 0x1F, 0x12, 25, 10, 28, 9, 30, 0, 0xCC];
        raw.extend_from_slice(&lat.to_be_bytes());
        raw.extend_from_slice(&lng.to_be_bytes());
        raw.push(0x00);
        raw.extend_from_slice(&course_status.to_be_bytes());
        raw.extend_from_slice(&[0; 8]);
        raw.extend_from_slice(&[0x00, 0x07]);
        let crc = crate::checksum::crc16_xmodem(&raw, 3, raw.len());
        raw.extend_from_slice(&crc.to_be_bytes());
        raw.extend_from_slice(&[0x0D, 0x0A]);
        raw
    }

    fn decoded(raw: &[u8]) -> DecodedRecord {
        match Gt06Decoder.decode(raw) {
            DecodeOutcome::Decoded(rec) => rec,
            other => panic!("expected a decoded record, got {:?}", other),
        }
    }

    #[test]
    fn gps_without_fix_and_zero_coordinates_decodes_without_position() {
        let rec = decoded(&gps_frame(0, 0, 0x0000));
        assert_eq!(rec.packet_type, PacketType::Gps);
        assert!(rec.fix.is_none());
        assert_eq!(
            rec.gps_time,
            NaiveDate::from_ymd_opt(2025, 10, 28).unwrap().and_hms_opt(9, 30, 0)
        );
    }

    #[test]
    fn gps_with_fix_but_zero_coordinates_has_no_position() {
        let rec = decoded(&gps_frame(0, 0, 0x1000));
        assert!(rec.fix.is_none());
        assert!(rec.gps_time.is_some());
    }

    #[test]
    fn gps_with_out_of_range_latitude_has_no_position() {
        // 91 degrees north with the fix bit set.
        let rec = decoded(&gps_frame(91 * 1_800_000, 50_909_940, 0x1400));
        assert!(rec.fix.is_none());
        assert!(rec.gps_time.is_some());
    }

    #[test]
    fn unknown_type_is_invalid() {
        assert_eq!(
            decode_hex("7878058A00078C7C0D0A"),
            DecodeOutcome::Invalid(DecodeError::UnknownType(0x8A))
        );
    }

    #[test]
    fn foreign_bytes_are_not_claimed() {
        assert_eq!(Gt06Decoder.decode(b"imei:1234"), DecodeOutcome::NotThisProtocol);
        assert_eq!(Gt06Decoder.decode(&[]), DecodeOutcome::NotThisProtocol);
    }

    #[test]
    fn short_packet_with_magic_is_invalid() {
        assert!(matches!(
            Gt06Decoder.decode(&[0x78, 0x78, 0x05, 0x01]),
            DecodeOutcome::Invalid(DecodeError::Frame(_))
        ));
    }

    #[test]
    fn extended_long_frame_is_scanned() {
        // 79 79 [len] 94 [sub-type 0x0A] [9 filler bytes] [position block] [serial]
        let mut body = vec![0x94, 0x0A];
        body.extend_from_slice(&[0x00; 9]);
        body.extend_from_slice(&27_750_060i32.to_be_bytes());
        body.extend_from_slice(&50_909_940i32.to_be_bytes());
        body.push(35);
        body.extend_from_slice(&0x1000u16.to_be_bytes());
        body.extend_from_slice(&[0x00, 0x09]);
        let len = (body.len() + 2) as u16;
        let mut raw = vec![0x79, 0x79];
        raw.extend_from_slice(&len.to_be_bytes());
        raw.extend_from_slice(&body);
        let crc = crate::checksum::crc16_xmodem(&raw, 4, raw.len());
        raw.extend_from_slice(&crc.to_be_bytes());
        raw.extend_from_slice(&[0x0D, 0x0A]);

        let rec = match Gt06Decoder.decode(&raw) {
            DecodeOutcome::Decoded(rec) => rec,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(rec.packet_type, PacketType::GpsExtended);
        let fix = rec.fix.unwrap();
        assert!((fix.latitude + 15.4167).abs() < 1e-6);
        assert!((fix.longitude - 28.2833).abs() < 1e-6);
        assert_eq!(fix.speed_kph, 35.0);
        assert!(rec.gps_time.is_none());
    }
}
