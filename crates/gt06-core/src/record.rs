//! Decoded packet types.

use chrono::NaiveDateTime;
use std::fmt;

/// GT06 protocol numbers understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Login,
    Gps,
    GpsLbs,
    Heartbeat,
    Status,
    /// Long-frame information packet carrying a position at an
    /// undocumented offset.
    GpsExtended,
}

impl PacketType {
    pub fn from_byte(b: u8) -> Option<PacketType> {
        match b {
            0x01 => Some(PacketType::Login),
            0x12 => Some(PacketType::Gps),
            0x22 => Some(PacketType::GpsLbs),
            0x13 => Some(PacketType::Heartbeat),
            0x23 => Some(PacketType::Status),
            0x94 => Some(PacketType::GpsExtended),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PacketType::Login => 0x01,
            PacketType::Gps => 0x12,
            PacketType::GpsLbs => 0x22,
            PacketType::Heartbeat => 0x13,
            PacketType::Status => 0x23,
            PacketType::GpsExtended => 0x94,
        }
    }

    pub fn is_position(self) -> bool {
        matches!(
            self,
            PacketType::Gps | PacketType::GpsLbs | PacketType::GpsExtended
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            PacketType::Login => "login",
            PacketType::Gps => "gps",
            PacketType::GpsLbs => "gps+lbs",
            PacketType::Heartbeat => "heartbeat",
            PacketType::Status => "status",
            PacketType::GpsExtended => "gps-extended",
        };
        write!(f, "{} (0x{:02X})", name, self.as_byte())
    }
}

/// One accepted position report. Latitude and longitude are always present.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionFix {
    /// Degrees, negative south of the equator.
    pub latitude: f64,
    /// Degrees, negative west of Greenwich.
    pub longitude: f64,
    pub speed_kph: f64,
    /// Degrees clockwise from north, 0..=360.
    pub course: u16,
    pub gps_valid: bool,
}

/// Everything extracted from one packet.
///
/// A structurally valid packet with nothing to extract (heartbeat, status,
/// a GPS report without a fix) still produces a record so the caller can
/// acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Family tag of the decoder that produced the record, e.g. `"GT06"`.
    pub protocol: String,
    pub packet_type: PacketType,
    pub imei: Option<String>,
    pub fix: Option<PositionFix>,
    /// Device-reported time, UTC without zone information.
    pub gps_time: Option<NaiveDateTime>,
    pub acc: Option<u8>,
    pub battery_mv: Option<u32>,
    pub mileage_m: Option<u32>,
    /// Uppercase hex of the whole packet.
    pub raw_hex: String,
}

/// What a record carries, for callers that branch on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload<'a> {
    /// Valid frame, nothing to store.
    Empty,
    /// A login carrying the device identifier.
    Identity(&'a str),
    /// A position fix.
    Position(&'a PositionFix),
}

impl DecodedRecord {
    pub fn new(protocol: &str, packet_type: PacketType, packet: &[u8]) -> Self {
        DecodedRecord {
            protocol: protocol.to_owned(),
            packet_type,
            imei: None,
            fix: None,
            gps_time: None,
            acc: None,
            battery_mv: None,
            mileage_m: None,
            raw_hex: hex::encode_upper(packet),
        }
    }

    pub fn payload(&self) -> Payload<'_> {
        if let Some(imei) = self.imei.as_deref() {
            return Payload::Identity(imei);
        }
        match &self.fix {
            Some(fix) => Payload::Position(fix),
            None => Payload::Empty,
        }
    }

    pub fn has_fix(&self) -> bool {
        self.fix.is_some()
    }
}
