//! GT06 frame builders.
//!
//! Every builder computes the CRC over type..serial, the same range the
//! gateway checks and uses for its own acknowledgments.

use gt06_core::crc16_xmodem;

const DEGREE_SCALE: f64 = 1_800_000.0;

/// Wrap `type + payload + serial` in a short (`78 78`) frame.
pub fn short_frame(packet_type: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let body = body(packet_type, payload, serial);
    let mut out = vec![0x78, 0x78, (body.len() + 2) as u8];
    finish(&mut out, &body);
    out
}

/// Wrap `type + payload + serial` in a long (`79 79`) frame.
pub fn long_frame(packet_type: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let body = body(packet_type, payload, serial);
    let mut out = vec![0x79, 0x79];
    out.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
    finish(&mut out, &body);
    out
}

fn body(packet_type: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(payload.len() + 3);
    body.push(packet_type);
    body.extend_from_slice(payload);
    body.extend_from_slice(&serial.to_be_bytes());
    body
}

fn finish(out: &mut Vec<u8>, body: &[u8]) {
    let crc = crc16_xmodem(body, 0, body.len());
    out.extend_from_slice(body);
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&[0x0D, 0x0A]);
}

/// Pack decimal digits as BCD, left-padded with zero to 16 nibbles.
pub fn imei_bcd(imei: &str) -> [u8; 8] {
    let padded = format!("{:0>16}", imei);
    let digits: Vec<u8> = padded.bytes().map(|b| b - b'0').collect();
    let mut out = [0u8; 8];
    for (i, pair) in digits.chunks(2).take(8).enumerate() {
        out[i] = (pair[0] << 4) | pair[1];
    }
    out
}

pub fn login_frame(imei: &str, serial: u16) -> Vec<u8> {
    short_frame(0x01, &imei_bcd(imei), serial)
}

/// Heartbeat with terminal info, voltage level, GSM signal and alarm bytes.
pub fn heartbeat_frame(serial: u16) -> Vec<u8> {
    short_frame(0x13, &[0x40, 0x04, 0x04, 0x00, 0x01], serial)
}

pub fn status_frame(serial: u16) -> Vec<u8> {
    short_frame(0x23, &[0x40, 0x04, 0x04, 0x00, 0x01], serial)
}

/// A GPS position report, encoded with the hemisphere bits for its signs.
#[derive(Debug, Clone)]
pub struct GpsReport {
    packet_type: u8,
    time: [u8; 6],
    latitude: f64,
    longitude: f64,
    speed: u8,
    course: u16,
    fix_valid: bool,
    satellite_byte: bool,
    long_form: bool,
}

impl GpsReport {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GpsReport {
            packet_type: 0x12,
            time: [25, 10, 28, 9, 30, 0],
            latitude,
            longitude,
            speed: 0,
            course: 0,
            fix_valid: true,
            satellite_byte: true,
            long_form: false,
        }
    }

    pub fn packet_type(mut self, packet_type: u8) -> Self {
        self.packet_type = packet_type;
        self
    }

    /// `[years since 2000, month, day, hour, minute, second]`
    pub fn time(mut self, time: [u8; 6]) -> Self {
        self.time = time;
        self
    }

    pub fn speed(mut self, speed: u8) -> Self {
        self.speed = speed;
        self
    }

    pub fn course(mut self, course: u16) -> Self {
        self.course = course;
        self
    }

    pub fn no_fix(mut self) -> Self {
        self.fix_valid = false;
        self
    }

    /// Omit the satellite-count byte ahead of the latitude.
    pub fn without_satellite_byte(mut self) -> Self {
        self.satellite_byte = false;
        self
    }

    pub fn long_form(mut self) -> Self {
        self.long_form = true;
        self
    }

    pub fn course_status(&self) -> u16 {
        let mut word = self.course & 0x03FF;
        if self.fix_valid {
            word |= 0x1000;
        }
        if self.latitude >= 0.0 {
            word |= 0x0400;
        }
        if self.longitude < 0.0 {
            word |= 0x0800;
        }
        word
    }

    pub fn encode(&self, serial: u16) -> Vec<u8> {
        let mut payload = self.time.to_vec();
        if self.satellite_byte {
            payload.push(0xCC);
        }
        let lat = (self.latitude.abs() * DEGREE_SCALE).round() as i32;
        let lng = (self.longitude.abs() * DEGREE_SCALE).round() as i32;
        payload.extend_from_slice(&lat.to_be_bytes());
        payload.extend_from_slice(&lng.to_be_bytes());
        payload.push(self.speed);
        payload.extend_from_slice(&self.course_status().to_be_bytes());
        // MCC, MNC, LAC, cell id
        payload.extend_from_slice(&[0x01, 0xCC, 0x00, 0x28, 0x7D, 0x00, 0x1F, 0xB8]);
        if self.long_form {
            long_frame(self.packet_type, &payload, serial)
        } else {
            short_frame(self.packet_type, &payload, serial)
        }
    }
}
