//! CRC-16/XMODEM as used by GT06 frames.

const POLY: u16 = 0x1021;

/// CRC-16/XMODEM over the half-open range `bytes[start..end]`.
///
/// Polynomial 0x1021, initial value 0, MSB-first, no final XOR. Out-of-range
/// bounds are clamped to the slice, so an empty or inverted range yields 0.
pub fn crc16_xmodem(bytes: &[u8], start: usize, end: usize) -> u16 {
    let end = end.min(bytes.len());
    if start >= end {
        return 0;
    }
    bytes[start..end].iter().fold(0u16, |crc, &b| {
        let mut crc = crc ^ (u16::from(b) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
        crc
    })
}
