//! Nibble-table checksum used to seal shm headers.
//!
//! Every process sharing a region must agree on this bit-for-bit, so the
//! running value is kept in 32 bits and never masked: the low 16 bits match
//! CRC-16/XMODEM while the high bits keep the shifted-out history.

const CRC_TABLE: [u32; 16] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7, 0x8108, 0x9129, 0xa14a,
    0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
];

#[inline]
fn step(crc: u32, nibble: u8) -> u32 {
    // Bits 12..16 of the running value select the table entry.
    let hi = ((crc >> 8) as u8) >> 4;
    (crc << 4) ^ CRC_TABLE[(hi ^ nibble) as usize]
}

/// Computes the checksum of `buf`, high nibble of each byte first.
pub fn calc_crc(buf: &[u8]) -> u32 {
    buf.iter()
        .fold(0u32, |crc, &b| step(step(crc, b >> 4), b & 0x0f))
}
