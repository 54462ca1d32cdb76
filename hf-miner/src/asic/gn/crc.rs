//! CRC8 used by GN frame headers.

use crc_all::CrcAlgo;

/// Calculates the 8-bit header CRC over a slice of bytes.
///
/// The algorithm uses polynomial 0x07 with an initial value of 0xff, no bit
/// reflection and no output XOR. On the wire it covers the six header bytes
/// between the 0xaa marker and the CRC byte itself.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC8_INIT;
    CRC8.update_crc(&mut crc, data);
    CRC8.finish_crc(&crc)
}

/// Checks a complete 8-byte header (marker included) against its CRC byte.
pub fn header_crc_is_valid(header: &[u8]) -> bool {
    header.len() >= 8 && crc8(&header[1..7]) == header[7]
}

const CRC8_INIT: u8 = 0xff;

const CRC8: CrcAlgo<u8> = CrcAlgo::<u8>::new(
    0x07,      // polynomial
    8,         // width
    CRC8_INIT, // init
    0,         // xorout
    false,     // reflect
);
