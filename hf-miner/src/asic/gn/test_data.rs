//! Wire frames shared by the protocol, parser and session tests.
//!
//! The controller side of a one-die, eight-core board: the handshake reply,
//! a status report with every core busy, a nonce report and a notice.

/// OP_USB_INIT reply: 1 die, 8 cores, GN ASIC with a 25 MHz reference clock.
///
/// Payload: init base (firmware 2, hardware 3, serial 0xdeadbeef, status 0,
/// clock 600), config data (500 ms periodic status, 30 s watchdog, sensors
/// disabled, ...), then a 4-byte core map with all 8 cores good.
pub const INIT_ACK_FRAME: &[u8] = &[
    0xaa, 0x80, 0x01, 0x08, 0x01, 0x19, 0x09, 0x2f, // header
    0x02, 0x00, 0x03, 0x00, 0xef, 0xbe, 0xad, 0xde, // firmware, hardware, serial
    0x00, 0x00, 0x00, 0x00, 0x58, 0x02, 0x00, 0x00, // status, modulus, clock, inflight
    0xf4, 0x19, 0x0a, 0x9e, 0x05, 0x86, 0x01, 0x64, // config data
    0xe8, 0x43, 0x03, 0x00, 0xe8, 0x03, 0xf4, 0x01, //
    0xff, 0x00, 0x00, 0x00, // core map
];

/// OP_STATUS from die 0, last sequence 7, 58.5 °C, every rail at 0.6 V.
/// Core map 0x5555: all 8 cores active, none pending.
pub const STATUS_FRAME: &[u8] = &[
    0xaa, 0x0c, 0x00, 0x00, 0x07, 0x00, 0x03, 0x5b, // header
    0x00, 0x08, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, // monitor
    0x55, 0x55, 0x00, 0x00, // core map
];

/// OP_NONCE from die 0: nonce 0x12345678, sequence 5, ntime 0x1123.
pub const NONCE_FRAME: &[u8] = &[
    0xaa, 0x0a, 0x00, 0x00, 0x00, 0x00, 0x02, 0xbc, // header
    0x78, 0x56, 0x34, 0x12, 0x05, 0x00, 0x23, 0x11, // candidate
];

/// OP_USB_NOTICE code 7, extra data 0xdeadbeef, message "hot".
pub const NOTICE_FRAME: &[u8] = &[
    0xaa, 0x8b, 0x00, 0x00, 0x07, 0x00, 0x02, 0x6f, // header
    0xef, 0xbe, 0xad, 0xde, 0x68, 0x6f, 0x74, 0x00, // extra data, "hot\0"
];
