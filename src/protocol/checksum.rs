//! Frame and blob integrity checks.
//!
//! The device computes both checksums independently, so the algorithms here are
//! fixed catalogue entries rather than configurable:
//!
//! - **CRC-8**: reflected polynomial 0x8C (0x31 normal form), init 0, no final
//!   XOR. This is the Dallas/Maxim 1-Wire CRC (`CRC_8_MAXIM_DOW`).
//! - **CRC-32**: IEEE 802.3 reflected, init and final XOR 0xFFFFFFFF
//!   (`CRC_32_ISO_HDLC`).

use crc::{Crc, CRC_32_ISO_HDLC, CRC_8_MAXIM_DOW};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Per-frame CRC-8 over exactly `bytes`.
pub fn checksum8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// Whole-blob CRC-32 used by the upload Start command.
pub fn checksum32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}
