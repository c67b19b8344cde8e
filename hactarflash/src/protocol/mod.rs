//! Wire-level building blocks shared by the bootloader clients.

pub mod slip;

pub use slip::{Direction, SlipPacket, slip_checksum};

/// Positive acknowledgement (ST bootloader and Hactar mode switch).
pub const ACK: u8 = 0x79;

/// Negative acknowledgement.
pub const NACK: u8 = 0x1F;

/// Sent by the board once it has switched into an upload mode.
pub const READY: u8 = 0x80;

/// XOR of every byte, folded left to right.
///
/// Used for every ST bootloader checksum. An empty slice folds to zero.
#[must_use]
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0, |acc, b| acc ^ b)
}
