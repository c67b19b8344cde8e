//! ST USART bootloader command set (AN3155).
//!
//! Every command is sent as its code followed by the code's complement and
//! is gated by an ACK (0x79) or NACK (0x1F). Multi-byte arguments end with
//! an XOR checksum of their bytes.
//!
//! ```text
//! Write Memory:
//!   host  31 CE          -> ACK
//!   host  A3 A2 A1 A0 CS -> ACK      (address big-endian, CS = XOR)
//!   host  N  D0 .. DN CS -> ACK      (N = len - 1, CS = XOR over N and data)
//! ```

use {
    crate::protocol::xor_checksum,
    byteorder::{BigEndian, WriteBytesExt},
};

/// Autobaud/sync byte, sent without complement.
pub const SYNC: u8 = 0x7F;

/// Largest block for Read Memory and Write Memory.
pub const MAX_CHUNK: usize = 256;

/// Bytes read per sector by the fast erase check.
pub const ERASE_PROBE_LEN: usize = 255;

/// Value of erased flash.
pub const ERASED: u8 = 0xFF;

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Bootloader version and supported commands.
    Get = 0x00,
    /// Bootloader version and read protection status.
    GetVersion = 0x01,
    /// Chip product ID.
    GetId = 0x02,
    /// Read up to 256 bytes.
    ReadMemory = 0x11,
    /// Jump to user code.
    Go = 0x21,
    /// Write up to 256 bytes.
    WriteMemory = 0x31,
    /// Legacy one-byte-index erase.
    Erase = 0x43,
    /// Two-byte-index erase.
    ExtendedErase = 0x44,
    /// Enable write protection.
    WriteProtect = 0x63,
    /// Disable write protection.
    WriteUnprotect = 0x73,
    /// Enable readout protection.
    ReadoutProtect = 0x82,
    /// Disable readout protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Command code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a command by code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::Get,
            0x01 => Self::GetVersion,
            0x02 => Self::GetId,
            0x11 => Self::ReadMemory,
            0x21 => Self::Go,
            0x31 => Self::WriteMemory,
            0x43 => Self::Erase,
            0x44 => Self::ExtendedErase,
            0x63 => Self::WriteProtect,
            0x73 => Self::WriteUnprotect,
            0x82 => Self::ReadoutProtect,
            0x92 => Self::ReadoutUnprotect,
            _ => return None,
        })
    }

    /// Code followed by its complement.
    pub fn frame(self) -> [u8; 2] {
        let code = self.code();
        [code, code ^ 0xFF]
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Get => "Get",
            Self::GetVersion => "Get Version",
            Self::GetId => "Get ID",
            Self::ReadMemory => "Read Memory",
            Self::Go => "Go",
            Self::WriteMemory => "Write Memory",
            Self::Erase => "Erase",
            Self::ExtendedErase => "Extended Erase",
            Self::WriteProtect => "Write Protect",
            Self::WriteUnprotect => "Write Unprotect",
            Self::ReadoutProtect => "Readout Protect",
            Self::ReadoutUnprotect => "Readout Unprotect",
        }
    }
}

/// Big-endian address followed by its checksum.
pub fn address_frame(address: u32) -> [u8; 5] {
    let [a3, a2, a1, a0] = address.to_be_bytes();
    [a3, a2, a1, a0, xor_checksum(&[a3, a2, a1, a0])]
}

/// Read Memory length byte and its complement. `len` must be 1..=256.
#[allow(clippy::cast_possible_truncation)]
pub fn length_frame(len: usize) -> [u8; 2] {
    let n = (len - 1) as u8;
    [n, n ^ 0xFF]
}

/// Extended Erase argument: count - 1, each index, checksum; all big-endian.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
pub fn erase_frame(sectors: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(2 + sectors.len() * 2 + 1);
    frame
        .write_u16::<BigEndian>(sectors.len().saturating_sub(1) as u16)
        .unwrap();
    for &sector in sectors {
        frame
            .write_u16::<BigEndian>(sector)
            .unwrap();
    }
    frame.push(xor_checksum(&frame));
    frame
}

/// Pad a chunk with erased bytes to a multiple of four.
pub fn pad_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut padded = chunk.to_vec();
    padded.resize(chunk.len().next_multiple_of(4), ERASED);
    padded
}

/// Write Memory data argument: len - 1, data, checksum over both.
#[allow(clippy::cast_possible_truncation)]
pub fn write_frame(padded: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(padded.len() + 2);
    frame.push((padded.len() - 1) as u8);
    frame.extend_from_slice(padded);
    frame.push(xor_checksum(&frame));
    frame
}
