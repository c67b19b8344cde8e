//! ESP32 ROM loader commands and their request payloads.
//!
//! All multi-byte request fields are little-endian 32-bit words.

use {
    crate::protocol::slip::SlipPacket,
    byteorder::LittleEndian,
};

/// Flash data block size.
pub const BLOCK_SIZE: usize = 0x400;

/// Size, sequence and two reserved words ahead of each FLASH_DATA block.
pub const DATA_HEADER_LEN: usize = 16;

/// First four SYNC payload bytes; 32 bytes of 0x55 follow.
pub const SYNC_MAGIC: [u8; 4] = [0x07, 0x07, 0x12, 0x20];

/// Length of the ASCII hex digest in an SPI_FLASH_MD5 response.
pub const MD5_HEX_LEN: usize = 32;

/// ROM loader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Erase a region and prepare to receive blocks.
    FlashBegin = 0x02,
    /// One data block.
    FlashData = 0x03,
    /// Finish flashing.
    FlashEnd = 0x04,
    /// Baud detection and handshake.
    Sync = 0x08,
    /// Flash geometry.
    SpiSetParams = 0x0B,
    /// Attach the SPI flash.
    SpiAttach = 0x0D,
    /// MD5 of a flash region.
    SpiFlashMd5 = 0x13,
}

impl Command {
    /// Command code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Name used in status lines.
    pub fn name(self) -> &'static str {
        match self {
            Self::FlashBegin => "Flash begin",
            Self::FlashData => "Flash data",
            Self::FlashEnd => "Flash end",
            Self::Sync => "Activating device",
            Self::SpiSetParams => "Set SPI parameters",
            Self::SpiAttach => "Attach SPI",
            Self::SpiFlashMd5 => "Verify",
        }
    }
}

/// SPI flash geometry sent with SPI_SET_PARAMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiFlashParams {
    /// Flash chip ID field (unused by the ROM, sent as 0).
    pub id: u32,
    /// Total flash size.
    pub total_size: u32,
    /// Erase block size.
    pub block_size: u32,
    /// Sector size.
    pub sector_size: u32,
    /// Page size.
    pub page_size: u32,
    /// Status register mask.
    pub status_mask: u32,
}

impl Default for SpiFlashParams {
    /// 4 MiB ESP32-S3 flash.
    fn default() -> Self {
        Self {
            id: 0,
            total_size: 0x40_0000,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }
}

fn request(command: Command, words: &[u32]) -> SlipPacket {
    let mut packet = SlipPacket::request(command.code());
    for &word in words {
        packet.push_u32::<LittleEndian>(word);
    }
    packet
}

/// Blocks needed for `size` bytes.
#[allow(clippy::cast_possible_truncation)]
pub fn block_count(size: usize) -> u32 {
    size.div_ceil(BLOCK_SIZE) as u32
}

/// SYNC request.
pub fn sync_packet() -> SlipPacket {
    let mut packet = SlipPacket::request(Command::Sync.code());
    packet.push_slice(&SYNC_MAGIC);
    packet.push_slice(&[0x55; 32]);
    packet
}

/// SPI_ATTACH request: two zero words.
pub fn spi_attach_packet() -> SlipPacket {
    request(Command::SpiAttach, &[0, 0])
}

/// SPI_SET_PARAMS request.
pub fn spi_params_packet(params: &SpiFlashParams) -> SlipPacket {
    request(
        Command::SpiSetParams,
        &[
            params.id,
            params.total_size,
            params.block_size,
            params.sector_size,
            params.page_size,
            params.status_mask,
        ],
    )
}

/// FLASH_BEGIN request: erase size, block count, block size, offset, 0.
#[allow(clippy::cast_possible_truncation)]
pub fn flash_begin_packet(size: u32, num_blocks: u32, offset: u32) -> SlipPacket {
    request(
        Command::FlashBegin,
        &[size, num_blocks, BLOCK_SIZE as u32, offset, 0],
    )
}

/// FLASH_DATA request for one block, padded with 0xFF to [`BLOCK_SIZE`].
///
/// The checksum covers the block only, not the 16-byte block header.
#[allow(clippy::cast_possible_truncation)]
pub fn flash_data_packet(sequence: u32, block: &[u8]) -> SlipPacket {
    let mut packet = request(Command::FlashData, &[BLOCK_SIZE as u32, sequence, 0, 0]);
    packet.push_slice(block);
    if block.len() < BLOCK_SIZE {
        packet.push_slice(&vec![0xFF; BLOCK_SIZE - block.len()]);
    }
    packet.set_checksum_start(DATA_HEADER_LEN);
    packet
}

/// FLASH_END request. The single word is 1: stay in the loader.
pub fn flash_end_packet() -> SlipPacket {
    request(Command::FlashEnd, &[1])
}

/// SPI_FLASH_MD5 request: address, size, two zero words.
pub fn flash_md5_packet(address: u32, size: u32) -> SlipPacket {
    request(Command::SpiFlashMd5, &[address, size, 0, 0])
}
