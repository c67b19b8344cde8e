//! Firmware images, STM32 sector layouts and where they come from.

use md5::{Digest, Md5};

use crate::error::{Error, Result};
use crate::target::Target;

/// A binary to be written at a fixed flash offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Name used in status lines (file name or partition name).
    pub name: String,
    /// Flash offset. For STM32 targets this is the user code start address.
    pub offset: u32,
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// Lowercase hex MD5 of `data`, if already known.
    pub md5: Option<String>,
}

impl FirmwareImage {
    /// Create an image without a precomputed digest.
    pub fn new(name: impl Into<String>, offset: u32, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            offset,
            data,
            md5: None,
        }
    }

    /// Attach a precomputed digest.
    #[must_use]
    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(
            md5.into()
                .to_ascii_lowercase(),
        );
        self
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data
            .len()
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data
            .is_empty()
    }

    /// Lowercase hex MD5 of the image, computed if not attached.
    pub fn md5_hex(&self) -> String {
        self.md5
            .clone()
            .unwrap_or_else(|| md5_hex(&self.data))
    }
}

/// Lowercase hex MD5 digest of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// One erasable flash sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashSector {
    /// Start address.
    #[cfg_attr(feature = "serde", serde(rename = "addr"))]
    pub address: u32,
    /// Size in bytes.
    pub size: u32,
}

/// Flash layout of one STM32 part.
///
/// Sectors are ordered by address, contiguous and non-overlapping, and the
/// first one starts at `user_start_address`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SectorConfig {
    /// Where user code starts.
    #[cfg_attr(feature = "serde", serde(rename = "usr_start_addr"))]
    pub user_start_address: u32,
    /// Sector table.
    pub sectors: Vec<FlashSector>,
}

impl SectorConfig {
    /// The 12-sector STM32F4 layout at 0x08000000: 4 x 16K, 64K, 7 x 128K.
    pub fn stm32f4() -> Self {
        let sizes = [
            0x4000, 0x4000, 0x4000, 0x4000, 0x1_0000, 0x2_0000, 0x2_0000, 0x2_0000, 0x2_0000,
            0x2_0000, 0x2_0000, 0x2_0000,
        ];
        let mut address = 0x0800_0000;
        let sectors = sizes
            .into_iter()
            .map(|size| {
                let sector = FlashSector { address, size };
                address += size;
                sector
            })
            .collect();

        Self {
            user_start_address: 0x0800_0000,
            sectors,
        }
    }

    /// Check that the table is usable for erase and write.
    ///
    /// The table must be non-empty, its sectors must follow each other
    /// without gaps, and the first one must start at `user_start_address`.
    pub fn validate(&self) -> Result<()> {
        let Some(first) = self
            .sectors
            .first()
        else {
            return Err(Error::Config("sector table is empty".into()));
        };
        if first.address != self.user_start_address {
            return Err(Error::Config(format!(
                "sector 0 starts at 0x{:08X} but user code starts at 0x{:08X}",
                first.address, self.user_start_address
            )));
        }

        for (index, pair) in self
            .sectors
            .windows(2)
            .enumerate()
        {
            let expected = pair[0]
                .address
                .checked_add(pair[0].size)
                .ok_or_else(|| {
                    Error::Config(format!("sector {index} extends past the 32-bit address space"))
                })?;
            if pair[1].address != expected {
                return Err(Error::Config(format!(
                    "sector {} starts at 0x{:08X}, expected 0x{expected:08X}",
                    index + 1,
                    pair[1].address
                )));
            }
        }
        Ok(())
    }

    /// Sector indices to erase for an image of `len` bytes.
    ///
    /// Whole sectors are taken in table order until they cover `len`.
    /// Sector 0 is always included, even for an empty image.
    pub fn sectors_to_erase(&self, len: usize) -> Result<Vec<u16>> {
        let mut covered = 0usize;
        let mut indices = Vec::new();

        for (index, sector) in self
            .sectors
            .iter()
            .enumerate()
        {
            let index = u16::try_from(index)
                .map_err(|_| Error::Config("sector table has more than 65536 entries".into()))?;
            indices.push(index);
            covered = covered.saturating_add(sector_len(sector));
            if covered >= len {
                return Ok(indices);
            }
        }

        Err(Error::Config(format!(
            "image of {len} bytes does not fit: {} sectors cover only {covered} bytes",
            self.sectors
                .len()
        )))
    }

    /// Sector by index.
    pub fn sector(&self, index: u16) -> Result<FlashSector> {
        self.sectors
            .get(usize::from(index))
            .copied()
            .ok_or_else(|| Error::Config(format!("sector {index} is not in the sector table")))
    }

    /// Total size of the given sectors.
    pub fn region_len(&self, indices: &[u16]) -> Result<usize> {
        indices
            .iter()
            .try_fold(0usize, |total, &index| {
                Ok(total.saturating_add(sector_len(&self.sector(index)?)))
            })
    }
}

fn sector_len(sector: &FlashSector) -> usize {
    usize::try_from(sector.size).unwrap_or(usize::MAX)
}

/// Supplies images and STM32 layouts to a flashing session.
pub trait BinaryProvider {
    /// The single image for an STM32 target (`mgmt` or `ui`).
    fn stm32_image(&self, target: Target) -> Result<FirmwareImage>;

    /// The ESP32 images, in flashing order.
    fn esp32_images(&self) -> Result<Vec<FirmwareImage>>;

    /// Layout for the STM32 part with this chip ID.
    fn sector_config(&self, chip_id: u32) -> Result<SectorConfig>;
}
