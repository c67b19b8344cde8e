//! Firmware bundle directories.
//!
//! A bundle is a directory laid out like a Hactar build output:
//!
//! ```text
//! <dir>/mgmt.bin
//! <dir>/ui.bin
//! <dir>/net/flasher_args.json      (ESP-IDF manifest)
//! <dir>/stm32_configurations.json  (optional sector tables by chip ID)
//! ```
//!
//! Every part is optional on disk; a missing one only fails when a session
//! actually needs it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use hactarflash::{
    BinaryProvider, Error as FlashError, FirmwareImage, SectorConfig, Target, image::md5_hex,
};
use log::debug;
use serde::Deserialize;

const NET_DIR: &str = "net";
const MANIFEST: &str = "flasher_args.json";
const SECTOR_TABLE: &str = "stm32_configurations.json";

/// Nominal load address reported for STM32 images; the real one comes from
/// the sector table once the chip is identified.
const STM32_LOAD_ADDRESS: u32 = 0x0800_0000;

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    offset: String,
    file: String,
}

/// The parts of `flasher_args.json` that get flashed, in flashing order.
#[derive(Debug, Default, Deserialize)]
struct Manifest {
    bootloader: Option<ManifestEntry>,
    #[serde(rename = "partition-table")]
    partition_table: Option<ManifestEntry>,
    app: Option<ManifestEntry>,
}

impl Manifest {
    fn entries(&self) -> impl Iterator<Item = (&'static str, &ManifestEntry)> {
        [
            ("bootloader", self.bootloader.as_ref()),
            ("partition-table", self.partition_table.as_ref()),
            ("app", self.app.as_ref()),
        ]
        .into_iter()
        .filter_map(|(name, entry)| entry.map(|e| (name, e)))
    }
}

/// Parse an offset written as `0x...` hex or plain decimal.
pub(crate) fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

/// Images and layouts read from a bundle directory.
#[derive(Debug)]
pub struct FirmwareDir {
    root: PathBuf,
    sector_configs: BTreeMap<u32, SectorConfig>,
    has_sector_table: bool,
}

impl FirmwareDir {
    /// Open `root` and load its sector table if it has one.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            bail!("firmware directory {} does not exist", root.display());
        }

        let table_path = root.join(SECTOR_TABLE);
        let has_sector_table = table_path.is_file();
        let sector_configs = if has_sector_table {
            load_sector_table(&table_path)?
        } else {
            debug!(
                "No {SECTOR_TABLE} in {}, using the STM32F4 layout",
                root.display()
            );
            BTreeMap::new()
        };

        Ok(Self {
            root: root.to_path_buf(),
            sector_configs,
            has_sector_table,
        })
    }

    /// Bundle directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sector tables keyed by chip ID.
    pub fn sector_configs(&self) -> &BTreeMap<u32, SectorConfig> {
        &self.sector_configs
    }

    fn stm32_path(&self, target: Target) -> PathBuf {
        self.root
            .join(format!("{}.bin", target.name()))
    }

    fn manifest_path(&self) -> PathBuf {
        self.root
            .join(NET_DIR)
            .join(MANIFEST)
    }

    /// Whether the bundle carries an image for `target`.
    pub fn has_target(&self, target: Target) -> bool {
        if target.is_stm32() {
            self.stm32_path(target)
                .is_file()
        } else {
            self.manifest_path()
                .is_file()
        }
    }

    /// Images a session would write to `target`.
    pub fn images_for(&self, target: Target) -> hactarflash::Result<Vec<FirmwareImage>> {
        if target.is_stm32() {
            Ok(vec![self.stm32_image(target)?])
        } else {
            self.esp32_images()
        }
    }

    fn read_manifest(&self) -> hactarflash::Result<Manifest> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Err(FlashError::Config(format!(
                "missing ESP32 manifest {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| FlashError::Config(format!("invalid manifest {}: {e}", path.display())))
    }
}

fn load_sector_table(path: &Path) -> Result<BTreeMap<u32, SectorConfig>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let raw: BTreeMap<String, SectorConfig> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut table = BTreeMap::new();
    for (key, layout) in raw {
        let chip_id = parse_u32(&key).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        layout
            .validate()
            .with_context(|| format!("{}: chip {chip_id:#05x}", path.display()))?;
        table.insert(chip_id, layout);
    }
    Ok(table)
}

impl BinaryProvider for FirmwareDir {
    fn stm32_image(&self, target: Target) -> hactarflash::Result<FirmwareImage> {
        let path = self.stm32_path(target);
        if !path.is_file() {
            return Err(FlashError::Config(format!(
                "missing {target} image {}",
                path.display()
            )));
        }
        let data = fs::read(&path)?;
        let md5 = md5_hex(&data);
        Ok(FirmwareImage::new(target.name(), STM32_LOAD_ADDRESS, data).with_md5(md5))
    }

    fn esp32_images(&self) -> hactarflash::Result<Vec<FirmwareImage>> {
        let manifest = self.read_manifest()?;
        let net_dir = self
            .root
            .join(NET_DIR);

        let mut images = Vec::new();
        for (name, entry) in manifest.entries() {
            let offset = parse_u32(&entry.offset)
                .map_err(|e| FlashError::Config(format!("{name} offset: {e}")))?;
            let path = net_dir.join(&entry.file);
            let data = fs::read(&path).map_err(|e| {
                FlashError::Config(format!("cannot read {name} image {}: {e}", path.display()))
            })?;
            let md5 = md5_hex(&data);
            images.push(FirmwareImage::new(name, offset, data).with_md5(md5));
        }

        if images.is_empty() {
            return Err(FlashError::Config(
                "ESP32 manifest lists no images".to_string(),
            ));
        }
        Ok(images)
    }

    fn sector_config(&self, chip_id: u32) -> hactarflash::Result<SectorConfig> {
        if let Some(layout) = self
            .sector_configs
            .get(&chip_id)
        {
            return Ok(layout.clone());
        }
        if self.has_sector_table {
            return Err(FlashError::Config(format!(
                "no sector configuration for chip ID {chip_id:#05x}"
            )));
        }
        Ok(SectorConfig::stm32f4())
    }
}
