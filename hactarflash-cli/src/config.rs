//! Configuration file support for hactarflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (HACTARFLASH_*)
//! 3. Local port memory (./hactarflash_ports.toml, or the global ports.toml)
//! 4. Local config file (./hactarflash.toml)
//! 5. Global config file (~/.config/hactarflash/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const LOCAL_CONFIG: &str = "hactarflash.toml";
const LOCAL_PORTS: &str = "hactarflash_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Flash session defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Upload mode, e.g. "ui+net".
    pub mode: Option<String>,
    /// Firmware bundle directory.
    pub firmware_dir: Option<PathBuf>,
    /// Read back the whole erased region instead of probing sector starts.
    #[serde(default)]
    pub full_erase_verify: bool,
    /// Pause before the net upload when another target ran first.
    pub settle_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(ports_config) = Self::load_ports_config() {
            config.merge_ports(ports_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_ports_file(path: &Path) -> Option<PortConfig> {
        let content = fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => {
                debug!("Loaded ports config from {}", path.display());
                Some(config)
            },
            Err(e) => {
                warn!("Ignoring ports config {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_ports_config() -> Option<PortConfig> {
        let local_path = Path::new(LOCAL_PORTS);
        if local_path.exists() {
            return Self::load_ports_file(local_path);
        }

        let global_path = Self::global_config_dir()?.join("ports.toml");
        if global_path.exists() {
            return Self::load_ports_file(&global_path);
        }

        None
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hactarflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    fn merge(&mut self, other: Self) {
        self.merge_ports(other.port);

        if other.flash.mode.is_some() {
            self.flash.mode = other.flash.mode;
        }
        if other.flash.firmware_dir.is_some() {
            self.flash.firmware_dir = other.flash.firmware_dir;
        }
        if other.flash.full_erase_verify {
            self.flash.full_erase_verify = true;
        }
        if other.flash.settle_delay_ms.is_some() {
            self.flash.settle_delay_ms = other.flash.settle_delay_ms;
        }
    }

    fn merge_ports(&mut self, other: PortConfig) {
        if other.connection.serial.is_some() {
            self.port.connection.serial = other.connection.serial;
        }
        for device in other.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }
    }

    /// Whether `vid`/`pid` was remembered by an earlier session.
    pub fn is_remembered(&self, vid: u16, pid: u16) -> bool {
        self.port
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid))
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        self.port.usb_device.push(device);
        self.write_ports()
    }

    /// Write the port section to the local ports file when a local config
    /// exists, otherwise to the global one.
    fn write_ports(&self) -> anyhow::Result<()> {
        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        Self::write_ports_to(&self.port, &path)
    }

    fn write_ports_to(port: &PortConfig, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(port)?;
        fs::write(path, content)?;
        info!("Saved port configuration to {}", path.display());
        Ok(())
    }
}
