//! Serial port discovery and classification.
//!
//! The Hactar shows up either behind a USB-to-UART bridge or through the
//! native USB of one of its processors. Ports are classified by USB VID/PID
//! so the CLI can pick the right one without asking.

use crate::{
    error::{Error, Result},
    port::PortInfo,
};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// Known USB bridge or device kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// CH340/CH341 USB-to-Serial converter.
    Ch340,
    /// Silicon Labs CP210x USB-to-Serial converter.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232 USB-to-Serial converter.
    Ftdi,
    /// Prolific PL2303 USB-to-Serial converter.
    Prolific,
    /// STMicroelectronics virtual COM port.
    StMicro,
    /// Espressif USB-JTAG/serial.
    Espressif,
    /// Unknown device.
    Unknown,
}

/// Known USB VID/PID pairs. An empty PID list matches any product.
const KNOWN_USB_DEVICES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
    (0x0483, &[0x5740, 0x374B, 0x3752], DeviceKind::StMicro),
    (0x303A, &[], DeviceKind::Espressif),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        for (known_vid, pids, device) in KNOWN_USB_DEVICES {
            if vid == *known_vid && (pids.is_empty() || pids.contains(&pid)) {
                return *device;
            }
        }
        Self::Unknown
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::StMicro => "STM32 VCP",
            Self::Espressif => "ESP32 USB",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the kind was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Bridges the board ships with, preferred during auto-selection.
    pub fn is_high_priority(&self) -> bool {
        matches!(self, Self::Ch340 | Self::Cp210x | Self::Ftdi)
    }
}

/// A discovered serial port.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name or path (e.g. "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified device kind.
    pub device: DeviceKind,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
    /// Device manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Device product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Whether the port is likely the board.
    pub fn is_likely_hactar(&self) -> bool {
        self.device
            .is_known()
    }
}

impl From<PortInfo> for DetectedPort {
    fn from(info: PortInfo) -> Self {
        let device = match (info.vid, info.pid) {
            (Some(vid), Some(pid)) => DeviceKind::from_vid_pid(vid, pid),
            _ => DeviceKind::Unknown,
        };
        Self {
            name: info.name,
            device,
            vid: info.vid,
            pid: info.pid,
            manufacturer: info.manufacturer,
            product: info.product,
            serial: info.serial_number,
        }
    }
}

/// Every serial port with its metadata.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    use crate::port::{NativePortEnumerator, PortEnumerator};

    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(DetectedPort::from)
            .inspect(|p| {
                trace!(
                    "Found port: {} (VID: {:?}, PID: {:?}, Device: {:?})",
                    p.name, p.vid, p.pid, p.device
                );
            })
            .collect(),
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
            Vec::new()
        },
    }
}

/// Without native serial support there is nothing to enumerate.
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate out of `ports`.
///
/// Bridges come first, then the processors' own USB, then anything else.
pub fn select_port(ports: Vec<DetectedPort>) -> Result<DetectedPort> {
    let best = ports
        .iter()
        .position(|p| {
            p.device
                .is_high_priority()
        })
        .or_else(|| {
            ports
                .iter()
                .position(|p| {
                    p.device
                        .is_known()
                })
        });

    match best {
        Some(index) => Ok(ports[index].clone()),
        None => ports
            .into_iter()
            .next()
            .ok_or(Error::DeviceNotFound),
    }
}

/// Auto-detect the board's port.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let port = select_port(detect_ports())?;
    if port
        .device
        .is_known()
    {
        info!("Auto-detected {} port: {}", port.device.name(), port.name);
    } else {
        info!("Using first available port: {}", port.name);
    }
    Ok(port)
}

/// Without native serial support nothing can be detected.
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::DeviceNotFound)
}
