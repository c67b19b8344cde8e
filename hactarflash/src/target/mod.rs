//! Flash targets on a Hactar board and the bootloader clients that reach them.
//!
//! The `mgmt` and `ui` chips are STM32 parts behind the ST UART bootloader
//! ([`stm32`]); the `net` chip is an ESP32-S3 behind its ROM loader
//! ([`esp32`]). Both clients implement [`Flasher`], so the orchestrator
//! drives them the same way.

pub mod esp32;
pub mod stm32;

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::image::BinaryProvider;
use crate::port::Parity;
use crate::progress::ProgressSink;

/// A flashable chip on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// Management STM32, reached directly over the USB serial bridge.
    Mgmt,
    /// UI STM32, reached through the management chip.
    Ui,
    /// ESP32-S3 network chip, reached through the management chip.
    Net,
}

impl Target {
    /// All targets in the order a combined session flashes them.
    pub const ALL: [Self; 3] = [Self::Mgmt, Self::Ui, Self::Net];

    /// Parse a target name (`mgmt`, `ui`, `net`), case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "mgmt" => Some(Self::Mgmt),
            "ui" => Some(Self::Ui),
            "net" => Some(Self::Net),
            _ => None,
        }
    }

    /// Short name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Mgmt => "mgmt",
            Self::Ui => "ui",
            Self::Net => "net",
        }
    }

    /// Parity the target's bootloader expects.
    pub fn parity(self) -> Parity {
        match self {
            Self::Mgmt | Self::Ui => Parity::Even,
            Self::Net => Parity::None,
        }
    }

    /// ASCII command that switches the board into this target's upload mode.
    ///
    /// `mgmt` has none; it is put into its bootloader with the modem lines.
    pub fn selection_command(self) -> Option<&'static [u8]> {
        match self {
            Self::Mgmt => None,
            Self::Ui => Some(b"ui_upload"),
            Self::Net => Some(b"net_upload"),
        }
    }

    /// Whether this target runs the ST bootloader.
    pub fn is_stm32(self) -> bool {
        matches!(self, Self::Mgmt | Self::Ui)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| Error::Config(format!("unknown target '{s}'")))
    }
}

/// A bootloader client that can flash one target.
pub trait Flasher {
    /// Establish contact with the bootloader.
    fn connect(&mut self, sink: &mut dyn ProgressSink) -> Result<()>;

    /// Erase, write and verify everything `provider` has for `target`.
    fn flash(
        &mut self,
        target: Target,
        provider: &dyn BinaryProvider,
        sink: &mut dyn ProgressSink,
    ) -> Result<()>;
}
