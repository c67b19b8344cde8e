//! ESP32 support through the ROM serial loader.

pub mod flasher;
pub mod protocol;

#[cfg(test)]
pub(crate) mod fake;

pub use flasher::{Esp32Client, Esp32Config, Response, response_status};
pub use protocol::{Command, SpiFlashParams};
