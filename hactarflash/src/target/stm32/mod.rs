//! STM32 support through the ST USART bootloader.

pub mod flasher;
pub mod protocol;

#[cfg(test)]
pub(crate) mod fake;

pub use flasher::{BootloaderInfo, EraseVerify, Stm32Client, Stm32Config};
pub use protocol::Command;
