//! # hactarflash
//!
//! A library for flashing the processors on a Hactar board over one serial
//! line.
//!
//! The board carries two STM32 parts (the `mgmt` supervisor and the `ui`
//! application processor), flashed through the ST USART bootloader, and an
//! ESP32 (`net`), flashed through its SLIP-framed ROM loader. This crate
//! provides:
//!
//! - a byte transport with a background reader ([`SerialLink`])
//! - the SLIP codec ([`SlipPacket`])
//! - clients for both bootloaders ([`Stm32Client`], [`Esp32Client`])
//! - an orchestrator that switches the board between upload modes and runs
//!   whole update sessions ([`FlashOrchestrator`])
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via `serialport`
//! - `serde`: Serialization support for firmware metadata
//!
//! ## Example
//!
//! ```rust,no_run
//! use hactarflash::{
//!     FirmwareImage, FlashOrchestrator, LogSink, OrchestratorConfig, SectorConfig, SerialLink,
//!     Target, UploadMode, image::BinaryProvider,
//! };
//!
//! struct Bundle;
//!
//! impl BinaryProvider for Bundle {
//!     fn stm32_image(&self, target: Target) -> hactarflash::Result<FirmwareImage> {
//!         let data = std::fs::read(format!("{target}.bin"))?;
//!         Ok(FirmwareImage::new(target.name(), 0x0800_0000, data))
//!     }
//!
//!     fn esp32_images(&self) -> hactarflash::Result<Vec<FirmwareImage>> {
//!         Ok(vec![FirmwareImage::new("app", 0x10000, std::fs::read("net.bin")?)])
//!     }
//!
//!     fn sector_config(&self, _chip_id: u32) -> hactarflash::Result<SectorConfig> {
//!         Ok(SectorConfig::stm32f4())
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let connector = hactarflash::port::NativeConnector::new("/dev/ttyUSB0");
//!         let link = SerialLink::new(Box::new(connector));
//!         let mut orchestrator = FlashOrchestrator::new(link, OrchestratorConfig::default());
//!         orchestrator.run(UploadMode::default(), &Bundle, &mut LogSink)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod image;
pub mod port;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod target;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

/// Set the calling test thread's interruption flag.
///
/// The flag is per thread so tests running in parallel do not see each
/// other's interruptions.
#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::cell::Cell;

    thread_local! {
        static TEST_INTERRUPT_FLAG: Cell<bool> = const { Cell::new(false) };
    }
    static INSTALLED: OnceLock<()> = OnceLock::new();

    INSTALLED.get_or_init(|| set_interrupt_checker(|| TEST_INTERRUPT_FLAG.with(Cell::get)));
    TEST_INTERRUPT_FLAG.with(|flag| flag.set(value));
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativeConnector, NativePort, NativePortEnumerator};
pub use {
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    error::{Error, ErrorCategory, Result},
    image::{BinaryProvider, FirmwareImage, FlashSector, SectorConfig},
    port::{Connector, Parity, Port, PortEnumerator, PortInfo, SerialConfig},
    progress::{LogSink, Phase, ProgressSink, RecordingSink, Severity, StatusLine, VerifyProgress},
    protocol::{ACK, NACK, READY, SlipPacket},
    session::{FlashOrchestrator, FlashSession, OrchestratorConfig, SessionState, UploadMode},
    target::{
        Flasher, Target,
        esp32::{Esp32Client, Esp32Config},
        stm32::{EraseVerify, Stm32Client, Stm32Config},
    },
    transport::SerialLink,
};
