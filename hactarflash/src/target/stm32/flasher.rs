//! ST bootloader client.
//!
//! [`Stm32Client`] borrows the session's [`SerialLink`] for the duration of
//! one target and owns no transport state itself. Every step waits for an
//! ACK; NACK, silence or any other byte ends the operation with an error
//! naming the step.

use {
    crate::{
        error::{Error, Result},
        image::{BinaryProvider, SectorConfig},
        is_interrupted_requested,
        progress::{Phase, ProgressSink, VerifyProgress, percent_of},
        protocol::{ACK, NACK},
        target::{
            Flasher, Target,
            stm32::protocol::{
                Command, ERASE_PROBE_LEN, ERASED, MAX_CHUNK, SYNC, address_frame, erase_frame,
                length_frame, pad_chunk, write_frame,
            },
        },
        transport::SerialLink,
    },
    log::{debug, trace, warn},
    std::time::Duration,
};

/// How erased sectors are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraseVerify {
    /// Read one 255-byte probe at the start of each erased sector.
    #[default]
    Fast,
    /// Read back the whole erased region.
    Full,
}

/// Timeouts and retry budgets for the ST bootloader.
#[derive(Debug, Clone)]
pub struct Stm32Config {
    /// Wait for a single reply byte.
    pub reply_timeout: Duration,
    /// Wait for the ACK that ends an erase.
    pub erase_timeout: Duration,
    /// Attempts for the sync byte.
    pub sync_retries: usize,
    /// Attempts for Get and Get ID.
    pub id_retries: usize,
    /// Reads of one sector probe before the fast erase check gives up.
    pub probe_attempts: usize,
    /// Erase check mode.
    pub erase_verify: EraseVerify,
}

impl Default for Stm32Config {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(2000),
            erase_timeout: Duration::from_millis(10_000),
            sync_retries: 5,
            id_retries: 5,
            probe_attempts: 10,
            erase_verify: EraseVerify::Fast,
        }
    }
}

impl Stm32Config {
    /// Set the reply timeout.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the erase timeout.
    #[must_use]
    pub fn with_erase_timeout(mut self, timeout: Duration) -> Self {
        self.erase_timeout = timeout;
        self
    }

    /// Set the erase check mode.
    #[must_use]
    pub fn with_erase_verify(mut self, mode: EraseVerify) -> Self {
        self.erase_verify = mode;
        self
    }
}

/// Result of the Get command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Bootloader version, major in the high nibble.
    pub version: u8,
    /// Supported command codes.
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    /// Whether `command` is supported.
    pub fn supports(&self, command: Command) -> bool {
        self.commands
            .contains(&command.code())
    }
}

/// ST USART bootloader client.
pub struct Stm32Client<'a> {
    link: &'a mut SerialLink,
    config: Stm32Config,
    layout: Option<SectorConfig>,
}

impl<'a> Stm32Client<'a> {
    /// Create a client on an open link.
    pub fn new(link: &'a mut SerialLink, config: Stm32Config) -> Self {
        Self {
            link,
            config,
            layout: None,
        }
    }

    /// Use this sector layout for erase and its checks.
    pub fn set_sector_config(&mut self, layout: SectorConfig) {
        self.layout = Some(layout);
    }

    /// The loaded sector layout.
    pub fn sector_config(&self) -> Result<&SectorConfig> {
        self.layout
            .as_ref()
            .ok_or_else(|| Error::Config("sector configuration has not been loaded".into()))
    }

    fn classify(byte: u8, stage: &str) -> Result<()> {
        match byte {
            ACK => Ok(()),
            NACK => Err(Error::nack(stage)),
            got => Err(Error::UnexpectedReply {
                stage: stage.to_string(),
                got,
            }),
        }
    }

    fn wait_ack(&mut self, timeout: Duration, stage: &str) -> Result<()> {
        match self
            .link
            .read_byte(timeout)
        {
            Some(byte) => Self::classify(byte, stage),
            None => Err(Error::no_reply(stage)),
        }
    }

    /// Write `bytes` and wait for the acknowledgement, resending on silence.
    fn send_wait_ack(
        &mut self,
        bytes: &[u8],
        attempts: usize,
        timeout: Duration,
        stage: &str,
    ) -> Result<()> {
        for attempt in 1..=attempts.max(1) {
            self.link
                .write_bytes(bytes)?;
            match self
                .link
                .read_byte(timeout)
            {
                Some(byte) => return Self::classify(byte, stage),
                None => warn!("{stage}: no reply (attempt {attempt}/{attempts})"),
            }
        }
        Err(Error::no_reply(stage))
    }

    fn command(&mut self, command: Command, attempts: usize) -> Result<()> {
        trace!("Sending {}", command.name());
        let timeout = self
            .config
            .reply_timeout;
        self.send_wait_ack(&command.frame(), attempts, timeout, command.name())
    }

    fn read_one(&mut self, stage: &str) -> Result<u8> {
        self.link
            .read_byte(
                self.config
                    .reply_timeout,
            )
            .ok_or_else(|| Error::no_reply(stage))
    }

    fn read_exact(&mut self, len: usize, stage: &str) -> Result<Vec<u8>> {
        let bytes = self
            .link
            .read_bytes(
                len,
                self.config
                    .reply_timeout,
            );
        if bytes.len() < len {
            return Err(Error::no_reply(stage));
        }
        Ok(bytes)
    }

    /// Send the sync byte until the bootloader acknowledges it.
    pub fn sync(&mut self) -> Result<()> {
        let attempts = self
            .config
            .sync_retries;
        let timeout = self
            .config
            .reply_timeout;
        self.send_wait_ack(&[SYNC], attempts, timeout, "Activating device")?;
        debug!("Bootloader synchronised");
        Ok(())
    }

    /// Get: bootloader version and supported commands.
    pub fn get_commands(&mut self) -> Result<BootloaderInfo> {
        self.command(
            Command::Get,
            self.config
                .id_retries,
        )?;
        let count = self.read_one("Get command count")?;
        let version = self.read_one("Get version byte")?;
        let commands = self.read_exact(usize::from(count), "Get command list")?;
        let timeout = self
            .config
            .reply_timeout;
        self.wait_ack(timeout, "Get")?;

        debug!("Bootloader {version:#04x} supports {commands:02X?}");
        Ok(BootloaderInfo { version, commands })
    }

    /// Get Version: bootloader version and the two option bytes.
    pub fn get_version(&mut self) -> Result<(u8, [u8; 2])> {
        self.command(Command::GetVersion, 1)?;
        let bytes = self.read_exact(3, "Get Version")?;
        let timeout = self
            .config
            .reply_timeout;
        self.wait_ack(timeout, "Get Version")?;
        Ok((bytes[0], [bytes[1], bytes[2]]))
    }

    /// Get ID: the chip product ID as a big-endian integer.
    ///
    /// Some bootloaders send a second ACK before the length byte. Exactly
    /// one such extra ACK is skipped.
    pub fn get_chip_id(&mut self) -> Result<u32> {
        self.command(
            Command::GetId,
            self.config
                .id_retries,
        )?;

        let mut len = self.read_one("Getting ID length")?;
        if len == ACK {
            trace!("Skipping duplicate ACK before ID length");
            len = self.read_one("Getting ID length")?;
        }
        if len == NACK {
            return Err(Error::nack("Getting ID length"));
        }

        let id_len = usize::from(len) + 1;
        if id_len > 4 {
            return Err(Error::Framing(format!(
                "chip ID of {id_len} bytes does not fit in 32 bits"
            )));
        }
        let id = self.read_exact(id_len, "Getting ID")?;
        let timeout = self
            .config
            .reply_timeout;
        self.wait_ack(timeout, "Getting ID")?;

        let id = id
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        debug!("Chip ID: {id:#06x}");
        Ok(id)
    }

    /// Read `len` bytes (1..=256) starting at `address`.
    ///
    /// Fails only when nothing arrives; a short read is returned as is.
    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        if !(1..=MAX_CHUNK).contains(&len) {
            return Err(Error::Config(format!(
                "read length {len} outside 1..={MAX_CHUNK}"
            )));
        }
        let timeout = self
            .config
            .reply_timeout;

        self.command(Command::ReadMemory, 1)?;
        self.send_wait_ack(&address_frame(address), 1, timeout, "Read memory address")?;
        self.send_wait_ack(&length_frame(len), 1, timeout, "Read memory length")?;
        self.link
            .read_bytes_or_fail(len, timeout, "Read memory data")
    }

    /// Sector indices covering an image of `len` bytes in the loaded layout.
    pub fn sectors_to_erase(&self, len: usize) -> Result<Vec<u16>> {
        self.sector_config()?
            .sectors_to_erase(len)
    }

    /// Extended Erase of the given sectors, then the configured erase check.
    pub fn extended_erase(&mut self, sectors: &[u16], sink: &mut dyn ProgressSink) -> Result<()> {
        if sectors.is_empty() {
            return Err(Error::Config("no sectors to erase".into()));
        }
        // Fail on an unknown sector before touching flash.
        self.sector_config()?
            .region_len(sectors)?;

        sink.info(format!("Erase: sectors {sectors:?}"));
        sink.phase(Phase::Erasing);
        self.command(Command::ExtendedErase, 1)?;

        sink.info("Erase: STARTED");
        let timeout = self
            .config
            .erase_timeout;
        self.send_wait_ack(&erase_frame(sectors), 1, timeout, "Erase")?;

        match self
            .config
            .erase_verify
        {
            EraseVerify::Fast => self.fast_erase_verify(sectors, sink)?,
            EraseVerify::Full => self.full_erase_verify(sectors, sink)?,
        }

        sink.info("Erase: COMPLETE");
        Ok(())
    }

    /// Whether flash at `address` reads back as `expected`, retrying up to
    /// the probe budget.
    fn compare_flash(&mut self, address: u32, expected: &[u8]) -> Result<bool> {
        let attempts = self
            .config
            .probe_attempts
            .max(1);
        for attempt in 1..=attempts {
            let mem = self.read_memory(address, expected.len())?;
            if mem == expected {
                return Ok(true);
            }
            debug!("Probe at {address:#010x} not erased (attempt {attempt}/{attempts})");
        }
        Ok(false)
    }

    fn fast_erase_verify(&mut self, sectors: &[u16], sink: &mut dyn ProgressSink) -> Result<()> {
        let expected = [ERASED; ERASE_PROBE_LEN];
        sink.info("Verifying erase: 0%");

        for (done, &index) in sectors
            .iter()
            .enumerate()
        {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let percent = percent_of(done, sectors.len());
            sink.update(format!("Verifying erase: {percent}%"));
            sink.percent("Verifying erase", percent);

            let address = self
                .sector_config()?
                .sector(index)?
                .address;
            if !self.compare_flash(address, &expected)? {
                sink.error(format!("Verifying erase: sector [{index}] is not blank"));
                return Err(Error::Verification {
                    stage: format!("Verifying erase of sector {index}"),
                    address,
                });
            }
        }

        sink.update("Verifying erase: 100%");
        sink.percent("Verifying erase", 100);
        Ok(())
    }

    fn full_erase_verify(&mut self, sectors: &[u16], sink: &mut dyn ProgressSink) -> Result<()> {
        let layout = self.sector_config()?;
        let start = layout
            .sector(sectors[0])?
            .address;
        let total = layout.region_len(sectors)?;

        let mut offset = 0;
        while offset < total {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let address = address_at(start, offset)?;
            let len = MAX_CHUNK.min(total - offset);
            let mem = self.read_memory(address, len)?;

            let mismatch = (0..len).find(|&i| mem.get(i) != Some(&ERASED));
            let percent = percent_of(offset + len, total);
            if let Some(i) = mismatch {
                let address = address_at(address, i)?;
                sink.verify(VerifyProgress {
                    address,
                    percent,
                    failed: true,
                });
                sink.error(format!("Verifying erase: failed at {address:#010x}"));
                return Err(Error::Verification {
                    stage: "Verifying erase".into(),
                    address,
                });
            }

            sink.verify(VerifyProgress {
                address,
                percent,
                failed: false,
            });
            sink.update(format!("Verifying erase: {percent}%"));
            sink.percent("Verifying erase", percent);
            offset += len;
        }

        Ok(())
    }

    /// Write `data` at `start` in 256-byte chunks, then read every chunk back.
    ///
    /// The last chunk is padded with 0xFF to a multiple of four bytes. Only
    /// the unpadded bytes are compared on read-back.
    pub fn write_memory(
        &mut self,
        data: &[u8],
        start: u32,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let timeout = self
            .config
            .reply_timeout;
        let total = data.len();

        sink.info(format!(
            "Write to memory: {total} bytes at {start:#010x}"
        ));
        sink.phase(Phase::Writing);
        for (index, chunk) in data
            .chunks(MAX_CHUNK)
            .enumerate()
        {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let offset = index * MAX_CHUNK;
            let address = address_at(start, offset)?;
            let percent = percent_of(offset, total);
            sink.update(format!("Flashing: {percent}%"));
            sink.percent("Flashing", percent);

            self.command(Command::WriteMemory, 1)?;
            let stage = format!("Writing {address:#010x}");
            self.send_wait_ack(&address_frame(address), 1, timeout, &stage)?;
            self.send_wait_ack(&write_frame(&pad_chunk(chunk)), 1, timeout, &stage)?;
        }
        sink.update("Flashing: 100%");
        sink.percent("Flashing", 100);

        sink.phase(Phase::Verifying);
        for (index, chunk) in data
            .chunks(MAX_CHUNK)
            .enumerate()
        {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let offset = index * MAX_CHUNK;
            let address = address_at(start, offset)?;
            let percent = percent_of(offset, total);
            sink.update(format!("Verifying write: {percent}%"));
            sink.percent("Verifying write", percent);

            let mem = self.read_memory(address, chunk.len())?;
            if let Some(i) = (0..chunk.len()).find(|&i| mem.get(i) != Some(&chunk[i])) {
                let address = address_at(address, i)?;
                sink.error(format!(
                    "Verifying write: failed at memory address {address:#010x}"
                ));
                return Err(Error::Verification {
                    stage: "Verifying write".into(),
                    address,
                });
            }
        }
        sink.update("Verifying write: 100%");
        sink.percent("Verifying write", 100);
        sink.info("Write: COMPLETE");
        Ok(())
    }

    /// Jump to user code at `address`.
    pub fn go(&mut self, address: u32) -> Result<()> {
        let timeout = self
            .config
            .reply_timeout;
        self.command(Command::Go, 1)?;
        self.send_wait_ack(
            &address_frame(address),
            1,
            timeout,
            &format!("Jumping to {address:#010x}"),
        )?;
        debug!("Jumped to {address:#010x}");
        Ok(())
    }
}

fn address_at(base: u32, offset: usize) -> Result<u32> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| {
            Error::Config(format!(
                "offset {offset:#x} from {base:#010x} leaves the 32-bit address space"
            ))
        })
}

impl Flasher for Stm32Client<'_> {
    fn connect(&mut self, sink: &mut dyn ProgressSink) -> Result<()> {
        sink.info("Activating device");
        if let Err(e) = self.sync() {
            sink.error("Activating device: FAILED");
            return Err(e);
        }
        sink.info("Activating device: SUCCESS");

        let info = self.get_commands()?;
        sink.debug(format!(
            "Bootloader version {}.{}",
            info.version >> 4,
            info.version & 0x0F
        ));
        if !info.supports(Command::ExtendedErase) {
            sink.error("Bootloader does not support Extended Erase");
            return Err(Error::Unsupported {
                command: Command::ExtendedErase.code(),
            });
        }
        Ok(())
    }

    fn flash(
        &mut self,
        target: Target,
        provider: &dyn BinaryProvider,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let image = provider.stm32_image(target)?;

        let chip_id = self.get_chip_id()?;
        sink.info(format!("Chip ID: {chip_id:#06x}"));
        let layout = provider.sector_config(chip_id)?;
        layout.validate()?;
        let start = layout.user_start_address;
        self.set_sector_config(layout);

        let sectors = self.sectors_to_erase(image.len())?;
        self.extended_erase(&sectors, sink)?;
        self.write_memory(&image.data, start, sink)?;

        if target == Target::Mgmt {
            sink.info(format!("Jumping to address {start:#010x}"));
            self.go(start)?;
        }

        sink.info(format!("{target}: update complete"));
        Ok(())
    }
}
