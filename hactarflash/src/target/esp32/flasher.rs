//! ESP32 ROM loader client.
//!
//! Requests are SLIP frames written in one piece; responses are read byte
//! by byte from the link until a complete frame has been seen. Responses
//! for commands nobody is waiting for are kept and handed out when that
//! command is waited for later.

use {
    crate::{
        error::{Error, Result},
        image::{BinaryProvider, FirmwareImage},
        is_interrupted_requested,
        progress::{Phase, ProgressSink, percent_of},
        protocol::slip::{END, SlipPacket},
        target::{
            Flasher, Target,
            esp32::protocol::{
                BLOCK_SIZE, Command, MD5_HEX_LEN, SpiFlashParams, block_count, flash_begin_packet,
                flash_data_packet, flash_end_packet, flash_md5_packet, spi_attach_packet,
                spi_params_packet, sync_packet,
            },
        },
        transport::SerialLink,
    },
    log::{debug, trace, warn},
    std::{collections::VecDeque, time::Duration},
};

/// Buffered unrelated responses kept at most.
const MAX_PENDING: usize = 16;

/// Timeouts and retry budgets for the ROM loader.
#[derive(Debug, Clone)]
pub struct Esp32Config {
    /// Wait for each byte of a response frame.
    pub byte_timeout: Duration,
    /// Sends of one request before giving up.
    pub write_retries: usize,
    /// Quiet period that ends the drain of extra SYNC responses.
    pub sync_drain_timeout: Duration,
    /// Longest raw frame accepted, delimiters included.
    pub max_frame_len: usize,
    /// Flash geometry.
    pub spi_params: SpiFlashParams,
}

impl Default for Esp32Config {
    fn default() -> Self {
        Self {
            byte_timeout: Duration::from_millis(2000),
            write_retries: 5,
            sync_drain_timeout: Duration::from_millis(100),
            max_frame_len: 4096,
            spi_params: SpiFlashParams::default(),
        }
    }
}

impl Esp32Config {
    /// Set the per-byte timeout.
    #[must_use]
    pub fn with_byte_timeout(mut self, timeout: Duration) -> Self {
        self.byte_timeout = timeout;
        self
    }

    /// Set the longest accepted frame.
    #[must_use]
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }
}

/// Outcome of waiting for response frames.
#[derive(Debug)]
pub enum Response {
    /// The awaited command's response.
    Matched(SlipPacket),
    /// Complete frames seen before the line went quiet, none of them awaited.
    Collected(Vec<SlipPacket>),
    /// Nothing complete arrived.
    NoReply,
}

/// Failure flag and error code of a response.
///
/// The status occupies the last two or four payload bytes: two when the
/// whole frame is 10 or 26 bytes long, four otherwise.
pub fn response_status(packet: &SlipPacket) -> Option<(u8, u8)> {
    let status_len = match packet.frame_len() {
        10 | 26 => 2,
        _ => 4,
    };
    let payload = packet.payload();
    let at = payload
        .len()
        .checked_sub(status_len)?;
    Some((payload[at], payload[at + 1]))
}

/// ESP32 ROM loader client.
pub struct Esp32Client<'a> {
    link: &'a mut SerialLink,
    config: Esp32Config,
    pending: VecDeque<SlipPacket>,
}

impl<'a> Esp32Client<'a> {
    /// Create a client on an open link.
    pub fn new(link: &'a mut SerialLink, config: Esp32Config) -> Self {
        Self {
            link,
            config,
            pending: VecDeque::new(),
        }
    }

    /// Encode and write one request.
    pub fn write_packet(&mut self, packet: &mut SlipPacket, checksum: bool) -> Result<()> {
        let command = packet.command();
        let frame = packet.encode(checksum);
        trace!("Sending command {command:#04x}, {} bytes framed", frame.len());
        self.link
            .write_bytes(frame)
    }

    /// Read one raw frame, delimiters included.
    ///
    /// Bytes before the opening delimiter are skipped. Two delimiters in a
    /// row mean the first one closed nothing, so the second starts the frame.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let timeout = self
            .config
            .byte_timeout;

        loop {
            match self
                .link
                .read_byte(timeout)
            {
                None => return Ok(None),
                Some(END) => break,
                Some(byte) => trace!("Skipping {byte:#04x} outside frame"),
            }
        }

        let mut frame = vec![END];
        loop {
            match self
                .link
                .read_byte(timeout)
            {
                None => return Ok(None),
                Some(END) if frame.len() == 1 => {},
                Some(END) => {
                    frame.push(END);
                    return Ok(Some(frame));
                },
                Some(byte) => {
                    frame.push(byte);
                    if frame.len() >= self.config.max_frame_len {
                        return Err(Error::Framing(format!(
                            "frame exceeds {} bytes",
                            self.config
                                .max_frame_len
                        )));
                    }
                },
            }
        }
    }

    fn buffer(&mut self, packet: SlipPacket) {
        if self
            .pending
            .len()
            >= MAX_PENDING
        {
            self.pending
                .pop_front();
        }
        self.pending
            .push_back(packet);
    }

    /// Wait for response frames.
    ///
    /// With `expected` set, a buffered response for that command is
    /// returned first; otherwise frames are read until one matches, and
    /// unrelated ones are buffered. Without `expected`, every frame is
    /// collected until the line goes quiet.
    pub fn wait_for_response(&mut self, expected: Option<u8>) -> Result<Response> {
        if let Some(command) = expected {
            if let Some(at) = self
                .pending
                .iter()
                .position(|p| p.command() == command)
            {
                if let Some(packet) = self
                    .pending
                    .remove(at)
                {
                    trace!("Using buffered response for {command:#04x}");
                    return Ok(Response::Matched(packet));
                }
            }
        }

        let mut collected = Vec::new();
        while let Some(frame) = self.read_frame()? {
            let packet = SlipPacket::decode(&frame)?;
            match expected {
                Some(command) if packet.command() == command => {
                    return Ok(Response::Matched(packet));
                },
                Some(command) => {
                    debug!(
                        "Buffering response {:#04x} while waiting for {command:#04x}",
                        packet.command()
                    );
                    self.buffer(packet.clone());
                    collected.push(packet);
                },
                None => collected.push(packet),
            }
        }

        if collected.is_empty() {
            Ok(Response::NoReply)
        } else {
            Ok(Response::Collected(collected))
        }
    }

    /// Write `packet` and wait for the response to its command, resending
    /// when nothing matching arrives.
    fn write_packet_wait(
        &mut self,
        packet: &mut SlipPacket,
        checksum: bool,
        attempts: usize,
        stage: &str,
    ) -> Result<SlipPacket> {
        let expected = packet.command();
        let mut unrelated = None;

        for attempt in 1..=attempts.max(1) {
            self.write_packet(packet, checksum)?;
            match self.wait_for_response(Some(expected))? {
                Response::Matched(reply) => return Ok(reply),
                Response::Collected(others) => {
                    unrelated = others
                        .last()
                        .map(SlipPacket::command);
                    warn!("{stage}: only unrelated responses (attempt {attempt}/{attempts})");
                },
                Response::NoReply => warn!("{stage}: no reply (attempt {attempt}/{attempts})"),
            }
        }

        match unrelated {
            Some(got) => Err(Error::UnexpectedResponse { expected, got }),
            None => Err(Error::no_reply(stage)),
        }
    }

    fn check_status(reply: &SlipPacket, stage: &str) -> Result<()> {
        match response_status(reply) {
            Some((1, status)) => Err(Error::DeviceFailure {
                stage: stage.to_string(),
                status,
            }),
            Some(_) => Ok(()),
            None => Err(Error::Framing(format!(
                "{stage}: response too short for a status field"
            ))),
        }
    }

    fn request(&mut self, mut packet: SlipPacket, command: Command) -> Result<SlipPacket> {
        let attempts = self
            .config
            .write_retries;
        let reply = self.write_packet_wait(&mut packet, false, attempts, command.name())?;
        Self::check_status(&reply, command.name())?;
        Ok(reply)
    }

    /// Handshake with the ROM loader.
    ///
    /// The ROM answers one SYNC with several responses; the extras are
    /// drained so they cannot be taken for the next command's response.
    pub fn sync(&mut self) -> Result<()> {
        let attempts = self
            .config
            .write_retries;
        let mut packet = sync_packet();
        self.write_packet_wait(&mut packet, false, attempts, Command::Sync.name())?;

        let drain = self
            .config
            .sync_drain_timeout;
        let mut drained = 0usize;
        while self
            .link
            .read_byte(drain)
            .is_some()
        {
            drained += 1;
        }
        self.pending
            .retain(|p| p.command() != Command::Sync.code());
        trace!("Drained {drained} bytes after SYNC");
        Ok(())
    }

    /// Attach the SPI flash.
    pub fn attach_spi(&mut self) -> Result<()> {
        self.request(spi_attach_packet(), Command::SpiAttach)?;
        Ok(())
    }

    /// Send the flash geometry.
    pub fn set_spi_parameters(&mut self) -> Result<()> {
        let packet = spi_params_packet(
            &self
                .config
                .spi_params,
        );
        self.request(packet, Command::SpiSetParams)?;
        Ok(())
    }

    /// Erase `size` bytes at `offset` and announce `num_blocks` blocks.
    pub fn flash_begin(&mut self, size: u32, num_blocks: u32, offset: u32) -> Result<()> {
        debug!("Flash begin: {size} bytes, {num_blocks} blocks at {offset:#x}");
        self.request(
            flash_begin_packet(size, num_blocks, offset),
            Command::FlashBegin,
        )?;
        Ok(())
    }

    /// Send `data` in 1024-byte blocks, the last padded with 0xFF.
    pub fn flash_data(
        &mut self,
        name: &str,
        data: &[u8],
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        let attempts = self
            .config
            .write_retries;
        let total = data.len();
        sink.info(format!(
            "Flashing {name}: {} blocks, {total} bytes",
            block_count(total)
        ));

        let offsets = (0usize..).step_by(BLOCK_SIZE);
        for ((sequence, offset), block) in (0u32..)
            .zip(offsets)
            .zip(data.chunks(BLOCK_SIZE))
        {
            if is_interrupted_requested() {
                return Err(Error::Interrupted);
            }
            let percent = percent_of(offset, total);
            sink.update(format!("Flashing {name}: {percent}%"));
            sink.percent(name, percent);

            let stage = format!("Writing {name} at byte offset {offset:#x}");
            let mut packet = flash_data_packet(sequence, block);
            let reply = self.write_packet_wait(&mut packet, true, attempts, &stage)?;
            if let Err(e) = Self::check_status(&reply, &stage) {
                sink.error(format!("{stage}: FAILED"));
                return Err(e);
            }
        }

        sink.update(format!("Flashing {name}: 100%"));
        sink.percent(name, 100);
        Ok(())
    }

    /// Leave flash mode.
    pub fn flash_end(&mut self) -> Result<()> {
        self.request(flash_end_packet(), Command::FlashEnd)?;
        Ok(())
    }

    /// Compare the device's MD5 of a region with `expected` (hex).
    pub fn flash_md5(&mut self, address: u32, size: u32, expected: &str) -> Result<()> {
        let reply = self.request(flash_md5_packet(address, size), Command::SpiFlashMd5)?;
        let payload = reply.payload();
        if payload.len() < MD5_HEX_LEN {
            return Err(Error::Framing(format!(
                "MD5 response carries {} bytes, expected at least {MD5_HEX_LEN}",
                payload.len()
            )));
        }

        let actual = String::from_utf8_lossy(&payload[..MD5_HEX_LEN]).to_ascii_lowercase();
        let expected = expected.to_ascii_lowercase();
        if actual != expected {
            return Err(Error::Md5Mismatch {
                address,
                expected,
                actual,
            });
        }
        debug!("MD5 at {address:#x} matches {actual}");
        Ok(())
    }

    /// Flash every image in order, verifying each, then end once.
    pub fn flash_all(
        &mut self,
        images: &[FirmwareImage],
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        for image in images {
            let size = u32::try_from(image.len()).map_err(|_| {
                Error::Config(format!("{} is larger than 4 GiB", image.name))
            })?;
            sink.info(format!(
                "Flashing {}: {size:#x} bytes at {:#x}",
                image.name, image.offset
            ));

            sink.phase(Phase::Erasing);
            self.flash_begin(size, block_count(image.len()), image.offset)?;
            sink.phase(Phase::Writing);
            self.flash_data(&image.name, &image.data, sink)?;

            sink.phase(Phase::Verifying);
            sink.info(format!("Verify {}: STARTED", image.name));
            if let Err(e) = self.flash_md5(image.offset, size, &image.md5_hex()) {
                sink.error(format!("Verify {}: FAILED", image.name));
                return Err(e);
            }
            sink.info(format!("Verify {}: COMPLETE", image.name));
        }

        self.flash_end()?;
        sink.info("Flashing complete");
        Ok(())
    }
}

impl Flasher for Esp32Client<'_> {
    fn connect(&mut self, sink: &mut dyn ProgressSink) -> Result<()> {
        sink.info("Activating device");
        if let Err(e) = self.sync() {
            sink.error("Activating device: FAILED");
            return Err(e);
        }
        sink.info("Activating device: SUCCESS");

        self.attach_spi()?;
        sink.info("Attach SPI: SUCCESS");
        self.set_spi_parameters()?;
        sink.info("Set SPI parameters: SUCCESS");
        Ok(())
    }

    fn flash(
        &mut self,
        target: Target,
        provider: &dyn BinaryProvider,
        sink: &mut dyn ProgressSink,
    ) -> Result<()> {
        if target != Target::Net {
            return Err(Error::Config(format!(
                "{target} is not flashed through the ESP32 loader"
            )));
        }
        let images = provider.esp32_images()?;
        if images.is_empty() {
            return Err(Error::Config("no ESP32 images to flash".into()));
        }
        self.flash_all(&images, sink)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            port::{
                Parity,
                mock::{MockDevice, Silent},
            },
            progress::RecordingSink,
            protocol::slip::Direction,
            target::esp32::fake::FakeEsp32,
        },
    };

    fn fast_config() -> Esp32Config {
        Esp32Config {
            byte_timeout: Duration::from_millis(100),
            sync_drain_timeout: Duration::from_millis(30),
            ..Esp32Config::default()
        }
    }

    fn open(device: &MockDevice) -> SerialLink {
        let mut link = SerialLink::new(Box::new(device.connector()));
        link.open(Parity::None)
            .unwrap();
        link
    }

    fn response(command: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = SlipPacket::new(Direction::Incoming, command);
        packet.push_slice(payload);
        packet
            .encode(false)
            .to_vec()
    }

    fn data(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31) ^ seed)
            .collect()
    }

    #[test]
    fn test_sync_retries_five_times_then_fails() {
        let device = MockDevice::new(Silent);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config().with_byte_timeout(Duration::from_millis(20)));

        assert!(matches!(client.sync(), Err(Error::NoReply { .. })));
        assert_eq!(
            device
                .writes()
                .len(),
            5
        );
    }

    #[test]
    fn test_sync_drains_extra_responses() {
        let fake = FakeEsp32::new();
        let device = MockDevice::new(fake.clone());
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        client
            .sync()
            .unwrap();
        client
            .attach_spi()
            .unwrap();
        assert!(client
            .pending
            .is_empty());
        assert_eq!(fake.commands(), vec![0x08, 0x0D]);
    }

    #[test]
    fn test_retry_after_silence() {
        let fake = FakeEsp32::new();
        fake.ignore_writes(2);
        let device = MockDevice::new(fake.clone());
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        client
            .attach_spi()
            .unwrap();
        assert_eq!(
            device
                .writes()
                .len(),
            3
        );
    }

    #[test]
    fn test_flash_all_sequences_images() {
        let fake = FakeEsp32::new();
        let device = MockDevice::new(fake.clone());
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());
        let mut sink = RecordingSink::default();

        let images = vec![
            FirmwareImage::new("bootloader", 0x0, data(1500, 1)),
            FirmwareImage::new("app", 0x10000, data(3000, 2)),
        ];
        client
            .flash_all(&images, &mut sink)
            .unwrap();

        assert_eq!(
            fake.commands(),
            vec![0x02, 0x03, 0x03, 0x13, 0x02, 0x03, 0x03, 0x03, 0x13, 0x04]
        );
        assert_eq!(fake.sequences(), vec![0, 1, 0, 1, 2]);
        assert_eq!(fake.read(0x0, 1500), images[0].data);
        assert_eq!(fake.read(0x10000, 3000), images[1].data);
        assert_eq!(fake.read(0x10000 + 3000, 4), vec![0xFF; 4]);
        assert!(sink.contains("Verify app: COMPLETE"));
        assert_eq!(
            sink.phases,
            [
                Phase::Erasing,
                Phase::Writing,
                Phase::Verifying,
                Phase::Erasing,
                Phase::Writing,
                Phase::Verifying
            ]
        );
    }

    #[test]
    fn test_flash_data_reports_name_and_offset_on_failure() {
        let fake = FakeEsp32::new();
        fake.fail_data_block(1, 0x07);
        let device = MockDevice::new(fake);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        client
            .flash_begin(3000, 3, 0x10000)
            .unwrap();
        let err = client
            .flash_data("app", &data(3000, 0), &mut RecordingSink::default())
            .unwrap_err();
        match err {
            Error::DeviceFailure { stage, status } => {
                assert_eq!(status, 0x07);
                assert!(stage.contains("app"));
                assert!(stage.contains("0x400"));
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_device_failure_on_flash_begin() {
        let fake = FakeEsp32::new();
        fake.fail_command(0x02, 0x05);
        let device = MockDevice::new(fake);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        assert!(matches!(
            client.flash_begin(16, 1, 0),
            Err(Error::DeviceFailure { status: 0x05, .. })
        ));
    }

    #[test]
    fn test_md5_mismatch() {
        let fake = FakeEsp32::new();
        let device = MockDevice::new(fake);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        let images = vec![
            FirmwareImage::new("app", 0x10000, data(100, 3))
                .with_md5("00000000000000000000000000000000"),
        ];
        let err = client
            .flash_all(&images, &mut RecordingSink::default())
            .unwrap_err();
        assert!(matches!(err, Error::Md5Mismatch { address: 0x10000, .. }));
    }

    #[test]
    fn test_unrelated_response_is_buffered() {
        let fake = FakeEsp32::new();
        fake.prepend_unsolicited(0x0D, 0x0B);
        let device = MockDevice::new(fake.clone());
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        client
            .attach_spi()
            .unwrap();
        assert_eq!(
            client
                .pending
                .len(),
            1
        );

        // Served from the buffer without another write.
        let writes = device
            .writes()
            .len();
        match client
            .wait_for_response(Some(0x0B))
            .unwrap()
        {
            Response::Matched(packet) => assert_eq!(packet.command(), 0x0B),
            other => panic!("unexpected response: {other:?}"),
        }
        assert_eq!(
            device
                .writes()
                .len(),
            writes
        );
    }

    #[test]
    fn test_only_unrelated_responses_is_unexpected_response() {
        let fake = FakeEsp32::new();
        fake.answer_as(0x0D, 0x0B);
        let device = MockDevice::new(fake);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        assert!(matches!(
            client.attach_spi(),
            Err(Error::UnexpectedResponse {
                expected: 0x0D,
                got: 0x0B
            })
        ));
        assert_eq!(
            device
                .writes()
                .len(),
            5
        );
    }

    #[test]
    fn test_wait_collects_everything_without_expectation() {
        let device = MockDevice::new(Silent);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        let mut raw = response(0x08, &[0, 0, 0, 0]);
        raw.extend(response(0x08, &[0, 0, 0, 0]));
        device.inject(&raw);

        match client
            .wait_for_response(None)
            .unwrap()
        {
            Response::Collected(packets) => assert_eq!(packets.len(), 2),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(matches!(
            client
                .wait_for_response(None)
                .unwrap(),
            Response::NoReply
        ));
    }

    #[test]
    fn test_wait_skips_noise_and_double_delimiter() {
        let device = MockDevice::new(Silent);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config());

        let mut raw = vec![0x00, 0x55, END];
        raw.extend(response(0x0D, &[0, 0, 0, 0]));
        device.inject(&raw);

        assert!(matches!(
            client
                .wait_for_response(Some(0x0D))
                .unwrap(),
            Response::Matched(_)
        ));
    }

    #[test]
    fn test_oversized_frame_is_framing_error() {
        let device = MockDevice::new(Silent);
        let mut link = open(&device);
        let mut client = Esp32Client::new(&mut link, fast_config().with_max_frame_len(64));

        let mut raw = vec![END];
        raw.extend_from_slice(&[0x11; 100]);
        device.inject(&raw);

        assert!(matches!(
            client.wait_for_response(Some(0x0D)),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn test_response_status_length() {
        let decode = |raw: Vec<u8>| SlipPacket::decode(&raw).unwrap();

        // 8 + 2 bytes: two-byte status.
        let packet = decode(response(0x0D, &[1, 0x05]));
        assert_eq!(response_status(&packet), Some((1, 0x05)));

        // 8 + 18 bytes: raw digest plus two-byte status.
        let mut payload = vec![0xAA; 16];
        payload.extend_from_slice(&[0, 0]);
        let packet = decode(response(0x13, &payload));
        assert_eq!(response_status(&packet), Some((0, 0)));

        // 8 + 4 bytes: four-byte status.
        let packet = decode(response(0x0D, &[1, 0x08, 0, 0]));
        assert_eq!(response_status(&packet), Some((1, 0x08)));

        let packet = decode(response(0x0D, &[]));
        assert_eq!(response_status(&packet), None);
    }
}
