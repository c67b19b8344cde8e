//! SLIP-framed packets spoken by the ESP32 ROM loader.
//!
//! ## Frame Format
//!
//! ```text
//! +------+-----------+---------+-------+-----------+-------------+------+
//! | 0xC0 | Direction | Command | Size  | Checksum  |   Payload   | 0xC0 |
//! +------+-----------+---------+-------+-----------+-------------+------+
//! |  1   |     1     |    1    | 2 LE  |   4 LE    |  Size bytes |  1   |
//! +------+-----------+---------+-------+-----------+-------------+------+
//! ```
//!
//! Inside the delimiters every 0xC0 is sent as `0xDB 0xDC` and every 0xDB
//! as `0xDB 0xDD`. In responses the checksum slot carries a value word
//! instead.

use {
    crate::error::{Error, Result},
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
};

/// Frame delimiter.
pub const END: u8 = 0xC0;
/// Escape introducer.
pub const ESC: u8 = 0xDB;
/// Escaped delimiter.
pub const ESC_END: u8 = 0xDC;
/// Escaped escape.
pub const ESC_ESC: u8 = 0xDD;

/// Direction, command, size and checksum.
pub const HEADER_LEN: usize = 8;

/// Seed of the payload checksum.
pub const CHECKSUM_SEED: u8 = 0xEF;

/// Packet direction as seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Host to device request.
    Outgoing = 0,
    /// Device to host response.
    Incoming = 1,
}

impl Direction {
    /// Parse the direction byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Outgoing),
            1 => Some(Self::Incoming),
            _ => None,
        }
    }
}

/// XOR of `data` seeded with [`CHECKSUM_SEED`].
#[must_use]
pub fn slip_checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(CHECKSUM_SEED, |acc, b| acc ^ b)
}

/// One ROM loader packet.
///
/// The encoded frame is cached. Every mutator drops the cache, so
/// [`encode`](Self::encode) only rebuilds after a change.
#[derive(Debug, Clone)]
pub struct SlipPacket {
    header: [u8; HEADER_LEN],
    payload: Vec<u8>,
    checksum_start: usize,
    encoded: Option<(bool, Vec<u8>)>,
}

impl SlipPacket {
    /// Largest payload the 16-bit size field can describe.
    ///
    /// Pushing past it wraps the size field back to zero, so callers must
    /// stay below it. The ROM loader client never exceeds 1040 bytes.
    pub const MAX_PAYLOAD: usize = 0xFFFF;

    /// Create an empty packet.
    pub fn new(direction: Direction, command: u8) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header[0] = direction as u8;
        header[1] = command;
        Self {
            header,
            payload: Vec::new(),
            checksum_start: 0,
            encoded: None,
        }
    }

    /// Create an outgoing request.
    pub fn request(command: u8) -> Self {
        Self::new(Direction::Outgoing, command)
    }

    /// Direction field, `None` if the byte is neither 0 nor 1.
    pub fn direction(&self) -> Option<Direction> {
        Direction::from_byte(self.header[0])
    }

    /// Set the direction field.
    pub fn set_direction(&mut self, direction: Direction) {
        self.header[0] = direction as u8;
        self.encoded = None;
    }

    /// Command byte.
    pub fn command(&self) -> u8 {
        self.header[1]
    }

    /// Set the command byte.
    pub fn set_command(&mut self, command: u8) {
        self.header[1] = command;
        self.encoded = None;
    }

    /// Size field as stored in the header.
    pub fn size(&self) -> u16 {
        LittleEndian::read_u16(&self.header[2..4])
    }

    /// Checksum field (the value word in responses).
    pub fn checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.header[4..8])
    }

    /// Alias of [`checksum`](Self::checksum) for responses.
    pub fn value(&self) -> u32 {
        self.checksum()
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Header followed by payload, unescaped.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Only payload bytes from `offset` on are covered by the checksum.
    pub fn set_checksum_start(&mut self, offset: usize) {
        self.checksum_start = offset;
        self.encoded = None;
    }

    fn grow(&mut self, count: usize) {
        // Wraps at 65536 like the 16-bit field on the wire.
        #[allow(clippy::cast_possible_truncation)]
        let size = self
            .size()
            .wrapping_add(count as u16);
        LittleEndian::write_u16(&mut self.header[2..4], size);
        self.encoded = None;
    }

    /// Append one byte.
    pub fn push_u8(&mut self, value: u8) {
        self.payload
            .push(value);
        self.grow(1);
    }

    /// Append a 16-bit value in byte order `B`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn push_u16<B: ByteOrder>(&mut self, value: u16) {
        self.payload
            .write_u16::<B>(value)
            .unwrap();
        self.grow(2);
    }

    /// Append a 32-bit value in byte order `B`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn push_u32<B: ByteOrder>(&mut self, value: u32) {
        self.payload
            .write_u32::<B>(value)
            .unwrap();
        self.grow(4);
    }

    /// Append raw bytes.
    pub fn push_slice(&mut self, bytes: &[u8]) {
        self.payload
            .extend_from_slice(bytes);
        self.grow(bytes.len());
    }

    /// Produce the escaped frame.
    ///
    /// With `checksum` set, the checksum field is first filled with
    /// [`slip_checksum`] over the payload from the checksum start offset.
    pub fn encode(&mut self, checksum: bool) -> &[u8] {
        let cached = matches!(&self.encoded, Some((with_checksum, _)) if *with_checksum == checksum);
        if !cached {
            if checksum {
                let start = self
                    .checksum_start
                    .min(
                        self.payload
                            .len(),
                    );
                let sum = slip_checksum(&self.payload[start..]);
                LittleEndian::write_u32(&mut self.header[4..8], u32::from(sum));
            }
            let frame = self.escape();
            self.encoded = Some((checksum, frame));
        }

        match &self.encoded {
            Some((_, frame)) => frame,
            None => &[],
        }
    }

    fn escape(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.frame_len() + self.frame_len() / 8 + 2);
        out.push(END);
        for &byte in self
            .header
            .iter()
            .chain(&self.payload)
        {
            match byte {
                END => out.extend_from_slice(&[ESC, ESC_END]),
                ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
                other => out.push(other),
            }
        }
        out.push(END);
        out
    }

    /// Parse one complete frame, delimiters included.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let interior = match raw {
            [END, interior @ .., END] => interior,
            _ => {
                return Err(Error::Framing(
                    "frame must start and end with 0xC0".into(),
                ));
            },
        };

        let mut bytes = Vec::with_capacity(interior.len());
        let mut iter = interior.iter();
        while let Some(&byte) = iter.next() {
            match byte {
                ESC => match iter.next() {
                    Some(&ESC_END) => bytes.push(END),
                    Some(&ESC_ESC) => bytes.push(ESC),
                    Some(&other) => {
                        return Err(Error::Framing(format!(
                            "invalid escape sequence 0xDB {other:#04x}"
                        )));
                    },
                    None => return Err(Error::Framing("dangling escape byte".into())),
                },
                END => {
                    return Err(Error::Framing(
                        "unescaped delimiter inside frame".into(),
                    ));
                },
                other => bytes.push(other),
            }
        }

        if bytes.len() < HEADER_LEN {
            return Err(Error::ShortHeader { len: bytes.len() });
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let size = usize::from(LittleEndian::read_u16(&header[2..4]));
        let body = &bytes[HEADER_LEN..];
        if body.len() < size {
            return Err(Error::Framing(format!(
                "payload truncated: size field {size}, got {} bytes",
                body.len()
            )));
        }

        Ok(Self {
            header,
            payload: body[..size].to_vec(),
            checksum_start: 0,
            encoded: None,
        })
    }
}
