//! In-process ESP32 ROM loader for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use byteorder::{ByteOrder, LittleEndian};

use crate::image::md5_hex;
use crate::port::mock::Responder;
use crate::protocol::slip::{Direction, SlipPacket, slip_checksum};
use crate::target::esp32::protocol::{BLOCK_SIZE, Command, DATA_HEADER_LEN};

const OK: [u8; 4] = [0, 0, 0, 0];

struct State {
    memory: HashMap<u32, u8>,
    region: u32,
    extra_sync: usize,
    ignore: usize,
    failures: HashMap<u8, u8>,
    data_failure: Option<(u32, u8)>,
    unsolicited: HashMap<u8, u8>,
    renamed: HashMap<u8, u8>,
    commands: Vec<u8>,
    sequences: Vec<u32>,
}

/// Handle to a fake ROM loader; clones share state.
#[derive(Clone)]
pub(crate) struct FakeEsp32 {
    state: Arc<Mutex<State>>,
}

fn word(payload: &[u8], index: usize) -> u32 {
    payload
        .get(index * 4..index * 4 + 4)
        .map(LittleEndian::read_u32)
        .unwrap_or_default()
}

fn reply(command: u8, body: &[u8], status: [u8; 4]) -> Vec<u8> {
    let mut packet = SlipPacket::new(Direction::Incoming, command);
    packet.push_slice(body);
    packet.push_slice(&status);
    packet
        .encode(false)
        .to_vec()
}

impl FakeEsp32 {
    /// A loader that answers SYNC eight times, like the ROM does.
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                memory: HashMap::new(),
                region: 0,
                extra_sync: 7,
                ignore: 0,
                failures: HashMap::new(),
                data_failure: None,
                unsolicited: HashMap::new(),
                renamed: HashMap::new(),
                commands: Vec::new(),
                sequences: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drop the next `count` writes without answering.
    pub(crate) fn ignore_writes(&self, count: usize) {
        self.lock()
            .ignore = count;
    }

    /// Report failure `code` for every `command`.
    pub(crate) fn fail_command(&self, command: u8, code: u8) {
        self.lock()
            .failures
            .insert(command, code);
    }

    /// Report failure `code` for data block `sequence`.
    pub(crate) fn fail_data_block(&self, sequence: u32, code: u8) {
        self.lock()
            .data_failure = Some((sequence, code));
    }

    /// Send an unrequested `extra` response ahead of each `command` response.
    pub(crate) fn prepend_unsolicited(&self, command: u8, extra: u8) {
        self.lock()
            .unsolicited
            .insert(command, extra);
    }

    /// Answer `command` with a response labelled `other`.
    pub(crate) fn answer_as(&self, command: u8, other: u8) {
        self.lock()
            .renamed
            .insert(command, other);
    }

    /// Commands answered so far.
    pub(crate) fn commands(&self) -> Vec<u8> {
        self.lock()
            .commands
            .clone()
    }

    /// Sequence numbers of accepted data blocks.
    pub(crate) fn sequences(&self) -> Vec<u32> {
        self.lock()
            .sequences
            .clone()
    }

    pub(crate) fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        state.read(address, len)
    }
}

impl State {
    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (address..)
            .take(len)
            .map(|a| {
                self.memory
                    .get(&a)
                    .copied()
                    .unwrap_or(0xFF)
            })
            .collect()
    }

    fn handle(&mut self, packet: &SlipPacket) -> (Vec<u8>, [u8; 4]) {
        let payload = packet.payload();
        let command = packet.command();
        if let Some(&code) = self
            .failures
            .get(&command)
        {
            return (Vec::new(), [1, code, 0, 0]);
        }

        match command {
            c if c == Command::FlashBegin.code() => {
                let size = word(payload, 0);
                let offset = word(payload, 3);
                self.memory
                    .retain(|a, _| !(offset..offset.saturating_add(size)).contains(a));
                self.region = offset;
                (Vec::new(), OK)
            },
            c if c == Command::FlashData.code() => {
                let sequence = word(payload, 1);
                let block = payload
                    .get(DATA_HEADER_LEN..)
                    .unwrap_or_default();
                if block.len() != BLOCK_SIZE
                    || u32::from(slip_checksum(block)) != packet.checksum()
                {
                    return (Vec::new(), [1, 0x07, 0, 0]);
                }
                if let Some((failing, code)) = self.data_failure {
                    if failing == sequence {
                        return (Vec::new(), [1, code, 0, 0]);
                    }
                }
                #[allow(clippy::cast_possible_truncation)]
                let base = self.region + sequence * BLOCK_SIZE as u32;
                for (address, &byte) in (base..).zip(block) {
                    self.memory
                        .insert(address, byte);
                }
                self.sequences
                    .push(sequence);
                (Vec::new(), OK)
            },
            c if c == Command::SpiFlashMd5.code() => {
                let address = word(payload, 0);
                let size = word(payload, 1) as usize;
                let digest = md5_hex(&self.read(address, size));
                (digest.into_bytes(), OK)
            },
            _ => (Vec::new(), OK),
        }
    }
}

impl Responder for FakeEsp32 {
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut state = self.lock();
        if state.ignore > 0 {
            state.ignore -= 1;
            return Vec::new();
        }
        let Ok(packet) = SlipPacket::decode(bytes) else {
            return Vec::new();
        };

        let command = packet.command();
        state
            .commands
            .push(command);
        let (body, status) = state.handle(&packet);

        let mut out = Vec::new();
        if let Some(&extra) = state
            .unsolicited
            .get(&command)
        {
            out.extend(reply(extra, &[], OK));
        }
        let label = state
            .renamed
            .get(&command)
            .copied()
            .unwrap_or(command);
        let answer = reply(label, &body, status);
        out.extend_from_slice(&answer);
        if command == Command::Sync.code() {
            for _ in 0..state.extra_sync {
                out.extend_from_slice(&answer);
            }
        }
        out
    }
}
