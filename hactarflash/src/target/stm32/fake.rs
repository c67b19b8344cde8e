//! In-process ST bootloader for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::image::SectorConfig;
use crate::port::mock::Responder;
use crate::protocol::{ACK, NACK, xor_checksum};
use crate::target::stm32::protocol::{Command, ERASED, SYNC};

#[derive(Debug, Clone, Copy)]
enum Phase {
    Idle,
    ReadAddress,
    ReadLength(u32),
    WriteAddress,
    WriteData(u32),
    EraseList,
    GoAddress,
}

struct State {
    layout: SectorConfig,
    memory: HashMap<u32, u8>,
    commands: Vec<u8>,
    chip_id: Vec<u8>,
    phase: Phase,
    double_ack_on_id: bool,
    nack_id_length: bool,
    nack_sync: bool,
    nack_command: Option<u8>,
    garbage: Option<(u8, u8)>,
    corrupt: Option<u32>,
    stuck: HashMap<u32, u8>,
    write_sizes: Vec<usize>,
    erased: Vec<Vec<u16>>,
    reads: usize,
    jumped: Option<u32>,
}

/// Handle to a fake bootloader; clones share state.
#[derive(Clone)]
pub(crate) struct FakeStm32 {
    state: Arc<Mutex<State>>,
}

impl FakeStm32 {
    pub(crate) fn new(layout: SectorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                layout,
                memory: HashMap::new(),
                commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92],
                chip_id: vec![0x04, 0x13],
                phase: Phase::Idle,
                double_ack_on_id: false,
                nack_id_length: false,
                nack_sync: false,
                nack_command: None,
                garbage: None,
                corrupt: None,
                stuck: HashMap::new(),
                write_sizes: Vec::new(),
                erased: Vec::new(),
                reads: 0,
                jumped: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn double_ack_on_id(&self) {
        self.lock()
            .double_ack_on_id = true;
    }

    /// Answer Get ID with NACK where the length byte belongs.
    pub(crate) fn nack_id_length(&self) {
        self.lock()
            .nack_id_length = true;
    }

    pub(crate) fn nack_sync(&self) {
        self.lock()
            .nack_sync = true;
    }

    pub(crate) fn nack_command(&self, code: u8) {
        self.lock()
            .nack_command = Some(code);
    }

    /// Answer `code` with `byte` instead of ACK.
    pub(crate) fn garbage_reply(&self, code: u8, byte: u8) {
        self.lock()
            .garbage = Some((code, byte));
    }

    pub(crate) fn without_command(&self, code: u8) {
        self.lock()
            .commands
            .retain(|&c| c != code);
    }

    /// Flip the byte at `address` in every read-back.
    pub(crate) fn corrupt_read(&self, address: u32) {
        self.lock()
            .corrupt = Some(address);
    }

    /// A cell that always reads as `value`, erased or not.
    pub(crate) fn stuck_byte(&self, address: u32, value: u8) {
        self.lock()
            .stuck
            .insert(address, value);
    }

    pub(crate) fn preload(&self, address: u32, bytes: &[u8]) {
        let mut state = self.lock();
        for (address, &byte) in (address..).zip(bytes) {
            state
                .memory
                .insert(address, byte);
        }
    }

    /// Flash contents as stored, ignoring read faults.
    pub(crate) fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let state = self.lock();
        (address..)
            .take(len)
            .map(|a| {
                state
                    .memory
                    .get(&a)
                    .copied()
                    .unwrap_or(ERASED)
            })
            .collect()
    }

    pub(crate) fn write_sizes(&self) -> Vec<usize> {
        self.lock()
            .write_sizes
            .clone()
    }

    pub(crate) fn erased(&self) -> Vec<Vec<u16>> {
        self.lock()
            .erased
            .clone()
    }

    pub(crate) fn reads(&self) -> usize {
        self.lock()
            .reads
    }

    pub(crate) fn jumped(&self) -> Option<u32> {
        self.lock()
            .jumped
    }
}

fn parse_address(bytes: &[u8]) -> Option<u32> {
    match bytes {
        [a3, a2, a1, a0, cs] if xor_checksum(&bytes[..4]) == *cs => {
            Some(u32::from_be_bytes([*a3, *a2, *a1, *a0]))
        },
        _ => None,
    }
}

impl State {
    fn read_cell(&self, address: u32) -> u8 {
        let mut value = self
            .stuck
            .get(&address)
            .or_else(|| {
                self.memory
                    .get(&address)
            })
            .copied()
            .unwrap_or(ERASED);
        if self.corrupt == Some(address) {
            value ^= 0xFF;
        }
        value
    }

    fn command(&mut self, code: u8) -> Vec<u8> {
        if self.nack_command == Some(code) || !self.commands.contains(&code) {
            return vec![NACK];
        }
        if let Some((garbage_code, byte)) = self.garbage {
            if garbage_code == code {
                return vec![byte];
            }
        }

        match Command::from_code(code) {
            Some(Command::Get) => {
                #[allow(clippy::cast_possible_truncation)]
                let mut reply = vec![ACK, self.commands.len() as u8, 0x31];
                reply.extend_from_slice(&self.commands);
                reply.push(ACK);
                reply
            },
            Some(Command::GetVersion) => vec![ACK, 0x31, 0x00, 0x00, ACK],
            Some(Command::GetId) => {
                let mut reply = vec![ACK];
                if self.double_ack_on_id {
                    reply.push(ACK);
                }
                if self.nack_id_length {
                    reply.push(NACK);
                    return reply;
                }
                #[allow(clippy::cast_possible_truncation)]
                reply.push((self.chip_id.len() - 1) as u8);
                reply.extend_from_slice(&self.chip_id);
                reply.push(ACK);
                reply
            },
            Some(Command::ReadMemory) => {
                self.phase = Phase::ReadAddress;
                vec![ACK]
            },
            Some(Command::WriteMemory) => {
                self.phase = Phase::WriteAddress;
                vec![ACK]
            },
            Some(Command::ExtendedErase) => {
                self.phase = Phase::EraseList;
                vec![ACK]
            },
            Some(Command::Go) => {
                self.phase = Phase::GoAddress;
                vec![ACK]
            },
            _ => vec![NACK],
        }
    }

    fn erase(&mut self, bytes: &[u8]) -> Vec<u8> {
        if bytes.len() < 3 || xor_checksum(&bytes[..bytes.len() - 1]) != bytes[bytes.len() - 1] {
            return vec![NACK];
        }
        let count = usize::from(u16::from_be_bytes([bytes[0], bytes[1]])) + 1;
        let list = &bytes[2..bytes.len() - 1];
        if list.len() != count * 2 {
            return vec![NACK];
        }

        let indices: Vec<u16> = list
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        for &index in &indices {
            let Some(sector) = self
                .layout
                .sectors
                .get(usize::from(index))
                .copied()
            else {
                return vec![NACK];
            };
            let range = sector.address..sector.address + sector.size;
            self.memory
                .retain(|address, _| !range.contains(address));
        }
        self.erased
            .push(indices);
        vec![ACK]
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Vec<u8> {
        let Some((&n, rest)) = bytes.split_first() else {
            return vec![NACK];
        };
        let len = usize::from(n) + 1;
        if rest.len() != len + 1 || len % 4 != 0 || xor_checksum(&bytes[..=len]) != rest[len] {
            return vec![NACK];
        }
        for (address, &byte) in (address..).zip(&rest[..len]) {
            self.memory
                .insert(address, byte);
        }
        self.write_sizes
            .push(len);
        vec![ACK]
    }
}

impl Responder for FakeStm32 {
    fn on_write(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut state = self.lock();
        let phase = state.phase;
        state.phase = Phase::Idle;

        match phase {
            Phase::Idle => match bytes {
                [SYNC] if state.nack_sync => vec![NACK],
                [SYNC] => vec![ACK],
                [code, complement] if *complement == code ^ 0xFF => state.command(*code),
                _ => vec![NACK],
            },
            Phase::ReadAddress => match parse_address(bytes) {
                Some(address) => {
                    state.phase = Phase::ReadLength(address);
                    vec![ACK]
                },
                None => vec![NACK],
            },
            Phase::ReadLength(address) => match bytes {
                [n, complement] if *complement == n ^ 0xFF => {
                    state.reads += 1;
                    let mut reply = vec![ACK];
                    reply.extend(
                        (address..)
                            .take(usize::from(*n) + 1)
                            .map(|a| state.read_cell(a)),
                    );
                    reply
                },
                _ => vec![NACK],
            },
            Phase::WriteAddress => match parse_address(bytes) {
                Some(address) => {
                    state.phase = Phase::WriteData(address);
                    vec![ACK]
                },
                None => vec![NACK],
            },
            Phase::WriteData(address) => state.write(address, bytes),
            Phase::EraseList => state.erase(bytes),
            Phase::GoAddress => match parse_address(bytes) {
                Some(address) => {
                    state.jumped = Some(address);
                    vec![ACK]
                },
                None => vec![NACK],
            },
        }
    }
}
