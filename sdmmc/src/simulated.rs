//! A byte-level model of an SD/MMC card in SPI mode.
//!
//! [Card] implements [Bus], answering command frames, data tokens and data packets the way a
//! physical card would. It is deterministic: initialization latency, busy periods and faults are
//! all set by [Config].

use crate::{
    command::{r1, token, Command, FILLER},
    Bus,
};
use quadtrail_codec::SECTOR_SIZE;
use std::collections::{BTreeMap, VecDeque};

/// Length of a command frame on the wire.
const FRAME_LEN: usize = 6;

/// Length of a data packet after its start token (payload and checksum).
const PACKET_LEN: usize = SECTOR_SIZE + 2;

/// Card generation to emulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Second-generation SD (answers the voltage probe).
    SdV2 { high_capacity: bool },
    /// First-generation SD.
    SdV1,
    /// MultiMediaCard (refuses application-specific commands).
    Mmc,
}

/// Configuration for a simulated [Card].
#[derive(Debug, Clone)]
pub struct Config {
    pub generation: Generation,

    /// Capacity, in sectors.
    pub sectors: u32,

    /// Number of start-initialization commands answered with idle before the card becomes ready
    /// (`None` keeps it idle forever).
    pub idle_polls: Option<u32>,

    /// Never drive the line (as if no card were inserted).
    pub silent: bool,

    /// Answer every data packet with a write error.
    pub reject_writes: bool,

    /// Number of bytes the card holds the line low after programming a block.
    pub busy_cycles: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            generation: Generation::SdV2 {
                high_capacity: true,
            },
            sectors: 1 << 16,
            idle_polls: Some(3),
            silent: false,
            reject_writes: false,
            busy_cycles: 4,
        }
    }
}

#[derive(Debug)]
enum State {
    /// Collecting a command frame.
    Command,
    /// Waiting for the start token of a data packet.
    AwaitPacket { sector: u32, multi: bool },
    /// Receiving a data packet.
    Packet {
        sector: u32,
        multi: bool,
        data: Vec<u8>,
    },
}

/// A simulated card.
pub struct Card {
    cfg: Config,

    selected: bool,
    fast: bool,
    spi_mode: bool,
    idle: bool,
    polls: u32,
    app: bool,
    busy: u32,
    elapsed_ms: u32,

    frame: Vec<u8>,
    state: State,
    outgoing: VecDeque<u8>,

    sectors: BTreeMap<u32, [u8; SECTOR_SIZE]>,
    writes: Vec<u32>,
    erase_count: Option<u32>,
}

impl Card {
    /// Create a powered-down card with blank media.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            selected: false,
            fast: false,
            spi_mode: false,
            idle: true,
            polls: 0,
            app: false,
            busy: 0,
            elapsed_ms: 0,
            frame: Vec::with_capacity(FRAME_LEN),
            state: State::Command,
            outgoing: VecDeque::new(),
            sectors: BTreeMap::new(),
            writes: Vec::new(),
            erase_count: None,
        }
    }

    /// Raw contents of `sector` (all zero if never written).
    pub fn read(&self, sector: u32) -> [u8; SECTOR_SIZE] {
        self.sectors
            .get(&sector)
            .copied()
            .unwrap_or([0; SECTOR_SIZE])
    }

    /// Overwrite the raw contents of `sector`, bypassing the protocol.
    pub fn write(&mut self, sector: u32, data: &[u8]) {
        let mut raw = [0u8; SECTOR_SIZE];
        let len = data.len().min(SECTOR_SIZE);
        raw[..len].copy_from_slice(&data[..len]);
        self.store(sector, raw);
    }

    /// Sectors programmed through the protocol, in order.
    pub fn writes(&self) -> &[u32] {
        &self.writes
    }

    /// Block count of the last pre-erase declaration, if any.
    pub fn erase_count(&self) -> Option<u32> {
        self.erase_count
    }

    /// Returns true once the link has been switched to its fast rate.
    pub fn is_fast(&self) -> bool {
        self.fast
    }

    /// Returns true while the card has not completed initialization.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Total milliseconds spent in [Bus::delay_ms].
    pub fn elapsed_ms(&self) -> u32 {
        self.elapsed_ms
    }

    fn store(&mut self, sector: u32, raw: [u8; SECTOR_SIZE]) {
        if raw.iter().all(|byte| *byte == 0) {
            self.sectors.remove(&sector);
        } else {
            self.sectors.insert(sector, raw);
        }
    }

    fn status(&self) -> u8 {
        if self.idle {
            r1::IDLE
        } else {
            r1::READY
        }
    }

    /// Resolve a data command argument into a sector number (or the R1 error to answer with).
    fn resolve(&self, arg: u32) -> Result<u32, u8> {
        let sector = match self.cfg.generation {
            Generation::SdV2 {
                high_capacity: true,
            } => arg,
            _ => {
                if arg % SECTOR_SIZE as u32 != 0 {
                    return Err(r1::ADDRESS_ERROR);
                }
                arg / SECTOR_SIZE as u32
            }
        };
        if sector >= self.cfg.sectors {
            return Err(r1::PARAMETER_ERROR);
        }
        Ok(sector)
    }

    /// Advance initialization by one start-initialization command.
    fn initialize_step(&mut self) -> u8 {
        if !self.idle {
            return r1::READY;
        }
        match self.cfg.idle_polls {
            Some(polls) if self.polls >= polls => {
                self.idle = false;
                r1::READY
            }
            Some(_) => {
                self.polls += 1;
                r1::IDLE
            }
            None => r1::IDLE,
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        // One byte of response latency
        self.outgoing.push_back(FILLER);
        self.outgoing.extend(bytes);
    }

    fn execute(&mut self, frame: [u8; FRAME_LEN]) {
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let crc = frame[5];
        let app = std::mem::take(&mut self.app);
        let command = Command::decode(index, app);

        // Before the first reset the card ignores everything else
        if command == Some(Command::GoIdleState) {
            if crc != Command::GoIdleState.crc() {
                return;
            }
            self.spi_mode = true;
            self.idle = true;
            self.polls = 0;
            self.respond(&[r1::IDLE]);
            return;
        }
        if !self.spi_mode {
            return;
        }

        let status = self.status();
        let Some(command) = command else {
            self.respond(&[status | r1::ILLEGAL_COMMAND]);
            return;
        };
        match command {
            Command::GoIdleState => {}
            Command::SendIfCond => match self.cfg.generation {
                Generation::SdV2 { .. } if crc != Command::SendIfCond.crc() => {
                    self.respond(&[status | r1::CRC_ERROR]);
                }
                Generation::SdV2 { .. } => {
                    self.respond(&[status, 0x00, 0x00, (arg >> 8) as u8 & 0x0F, arg as u8]);
                }
                _ => self.respond(&[status | r1::ILLEGAL_COMMAND]),
            },
            Command::AppCmd => {
                if self.cfg.generation == Generation::Mmc {
                    self.respond(&[status | r1::ILLEGAL_COMMAND]);
                } else {
                    self.app = true;
                    self.respond(&[status]);
                }
            }
            Command::SdSendOpCond | Command::SendOpCond => {
                let response = self.initialize_step();
                self.respond(&[response]);
            }
            Command::ReadOcr => match self.cfg.generation {
                Generation::SdV2 { high_capacity } => {
                    let mut high = 0x80;
                    if high_capacity && !self.idle {
                        high |= 0x40;
                    }
                    self.respond(&[status, high, 0xFF, 0x80, 0x00]);
                }
                _ => self.respond(&[status | r1::ILLEGAL_COMMAND]),
            },
            _ if self.idle => self.respond(&[status | r1::ILLEGAL_COMMAND]),
            Command::SetBlockLen => {
                if arg == SECTOR_SIZE as u32 {
                    self.respond(&[r1::READY]);
                } else {
                    self.respond(&[r1::PARAMETER_ERROR]);
                }
            }
            Command::SetWrBlkEraseCount => {
                self.erase_count = Some(arg);
                self.respond(&[r1::READY]);
            }
            Command::ReadSingleBlock => match self.resolve(arg) {
                Ok(sector) => {
                    let data = self.read(sector);
                    self.respond(&[r1::READY, FILLER, token::START_BLOCK]);
                    self.outgoing.extend(data);
                    self.outgoing.extend([FILLER, FILLER]);
                }
                Err(response) => self.respond(&[response]),
            },
            Command::WriteBlock | Command::WriteMultipleBlock => match self.resolve(arg) {
                Ok(sector) => {
                    self.state = State::AwaitPacket {
                        sector,
                        multi: command == Command::WriteMultipleBlock,
                    };
                    self.respond(&[r1::READY]);
                }
                Err(response) => self.respond(&[response]),
            },
        }
    }

    fn receive(&mut self, byte: u8) {
        match std::mem::replace(&mut self.state, State::Command) {
            State::Command => {
                // Frames start with a 0 bit followed by a 1 bit
                if self.frame.is_empty() && byte & 0xC0 != 0x40 {
                    return;
                }
                self.frame.push(byte);
                if self.frame.len() == FRAME_LEN {
                    let mut frame = [0u8; FRAME_LEN];
                    frame.copy_from_slice(&self.frame);
                    self.frame.clear();
                    self.execute(frame);
                }
            }
            State::AwaitPacket { sector, multi } => {
                self.state = match byte {
                    token::START_BLOCK if !multi => State::Packet {
                        sector,
                        multi,
                        data: Vec::with_capacity(PACKET_LEN),
                    },
                    token::START_MULTI if multi => State::Packet {
                        sector,
                        multi,
                        data: Vec::with_capacity(PACKET_LEN),
                    },
                    token::STOP_TRAN if multi => {
                        self.busy = self.cfg.busy_cycles;
                        State::Command
                    }
                    _ => State::AwaitPacket { sector, multi },
                };
            }
            State::Packet {
                sector,
                multi,
                mut data,
            } => {
                data.push(byte);
                if data.len() < PACKET_LEN {
                    self.state = State::Packet {
                        sector,
                        multi,
                        data,
                    };
                    return;
                }

                if self.cfg.reject_writes || sector >= self.cfg.sectors {
                    self.outgoing.push_back(token::DATA_WRITE_ERROR);
                } else {
                    let mut raw = [0u8; SECTOR_SIZE];
                    raw.copy_from_slice(&data[..SECTOR_SIZE]);
                    self.store(sector, raw);
                    self.writes.push(sector);
                    self.outgoing.push_back(token::DATA_ACCEPTED);
                    self.busy = self.cfg.busy_cycles;
                }
                if multi {
                    self.state = State::AwaitPacket {
                        sector: sector + 1,
                        multi,
                    };
                }
            }
        }
    }
}

impl Bus for Card {
    fn transfer(&mut self, byte: u8) -> u8 {
        if !self.selected || self.cfg.silent {
            return FILLER;
        }
        if let Some(out) = self.outgoing.pop_front() {
            self.receive(byte);
            return out;
        }

        // Programming: hold the line low and ignore input
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        self.receive(byte);
        FILLER
    }

    fn select(&mut self) {
        self.selected = true;
    }

    fn deselect(&mut self) {
        self.selected = false;
        self.outgoing.clear();
        self.frame.clear();
        self.state = State::Command;
    }

    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += ms;
    }

    fn set_fast(&mut self) {
        self.fast = true;
    }
}
