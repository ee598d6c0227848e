//! Drive SD/MMC cards over a byte-oriented serial link.
//!
//! # Overview
//!
//! A [Card] speaks the SPI-mode command/response protocol of SD and MMC cards over any [Bus] that
//! can clock one byte out while clocking one byte in. Once [Card::initialize] has identified the
//! card generation, the card exposes sector-granular access through the [BlockDevice] trait:
//!
//! * [BlockDevice::read_sector] returns an owned [RecordBuffer] holding the populated head of a
//!   sector.
//! * [BlockDevice::write_sector] persists a [RecordBuffer], zero-filling the rest of the sector.
//! * [BlockDevice::erase_range] zero-fills a contiguous range of sectors.
//!
//! Callers always address sectors by block number. Whether the card expects block numbers or
//! byte offsets is discovered during initialization ([CardKind::addressing]) and applied
//! transparently.
//!
//! # Bounded Waits
//!
//! Every loop that waits on the card is bounded by an attempt count from [Config]. Exhausting one
//! yields [Error::Timeout]; nothing in this crate blocks forever on a card that stops answering.
//!
//! # Write Completion
//!
//! By default, [BlockDevice::write_sector] returns as soon as the card has accepted the data block
//! and its internal write cycle has been triggered. The next command absorbs the busy period when
//! it waits for the card to become ready. Set [Config::wait_for_write] to poll for completion
//! before returning instead, trading latency for the guarantee that the card finished the write.
//!
//! # Testing
//!
//! [memory::Device] implements [BlockDevice] directly on a sector map and [simulated::Card]
//! implements [Bus] with a byte-level model of a card, so the full protocol can be exercised
//! without hardware.
//!
//! # Example
//!
//! ```rust
//! use quadtrail_codec::RecordBuffer;
//! use quadtrail_sdmmc::{simulated, BlockDevice, Card, CardKind, Config};
//!
//! let bus = simulated::Card::new(simulated::Config::default());
//! let mut card = Card::new(bus, Config::default());
//! assert_eq!(card.initialize().unwrap(), CardKind::SdV2Block);
//!
//! let mut buffer = RecordBuffer::new();
//! buffer.put("hello", 0).unwrap();
//! card.write_sector(300, &buffer).unwrap();
//! assert_eq!(card.read_sector(300).unwrap(), buffer);
//! assert!(card.read_sector(301).unwrap().is_empty());
//! ```

mod card;
mod command;
pub mod memory;
pub mod simulated;

pub use card::Card;
pub use quadtrail_codec::{RecordBuffer, SECTOR_SIZE};
use thiserror::Error;

/// Errors that can occur when interacting with a card.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no response")]
    NoResponse,
    #[error("timeout")]
    Timeout,
    #[error("rejected")]
    Rejected,
    #[error("not initialized")]
    NotInitialized,
    #[error("address overflow: {0}")]
    AddressOverflow(u32),
}

/// Generation (and addressing variant) of an initialized card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardKind {
    /// Second-generation SD card addressed by block number (high capacity).
    SdV2Block,
    /// Second-generation SD card addressed by byte offset (standard capacity).
    SdV2Byte,
    /// First-generation SD card.
    SdV1,
    /// Third-generation MultiMediaCard.
    Mmc,
}

/// How a card interprets the argument of a data command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Block,
    Byte,
}

impl CardKind {
    /// The addressing mode used for data commands.
    pub fn addressing(&self) -> Addressing {
        match self {
            CardKind::SdV2Block => Addressing::Block,
            _ => Addressing::Byte,
        }
    }

    /// Returns true for SD cards (which accept application-specific commands).
    pub fn is_sd(&self) -> bool {
        !matches!(self, CardKind::Mmc)
    }
}

/// A byte-oriented, full-duplex serial link to a card.
pub trait Bus {
    /// Clock `byte` out to the card and return the byte clocked in at the same time.
    fn transfer(&mut self, byte: u8) -> u8;

    /// Assert the card's chip select.
    fn select(&mut self);

    /// Release the card's chip select.
    fn deselect(&mut self);

    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Raise the link speed once the card has been initialized.
    fn set_fast(&mut self) {}
}

/// Sector-granular access to an initialized storage device.
pub trait BlockDevice {
    /// Read the sector at `addr`.
    ///
    /// The returned buffer holds the populated head of the sector. A sector that was never written
    /// (or was erased) reads back as an empty buffer.
    fn read_sector(&mut self, addr: u32) -> Result<RecordBuffer, Error>;

    /// Persist `buf` at `addr`, zero-filling the remainder of the sector.
    fn write_sector(&mut self, addr: u32, buf: &RecordBuffer) -> Result<(), Error>;

    /// Zero-fill `count` sectors starting at `addr`.
    fn erase_range(&mut self, addr: u32, count: u32) -> Result<(), Error>;
}

/// Configuration for a [Card].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of bytes to poll for the card to signal ready before sending a command.
    pub ready_attempts: u32,

    /// Number of bytes to poll for a command response.
    pub response_attempts: u32,

    /// Number of times to issue a start-initialization command while the card remains idle.
    pub init_attempts: u32,

    /// Number of bytes to poll for the start-of-data token of a read.
    pub token_attempts: u32,

    /// Number of bytes to poll for the card to finish a previous data block before sending another.
    pub busy_attempts: u32,

    /// Milliseconds to wait for supply settling before the card is clocked.
    pub settle_ms: u32,

    /// Whether to wait for the card to finish programming a written sector before returning.
    pub wait_for_write: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ready_attempts: 50,
            response_attempts: 50,
            init_attempts: 1_000,
            token_attempts: 50_000,
            busy_attempts: 50_000,
            settle_ms: 2,
            wait_for_write: false,
        }
    }
}
