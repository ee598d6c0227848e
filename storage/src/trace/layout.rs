//! On-media layout: reserved regions, record type tokens and field offsets.
//!
//! ```text
//! sector 0            signature
//! sectors 1..=255     manifest (one entry per session, slot n at sector n)
//! sectors 256..       per session: router grid (cols * rows sectors), then the node log
//! ```

use quadtrail_codec::{Encode, Error as CodecError, Read, RecordBuffer};

/// Sector holding the card signature.
pub const SIGNATURE_SECTOR: u32 = 0;

/// First sector of the manifest region.
pub const MANIFEST_SECTOR: u32 = 1;

/// Number of manifest slots (and so of sessions a formatted card can hold).
pub const MANIFEST_SLOTS: u16 = 255;

/// First sector after the reserved regions.
pub const DATA_SECTOR: u32 = MANIFEST_SECTOR + MANIFEST_SLOTS as u32;

/// Number of run addresses a router can hold.
pub const ROUTER_SLOTS: usize = 8;

/// Magic stored after the signature type token.
pub const SIGNATURE_MAGIC: &str = "QTRL";

/// Type token stored at offset 0 of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Signature = 0,
    Trace = 1,
    Singular = 2,
    Router = 3,
    Normal = 4,
    Super = 5,
    Origin = 6,
    Reference = 7,
}

impl TryFrom<u8> for DataType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => DataType::Signature,
            1 => DataType::Trace,
            2 => DataType::Singular,
            3 => DataType::Router,
            4 => DataType::Normal,
            5 => DataType::Super,
            6 => DataType::Origin,
            7 => DataType::Reference,
            other => return Err(other),
        })
    }
}

/// A fixed slot inside a record: `width` bytes (including the NUL terminator) at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: u16,
    pub width: u16,
}

impl Field {
    pub const fn new(offset: u16, width: u16) -> Self {
        Self { offset, width }
    }

    /// Offset of the first byte after this field.
    pub const fn end(&self) -> u16 {
        self.offset + self.width
    }

    /// Write `value` into the field, refusing tokens that would spill into the next one.
    pub fn put<T: Encode + ?Sized>(
        &self,
        buffer: &mut RecordBuffer,
        value: &T,
    ) -> Result<(), CodecError> {
        let len = value.len_encoded();
        if len >= usize::from(self.width) {
            return Err(CodecError::Overflow {
                offset: usize::from(self.offset),
                len,
                capacity: usize::from(self.width),
            });
        }
        buffer.put(value, self.offset)
    }

    pub fn get<T: Read>(&self, buffer: &RecordBuffer) -> Result<T, CodecError> {
        buffer.get(self.offset)
    }

    pub fn is_blank(&self, buffer: &RecordBuffer) -> bool {
        buffer.is_blank(self.offset)
    }
}

/// Type token, shared by every record.
pub const TYPE: Field = Field::new(0, 2);

pub mod signature {
    use super::{Field, TYPE};

    pub const MAGIC: Field = Field::new(TYPE.end(), 5);
}

pub mod manifest {
    use super::{Field, TYPE};

    pub const START: Field = Field::new(TYPE.end(), 9);
}

pub mod router {
    use super::{Field, ROUTER_SLOTS, TYPE};

    pub const ENTRY: Field = Field::new(TYPE.end(), 4);

    const ADDRESS_WIDTH: u16 = 9;

    /// Slot `index` of the run address list.
    pub const fn address(index: usize) -> Field {
        Field::new(ENTRY.end() + index as u16 * ADDRESS_WIDTH, ADDRESS_WIDTH)
    }

    /// Bytes used by a full router.
    pub const SIZE: u16 = address(ROUTER_SLOTS - 1).end();
}

pub mod node {
    use super::{Field, TYPE};

    pub const ENTRY: Field = Field::new(TYPE.end(), 4);
    pub const X: Field = Field::new(ENTRY.end(), 12);
    pub const Y: Field = Field::new(X.end(), 12);
    pub const TIME: Field = Field::new(Y.end(), 9);
    pub const DATE: Field = Field::new(TIME.end(), 9);
    pub const QX: Field = Field::new(DATE.end(), 4);
    pub const QY: Field = Field::new(QX.end(), 4);
}
