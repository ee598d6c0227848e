//! A fixed-capacity staging area for a single sector record.

use crate::{types::string::is_token, Encode, Error, Read};
use std::fmt;

/// Size of an addressable sector, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Fixed-capacity buffer holding the populated head of one sector.
///
/// Writers place tokens at fixed offsets with [RecordBuffer::put]; each call terminates the token
/// with a NUL byte and raises the populated length to cover it. Only `[0, len)` is transmitted when
/// the buffer is persisted; the remainder of the sector is zero-filled by the device.
///
/// The buffer never reorders fields. Callers are expected to write the fields of a record in
/// increasing-offset order and to keep tokens within the widths of their layout; overlapping tokens
/// are not detected.
#[derive(Clone, PartialEq, Eq)]
pub struct RecordBuffer {
    data: [u8; Self::CAPACITY],
    len: usize,
}

impl RecordBuffer {
    /// Number of bytes of a sector that are staged in memory.
    pub const CAPACITY: usize = 78;

    /// Create an empty buffer.
    pub const fn new() -> Self {
        Self {
            data: [0; Self::CAPACITY],
            len: 0,
        }
    }

    /// Build a buffer from the raw contents of a sector.
    ///
    /// The first [RecordBuffer::CAPACITY] bytes are retained. The populated length is recovered by
    /// scanning backward for the last non-zero byte and counting the NUL that terminates it, so a
    /// sector that was never written (or was erased) yields an empty buffer.
    pub fn from_sector(sector: &[u8; SECTOR_SIZE]) -> Self {
        let mut data = [0u8; Self::CAPACITY];
        data.copy_from_slice(&sector[..Self::CAPACITY]);
        let len = match data.iter().rposition(|byte| *byte != 0) {
            Some(last) => (last + 2).min(Self::CAPACITY),
            None => 0,
        };
        Self { data, len }
    }

    /// Write `value` as a NUL-terminated token starting at `offset`.
    pub fn put<T: Encode + ?Sized>(&mut self, value: &T, offset: u16) -> Result<(), Error> {
        let offset = usize::from(offset);
        let len = value.len_encoded();
        let end = offset + len + 1;
        if end > Self::CAPACITY {
            return Err(Error::Overflow {
                offset,
                len,
                capacity: Self::CAPACITY,
            });
        }

        let mut slot: &mut [u8] = &mut self.data[offset..offset + len];
        value.write(&mut slot);
        if !is_token(&self.data[offset..offset + len]) {
            self.data[offset..end].fill(0);
            return Err(Error::InvalidToken);
        }
        self.data[offset + len] = 0;
        self.len = self.len.max(end);
        Ok(())
    }

    /// Clear all staged bytes.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    /// Number of populated bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no byte is populated (the sector read back as all zero).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The populated bytes, `[0, len)`.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Expand the buffer into a full, zero-padded sector.
    pub fn to_sector(&self) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..self.len].copy_from_slice(self.as_slice());
        sector
    }

    /// The token (without terminator) starting at `offset`.
    pub fn token(&self, offset: u16) -> Result<&[u8], Error> {
        let offset = usize::from(offset);
        let tail = self.data.get(offset..).ok_or(Error::OutOfBounds(offset))?;
        if tail.is_empty() {
            return Err(Error::OutOfBounds(offset));
        }
        let end = tail
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(Error::Unterminated(offset))?;
        Ok(&tail[..end])
    }

    /// Decode the token starting at `offset`.
    pub fn get<T: Read>(&self, offset: u16) -> Result<T, Error> {
        let mut token = self.token(offset)?;
        T::read(&mut token)
    }

    /// Returns true if no token starts at `offset`.
    pub fn is_blank(&self, offset: u16) -> bool {
        self.data
            .get(usize::from(offset))
            .map_or(true, |byte| *byte == 0)
    }
}

impl Default for RecordBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordBuffer")
            .field("len", &self.len)
            .field("data", &self.as_slice().escape_ascii().to_string())
            .finish()
    }
}
