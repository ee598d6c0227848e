//! A [BlockDevice] backed by a sector map.

use crate::{BlockDevice, Error};
use quadtrail_codec::RecordBuffer;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// An in-memory device of fixed capacity.
///
/// Sectors that were never written read back empty. Writes to selected sectors can be made to
/// fail (see [Device::fail_writes_at]) to exercise error paths of callers.
#[derive(Debug, Clone)]
pub struct Device {
    capacity: u32,
    sectors: BTreeMap<u32, RecordBuffer>,
    writes: Vec<u32>,
    erases: Vec<(u32, u32)>,
    failing: BTreeSet<u32>,
}

impl Device {
    /// Create a blank device holding `capacity` sectors.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            sectors: BTreeMap::new(),
            writes: Vec::new(),
            erases: Vec::new(),
            failing: BTreeSet::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Contents of `addr`, if it holds any data.
    pub fn sector(&self, addr: u32) -> Option<&RecordBuffer> {
        self.sectors.get(&addr)
    }

    /// Sectors written successfully, in order.
    pub fn writes(&self) -> &[u32] {
        &self.writes
    }

    /// Ranges erased, as `(start, count)`, in order.
    pub fn erases(&self) -> &[(u32, u32)] {
        &self.erases
    }

    /// Refuse any subsequent write to `addr`.
    pub fn fail_writes_at(&mut self, addr: u32) {
        self.failing.insert(addr);
    }

    /// Accept writes everywhere again.
    pub fn clear_failures(&mut self) {
        self.failing.clear();
    }

    fn check(&self, addr: u32) -> Result<(), Error> {
        if addr >= self.capacity {
            return Err(Error::Rejected);
        }
        Ok(())
    }
}

impl BlockDevice for Device {
    fn read_sector(&mut self, addr: u32) -> Result<RecordBuffer, Error> {
        self.check(addr)?;
        Ok(self.sectors.get(&addr).cloned().unwrap_or_default())
    }

    fn write_sector(&mut self, addr: u32, buf: &RecordBuffer) -> Result<(), Error> {
        self.check(addr)?;
        if self.failing.contains(&addr) {
            trace!(sector = addr, "injected write failure");
            return Err(Error::Rejected);
        }
        if buf.is_empty() {
            self.sectors.remove(&addr);
        } else {
            self.sectors.insert(addr, buf.clone());
        }
        self.writes.push(addr);
        Ok(())
    }

    fn erase_range(&mut self, addr: u32, count: u32) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let end = addr
            .checked_add(count)
            .ok_or(Error::AddressOverflow(addr))?;
        if end > self.capacity {
            return Err(Error::Rejected);
        }
        let erased: Vec<u32> = self.sectors.range(addr..end).map(|(k, _)| *k).collect();
        for sector in erased {
            self.sectors.remove(&sector);
        }
        self.erases.push((addr, count));
        Ok(())
    }
}
