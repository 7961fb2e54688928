//! Page-granular backing store for evicted dirty pages.
//!
//! Slot `i` lives at byte offset `i * page_size` of the swap file; there is no
//! header. The key → slot map lives only in memory and is not expected to
//! survive a restart.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
};

use log::debug;

use crate::{
    error::{Result, VmError},
    frame_table::PageKey,
};

pub type SlotId = usize;

/// Byte-addressable file holding the swap slots.
pub trait SwapFile: Send {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<()>;

    fn write_at(&mut self, offset: u64, buffer: &[u8]) -> io::Result<()>;

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Swap file kept in a growable buffer.
#[derive(Debug, Default)]
pub struct MemorySwapFile {
    bytes: Vec<u8>,
}

impl MemorySwapFile {
    pub fn new() -> Self {
        MemorySwapFile::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl SwapFile for MemorySwapFile {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + buffer.len();

        let source = self
            .bytes
            .get(start..end)
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        buffer.copy_from_slice(source);

        Ok(())
    }

    fn write_at(&mut self, offset: u64, buffer: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + buffer.len();

        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buffer);

        Ok(())
    }
}

pub struct SwapStore {
    file: Box<dyn SwapFile>,
    page_size: usize,
    slots: BTreeMap<PageKey, SlotId>,
    free_slots: BTreeSet<SlotId>,
    next_slot: SlotId,
}

impl SwapStore {
    pub fn new(file: Box<dyn SwapFile>, page_size: usize) -> Self {
        SwapStore {
            file,
            page_size,
            slots: BTreeMap::new(),
            free_slots: BTreeSet::new(),
            next_slot: 0,
        }
    }

    fn offset(&self, slot: SlotId) -> u64 {
        (slot * self.page_size) as u64
    }

    /// Persists one page for `key`.
    ///
    /// A key that already holds a slot keeps it. Otherwise the lowest pooled
    /// slot is reused, and only when the pool is empty does the file grow.
    pub fn write(&mut self, key: PageKey, page: &[u8]) -> Result<SlotId> {
        debug_assert_eq!(page.len(), self.page_size);

        let slot = match self.slots.get(&key) {
            Some(&slot) => slot,
            None => self.free_slots.first().copied().unwrap_or(self.next_slot),
        };

        self.file.write_at(self.offset(slot), page)?;

        if !self.free_slots.remove(&slot) && slot == self.next_slot {
            self.next_slot += 1;
        }
        self.slots.insert(key, slot);

        debug!("swap: wrote {} to slot {}", key, slot);

        Ok(slot)
    }

    /// Reads the page stored for `key` into `buffer`.
    ///
    /// A key without a slot means the pager lost track of an evicted page.
    pub fn read(&mut self, key: PageKey, buffer: &mut [u8]) -> Result<SlotId> {
        debug_assert_eq!(buffer.len(), self.page_size);

        let slot = *self.slots.get(&key).ok_or(VmError::SwapSlotMissing(key))?;
        let offset = self.offset(slot);
        self.file.read_at(offset, buffer)?;

        debug!("swap: read {} from slot {}", key, slot);

        Ok(slot)
    }

    /// Returns the slot held by `key` to the pool.
    pub fn release(&mut self, key: PageKey) -> Option<SlotId> {
        let slot = self.slots.remove(&key)?;
        self.free_slots.insert(slot);

        debug!("swap: released slot {} of {}", slot, key);

        Some(slot)
    }

    pub fn slot_of(&self, key: PageKey) -> Option<SlotId> {
        self.slots.get(&key).copied()
    }

    /// Number of slots the file has ever grown to.
    pub fn slot_count(&self) -> usize {
        self.next_slot
    }

    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    pub fn close(&mut self) -> Result<()> {
        self.file.close()?;
        Ok(())
    }
}
