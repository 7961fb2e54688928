//! The simulated hardware: physical memory plus a software-managed TLB.
//!
//! The MMU never walks page tables. Every translation goes through the TLB,
//! and a miss is reported to the kernel as an [`Exception`].

use std::ops::Range;

use log::trace;

use crate::{config::MachineConfig, frame_table::FrameId};

/// A raw TLB entry, as the hardware sees it.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct TranslationEntry {
    pub vpn: usize,
    pub ppn: FrameId,
    pub valid: bool,
    pub read_only: bool,
    pub used: bool,
    pub dirty: bool,
}

impl TranslationEntry {
    pub fn invalid() -> Self {
        TranslationEntry::default()
    }
}

/// Exceptions raised by a user-mode memory access.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exception {
    TlbMiss(usize),
    ReadOnly(usize),
}

pub struct Mmu {
    page_size: usize,
    memory: Vec<u8>,
    tlb: Vec<TranslationEntry>,
}

impl Mmu {
    pub fn new(config: &MachineConfig) -> Self {
        Mmu {
            page_size: config.page_size,
            memory: vec![0; config.memory_size()],
            tlb: vec![TranslationEntry::invalid(); config.tlb_size],
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn tlb_size(&self) -> usize {
        self.tlb.len()
    }

    pub fn read_tlb_entry(&self, slot: usize) -> TranslationEntry {
        self.tlb[slot]
    }

    pub fn write_tlb_entry(&mut self, slot: usize, entry: TranslationEntry) {
        trace!(
            "mmu: tlb[{}] <- vpn={:#x} ppn={:#x} valid={}",
            slot,
            entry.vpn,
            entry.ppn,
            entry.valid
        );
        self.tlb[slot] = entry;
    }

    /// First slot not holding a valid translation.
    pub fn invalid_tlb_slot(&self) -> Option<usize> {
        self.tlb.iter().position(|entry| !entry.valid)
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.fill(TranslationEntry::invalid());
    }

    fn frame_idx_to_range(&self, frame_idx: FrameId) -> Range<usize> {
        Range {
            start: frame_idx * self.page_size,
            end: (frame_idx + 1) * self.page_size,
        }
    }

    pub fn frame(&self, frame_idx: FrameId) -> &[u8] {
        let range = self.frame_idx_to_range(frame_idx);
        &self.memory[range]
    }

    pub fn frame_mut(&mut self, frame_idx: FrameId) -> &mut [u8] {
        let range = self.frame_idx_to_range(frame_idx);
        &mut self.memory[range]
    }

    /// Looks `vaddr` up in the TLB and returns the physical address.
    ///
    /// A hit sets the entry's used bit, and its dirty bit when `write` is set.
    pub fn translate(&mut self, vaddr: usize, write: bool) -> Result<usize, Exception> {
        let vpn = vaddr / self.page_size;
        let offset = vaddr % self.page_size;

        let entry = self
            .tlb
            .iter_mut()
            .find(|entry| entry.valid && entry.vpn == vpn)
            .ok_or(Exception::TlbMiss(vaddr))?;

        if write && entry.read_only {
            return Err(Exception::ReadOnly(vaddr));
        }

        entry.used = true;
        if write {
            entry.dirty = true;
        }

        trace!("mmu: tlb hit vaddr={:#x} vpn={:#x} ppn={:#x}", vaddr, vpn, entry.ppn);

        Ok(entry.ppn * self.page_size + offset)
    }

    pub fn load(&mut self, vaddr: usize) -> Result<u8, Exception> {
        let paddr = self.translate(vaddr, false)?;
        Ok(self.memory[paddr])
    }

    pub fn store(&mut self, vaddr: usize, value: u8) -> Result<(), Exception> {
        let paddr = self.translate(vaddr, true)?;
        self.memory[paddr] = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mmu() -> Mmu {
        Mmu::new(
            &MachineConfig::default()
                .with_page_size(16)
                .with_phys_pages(4)
                .with_tlb_size(2),
        )
    }

    fn entry(vpn: usize, ppn: usize, read_only: bool) -> TranslationEntry {
        TranslationEntry {
            vpn,
            ppn,
            valid: true,
            read_only,
            used: false,
            dirty: false,
        }
    }

    #[test]
    fn miss_on_empty_tlb() {
        let mut mmu = mmu();
        assert_eq!(mmu.load(0x21), Err(Exception::TlbMiss(0x21)));
        assert_eq!(mmu.invalid_tlb_slot(), Some(0));
    }

    #[test]
    fn hit_sets_used_and_dirty() {
        let mut mmu = mmu();
        mmu.write_tlb_entry(1, entry(2, 3, false));

        assert_eq!(mmu.load(0x25), Ok(0));
        let after_load = mmu.read_tlb_entry(1);
        assert!(after_load.used);
        assert!(!after_load.dirty);

        mmu.store(0x25, 0xAB).unwrap();
        assert!(mmu.read_tlb_entry(1).dirty);
        assert_eq!(mmu.frame(3)[5], 0xAB);
    }

    #[test]
    fn read_only_entry_rejects_stores() {
        let mut mmu = mmu();
        mmu.write_tlb_entry(0, entry(0, 0, true));

        assert_eq!(mmu.store(0x3, 1), Err(Exception::ReadOnly(0x3)));
        assert!(!mmu.read_tlb_entry(0).dirty);
        assert_eq!(mmu.frame(0)[3], 0);
    }

    #[test]
    fn flush_invalidates_every_slot() {
        let mut mmu = mmu();
        mmu.write_tlb_entry(0, entry(0, 0, false));
        mmu.write_tlb_entry(1, entry(1, 1, false));
        assert_eq!(mmu.invalid_tlb_slot(), None);

        mmu.flush_tlb();
        assert_eq!(mmu.invalid_tlb_slot(), Some(0));
        assert_eq!(mmu.load(0x10), Err(Exception::TlbMiss(0x10)));
    }
}
