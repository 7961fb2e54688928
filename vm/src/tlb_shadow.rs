//! Per-process view of the shared hardware TLB.
//!
//! While a process runs, `positions` says which slot (if any) holds each of
//! its pages; the live entry's used/dirty bits count as part of the page's
//! state. While it is switched out, `backup` holds the raw slots it left
//! behind and every position is clear.

use log::trace;

use crate::{
    frame_table::Vpn,
    mmu::{Mmu, TranslationEntry},
    page_table::PageTable,
};

pub struct TlbShadow {
    positions: Vec<Option<usize>>,
    backup: Vec<TranslationEntry>,
}

impl TlbShadow {
    pub fn new(page_count: usize, tlb_size: usize) -> Self {
        TlbShadow {
            positions: vec![None; page_count],
            backup: vec![TranslationEntry::invalid(); tlb_size],
        }
    }

    pub fn position(&self, vpn: Vpn) -> Option<usize> {
        self.positions.get(vpn).copied().flatten()
    }

    /// A pinned page is live in the TLB of the running process.
    pub fn is_pinned(&self, vpn: Vpn) -> bool {
        self.position(vpn).is_some()
    }

    pub fn set_position(&mut self, vpn: Vpn, slot: usize) {
        self.positions[vpn] = Some(slot);
    }

    pub fn take_position(&mut self, vpn: Vpn) -> Option<usize> {
        self.positions.get_mut(vpn).and_then(Option::take)
    }

    pub fn backup(&self) -> &[TranslationEntry] {
        &self.backup
    }

    /// Folds the live TLB into the page table and snapshots it.
    ///
    /// After this the hardware copy is stale for this process; nothing is
    /// pinned until the next [`TlbShadow::restore`].
    pub fn save(&mut self, page_table: &mut PageTable, mmu: &Mmu) {
        for slot in 0..mmu.tlb_size() {
            let entry = mmu.read_tlb_entry(slot);

            if entry.valid && page_table.is_resident(entry.vpn) {
                page_table.merge_bits(entry.vpn, entry.used, entry.dirty);
                self.take_position(entry.vpn);
            }

            self.backup[slot] = entry;
        }

        trace!("vm: saved {} tlb slots", self.backup.len());
    }

    /// Puts the snapshot back into the TLB.
    ///
    /// Entries whose page was evicted in the meantime (or now sits in a
    /// different frame) are written back invalid.
    pub fn restore(&mut self, page_table: &PageTable, mmu: &mut Mmu) {
        for (slot, entry) in self.backup.iter_mut().enumerate() {
            if entry.valid {
                if page_table.translate(entry.vpn) == Some(entry.ppn) {
                    self.positions[entry.vpn] = Some(slot);
                } else {
                    trace!("vm: tlb[{}] vpn={:#x} went stale while switched out", slot, entry.vpn);
                    entry.valid = false;
                }
            }

            mmu.write_tlb_entry(slot, *entry);
        }
    }
}
