use crate::{
    error::Result,
    frame_table::{FrameId, Vpn},
    mmu::TranslationEntry,
    page_loader::ProgramImage,
};

#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct PageTableEntry {
    pub resident: bool,
    /// Last frame held. Only meaningful while `resident`.
    pub frame: FrameId,
    pub read_only: bool,
    pub used: bool,
    pub dirty: bool,
}

/// Where a page's contents come from the next time it is faulted in.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageOrigin {
    /// Anonymous memory (stack, heap).
    Zero,
    /// Page `offset` of image section `section`.
    Image { section: usize, offset: usize },
    /// Written out to swap at least once; the slot is the authoritative copy.
    Swap,
}

pub struct PageTable {
    entries: Vec<PageTableEntry>,
    origins: Vec<PageOrigin>,
}

impl PageTable {
    pub fn new(page_count: usize) -> Self {
        PageTable {
            entries: vec![PageTableEntry::default(); page_count],
            origins: vec![PageOrigin::Zero; page_count],
        }
    }

    /// Builds the table for `image`: every page non-resident, section pages
    /// marked with their origin and protection.
    pub fn from_image(image: &ProgramImage) -> Result<Self> {
        let mut table = PageTable::new(image.page_count()?);

        for (index, section) in image.sections().iter().enumerate() {
            for offset in 0..section.length() {
                let vpn = section.first_vpn() + offset;
                table.origins[vpn] = PageOrigin::Image {
                    section: index,
                    offset,
                };
                table.entries[vpn].read_only = section.is_read_only();
            }
        }

        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, vpn: Vpn) -> Option<PageTableEntry> {
        self.entries.get(vpn).copied()
    }

    /// The resident frame of `vpn`, if any. Pages past the end are never resident.
    pub fn translate(&self, vpn: Vpn) -> Option<FrameId> {
        self.entries
            .get(vpn)
            .filter(|entry| entry.resident)
            .map(|entry| entry.frame)
    }

    pub fn is_resident(&self, vpn: Vpn) -> bool {
        self.translate(vpn).is_some()
    }

    pub fn is_read_only(&self, vpn: Vpn) -> bool {
        self.entries.get(vpn).map_or(false, |entry| entry.read_only)
    }

    pub fn mark_used(&mut self, vpn: Vpn) {
        self.merge_bits(vpn, true, false);
    }

    pub fn mark_dirty(&mut self, vpn: Vpn) {
        self.merge_bits(vpn, true, true);
    }

    /// ORs used/dirty bits observed elsewhere (a live TLB entry) into the entry.
    pub fn merge_bits(&mut self, vpn: Vpn, used: bool, dirty: bool) {
        if let Some(entry) = self.entries.get_mut(vpn) {
            entry.used |= used;
            entry.dirty |= dirty;
        }
    }

    /// Maps `vpn` to `frame` with fresh used/dirty bits.
    pub fn install(&mut self, vpn: Vpn, frame: FrameId) {
        let entry = &mut self.entries[vpn];
        entry.resident = true;
        entry.frame = frame;
        entry.used = false;
        entry.dirty = false;
    }

    pub fn invalidate(&mut self, vpn: Vpn) {
        if let Some(entry) = self.entries.get_mut(vpn) {
            entry.resident = false;
        }
    }

    pub fn origin(&self, vpn: Vpn) -> PageOrigin {
        self.origins[vpn]
    }

    pub fn mark_swapped(&mut self, vpn: Vpn) {
        self.origins[vpn] = PageOrigin::Swap;
    }

    pub fn swapped_pages(&self) -> impl Iterator<Item = Vpn> + '_ {
        self.origins
            .iter()
            .enumerate()
            .filter(|(_, origin)| **origin == PageOrigin::Swap)
            .map(|(vpn, _)| vpn)
    }

    pub fn resident_pages(&self) -> impl Iterator<Item = (Vpn, FrameId)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.resident)
            .map(|(vpn, entry)| (vpn, entry.frame))
    }

    /// The TLB entry the hardware should hold for a resident `vpn`.
    pub fn translation_entry(&self, vpn: Vpn) -> TranslationEntry {
        let entry = self.entries[vpn];

        TranslationEntry {
            vpn,
            ppn: entry.frame,
            valid: entry.resident,
            read_only: entry.read_only,
            used: entry.used,
            dirty: entry.dirty,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::page_loader::{BytesImage, Section};

    #[test]
    fn image_pages_carry_origin_and_protection() {
        let text = Arc::new(BytesImage::new(vec![0; 8]));
        let image = ProgramImage::new(2)
            .with_section(Section::new(".text", 0, 1, true, text.clone()))
            .with_section(Section::new(".data", 1, 2, false, text));

        let table = PageTable::from_image(&image).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.origin(0), PageOrigin::Image { section: 0, offset: 0 });
        assert_eq!(table.origin(2), PageOrigin::Image { section: 1, offset: 1 });
        assert_eq!(table.origin(4), PageOrigin::Zero);
        assert!(table.is_read_only(0));
        assert!(!table.is_read_only(1));
        assert_eq!(table.resident_pages().count(), 0);
    }

    #[test]
    fn install_resets_bits_and_invalidate_drops_residency() {
        let mut table = PageTable::new(2);
        table.install(1, 9);
        table.mark_dirty(1);
        assert_eq!(table.translate(1), Some(9));
        assert!(table.get(1).unwrap().dirty);

        table.invalidate(1);
        assert_eq!(table.translate(1), None);

        table.install(1, 4);
        let entry = table.get(1).unwrap();
        assert!(!entry.used && !entry.dirty);
        assert_eq!(entry.frame, 4);
    }

    #[test]
    fn pages_past_the_end_are_never_resident() {
        let mut table = PageTable::new(1);
        table.mark_used(5);
        assert_eq!(table.translate(5), None);
        assert_eq!(table.get(5), None);
    }

    #[test]
    fn swapped_origin_replaces_image_origin() {
        let image = ProgramImage::new(0).with_section(Section::new(
            ".data",
            0,
            1,
            false,
            Arc::new(BytesImage::new(Vec::new())),
        ));
        let mut table = PageTable::from_image(&image).unwrap();

        table.mark_swapped(0);
        assert_eq!(table.origin(0), PageOrigin::Swap);
        assert_eq!(table.swapped_pages().collect::<Vec<_>>(), vec![0]);
    }
}
