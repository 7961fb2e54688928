use std::collections::BTreeSet;

use crate::{
    error::Result,
    frame_table::{FrameId, Pid},
    page_loader::{ProgramImage, Section},
    page_table::PageTable,
    tlb_shadow::TlbShadow,
};

/// Everything the pager keeps for one process.
///
/// Lives in the kernel's registry from load until
/// [`Vm::release_address_space`](crate::Vm::release_address_space), so a fault
/// in another process can reach it during eviction.
pub struct AddressSpace {
    pub(crate) pid: Pid,
    pub(crate) page_table: PageTable,
    pub(crate) shadow: TlbShadow,
    pub(crate) sections: Vec<Section>,
    pub(crate) frames: BTreeSet<FrameId>,
}

impl AddressSpace {
    pub fn new(pid: Pid, image: ProgramImage, tlb_size: usize) -> Result<Self> {
        let page_table = PageTable::from_image(&image)?;
        let shadow = TlbShadow::new(page_table.len(), tlb_size);

        Ok(AddressSpace {
            pid,
            page_table,
            shadow,
            sections: image.sections().to_vec(),
            frames: BTreeSet::new(),
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }
}
