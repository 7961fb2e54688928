use thiserror::Error;

use crate::{
    frame_table::{FrameId, PageKey, Pid},
    mmu::Exception,
};

pub type Result<T> = core::result::Result<T, VmError>;

/// Errors surfaced by the pager.
///
/// Frame exhaustion never shows up here: it is resolved by eviction. The
/// `SwapSlotMissing`, `OrphanFrame`, `StaleOwner` and `OwnershipMismatch`
/// variants mean the bookkeeping is broken and the current operation must be
/// abandoned.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid machine configuration: {0}")]
    Config(&'static str),

    #[error("process {0} already has an address space")]
    DuplicateProcess(Pid),

    #[error("process {0} has no address space")]
    UnknownProcess(Pid),

    #[error("no process is running")]
    NoCurrentProcess,

    #[error("process {0} is not the running process")]
    NotRunning(Pid),

    #[error("process {0} is still running")]
    AlreadyRunning(Pid),

    #[error("address {vaddr:#x} is outside the {pages}-page address space")]
    AddressOutOfRange { vaddr: usize, pages: usize },

    #[error("write to read-only page at {0:#x}")]
    ReadOnly(usize),

    #[error("tlb miss at {0:#x} persisted after the fault was handled")]
    UnresolvedMiss(usize),

    #[error("section `{name}` starts at page {first_vpn}, expected page {expected}")]
    FragmentedImage {
        name: String,
        first_vpn: usize,
        expected: usize,
    },

    #[error("swap read for {0} which holds no slot")]
    SwapSlotMissing(PageKey),

    #[error("frame {0} was picked for eviction but has no owner")]
    OrphanFrame(FrameId),

    #[error("frame {frame} is owned by {key}, whose page table disagrees")]
    StaleOwner { frame: FrameId, key: PageKey },

    #[error("ownership mismatch at frame {frame}: {detail}")]
    OwnershipMismatch { frame: FrameId, detail: String },

    #[error("swap i/o failed")]
    Io(#[from] std::io::Error),
}

impl From<Exception> for VmError {
    fn from(exception: Exception) -> Self {
        match exception {
            Exception::TlbMiss(vaddr) => VmError::UnresolvedMiss(vaddr),
            Exception::ReadOnly(vaddr) => VmError::ReadOnly(vaddr),
        }
    }
}
