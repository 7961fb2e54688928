//! Demand-paged virtual memory for a small teaching kernel.
//!
//! Physical frames are a cache of virtual pages. Pages come in on a TLB miss
//! (zero-filled, copied from the program image, or read back from swap) and
//! leave when another fault needs their frame. The hardware TLB is shared by
//! every process, so each process keeps a shadow of the slots it occupies and
//! a backup of the raw entries across context switches.
//!
//! The entry point is [`kernel::Vm`].

pub mod address_space;
pub mod config;
pub mod error;
pub mod frame_table;
pub mod kernel;
pub mod mmu;
pub mod page_loader;
pub mod page_replacer;
pub mod page_table;
pub mod swap;
pub mod tlb_shadow;

pub use config::MachineConfig;
pub use error::{Result, VmError};
pub use frame_table::{FrameId, PageKey, Pid, Vpn};
pub use kernel::{Vm, VmStats};
