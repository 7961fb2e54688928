use crate::error::{Result, VmError};

/// Geometry of the simulated machine and tuning of the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Bytes per page (and per frame, and per swap slot).
    pub page_size: usize,
    /// Number of physical frames.
    pub phys_pages: usize,
    /// Number of hardware TLB slots.
    pub tlb_size: usize,
    /// How many random frames eviction samples before settling for the last one.
    pub eviction_attempts: usize,
    /// Seed for the replacement RNG. `None` seeds from the OS.
    pub seed: Option<u64>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            page_size: 1024,
            phys_pages: 32,
            tlb_size: 4,
            eviction_attempts: 26,
            seed: None,
        }
    }
}

impl MachineConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_phys_pages(mut self, phys_pages: usize) -> Self {
        self.phys_pages = phys_pages;
        self
    }

    pub fn with_tlb_size(mut self, tlb_size: usize) -> Self {
        self.tlb_size = tlb_size;
        self
    }

    pub fn with_eviction_attempts(mut self, attempts: usize) -> Self {
        self.eviction_attempts = attempts;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Total bytes of physical memory.
    pub fn memory_size(&self) -> usize {
        self.page_size * self.phys_pages
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(VmError::Config("page size must be non-zero"));
        }
        if self.phys_pages == 0 {
            return Err(VmError::Config("at least one physical frame is required"));
        }
        if self.tlb_size == 0 {
            return Err(VmError::Config("the TLB needs at least one slot"));
        }
        if self.eviction_attempts == 0 {
            return Err(VmError::Config("eviction must sample at least one frame"));
        }
        if self.page_size.checked_mul(self.phys_pages).is_none() {
            return Err(VmError::Config("physical memory size overflows"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_machine() {
        let config = MachineConfig::default();
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.tlb_size, 4);
        assert_eq!(config.eviction_attempts, 26);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_machines() {
        let base = MachineConfig::default();
        assert!(base.with_page_size(0).validate().is_err());
        assert!(base.with_phys_pages(0).validate().is_err());
        assert!(base.with_tlb_size(0).validate().is_err());
        assert!(base.with_eviction_attempts(0).validate().is_err());
        assert!(base.with_page_size(usize::MAX).with_phys_pages(2).validate().is_err());
    }
}
