//! Fault handling, eviction and the context-switch hooks.
//!
//! All pager state sits behind one lock. A fault holds it from entry to exit,
//! which serializes faults across processes; eviction can then edit another
//! process's page table and shadow without further synchronization.

use std::collections::BTreeMap;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    address_space::AddressSpace,
    config::MachineConfig,
    error::{Result, VmError},
    frame_table::{FrameId, FrameTable, PageKey, Pid, Vpn},
    mmu::{Exception, Mmu, TranslationEntry},
    page_loader::ProgramImage,
    page_replacer::{PageReplacer, RandomReplacer},
    page_table::{PageOrigin, PageTableEntry},
    swap::{SlotId, SwapFile, SwapStore},
};

/// Counters for what the pager has done so far.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct VmStats {
    pub tlb_misses: u64,
    pub page_faults: u64,
    pub evictions: u64,
    pub swap_writes: u64,
    pub swap_reads: u64,
    pub image_loads: u64,
    pub zero_fills: u64,
}

struct Inner {
    mmu: Mmu,
    frames: FrameTable,
    swap: SwapStore,
    processes: BTreeMap<Pid, AddressSpace>,
    current: Option<Pid>,
    replacer: Box<dyn PageReplacer>,
    stats: VmStats,
}

pub struct Vm {
    config: MachineConfig,
    inner: Mutex<Inner>,
}

impl Vm {
    /// Builds a machine whose replacement decisions come from a
    /// [`RandomReplacer`], seeded from `config.seed` when set.
    pub fn new(config: MachineConfig, swap_file: impl SwapFile + 'static) -> Result<Self> {
        let replacer = match config.seed {
            Some(seed) => RandomReplacer::seeded(config.eviction_attempts, seed),
            None => RandomReplacer::new(config.eviction_attempts),
        };

        Vm::with_replacer(config, swap_file, replacer)
    }

    pub fn with_replacer(
        config: MachineConfig,
        swap_file: impl SwapFile + 'static,
        replacer: impl PageReplacer + 'static,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Inner {
            mmu: Mmu::new(&config),
            frames: FrameTable::new(config.phys_pages),
            swap: SwapStore::new(Box::new(swap_file), config.page_size),
            processes: BTreeMap::new(),
            current: None,
            replacer: Box::new(replacer),
            stats: VmStats::default(),
        };

        debug!(
            "vm: {} frames of {} bytes, {} tlb slots",
            config.phys_pages, config.page_size, config.tlb_size
        );

        Ok(Vm {
            config,
            inner: Mutex::new(inner),
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Registers `pid` with a fully non-resident address space sized for `image`.
    pub fn create_address_space(&self, pid: Pid, image: ProgramImage) -> Result<usize> {
        let mut inner = self.inner.lock();

        if inner.processes.contains_key(&pid) {
            return Err(VmError::DuplicateProcess(pid));
        }

        let space = AddressSpace::new(pid, image, self.config.tlb_size)?;
        let pages = space.page_count();
        inner.processes.insert(pid, space);

        debug!("vm: process {} gets {} pages", pid, pages);

        Ok(pages)
    }

    /// Frees every frame and swap slot of `pid` and forgets the process.
    pub fn release_address_space(&self, pid: Pid) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let space = inner
            .processes
            .remove(&pid)
            .ok_or(VmError::UnknownProcess(pid))?;

        for &frame in &space.frames {
            inner.frames.release(frame);
        }
        for vpn in space.page_table.swapped_pages() {
            inner.swap.release(PageKey::new(pid, vpn));
        }

        if inner.current == Some(pid) {
            inner.mmu.flush_tlb();
            inner.current = None;
        }

        debug!(
            "vm: released process {} ({} frames back in the pool)",
            pid,
            space.frames.len()
        );

        Ok(())
    }

    pub fn current(&self) -> Option<Pid> {
        self.inner.lock().current
    }

    /// Saves the TLB state of the running process `pid` and leaves the
    /// machine with no running process.
    pub fn on_context_switch_out(&self, pid: Pid) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        if inner.current != Some(pid) {
            return Err(VmError::NotRunning(pid));
        }

        let space = inner
            .processes
            .get_mut(&pid)
            .ok_or(VmError::UnknownProcess(pid))?;
        space.shadow.save(&mut space.page_table, &inner.mmu);
        inner.current = None;

        trace!("vm: process {} switched out", pid);

        Ok(())
    }

    /// Makes `pid` the running process and reloads its TLB snapshot.
    pub fn on_context_switch_in(&self, pid: Pid) -> Result<()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        if let Some(running) = inner.current {
            return Err(VmError::AlreadyRunning(running));
        }

        let space = inner
            .processes
            .get_mut(&pid)
            .ok_or(VmError::UnknownProcess(pid))?;
        space.shadow.restore(&space.page_table, &mut inner.mmu);
        inner.current = Some(pid);

        trace!("vm: process {} switched in", pid);

        Ok(())
    }

    /// Switches the machine from whatever runs now to `pid`.
    pub fn switch_to(&self, pid: Pid) -> Result<()> {
        if let Some(running) = self.current() {
            if running == pid {
                return Ok(());
            }
            self.on_context_switch_out(running)?;
        }

        self.on_context_switch_in(pid)
    }

    /// Resolves a TLB miss of the running process at `vaddr`.
    pub fn handle_tlb_miss(&self, vaddr: usize) -> Result<()> {
        self.inner.lock().handle_tlb_miss(vaddr)
    }

    /// A user-mode load: goes through the TLB, faulting on a miss.
    pub fn user_load(&self, vaddr: usize) -> Result<u8> {
        let mut inner = self.inner.lock();

        match inner.mmu.load(vaddr) {
            Err(Exception::TlbMiss(addr)) => {
                inner.handle_tlb_miss(addr)?;
                Ok(inner.mmu.load(vaddr)?)
            }
            other => Ok(other?),
        }
    }

    /// A user-mode store: goes through the TLB, faulting on a miss.
    pub fn user_store(&self, vaddr: usize, value: u8) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.mmu.store(vaddr, value) {
            Err(Exception::TlbMiss(addr)) => {
                inner.handle_tlb_miss(addr)?;
                Ok(inner.mmu.store(vaddr, value)?)
            }
            other => Ok(other?),
        }
    }

    /// Copies from the running process's memory into `data`, paging in as
    /// needed. Stops short at the end of the address space.
    pub fn read_bytes(&self, vaddr: usize, data: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let pid = inner.current.ok_or(VmError::NoCurrentProcess)?;
        let page_size = self.config.page_size;

        let mut amount = 0;
        while amount < data.len() {
            let Some(addr) = vaddr.checked_add(amount) else {
                break;
            };
            let vpn = addr / page_size;
            let offset = addr % page_size;
            if vpn >= inner.space(pid)?.page_count() {
                break;
            }

            let frame = inner.page_in(pid, vpn)?;
            inner.space_mut(pid)?.page_table.mark_used(vpn);

            let chunk = (page_size - offset).min(data.len() - amount);
            data[amount..amount + chunk]
                .copy_from_slice(&inner.mmu.frame(frame)[offset..offset + chunk]);
            amount += chunk;
        }

        Ok(amount)
    }

    /// Copies `data` into the running process's memory, paging in as needed.
    /// Stops short at a read-only page or the end of the address space.
    pub fn write_bytes(&self, vaddr: usize, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let pid = inner.current.ok_or(VmError::NoCurrentProcess)?;
        let page_size = self.config.page_size;

        let mut amount = 0;
        while amount < data.len() {
            let Some(addr) = vaddr.checked_add(amount) else {
                break;
            };
            let vpn = addr / page_size;
            let offset = addr % page_size;
            let space = inner.space(pid)?;
            if vpn >= space.page_count() || space.page_table.is_read_only(vpn) {
                break;
            }

            let frame = inner.page_in(pid, vpn)?;
            inner.space_mut(pid)?.page_table.mark_dirty(vpn);

            let chunk = (page_size - offset).min(data.len() - amount);
            inner.mmu.frame_mut(frame)[offset..offset + chunk]
                .copy_from_slice(&data[amount..amount + chunk]);
            amount += chunk;
        }

        Ok(amount)
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    ///
    /// `None` if no terminator shows up within `max_len + 1` bytes.
    pub fn read_string(&self, vaddr: usize, max_len: usize) -> Result<Option<String>> {
        let limit = max_len.saturating_add(1);
        let mut bytes = Vec::new();
        let mut chunk = vec![0; self.config.page_size];

        while bytes.len() < limit {
            let Some(addr) = vaddr.checked_add(bytes.len()) else {
                break;
            };
            let want = (limit - bytes.len()).min(chunk.len());
            let read = self.read_bytes(addr, &mut chunk[..want])?;

            if let Some(len) = chunk[..read].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..len]);
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
            bytes.extend_from_slice(&chunk[..read]);

            if read < want {
                break;
            }
        }

        Ok(None)
    }

    pub fn stats(&self) -> VmStats {
        self.inner.lock().stats
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().frames.free_count()
    }

    pub fn frame_owner(&self, frame: FrameId) -> Option<PageKey> {
        self.inner.lock().frames.owner_of(frame)
    }

    pub fn page_entry(&self, pid: Pid, vpn: Vpn) -> Option<PageTableEntry> {
        let inner = self.inner.lock();
        inner.processes.get(&pid)?.page_table.get(vpn)
    }

    pub fn page_origin(&self, pid: Pid, vpn: Vpn) -> Option<PageOrigin> {
        let inner = self.inner.lock();
        let space = inner.processes.get(&pid)?;
        (vpn < space.page_count()).then(|| space.page_table.origin(vpn))
    }

    pub fn tlb_position(&self, pid: Pid, vpn: Vpn) -> Option<usize> {
        let inner = self.inner.lock();
        inner.processes.get(&pid)?.shadow.position(vpn)
    }

    pub fn tlb_entry(&self, slot: usize) -> TranslationEntry {
        self.inner.lock().mmu.read_tlb_entry(slot)
    }

    pub fn swap_slot(&self, key: PageKey) -> Option<SlotId> {
        self.inner.lock().swap.slot_of(key)
    }

    /// Checks that the frame table and every page table agree on who owns
    /// which frame.
    pub fn check_invariants(&self) -> Result<()> {
        self.inner.lock().check_invariants()
    }

    /// Closes the swap file.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.lock().swap.close()
    }
}

impl Inner {
    fn space(&self, pid: Pid) -> Result<&AddressSpace> {
        self.processes.get(&pid).ok_or(VmError::UnknownProcess(pid))
    }

    fn space_mut(&mut self, pid: Pid) -> Result<&mut AddressSpace> {
        self.processes
            .get_mut(&pid)
            .ok_or(VmError::UnknownProcess(pid))
    }

    fn handle_tlb_miss(&mut self, vaddr: usize) -> Result<()> {
        let pid = self.current.ok_or(VmError::NoCurrentProcess)?;
        let vpn = vaddr / self.mmu.page_size();
        let pages = self.space(pid)?.page_count();

        if vpn >= pages {
            return Err(VmError::AddressOutOfRange { vaddr, pages });
        }

        // Another thread may have mapped the page since this miss was raised.
        if let Some(slot) = self.space(pid)?.shadow.position(vpn) {
            let live = self.mmu.read_tlb_entry(slot);
            if live.valid && live.vpn == vpn {
                trace!("vm: vpn={:#x} already live in tlb[{}]", vpn, slot);
                return Ok(());
            }
        }

        self.stats.tlb_misses += 1;
        debug!("vm: tlb miss pid={} vaddr={:#x} vpn={:#x}", pid, vaddr, vpn);

        let slot = self.pick_tlb_slot(pid)?;
        self.page_in(pid, vpn)?;

        let space = self.space_mut(pid)?;
        let entry = space.page_table.translation_entry(vpn);
        space.shadow.set_position(vpn, slot);
        self.mmu.write_tlb_entry(slot, entry);

        Ok(())
    }

    /// A free TLB slot, or a random one whose occupant is folded back into
    /// the page table first.
    fn pick_tlb_slot(&mut self, pid: Pid) -> Result<usize> {
        if let Some(slot) = self.mmu.invalid_tlb_slot() {
            return Ok(slot);
        }

        let slot = self.replacer.pick_tlb_slot(self.mmu.tlb_size());
        let victim = self.mmu.read_tlb_entry(slot);

        let space = self
            .processes
            .get_mut(&pid)
            .ok_or(VmError::UnknownProcess(pid))?;
        if victim.valid && space.page_table.is_resident(victim.vpn) {
            space.page_table.merge_bits(victim.vpn, victim.used, victim.dirty);
            space.shadow.take_position(victim.vpn);
        }
        self.mmu.write_tlb_entry(slot, TranslationEntry::invalid());

        Ok(slot)
    }

    /// Makes `vpn` of `pid` resident and returns its frame.
    fn page_in(&mut self, pid: Pid, vpn: Vpn) -> Result<FrameId> {
        if let Some(frame) = self.space(pid)?.page_table.translate(vpn) {
            return Ok(frame);
        }

        self.stats.page_faults += 1;

        let frame = match self.frames.allocate() {
            Some(frame) => frame,
            None => self.evict()?,
        };
        let key = PageKey::new(pid, vpn);
        self.frames.set_owner(frame, key);

        if let Err(err) = self.fill_frame(key, frame) {
            self.frames.release(frame);
            return Err(err);
        }

        let space = self.space_mut(pid)?;
        space.page_table.install(vpn, frame);
        space.frames.insert(frame);

        debug!("vm: {} now resident in frame {}", key, frame);

        Ok(frame)
    }

    fn fill_frame(&mut self, key: PageKey, frame: FrameId) -> Result<()> {
        let Inner {
            mmu,
            swap,
            processes,
            stats,
            ..
        } = self;
        let space = processes
            .get(&key.pid)
            .ok_or(VmError::UnknownProcess(key.pid))?;
        let target = mmu.frame_mut(frame);

        match space.page_table.origin(key.vpn) {
            PageOrigin::Swap => {
                swap.read(key, target)?;
                stats.swap_reads += 1;
            }
            PageOrigin::Image { section, offset } => {
                space.sections[section].load_page(offset, target);
                stats.image_loads += 1;
            }
            PageOrigin::Zero => {
                target.fill(0);
                stats.zero_fills += 1;
            }
        }

        Ok(())
    }

    /// Frees an owned frame by pushing its page out, and returns it still
    /// out of the free pool.
    fn evict(&mut self) -> Result<FrameId> {
        let Inner {
            mmu,
            frames,
            swap,
            processes,
            replacer,
            stats,
            ..
        } = self;

        let frame = replacer.pick_replacement_frame(frames.len(), &mut |frame| {
            frames
                .owner_of(frame)
                .and_then(|key| processes.get(&key.pid).map(|space| space.shadow.is_pinned(key.vpn)))
                .unwrap_or(false)
        });

        let key = frames.owner_of(frame).ok_or(VmError::OrphanFrame(frame))?;
        let victim = processes
            .get_mut(&key.pid)
            .ok_or(VmError::StaleOwner { frame, key })?;
        if victim.page_table.translate(key.vpn) != Some(frame) {
            return Err(VmError::StaleOwner { frame, key });
        }

        // Only the running process has positions, so a pinned slot is live
        // hardware state belonging to the victim.
        let live = victim
            .shadow
            .position(key.vpn)
            .map(|slot| (slot, mmu.read_tlb_entry(slot)))
            .filter(|(_, entry)| entry.valid && entry.vpn == key.vpn);

        let entry = victim.page_table.get(key.vpn).unwrap_or_default();
        let dirty = entry.dirty || live.map_or(false, |(_, entry)| entry.dirty);

        if dirty {
            swap.write(key, mmu.frame(frame))?;
            stats.swap_writes += 1;
            victim.page_table.mark_swapped(key.vpn);
        }

        if let Some((slot, entry)) = live {
            victim.page_table.merge_bits(key.vpn, entry.used, entry.dirty);
            mmu.write_tlb_entry(slot, TranslationEntry::invalid());
        }
        victim.shadow.take_position(key.vpn);
        victim.page_table.invalidate(key.vpn);
        victim.frames.remove(&frame);
        frames.clear_owner(frame);
        stats.evictions += 1;

        debug!(
            "vm: evicted {} from frame {}{}",
            key,
            frame,
            if dirty { " (written to swap)" } else { "" }
        );

        Ok(frame)
    }

    fn check_invariants(&self) -> Result<()> {
        let mismatch = |frame, detail: String| Err(VmError::OwnershipMismatch { frame, detail });

        let mut owned = 0;
        for (frame, key) in self.frames.owned() {
            owned += 1;

            if self.frames.is_free(frame) {
                return mismatch(frame, format!("owned by {} but in the free pool", key));
            }
            let Some(space) = self.processes.get(&key.pid) else {
                return mismatch(frame, format!("owned by {} which has exited", key));
            };
            if space.page_table.translate(key.vpn) != Some(frame) {
                return mismatch(frame, format!("page table of {} does not map it", key));
            }
            if !space.frames.contains(&frame) {
                return mismatch(frame, format!("missing from the frame set of {}", key));
            }
        }

        for space in self.processes.values() {
            for (vpn, frame) in space.page_table.resident_pages() {
                let key = PageKey::new(space.pid, vpn);
                if self.frames.owner_of(frame) != Some(key) {
                    return mismatch(frame, format!("{} maps it but does not own it", key));
                }
            }
        }

        if owned + self.frames.free_count() != self.frames.len() {
            return mismatch(
                self.frames.len(),
                format!(
                    "{} owned + {} free frames != {}",
                    owned,
                    self.frames.free_count(),
                    self.frames.len()
                ),
            );
        }

        Ok(())
    }
}
