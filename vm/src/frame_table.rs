use std::{collections::VecDeque, fmt};

pub type FrameId = usize;
pub type Pid = u32;
pub type Vpn = usize;

/// A (process, virtual page) pair. Identifies the owner of a frame and the
/// key of a swap slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub pid: Pid,
    pub vpn: Vpn,
}

impl PageKey {
    pub fn new(pid: Pid, vpn: Vpn) -> Self {
        PageKey { pid, vpn }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(pid {}, page {:#x})", self.pid, self.vpn)
    }
}

/// Global owner table of physical frames plus the free pool.
///
/// Never evicts on its own: an empty pool is reported to the caller.
pub struct FrameTable {
    owners: Vec<Option<PageKey>>,
    free_frames: VecDeque<FrameId>,
}

impl FrameTable {
    pub fn new(frame_count: usize) -> Self {
        FrameTable {
            owners: vec![None; frame_count],
            free_frames: (0..frame_count).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.free_frames.len()
    }

    /// Takes a frame from the free pool. `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<FrameId> {
        self.free_frames.pop_front()
    }

    /// Drops the owner and returns the frame to the free pool.
    pub fn release(&mut self, frame: FrameId) {
        debug_assert!(!self.free_frames.contains(&frame), "frame {frame} released twice");

        self.owners[frame] = None;
        self.free_frames.push_back(frame);
    }

    pub fn owner_of(&self, frame: FrameId) -> Option<PageKey> {
        self.owners.get(frame).copied().flatten()
    }

    /// Records `key` as the owner of `frame`, returning the previous owner.
    pub fn set_owner(&mut self, frame: FrameId, key: PageKey) -> Option<PageKey> {
        self.owners[frame].replace(key)
    }

    /// Drops the owner without returning the frame to the pool, for a frame
    /// about to be handed straight to someone else.
    pub fn clear_owner(&mut self, frame: FrameId) -> Option<PageKey> {
        self.owners[frame].take()
    }

    pub fn owned(&self) -> impl Iterator<Item = (FrameId, PageKey)> + '_ {
        self.owners
            .iter()
            .enumerate()
            .filter_map(|(frame, owner)| owner.map(|key| (frame, key)))
    }

    pub fn is_free(&self, frame: FrameId) -> bool {
        self.free_frames.contains(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_every_frame_then_reports_exhaustion() {
        let mut table = FrameTable::new(3);

        let mut got: Vec<_> = (0..3).map(|_| table.allocate().unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(table.allocate(), None);
        assert_eq!(table.free_count(), 0);
    }

    #[test]
    fn release_returns_frame_and_clears_owner() {
        let mut table = FrameTable::new(2);
        let frame = table.allocate().unwrap();
        table.set_owner(frame, PageKey::new(7, 3));
        assert_eq!(table.owner_of(frame), Some(PageKey::new(7, 3)));

        table.release(frame);
        assert_eq!(table.owner_of(frame), None);
        assert!(table.is_free(frame));
        assert_eq!(table.free_count(), 2);
    }

    #[test]
    fn reassignment_keeps_frame_out_of_pool() {
        let mut table = FrameTable::new(1);
        let frame = table.allocate().unwrap();
        table.set_owner(frame, PageKey::new(1, 0));

        assert_eq!(table.clear_owner(frame), Some(PageKey::new(1, 0)));
        assert_eq!(table.set_owner(frame, PageKey::new(2, 5)), None);
        assert_eq!(table.free_count(), 0);
        assert_eq!(table.owned().collect::<Vec<_>>(), vec![(0, PageKey::new(2, 5))]);
    }
}
