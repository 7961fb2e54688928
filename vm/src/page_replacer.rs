use log::trace;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::frame_table::FrameId;

/// Chooses what to throw out when the TLB or physical memory is full.
pub trait PageReplacer: Send {
    /// Picks the TLB slot to overwrite when no slot is free.
    fn pick_tlb_slot(&mut self, tlb_size: usize) -> usize;

    /// Picks the frame to evict. `is_pinned` reports frames whose page is
    /// live in the running process's TLB; implementations should prefer
    /// frames that are not pinned but must always return some frame.
    fn pick_replacement_frame(
        &mut self,
        frame_count: usize,
        is_pinned: &mut dyn FnMut(FrameId) -> bool,
    ) -> FrameId;
}

/// Uniform random choice, with a bounded number of draws for eviction.
///
/// If every draw lands on a pinned frame, the last draw is evicted anyway.
pub struct RandomReplacer {
    rng: StdRng,
    attempts: usize,
}

impl RandomReplacer {
    pub fn new(attempts: usize) -> Self {
        RandomReplacer {
            rng: StdRng::from_entropy(),
            attempts,
        }
    }

    pub fn seeded(attempts: usize, seed: u64) -> Self {
        RandomReplacer {
            rng: StdRng::seed_from_u64(seed),
            attempts,
        }
    }
}

impl PageReplacer for RandomReplacer {
    fn pick_tlb_slot(&mut self, tlb_size: usize) -> usize {
        self.rng.gen_range(0..tlb_size)
    }

    fn pick_replacement_frame(
        &mut self,
        frame_count: usize,
        is_pinned: &mut dyn FnMut(FrameId) -> bool,
    ) -> FrameId {
        let mut candidate = self.rng.gen_range(0..frame_count);

        for attempt in 1..=self.attempts {
            if !is_pinned(candidate) {
                trace!("vm: victim frame {} after {} draws", candidate, attempt);
                return candidate;
            }
            if attempt < self.attempts {
                candidate = self.rng.gen_range(0..frame_count);
            }
        }

        trace!("vm: every draw was pinned, settling for frame {}", candidate);
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlb_slot_is_in_range() {
        let mut replacer = RandomReplacer::seeded(26, 1);
        for _ in 0..100 {
            assert!(replacer.pick_tlb_slot(4) < 4);
        }
    }

    #[test]
    fn prefers_unpinned_frames() {
        let mut replacer = RandomReplacer::seeded(10_000, 7);
        let frame = replacer.pick_replacement_frame(8, &mut |frame| frame != 5);
        assert_eq!(frame, 5);
    }

    #[test]
    fn gives_up_after_the_attempt_bound() {
        let mut replacer = RandomReplacer::seeded(26, 3);
        let mut draws = Vec::new();

        let frame = replacer.pick_replacement_frame(4, &mut |frame| {
            draws.push(frame);
            true
        });

        assert_eq!(draws.len(), 26);
        assert_eq!(Some(&frame), draws.last());
    }

    #[test]
    fn single_attempt_takes_the_first_draw() {
        let mut replacer = RandomReplacer::seeded(1, 11);
        let mut calls = 0;
        let frame = replacer.pick_replacement_frame(16, &mut |_| {
            calls += 1;
            true
        });
        assert_eq!(calls, 1);
        assert!(frame < 16);
    }
}
