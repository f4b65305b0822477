//! Bitmap allocator for the resource heap segment.
//!
//! The heap is carved into fixed 4 KiB blocks tracked by an occupancy
//! bitmap held in kernel-agent private memory - the bitmap itself never
//! crosses the trust boundary; the host only reads payload bytes at
//! offsets the guest cites. First-fit only: the workload is short-lived
//! per-command payloads plus long-lived resource backings, and never needs
//! defragmentation within a device lifetime. Callers that see
//! `HeapExhausted` despite free space retry after waiting on their most
//! recent fence.

use std::collections::BTreeMap;

use tracing::trace;

use pvgpu_protocol::{PvgpuError, Result, PVGPU_HEAP_BLOCK_SIZE};

pub struct HeapAllocator {
    /// One bit per block; set = allocated.
    bitmap: Vec<u64>,
    block_count: usize,
    free_blocks: usize,
    /// Region-global offset of the heap segment.
    base_offset: u32,
    /// Live allocations: region-global offset -> block count. Used to
    /// reject double-frees and size mismatches without corrupting the
    /// bitmap.
    allocations: BTreeMap<u32, usize>,
}

impl HeapAllocator {
    pub fn new(heap_offset: u32, heap_size: u32) -> Self {
        let block_count = heap_size as usize / PVGPU_HEAP_BLOCK_SIZE;
        Self {
            bitmap: vec![0u64; block_count.div_ceil(64)],
            block_count,
            free_blocks: block_count,
            base_offset: heap_offset,
            allocations: BTreeMap::new(),
        }
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    /// Allocate `size` bytes with the given alignment. Returns the
    /// region-global offset and the rounded-up allocation size.
    /// Alignments finer than the block size collapse to block alignment.
    pub fn allocate(&mut self, size: u32, alignment: u32) -> Result<(u32, u32)> {
        if size == 0 {
            return Err(PvgpuError::InvalidParameter);
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(PvgpuError::InvalidParameter);
        }

        let blocks_needed = (size as usize).div_ceil(PVGPU_HEAP_BLOCK_SIZE);
        let align_blocks = (alignment as usize / PVGPU_HEAP_BLOCK_SIZE).max(1);
        if blocks_needed > self.free_blocks {
            return Err(PvgpuError::HeapExhausted);
        }

        let mut idx = 0usize;
        while idx + blocks_needed <= self.block_count {
            match self.first_set_in(idx, blocks_needed) {
                None => {
                    // Clear run found.
                    self.set_range(idx, blocks_needed);
                    self.free_blocks -= blocks_needed;
                    let offset =
                        self.base_offset + (idx * PVGPU_HEAP_BLOCK_SIZE) as u32;
                    let allocated = (blocks_needed * PVGPU_HEAP_BLOCK_SIZE) as u32;
                    self.allocations.insert(offset, blocks_needed);
                    trace!(offset, allocated, "heap allocate");
                    return Ok((offset, allocated));
                }
                Some(set_idx) => {
                    // Skip past the obstruction, keeping alignment.
                    idx = (set_idx + 1).next_multiple_of(align_blocks);
                }
            }
        }

        Err(PvgpuError::HeapExhausted)
    }

    /// Free a range returned by a prior [`allocate`](Self::allocate).
    /// The offset and size must match that allocation exactly.
    pub fn free(&mut self, offset: u32, size: u32) -> Result<()> {
        let heap_end =
            self.base_offset as usize + self.block_count * PVGPU_HEAP_BLOCK_SIZE;
        if (offset as usize) < self.base_offset as usize
            || offset as usize >= heap_end
            || (offset as usize - self.base_offset as usize) % PVGPU_HEAP_BLOCK_SIZE != 0
        {
            return Err(PvgpuError::InvalidParameter);
        }

        let blocks = (size as usize).div_ceil(PVGPU_HEAP_BLOCK_SIZE);
        match self.allocations.get(&offset) {
            Some(&allocated_blocks) if allocated_blocks == blocks => {}
            _ => return Err(PvgpuError::InvalidParameter),
        }

        let idx = (offset as usize - self.base_offset as usize) / PVGPU_HEAP_BLOCK_SIZE;
        self.clear_range(idx, blocks);
        self.free_blocks += blocks;
        self.allocations.remove(&offset);
        trace!(offset, size, "heap free");
        Ok(())
    }

    /// Drop every outstanding allocation. Used on device reset.
    pub fn free_all(&mut self) {
        self.bitmap.fill(0);
        self.free_blocks = self.block_count;
        self.allocations.clear();
    }

    fn is_set(&self, idx: usize) -> bool {
        (self.bitmap[idx / 64] >> (idx % 64)) & 1 != 0
    }

    /// Index of the first set bit in `[start, start + len)`, or `None` if
    /// the whole run is clear.
    fn first_set_in(&self, start: usize, len: usize) -> Option<usize> {
        (start..start + len).find(|&i| self.is_set(i))
    }

    fn set_range(&mut self, start: usize, len: usize) {
        for i in start..start + len {
            self.bitmap[i / 64] |= 1 << (i % 64);
        }
    }

    fn clear_range(&mut self, start: usize, len: usize) {
        for i in start..start + len {
            self.bitmap[i / 64] &= !(1 << (i % 64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const BASE: u32 = 0x1001000;
    const BLOCK: u32 = PVGPU_HEAP_BLOCK_SIZE as u32;

    fn heap_of(blocks: u32) -> HeapAllocator {
        HeapAllocator::new(BASE, blocks * BLOCK)
    }

    #[test]
    fn allocate_returns_block_rounded_global_offsets() {
        let mut heap = heap_of(16);
        let (off_a, size_a) = heap.allocate(1, 16).unwrap();
        assert_eq!(off_a, BASE);
        assert_eq!(size_a, BLOCK);

        let (off_b, size_b) = heap.allocate(BLOCK + 1, 16).unwrap();
        assert_eq!(off_b, BASE + BLOCK);
        assert_eq!(size_b, 2 * BLOCK);
        assert_eq!(heap.free_blocks(), 13);
    }

    #[test]
    fn alloc_free_restores_state() {
        let mut heap = heap_of(64);
        let before = heap.free_blocks();
        let (off, size) = heap.allocate(5 * BLOCK, 16).unwrap();
        heap.free(off, size).unwrap();
        assert_eq!(heap.free_blocks(), before);
        // The same run is handed out again.
        let (off2, _) = heap.allocate(5 * BLOCK, 16).unwrap();
        assert_eq!(off2, off);
    }

    #[test]
    fn full_heap_alloc_succeeds_oversize_fails() {
        let mut heap = heap_of(4096);
        let heap_size = 4096 * BLOCK;
        let (off, size) = heap.allocate(heap_size, 1).unwrap();
        assert_eq!(off, BASE);
        assert_eq!(size, heap_size);
        assert_eq!(heap.free_blocks(), 0);
        heap.free(off, size).unwrap();

        assert_eq!(
            heap.allocate(heap_size + BLOCK, 1),
            Err(PvgpuError::HeapExhausted)
        );
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut heap = heap_of(4);
        heap.allocate(4 * BLOCK, 1).unwrap();
        assert_eq!(heap.allocate(1, 1), Err(PvgpuError::HeapExhausted));
    }

    #[test]
    fn double_free_rejected_without_corruption() {
        let mut heap = heap_of(8);
        let (off, size) = heap.allocate(2 * BLOCK, 16).unwrap();
        heap.free(off, size).unwrap();
        assert_eq!(heap.free(off, size), Err(PvgpuError::InvalidParameter));
        assert_eq!(heap.free_blocks(), 8);
        // The heap still serves allocations normally.
        let (off2, _) = heap.allocate(8 * BLOCK, 1).unwrap();
        assert_eq!(off2, BASE);
    }

    #[test]
    fn mismatched_size_rejected() {
        let mut heap = heap_of(8);
        let (off, _) = heap.allocate(3 * BLOCK, 16).unwrap();
        assert_eq!(heap.free(off, BLOCK), Err(PvgpuError::InvalidParameter));
        assert_eq!(heap.free_blocks(), 5);
        heap.free(off, 3 * BLOCK).unwrap();
        assert_eq!(heap.free_blocks(), 8);
    }

    #[test]
    fn unaligned_or_foreign_offset_rejected() {
        let mut heap = heap_of(8);
        heap.allocate(BLOCK, 16).unwrap();
        assert_eq!(heap.free(BASE + 7, BLOCK), Err(PvgpuError::InvalidParameter));
        assert_eq!(heap.free(0, BLOCK), Err(PvgpuError::InvalidParameter));
        // In-heap, block-aligned, but never allocated.
        assert_eq!(
            heap.free(BASE + 4 * BLOCK, BLOCK),
            Err(PvgpuError::InvalidParameter)
        );
    }

    #[test]
    fn coarse_alignment_respected() {
        let mut heap = heap_of(64);
        // Occupy the first block so an aligned allocation must skip ahead.
        heap.allocate(1, 0).unwrap();
        let (off, _) = heap.allocate(BLOCK, 4 * BLOCK).unwrap();
        assert_eq!((off - BASE) % (4 * BLOCK), 0);
    }

    #[test]
    fn zero_size_and_bad_alignment_rejected() {
        let mut heap = heap_of(8);
        assert_eq!(heap.allocate(0, 16), Err(PvgpuError::InvalidParameter));
        assert_eq!(heap.allocate(BLOCK, 3), Err(PvgpuError::InvalidParameter));
    }

    #[test]
    fn free_all_resets() {
        let mut heap = heap_of(16);
        heap.allocate(3 * BLOCK, 16).unwrap();
        heap.allocate(5 * BLOCK, 16).unwrap();
        heap.free_all();
        assert_eq!(heap.free_blocks(), 16);
        let (off, _) = heap.allocate(16 * BLOCK, 1).unwrap();
        assert_eq!(off, BASE);
    }

    proptest! {
        /// Any sequence of allocations fully freed in any order restores
        /// the empty-heap state, and live ranges never overlap.
        #[test]
        fn alloc_free_sequences_restore_state(
            sizes in proptest::collection::vec(1u32..6 * BLOCK, 1..24),
            free_order in proptest::collection::vec(0usize..24, 0..24),
        ) {
            let mut heap = heap_of(256);
            let mut live: Vec<(u32, u32)> = Vec::new();

            for size in sizes {
                if let Ok((off, alloc_size)) = heap.allocate(size, 16) {
                    // No overlap with anything currently live.
                    for &(other_off, other_size) in &live {
                        let disjoint = off + alloc_size <= other_off
                            || other_off + other_size <= off;
                        prop_assert!(disjoint, "overlap at 0x{off:X}");
                    }
                    live.push((off, alloc_size));
                }
            }

            for i in free_order {
                if i < live.len() {
                    let (off, size) = live.swap_remove(i);
                    prop_assert!(heap.free(off, size).is_ok());
                }
            }
            for (off, size) in live.drain(..) {
                prop_assert!(heap.free(off, size).is_ok());
            }
            prop_assert_eq!(heap.free_blocks(), 256);
        }
    }
}
