//! Memory hierarchy model.
//!
//! Three tiers: external DDR (the client's shared-memory arena), a
//! shared L2, and one L1 scratchpad per engine. L2 and L1 are bounded
//! block caches keyed by `(handle, offset)` with LRU eviction and
//! hit/miss counters. Staging copies real bytes into tier storage, but
//! the tiers affect statistics only — the matmul path reads its
//! operands straight from DDR, and callers must preserve that split.
//!
//! Allocation inside a tier is a bump pointer; eviction removes blocks
//! wholesale, and `reset` (called at the start of every tiled matmul)
//! rewinds everything so hit/miss statistics are per-kernel.

use npm_device::{NpmError, Result};

/// Whether a staging call found its block already resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staged {
    /// Block was resident; no transfer needed.
    Hit,
    /// Block was brought in (and something may have been evicted).
    Miss,
}

impl Staged {
    /// True for [`Staged::Miss`].
    pub const fn is_miss(self) -> bool {
        matches!(self, Self::Miss)
    }
}

/// One cached block inside a tier.
#[derive(Debug, Clone)]
struct MemBlock {
    handle: u64,
    offset: usize,
    size: usize,
    local_offset: usize,
    last_access: u64,
    dirty: bool,
}

/// A bounded cache tier: storage, bump pointer, block list.
#[derive(Debug)]
struct Tier {
    capacity: usize,
    used: usize,
    storage: Vec<u8>,
    blocks: Vec<MemBlock>,
}

impl Tier {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            storage: vec![0; capacity],
            blocks: Vec::new(),
        }
    }

    fn find(&mut self, handle: u64, offset: usize) -> Option<&mut MemBlock> {
        self.blocks
            .iter_mut()
            .find(|b| b.handle == handle && b.offset == offset)
    }

    fn can_fit(&self, size: usize) -> bool {
        self.used + size <= self.capacity
    }

    /// Evict least-recently-used blocks until `size` fits. The bump
    /// pointer rewinds by the evicted sizes, compacting as it goes.
    fn evict_lru(&mut self, size: usize) {
        while !self.blocks.is_empty() && !self.can_fit(size) {
            let lru = self
                .blocks
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.last_access)
                .map(|(i, _)| i)
                .expect("non-empty block list has a minimum");
            let evicted = self.blocks.swap_remove(lru);
            self.used -= evicted.size;
        }
    }

    /// Insert a block and copy `src` into its storage slot. The caller
    /// has already established that `src.len()` fits.
    fn insert(&mut self, handle: u64, offset: usize, src: &[u8], last_access: u64) -> usize {
        let local_offset = self.used;
        self.used += src.len();
        self.storage[local_offset..local_offset + src.len()].copy_from_slice(src);
        self.blocks.push(MemBlock {
            handle,
            offset,
            size: src.len(),
            local_offset,
            last_access,
            dirty: false,
        });
        local_offset
    }

    fn clear(&mut self) {
        self.blocks.clear();
        self.used = 0;
    }
}

/// LRU-tracked L1-per-engine / shared-L2 hierarchy with hit and miss
/// counters.
#[derive(Debug)]
pub struct MemoryHierarchy {
    l1: Vec<Tier>,
    l2: Tier,
    access_counter: u64,
    l1_hits: u64,
    l1_misses: u64,
    l2_hits: u64,
    l2_misses: u64,
    total_bytes_moved: u64,
}

impl MemoryHierarchy {
    /// Build a hierarchy with `num_engines` L1 tiers of
    /// `l1_size_per_engine` bytes each and one shared L2.
    pub fn new(num_engines: usize, l1_size_per_engine: usize, l2_size: usize) -> Self {
        Self {
            l1: (0..num_engines)
                .map(|_| Tier::new(l1_size_per_engine))
                .collect(),
            l2: Tier::new(l2_size),
            access_counter: 0,
            l1_hits: 0,
            l1_misses: 0,
            l2_hits: 0,
            l2_misses: 0,
            total_bytes_moved: 0,
        }
    }

    /// Stage a DDR block into L2.
    ///
    /// A resident `(handle, offset)` block is a hit and only refreshes
    /// its LRU stamp. A miss evicts until the block fits, then copies
    /// `src` into L2 storage.
    ///
    /// # Errors
    ///
    /// [`NpmError::OutOfMemory`] if the block is larger than the whole
    /// tier.
    pub fn stage_to_l2(&mut self, handle: u64, offset: usize, src: &[u8]) -> Result<Staged> {
        self.access_counter += 1;
        let stamp = self.access_counter;

        if let Some(block) = self.l2.find(handle, offset) {
            block.last_access = stamp;
            self.l2_hits += 1;
            return Ok(Staged::Hit);
        }

        self.l2_misses += 1;
        if src.len() > self.l2.capacity {
            return Err(NpmError::out_of_memory(format!(
                "block of {} bytes exceeds L2 capacity {}",
                src.len(),
                self.l2.capacity
            )));
        }
        if !self.l2.can_fit(src.len()) {
            self.l2.evict_lru(src.len());
        }
        self.l2.insert(handle, offset, src, stamp);
        self.total_bytes_moved += src.len() as u64;
        Ok(Staged::Miss)
    }

    /// Promote an L2-resident block into an engine's L1.
    ///
    /// # Errors
    ///
    /// [`NpmError::InvalidParams`] for an unknown engine or a block that
    /// was never staged to L2; [`NpmError::OutOfMemory`] if the block is
    /// larger than the whole L1 tier.
    pub fn stage_to_l1(&mut self, engine: usize, handle: u64, offset: usize) -> Result<Staged> {
        if engine >= self.l1.len() {
            return Err(NpmError::invalid_params(format!(
                "engine {engine} out of range ({} engines)",
                self.l1.len()
            )));
        }

        self.access_counter += 1;
        let stamp = self.access_counter;

        if let Some(block) = self.l1[engine].find(handle, offset) {
            block.last_access = stamp;
            self.l1_hits += 1;
            return Ok(Staged::Hit);
        }
        self.l1_misses += 1;

        let (l2_local, size) = match self.l2.find(handle, offset) {
            Some(block) => (block.local_offset, block.size),
            None => {
                return Err(NpmError::invalid_params(
                    "block must be staged to L2 before L1",
                ))
            }
        };

        let l1 = &mut self.l1[engine];
        if size > l1.capacity {
            return Err(NpmError::out_of_memory(format!(
                "block of {size} bytes exceeds L1 capacity {}",
                l1.capacity
            )));
        }
        if !l1.can_fit(size) {
            l1.evict_lru(size);
        }
        let src = &self.l2.storage[l2_local..l2_local + size];
        l1.insert(handle, offset, src, stamp);
        self.total_bytes_moved += size as u64;
        Ok(Staged::Miss)
    }

    /// Mark an L1-resident block dirty.
    pub fn mark_dirty(&mut self, engine: usize, handle: u64, offset: usize) {
        if let Some(tier) = self.l1.get_mut(engine) {
            if let Some(block) = tier.find(handle, offset) {
                block.dirty = true;
            }
        }
    }

    /// Copy a dirty L1 block down to its L2 twin and clear its dirty
    /// bit; the L2 twin becomes dirty. No-op if either block is missing
    /// or the L1 block is clean.
    pub fn writeback_l1_to_l2(&mut self, engine: usize, handle: u64, offset: usize) {
        let Some(l1) = self.l1.get_mut(engine) else {
            return;
        };
        let Some(l1_block) = l1.find(handle, offset) else {
            return;
        };
        if !l1_block.dirty {
            return;
        }
        let (l1_local, size) = (l1_block.local_offset, l1_block.size);
        l1_block.dirty = false;

        let Some(l2_block) = self.l2.find(handle, offset) else {
            return;
        };
        let l2_local = l2_block.local_offset;
        l2_block.dirty = true;

        let (src, dst_tier) = (&l1.storage[l1_local..l1_local + size], &mut self.l2.storage);
        dst_tier[l2_local..l2_local + size].copy_from_slice(src);
        self.total_bytes_moved += size as u64;
    }

    /// Copy a dirty L2 block back to DDR and clear its dirty bit.
    /// No-op if the block is missing or clean.
    ///
    /// # Errors
    ///
    /// [`NpmError::InvalidParams`] if `ddr` is smaller than the block.
    pub fn writeback_l2_to_ddr(&mut self, handle: u64, offset: usize, ddr: &mut [u8]) -> Result<()> {
        let Some(block) = self.l2.find(handle, offset) else {
            return Ok(());
        };
        if !block.dirty {
            return Ok(());
        }
        let (local, size) = (block.local_offset, block.size);
        if ddr.len() < size {
            return Err(NpmError::invalid_params(format!(
                "DDR destination of {} bytes cannot hold a {size}-byte block",
                ddr.len()
            )));
        }
        block.dirty = false;
        ddr[..size].copy_from_slice(&self.l2.storage[local..local + size]);
        self.total_bytes_moved += size as u64;
        Ok(())
    }

    /// Flush every dirty block: L1 → L2, then hand each dirty L2 block
    /// to `sink` as `(handle, offset, bytes)`.
    pub fn flush_all(&mut self, mut sink: impl FnMut(u64, usize, &[u8])) {
        let dirty_l1: Vec<(usize, u64, usize)> = self
            .l1
            .iter()
            .enumerate()
            .flat_map(|(e, tier)| {
                tier.blocks
                    .iter()
                    .filter(|b| b.dirty)
                    .map(move |b| (e, b.handle, b.offset))
            })
            .collect();
        for (engine, handle, offset) in dirty_l1 {
            self.writeback_l1_to_l2(engine, handle, offset);
        }

        for block in &mut self.l2.blocks {
            if block.dirty {
                block.dirty = false;
                let bytes = &self.l2.storage[block.local_offset..block.local_offset + block.size];
                sink(block.handle, block.offset, bytes);
                self.total_bytes_moved += block.size as u64;
            }
        }
    }

    /// Drop all cached blocks in every tier and zero every counter.
    pub fn reset(&mut self) {
        for tier in &mut self.l1 {
            tier.clear();
        }
        self.l2.clear();
        self.access_counter = 0;
        self.l1_hits = 0;
        self.l1_misses = 0;
        self.l2_hits = 0;
        self.l2_misses = 0;
        self.total_bytes_moved = 0;
    }

    /// L1 hit count since the last reset.
    pub const fn l1_hits(&self) -> u64 {
        self.l1_hits
    }

    /// L1 miss count since the last reset.
    pub const fn l1_misses(&self) -> u64 {
        self.l1_misses
    }

    /// L2 hit count since the last reset.
    pub const fn l2_hits(&self) -> u64 {
        self.l2_hits
    }

    /// L2 miss count since the last reset.
    pub const fn l2_misses(&self) -> u64 {
        self.l2_misses
    }

    /// Bytes copied between tiers since the last reset.
    pub const fn total_bytes_moved(&self) -> u64 {
        self.total_bytes_moved
    }

    /// Number of engines (L1 tiers).
    pub fn num_engines(&self) -> usize {
        self.l1.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_plus_misses_equals_stage_calls() {
        let mut mem = MemoryHierarchy::new(1, 1024, 4096);
        let data = [0u8; 64];
        let calls = 10;
        for i in 0..calls {
            // alternate between two blocks so both hits and misses occur
            mem.stage_to_l2(1, (i % 2) * 64, &data).unwrap();
        }
        assert_eq!(mem.l2_hits() + mem.l2_misses(), calls as u64);
        assert_eq!(mem.l2_misses(), 2);
    }

    #[test]
    fn repeated_staging_hits() {
        let mut mem = MemoryHierarchy::new(1, 1024, 4096);
        let data = [7u8; 128];
        assert_eq!(mem.stage_to_l2(3, 0, &data).unwrap(), Staged::Miss);
        assert_eq!(mem.stage_to_l2(3, 0, &data).unwrap(), Staged::Hit);
        assert_eq!(mem.total_bytes_moved(), 128);
    }

    #[test]
    fn lru_evicts_the_oldest_block() {
        // L2 fits exactly two 64-byte blocks
        let mut mem = MemoryHierarchy::new(1, 1024, 128);
        let data = [0u8; 64];
        mem.stage_to_l2(1, 0, &data).unwrap();
        mem.stage_to_l2(1, 64, &data).unwrap();
        // touch block 0 so block 64 becomes LRU
        mem.stage_to_l2(1, 0, &data).unwrap();
        // third block evicts (1, 64)
        mem.stage_to_l2(1, 128, &data).unwrap();
        assert_eq!(mem.stage_to_l2(1, 0, &data).unwrap(), Staged::Hit);
        assert_eq!(mem.stage_to_l2(1, 64, &data).unwrap(), Staged::Miss);
    }

    #[test]
    fn l1_requires_l2_residency() {
        let mut mem = MemoryHierarchy::new(2, 256, 1024);
        assert!(mem.stage_to_l1(0, 9, 0).is_err());

        let data = [1u8; 32];
        mem.stage_to_l2(9, 0, &data).unwrap();
        assert_eq!(mem.stage_to_l1(0, 9, 0).unwrap(), Staged::Miss);
        assert_eq!(mem.stage_to_l1(0, 9, 0).unwrap(), Staged::Hit);
        // the other engine's L1 is independent
        assert_eq!(mem.stage_to_l1(1, 9, 0).unwrap(), Staged::Miss);
        assert!(mem.stage_to_l1(2, 9, 0).is_err());
    }

    #[test]
    fn oversized_block_is_out_of_memory() {
        let mut mem = MemoryHierarchy::new(1, 64, 128);
        let big = vec![0u8; 256];
        assert!(matches!(
            mem.stage_to_l2(1, 0, &big),
            Err(NpmError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn dirty_writeback_flows_down_the_tiers() {
        let mut mem = MemoryHierarchy::new(1, 256, 1024);
        let data = [5u8; 16];
        mem.stage_to_l2(2, 0, &data).unwrap();
        mem.stage_to_l1(0, 2, 0).unwrap();
        mem.mark_dirty(0, 2, 0);

        mem.writeback_l1_to_l2(0, 2, 0);
        let mut ddr = [0u8; 16];
        mem.writeback_l2_to_ddr(2, 0, &mut ddr).unwrap();
        assert_eq!(ddr, data);

        // a second writeback is a no-op: the dirty bit is clear
        let mut ddr2 = [9u8; 16];
        mem.writeback_l2_to_ddr(2, 0, &mut ddr2).unwrap();
        assert_eq!(ddr2, [9u8; 16]);
    }

    #[test]
    fn flush_all_visits_every_dirty_block() {
        let mut mem = MemoryHierarchy::new(1, 256, 1024);
        mem.stage_to_l2(1, 0, &[1u8; 8]).unwrap();
        mem.stage_to_l2(1, 8, &[2u8; 8]).unwrap();
        mem.stage_to_l1(0, 1, 0).unwrap();
        mem.mark_dirty(0, 1, 0);

        let mut flushed = Vec::new();
        mem.flush_all(|handle, offset, bytes| flushed.push((handle, offset, bytes.to_vec())));
        assert_eq!(flushed, vec![(1, 0, vec![1u8; 8])]);
    }

    #[test]
    fn reset_clears_blocks_and_counters() {
        let mut mem = MemoryHierarchy::new(2, 256, 1024);
        let data = [0u8; 32];
        mem.stage_to_l2(1, 0, &data).unwrap();
        mem.stage_to_l1(0, 1, 0).unwrap();
        mem.reset();
        assert_eq!(mem.l1_hits(), 0);
        assert_eq!(mem.l1_misses(), 0);
        assert_eq!(mem.l2_hits(), 0);
        assert_eq!(mem.l2_misses(), 0);
        assert_eq!(mem.total_bytes_moved(), 0);
        // everything was dropped, so staging misses again
        assert_eq!(mem.stage_to_l2(1, 0, &data).unwrap(), Staged::Miss);
    }
}
