// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! LPI ID space management and the LPI configuration (property) table.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::hw::{DmaBuffer, DmaError, DmaMemory};
use crate::logger::{debug, extract_guard, info};
use crate::utils::{SZ_64K, align_up};

/// First LPI INTID.
pub const LPI_BASE: u32 = 8192;

/// Default priority written for every LPI.
pub const LPI_PROP_DEFAULT_PRIO: u8 = 0xa0;
/// Group 1 bit of a property byte.
pub const LPI_PROP_GROUP1: u8 = 1 << 1;
/// Enable bit of a property byte.
pub const LPI_PROP_ENABLED: u8 = 1 << 0;

/// A contiguous run of LPI IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LpiRange {
    /// First ID of the run.
    pub base_id: u32,
    /// Number of IDs.
    pub span: u32,
}

impl LpiRange {
    /// Creates a range.
    pub const fn new(base_id: u32, span: u32) -> Self {
        LpiRange { base_id, span }
    }

    /// One past the last ID, widened so that a range ending at 2^32 is representable.
    pub fn end(&self) -> u64 {
        u64::from(self.base_id) + u64::from(self.span)
    }

    /// Whether `id` belongs to the range.
    pub fn contains(&self, id: u32) -> bool {
        id >= self.base_id && u64::from(id) < self.end()
    }

    /// Whether `self` and `other` share at least one ID.
    pub fn overlaps(&self, other: &LpiRange) -> bool {
        u64::from(self.base_id) < other.end() && u64::from(other.base_id) < self.end()
    }
}

/// Errors associated with the LPI allocator.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum LpiError {
    /// No free LPI range of {0} IDs
    Exhausted(u32),
    /// Cannot allocate an empty LPI range
    EmptyRequest,
    /// Range {0:?} is outside the LPI space or overlaps a free range
    InvalidFree(LpiRange),
    /// Invalid LPI space of {0} ID bits
    InvalidIdBits(u32),
}

/// First-fit allocator over the LPI ID space.
///
/// The free list is kept sorted by base ID, and adjacent free ranges are always merged, so
/// that freeing everything that was allocated gives back the initial single range.
#[derive(Debug)]
pub struct LpiAllocator {
    space: LpiRange,
    free: Mutex<Vec<LpiRange>>,
}

impl LpiAllocator {
    /// Creates an allocator covering `[8192, 2^id_bits)`, or only the first `restricted`
    /// LPIs of that space when the hypervisor limits us.
    pub fn new(id_bits: u32, restricted: Option<u32>) -> Result<Self, LpiError> {
        if !(14..=32).contains(&id_bits) {
            return Err(LpiError::InvalidIdBits(id_bits));
        }
        let full = (1u64 << id_bits) - u64::from(LPI_BASE);
        // Values too small to be useful are ignored.
        let span = match restricted {
            Some(nr) if nr > 2 && u64::from(nr) <= full => {
                info!("ITS: Using hypervisor restricted LPI range [{nr}]");
                u64::from(nr)
            }
            _ => full,
        };
        // id_bits <= 32 so the span always fits.
        let space = LpiRange::new(LPI_BASE, u32::try_from(span).unwrap_or(u32::MAX));
        info!("ITS: Allocator initialized for {} LPIs", space.span);
        Ok(LpiAllocator {
            space,
            free: Mutex::new(vec![space]),
        })
    }

    /// The whole range managed by this allocator.
    pub fn space(&self) -> LpiRange {
        self.space
    }

    /// Allocates exactly `count` contiguous IDs from the first free range large enough.
    pub fn alloc_exact(&self, count: u32) -> Result<LpiRange, LpiError> {
        if count == 0 {
            return Err(LpiError::EmptyRequest);
        }
        let mut free = extract_guard(self.free.lock());
        Self::alloc_locked(&mut free, count).ok_or(LpiError::Exhausted(count))
    }

    /// Allocates up to `count` contiguous IDs, halving the request until it fits. The
    /// returned range may therefore be shorter than requested.
    pub fn allocate(&self, count: u32) -> Result<LpiRange, LpiError> {
        if count == 0 {
            return Err(LpiError::EmptyRequest);
        }
        let mut free = extract_guard(self.free.lock());
        let mut want = count;
        loop {
            if let Some(range) = Self::alloc_locked(&mut free, want) {
                debug!("ITS: LPI alloc of {count} IDs got [{}, {})", range.base_id, range.end());
                return Ok(range);
            }
            want /= 2;
            if want == 0 {
                return Err(LpiError::Exhausted(count));
            }
        }
    }

    fn alloc_locked(free: &mut Vec<LpiRange>, count: u32) -> Option<LpiRange> {
        let idx = free.iter().position(|range| range.span >= count)?;
        let range = &mut free[idx];
        let allocated = LpiRange::new(range.base_id, count);
        range.base_id += count;
        range.span -= count;
        if range.span == 0 {
            free.remove(idx);
        }
        Some(allocated)
    }

    /// Returns a range to the free list, merging it with its neighbours.
    pub fn free(&self, range: LpiRange) -> Result<(), LpiError> {
        if range.span == 0
            || range.base_id < self.space.base_id
            || range.end() > self.space.end()
        {
            return Err(LpiError::InvalidFree(range));
        }

        let mut free = extract_guard(self.free.lock());
        let idx = free.partition_point(|r| r.base_id < range.base_id);
        let prev_overlaps = idx > 0 && free[idx - 1].overlaps(&range);
        let next_overlaps = idx < free.len() && free[idx].overlaps(&range);
        if prev_overlaps || next_overlaps {
            return Err(LpiError::InvalidFree(range));
        }

        free.insert(idx, range);
        // Merge with the successor, then with the predecessor.
        if idx + 1 < free.len() && free[idx].end() == u64::from(free[idx + 1].base_id) {
            free[idx].span += free[idx + 1].span;
            free.remove(idx + 1);
        }
        if idx > 0 && free[idx - 1].end() == u64::from(free[idx].base_id) {
            free[idx - 1].span += free[idx].span;
            free.remove(idx);
        }
        Ok(())
    }

    /// Snapshot of the free list.
    pub fn free_ranges(&self) -> Vec<LpiRange> {
        extract_guard(self.free.lock()).clone()
    }

    /// Total number of free IDs.
    pub fn free_count(&self) -> u64 {
        extract_guard(self.free.lock())
            .iter()
            .map(|range| u64::from(range.span))
            .sum()
    }
}

/// The LPI configuration table: one property byte per LPI, read by the redistributors.
#[derive(Debug)]
pub struct PropTable {
    buf: DmaBuffer,
    nr_ids: u64,
    coherent: bool,
}

impl PropTable {
    /// Allocates a table for `id_bits` worth of INTIDs, with every LPI at the default
    /// priority, group 1 and disabled.
    pub fn new(memory: &Arc<dyn DmaMemory>, id_bits: u32, coherent: bool) -> Result<Self, DmaError> {
        let nr_ids = 1u64 << id_bits;
        // Indexed by INTID - 8192, sized for the full INTID space like GICR_PROPBASER expects.
        let size = align_up(crate::utils::u64_to_usize(nr_ids), SZ_64K);
        let buf = DmaBuffer::new(memory, size, SZ_64K)?;
        buf.fill(LPI_PROP_DEFAULT_PRIO | LPI_PROP_GROUP1);
        buf.flush();
        Ok(PropTable {
            buf,
            nr_ids,
            coherent,
        })
    }

    fn offset(&self, lpi: u32) -> Option<usize> {
        (lpi >= LPI_BASE && u64::from(lpi) < self.nr_ids).then(|| (lpi - LPI_BASE) as usize)
    }

    /// Physical address of the table.
    pub fn phys(&self) -> u64 {
        self.buf.phys()
    }

    /// Property byte of `lpi`, if it is covered by the table.
    pub fn get(&self, lpi: u32) -> Option<u8> {
        self.offset(lpi).map(|offset| self.buf.read_u8(offset))
    }

    /// Clears then sets bits of the property byte of `lpi` and makes the update visible to
    /// the redistributors. Returns the new value.
    pub fn update(&self, lpi: u32, clr: u8, set: u8) -> Option<u8> {
        let offset = self.offset(lpi)?;
        let val = (self.buf.read_u8(offset) & !clr) | set;
        self.buf.write_u8(offset, val);
        if self.coherent {
            self.buf.memory().store_barrier();
        } else {
            self.buf.flush_range(offset, 1);
        }
        Some(val)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::SimMemory;

    #[test]
    fn test_init() {
        let alloc = LpiAllocator::new(16, None).unwrap();
        assert_eq!(alloc.space(), LpiRange::new(8192, 65536 - 8192));
        assert_eq!(alloc.free_ranges(), vec![alloc.space()]);

        let alloc = LpiAllocator::new(16, Some(1024)).unwrap();
        assert_eq!(alloc.space(), LpiRange::new(8192, 1024));
        // Too small to be honoured.
        let alloc = LpiAllocator::new(16, Some(2)).unwrap();
        assert_eq!(alloc.space().span, 65536 - 8192);

        let alloc = LpiAllocator::new(32, None).unwrap();
        assert_eq!(alloc.space().end(), 1 << 32);

        assert_eq!(LpiAllocator::new(13, None).unwrap_err(), LpiError::InvalidIdBits(13));
    }

    #[test]
    fn test_first_fit_and_merge() {
        let alloc = LpiAllocator::new(14, None).unwrap();
        let a = alloc.alloc_exact(32).unwrap();
        let b = alloc.alloc_exact(32).unwrap();
        let c = alloc.alloc_exact(32).unwrap();
        assert_eq!(a.base_id, 8192);
        assert_eq!(b.base_id, 8224);
        assert_eq!(c.base_id, 8256);

        alloc.free(a).unwrap();
        alloc.free(c).unwrap();
        assert_eq!(
            alloc.free_ranges(),
            vec![LpiRange::new(8192, 32), LpiRange::new(8256, 16384 - 8256)]
        );
        // First fit reuses the hole left by `a`.
        let d = alloc.alloc_exact(16).unwrap();
        assert_eq!(d.base_id, 8192);
        alloc.free(d).unwrap();

        // Freeing the middle range merges both neighbours.
        alloc.free(b).unwrap();
        assert_eq!(alloc.free_ranges(), vec![alloc.space()]);
    }

    #[test]
    fn test_invalid_free() {
        let alloc = LpiAllocator::new(14, None).unwrap();
        let a = alloc.alloc_exact(8).unwrap();
        alloc.free(a).unwrap();
        // Double free.
        assert_eq!(alloc.free(a), Err(LpiError::InvalidFree(a)));
        // Outside of the LPI space.
        let outside = LpiRange::new(100, 4);
        assert_eq!(alloc.free(outside), Err(LpiError::InvalidFree(outside)));
        assert_eq!(alloc.free_ranges(), vec![alloc.space()]);
    }

    #[test]
    fn test_allocate_halves_request() {
        let alloc = LpiAllocator::new(14, Some(100)).unwrap();
        let big = alloc.allocate(64).unwrap();
        assert_eq!(big.span, 64);
        // 36 left: 64 -> 32.
        let partial = alloc.allocate(64).unwrap();
        assert_eq!(partial.span, 32);
        assert_eq!(alloc.alloc_exact(8), Err(LpiError::Exhausted(8)));
        let last = alloc.allocate(8).unwrap();
        assert_eq!(last.span, 4);
        assert_eq!(alloc.allocate(1), Err(LpiError::Exhausted(1)));
        assert_eq!(alloc.allocate(0), Err(LpiError::EmptyRequest));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(u32),
        Free(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..600).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_free_list_partitions_space(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let alloc = LpiAllocator::new(14, None).unwrap();
            let space = alloc.space();
            let mut live: Vec<LpiRange> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc(count) => {
                        if let Ok(range) = alloc.allocate(count) {
                            prop_assert!(range.span >= 1 && range.span <= count);
                            prop_assert!(live.iter().all(|r| !r.overlaps(&range)));
                            live.push(range);
                        }
                    }
                    Op::Free(idx) => {
                        if !live.is_empty() {
                            let range = live.swap_remove(idx % live.len());
                            alloc.free(range).unwrap();
                        }
                    }
                }

                // Free ranges are sorted, non-adjacent and together with the live ranges
                // cover the whole space exactly once.
                let free = alloc.free_ranges();
                for pair in free.windows(2) {
                    prop_assert!(pair[0].end() < u64::from(pair[1].base_id));
                }
                let mut all: Vec<LpiRange> = free.iter().chain(live.iter()).copied().collect();
                all.sort_by_key(|r| r.base_id);
                let mut cursor = u64::from(space.base_id);
                for range in &all {
                    prop_assert_eq!(u64::from(range.base_id), cursor);
                    cursor = range.end();
                }
                prop_assert_eq!(cursor, space.end());
            }

            for range in live.drain(..) {
                alloc.free(range).unwrap();
            }
            prop_assert_eq!(alloc.free_ranges(), vec![space]);
        }
    }

    #[test]
    fn test_prop_table() {
        let sim = Arc::new(SimMemory::new(false));
        let memory: Arc<dyn DmaMemory> = sim.clone();
        let table = PropTable::new(&memory, 16, false).unwrap();
        assert_eq!(table.phys() % 0x1_0000, 0);
        assert!(sim.is_clean(table.phys(), 0x1_0000));

        assert_eq!(table.get(8192), Some(0xa2));
        assert_eq!(table.get(65535), Some(0xa2));
        assert_eq!(table.get(8191), None);
        assert_eq!(table.get(65536), None);

        assert_eq!(table.update(8200, 0, LPI_PROP_ENABLED), Some(0xa3));
        assert_eq!(table.get(8200), Some(0xa3));
        // Non-coherent redistributors see the update right away.
        assert!(sim.is_clean(table.phys(), 0x1_0000));
        assert_eq!(table.update(8200, LPI_PROP_ENABLED, 0), Some(0xa2));
        assert_eq!(table.update(70000, 0, 1), None);
    }
}
