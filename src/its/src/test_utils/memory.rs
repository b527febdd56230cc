// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use vm_allocator::{AddressAllocator, AllocPolicy, RangeInclusive};

use crate::hw::{DmaError, DmaMemory};
use crate::logger::extract_guard;
use crate::utils::{genmask, u64_to_usize, usize_to_u64};

/// Start of the simulated physical memory.
pub const SIM_DRAM_BASE: u64 = 0x8000_0000;
/// Size of the simulated physical address space.
pub const SIM_DRAM_SIZE: u64 = 1 << 36;
/// Byte pattern of freshly allocated memory.
pub const SIM_POISON: u8 = 0x5a;

const CACHE_LINE: u64 = 64;
const LVL1_VALID: u64 = 1 << 63;

/// Snapshot of a level-2 page taken when a level-1 entry pointing at it became valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishRecord {
    /// Address of the level-1 entry.
    pub entry: u64,
    /// Address of the level-2 page.
    pub target: u64,
    /// Whether the page only held zeroes.
    pub zeroed: bool,
    /// Whether no byte of the page was still sitting in a CPU cache.
    pub clean: bool,
}

#[derive(Debug)]
struct PublishWatch {
    base: u64,
    size: u64,
    target_size: usize,
}

#[derive(Debug)]
struct Region {
    range: RangeInclusive,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MemoryState {
    allocator: AddressAllocator,
    regions: BTreeMap<u64, Region>,
    // Cache lines written by the CPU and not cleaned yet. Only tracked when non-coherent.
    dirty: BTreeSet<u64>,
    watches: Vec<PublishWatch>,
    publishes: Vec<PublishRecord>,
    stale_reads: Vec<u64>,
    alloc_budget: Option<usize>,
}

impl MemoryState {
    fn bytes(&self, phys: u64, len: usize) -> &[u8] {
        let (base, region) = self
            .regions
            .range(..=phys)
            .next_back()
            .unwrap_or_else(|| panic!("access to unallocated memory at {phys:#x}"));
        let offset = u64_to_usize(phys - base);
        assert!(
            offset + len <= region.data.len(),
            "access at {phys:#x} overflows its allocation"
        );
        &region.data[offset..offset + len]
    }

    fn bytes_mut(&mut self, phys: u64, len: usize) -> &mut [u8] {
        let (base, region) = self
            .regions
            .range_mut(..=phys)
            .next_back()
            .unwrap_or_else(|| panic!("access to unallocated memory at {phys:#x}"));
        let offset = u64_to_usize(phys - base);
        assert!(
            offset + len <= region.data.len(),
            "access at {phys:#x} overflows its allocation"
        );
        &mut region.data[offset..offset + len]
    }

    fn lines(phys: u64, len: usize) -> impl Iterator<Item = u64> {
        let first = phys & !(CACHE_LINE - 1);
        let end = phys + usize_to_u64(len);
        (first..end).step_by(CACHE_LINE as usize)
    }

    fn is_clean(&self, phys: u64, len: usize) -> bool {
        let first = phys & !(CACHE_LINE - 1);
        self.dirty
            .range(first..phys + usize_to_u64(len))
            .next()
            .is_none()
    }

    fn is_zeroed(&self, phys: u64, len: usize) -> bool {
        self.bytes(phys, len).iter().all(|byte| *byte == 0)
    }
}

/// Simulated physical memory shared between the CPU and the GIC.
///
/// When built non-coherent, every CPU store leaves its cache line dirty until it is cleaned
/// with [`DmaMemory::flush_to_poc`]; hardware reads of dirty lines are recorded as stale.
#[derive(Debug)]
pub struct SimMemory {
    coherent: bool,
    state: Mutex<MemoryState>,
}

impl SimMemory {
    /// Creates an empty memory.
    pub fn new(coherent: bool) -> Self {
        SimMemory {
            coherent,
            state: Mutex::new(MemoryState {
                allocator: AddressAllocator::new(SIM_DRAM_BASE, SIM_DRAM_SIZE).unwrap(),
                regions: BTreeMap::new(),
                dirty: BTreeSet::new(),
                watches: Vec::new(),
                publishes: Vec::new(),
                stale_reads: Vec::new(),
                alloc_budget: None,
            }),
        }
    }

    /// Whether the GIC snoops the CPU caches.
    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    /// Number of bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        extract_guard(self.state.lock())
            .regions
            .values()
            .map(|region| region.data.len())
            .sum()
    }

    /// Number of live allocations.
    pub fn allocations(&self) -> usize {
        extract_guard(self.state.lock()).regions.len()
    }

    /// Makes every allocation after the next `count` ones fail.
    pub fn fail_allocations_after(&self, count: usize) {
        extract_guard(self.state.lock()).alloc_budget = Some(count);
    }

    /// Whether no CPU store to the range is still waiting to be cleaned.
    pub fn is_clean(&self, phys: u64, len: usize) -> bool {
        extract_guard(self.state.lock()).is_clean(phys, len)
    }

    /// Whether the range only holds zeroes.
    pub fn is_zeroed(&self, phys: u64, len: usize) -> bool {
        extract_guard(self.state.lock()).is_zeroed(phys, len)
    }

    /// Addresses the hardware read while the CPU still had them dirty in its cache.
    pub fn stale_reads(&self) -> Vec<u64> {
        extract_guard(self.state.lock()).stale_reads.clone()
    }

    /// Records the state of the `target_size` bytes pointed at whenever a valid entry is
    /// written into the level-1 table at `base`.
    pub fn watch_publish(&self, base: u64, size: usize, target_size: usize) {
        extract_guard(self.state.lock()).watches.push(PublishWatch {
            base,
            size: usize_to_u64(size),
            target_size,
        });
    }

    /// Records taken by [`SimMemory::watch_publish`] watches.
    pub fn publish_records(&self) -> Vec<PublishRecord> {
        extract_guard(self.state.lock()).publishes.clone()
    }

    /// Read performed by the hardware.
    pub fn hw_read_u64(&self, phys: u64) -> u64 {
        let mut state = extract_guard(self.state.lock());
        if !state.is_clean(phys, 8) {
            state.stale_reads.push(phys);
        }
        u64::from_le_bytes(state.bytes(phys, 8).try_into().unwrap())
    }

    /// Write performed by the hardware. It never goes through the CPU caches.
    pub fn hw_write_u64(&self, phys: u64, val: u64) {
        let mut state = extract_guard(self.state.lock());
        state.bytes_mut(phys, 8).copy_from_slice(&val.to_le_bytes());
    }

    fn cpu_store(&self, state: &mut MemoryState, phys: u64, len: usize) {
        if !self.coherent {
            state.dirty.extend(MemoryState::lines(phys, len));
        }
    }
}

impl DmaMemory for SimMemory {
    fn alloc(&self, size: usize, align: usize) -> Result<u64, DmaError> {
        let mut state = extract_guard(self.state.lock());
        if let Some(budget) = state.alloc_budget.as_mut() {
            if *budget == 0 {
                return Err(DmaError::OutOfMemory { size, align });
            }
            *budget -= 1;
        }
        let range = state
            .allocator
            .allocate(
                usize_to_u64(size),
                usize_to_u64(align),
                AllocPolicy::FirstMatch,
            )
            .map_err(|_| DmaError::OutOfMemory { size, align })?;
        let phys = range.start();
        state.regions.insert(
            phys,
            Region {
                range,
                data: vec![SIM_POISON; size],
            },
        );
        Ok(phys)
    }

    fn free(&self, phys: u64, size: usize) {
        let mut state = extract_guard(self.state.lock());
        let region = state
            .regions
            .remove(&phys)
            .unwrap_or_else(|| panic!("free of unallocated memory at {phys:#x}"));
        assert_eq!(region.data.len(), size, "free size mismatch at {phys:#x}");
        state.allocator.free(&region.range).unwrap();
        let stale: Vec<u64> = state
            .dirty
            .range(phys..phys + usize_to_u64(size))
            .copied()
            .collect();
        for line in stale {
            state.dirty.remove(&line);
        }
    }

    fn read_u64(&self, phys: u64) -> u64 {
        let state = extract_guard(self.state.lock());
        u64::from_le_bytes(state.bytes(phys, 8).try_into().unwrap())
    }

    fn write_u64(&self, phys: u64, val: u64) {
        let mut state = extract_guard(self.state.lock());
        state.bytes_mut(phys, 8).copy_from_slice(&val.to_le_bytes());
        self.cpu_store(&mut state, phys, 8);

        if val & LVL1_VALID == 0 {
            return;
        }
        let watch = state
            .watches
            .iter()
            .find(|watch| phys >= watch.base && phys < watch.base + watch.size)
            .map(|watch| watch.target_size);
        if let Some(target_size) = watch {
            let target = val & genmask(51, 0);
            let record = PublishRecord {
                entry: phys,
                target,
                zeroed: state.is_zeroed(target, target_size),
                clean: state.is_clean(target, target_size),
            };
            state.publishes.push(record);
        }
    }

    fn read_u8(&self, phys: u64) -> u8 {
        extract_guard(self.state.lock()).bytes(phys, 1)[0]
    }

    fn write_u8(&self, phys: u64, val: u8) {
        let mut state = extract_guard(self.state.lock());
        state.bytes_mut(phys, 1)[0] = val;
        self.cpu_store(&mut state, phys, 1);
    }

    fn fill(&self, phys: u64, len: usize, val: u8) {
        let mut state = extract_guard(self.state.lock());
        state.bytes_mut(phys, len).fill(val);
        self.cpu_store(&mut state, phys, len);
    }

    fn flush_to_poc(&self, phys: u64, len: usize) {
        let mut state = extract_guard(self.state.lock());
        for line in MemoryState::lines(phys, len) {
            state.dirty.remove(&line);
        }
    }

    fn store_barrier(&self) {}

    fn full_barrier(&self) {}
}
