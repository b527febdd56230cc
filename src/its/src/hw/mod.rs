// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Hardware seams of the driver.
//!
//! Everything the ITS core touches outside of its own memory goes through one of three
//! traits: [`ItsMmio`] for the register frame of a controller, [`DmaMemory`] for memory
//! shared with the GIC, and [`Redistributors`] for the per-CPU redistributor frames.

pub mod regs;

use std::fmt::Debug;
use std::sync::Arc;

use crate::utils::{Backoff, Timeout, usize_to_u64};

/// Errors associated with memory shared with the GIC.
#[derive(Debug, Clone, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum DmaError {
    /// Cannot allocate {size:#x} bytes aligned to {align:#x}
    OutOfMemory {
        /// Requested size.
        size: usize,
        /// Requested alignment.
        align: usize,
    },
    /// Invalid DMA allocation request: size {size:#x}, alignment {align:#x}
    InvalidRequest {
        /// Requested size.
        size: usize,
        /// Requested alignment.
        align: usize,
    },
}

/// Register frame of one ITS.
pub trait ItsMmio: Debug + Send + Sync {
    /// Physical address of the frame, used to build MSI doorbell addresses.
    fn phys_base(&self) -> u64;
    /// Reads a register. 32-bit registers are returned zero-extended.
    fn read(&self, offset: u32) -> u64;
    /// Writes a register.
    fn write(&self, offset: u32, val: u64);
}

/// Physically contiguous memory shared with the GIC.
///
/// Freshly allocated memory has unspecified contents. On a non-coherent system, CPU writes
/// only become visible to the GIC after [`DmaMemory::flush_to_poc`].
pub trait DmaMemory: Debug + Send + Sync {
    /// Allocates `size` bytes aligned to `align` (a power of two) and returns the physical
    /// address.
    fn alloc(&self, size: usize, align: usize) -> Result<u64, DmaError>;
    /// Releases an allocation made by [`DmaMemory::alloc`].
    fn free(&self, phys: u64, size: usize);
    /// Reads a little-endian u64.
    fn read_u64(&self, phys: u64) -> u64;
    /// Writes a little-endian u64.
    fn write_u64(&self, phys: u64, val: u64);
    /// Reads a byte.
    fn read_u8(&self, phys: u64) -> u8;
    /// Writes a byte.
    fn write_u8(&self, phys: u64, val: u8);
    /// Sets `len` bytes starting at `phys` to `val`.
    fn fill(&self, phys: u64, len: usize, val: u8);
    /// Cleans the data cache for the range to the point of coherency.
    fn flush_to_poc(&self, phys: u64, len: usize);
    /// Orders prior stores before subsequent stores and MMIO writes (`dsb ishst`).
    fn store_barrier(&self);
    /// Full system barrier (`dsb sy`).
    fn full_barrier(&self);
}

/// Per-CPU redistributors.
pub trait Redistributors: Debug + Send + Sync {
    /// Number of CPUs (and redistributors) in the system.
    fn nr_cpus(&self) -> usize;
    /// Whether `cpu` is online.
    fn is_online(&self, cpu: usize) -> bool;
    /// Physical address of the RD_base frame of `cpu`.
    fn phys_base(&self, cpu: usize) -> u64;
    /// GICR_TYPER.Processor_Number of `cpu`.
    fn processor_number(&self, cpu: usize) -> u16;
    /// Whether the redistributors implement GICR_{SET,CLR,INV}LPIR.
    fn has_direct_lpi(&self) -> bool;
    /// Whether the redistributors access LPI tables coherently.
    fn is_coherent(&self) -> bool {
        true
    }
    /// Reads a register of the redistributor of `cpu`.
    fn read(&self, cpu: usize, offset: u32) -> u64;
    /// Writes a register of the redistributor of `cpu`.
    fn write(&self, cpu: usize, offset: u32, val: u64);
}

/// Waits for GICR_SYNCR of `cpu` to report that direct LPI writes have completed.
pub fn wait_for_syncr(rdists: &dyn Redistributors, cpu: usize, backoff: &Backoff) -> Result<(), Timeout> {
    backoff.retry(|| (rdists.read(cpu, regs::GICR_SYNCR) & regs::GICR_SYNCR_BUSY == 0).then_some(()))
}

/// A DMA allocation released when dropped.
#[derive(Debug)]
pub struct DmaBuffer {
    memory: Arc<dyn DmaMemory>,
    phys: u64,
    size: usize,
}

impl DmaBuffer {
    /// Allocates a buffer with unspecified contents.
    pub fn new(memory: &Arc<dyn DmaMemory>, size: usize, align: usize) -> Result<Self, DmaError> {
        if size == 0 || !align.is_power_of_two() {
            return Err(DmaError::InvalidRequest { size, align });
        }
        let phys = memory.alloc(size, align)?;
        Ok(DmaBuffer {
            memory: memory.clone(),
            phys,
            size,
        })
    }

    /// Allocates a buffer and clears it.
    pub fn zeroed(memory: &Arc<dyn DmaMemory>, size: usize, align: usize) -> Result<Self, DmaError> {
        let buf = Self::new(memory, size, align)?;
        buf.zero();
        Ok(buf)
    }

    /// Physical address of the first byte.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    fn addr(&self, offset: usize, len: usize) -> u64 {
        debug_assert!(offset + len <= self.size, "DMA access out of bounds");
        self.phys + usize_to_u64(offset)
    }

    /// Reads the u64 at `offset`.
    pub fn read_u64(&self, offset: usize) -> u64 {
        self.memory.read_u64(self.addr(offset, 8))
    }

    /// Writes the u64 at `offset`.
    pub fn write_u64(&self, offset: usize, val: u64) {
        self.memory.write_u64(self.addr(offset, 8), val)
    }

    /// Reads the byte at `offset`.
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.memory.read_u8(self.addr(offset, 1))
    }

    /// Writes the byte at `offset`.
    pub fn write_u8(&self, offset: usize, val: u8) {
        self.memory.write_u8(self.addr(offset, 1), val)
    }

    /// Sets the whole buffer to `val`.
    pub fn fill(&self, val: u8) {
        self.memory.fill(self.phys, self.size, val)
    }

    /// Clears the whole buffer.
    pub fn zero(&self) {
        self.fill(0)
    }

    /// Cleans the whole buffer to the point of coherency.
    pub fn flush(&self) {
        self.memory.flush_to_poc(self.phys, self.size)
    }

    /// Cleans `len` bytes at `offset` to the point of coherency.
    pub fn flush_range(&self, offset: usize, len: usize) {
        self.memory.flush_to_poc(self.addr(offset, len), len)
    }

    /// Backing memory.
    pub fn memory(&self) -> &Arc<dyn DmaMemory> {
        &self.memory
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.memory.free(self.phys, self.size);
    }
}
