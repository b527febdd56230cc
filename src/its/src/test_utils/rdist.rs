// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Mutex;

use crate::hw::Redistributors;
use crate::hw::regs::*;
use crate::logger::extract_guard;

/// RD_base of CPU0's redistributor.
pub const SIM_RDIST_BASE: u64 = 0x080a_0000;
/// Distance between two redistributors (four 64K frames, GICv4).
pub const SIM_RDIST_STRIDE: u64 = 0x4_0000;

/// Direct LPI register write observed by a redistributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectLpiOp {
    /// GICR_SETLPIR.
    Set {
        /// CPU of the redistributor.
        cpu: usize,
        /// LPI.
        lpi: u32,
    },
    /// GICR_CLRLPIR.
    Clear {
        /// CPU of the redistributor.
        cpu: usize,
        /// LPI.
        lpi: u32,
    },
    /// GICR_INVLPIR.
    Inv {
        /// CPU of the redistributor.
        cpu: usize,
        /// LPI.
        lpi: u32,
    },
}

#[derive(Debug)]
struct RdistState {
    online: Vec<bool>,
    ops: Vec<DirectLpiOp>,
    vpropbaser: Vec<u64>,
    vpendbaser: Vec<u64>,
    // Remaining reads of GICR_VPENDBASER that report Dirty.
    dirty_polls: Vec<u32>,
    pending_last: Vec<bool>,
    dirty_latency: u32,
}

/// Simulated redistributors, one per CPU.
#[derive(Debug)]
pub struct SimRedistributors {
    nr_cpus: usize,
    direct_lpi: bool,
    coherent: bool,
    state: Mutex<RdistState>,
}

impl SimRedistributors {
    /// Creates `nr_cpus` redistributors, all online.
    pub fn new(nr_cpus: usize, direct_lpi: bool, coherent: bool) -> Self {
        SimRedistributors {
            nr_cpus,
            direct_lpi,
            coherent,
            state: Mutex::new(RdistState {
                online: vec![true; nr_cpus],
                ops: Vec::new(),
                vpropbaser: vec![0; nr_cpus],
                vpendbaser: vec![0; nr_cpus],
                dirty_polls: vec![0; nr_cpus],
                pending_last: vec![false; nr_cpus],
                dirty_latency: 2,
            }),
        }
    }

    /// Marks `cpu` online or offline.
    pub fn set_online(&self, cpu: usize, online: bool) {
        extract_guard(self.state.lock()).online[cpu] = online;
    }

    /// Direct LPI register writes, in order.
    pub fn ops(&self) -> Vec<DirectLpiOp> {
        extract_guard(self.state.lock()).ops.clone()
    }

    /// Forgets the recorded direct LPI writes.
    pub fn clear_ops(&self) {
        extract_guard(self.state.lock()).ops.clear();
    }

    /// Number of GICR_VPENDBASER reads that report Dirty after a VPE is descheduled.
    /// `u32::MAX` keeps Dirty set forever.
    pub fn set_dirty_latency(&self, polls: u32) {
        extract_guard(self.state.lock()).dirty_latency = polls;
    }

    /// Whether the next VPE descheduled from `cpu` has interrupts pending.
    pub fn set_pending_last(&self, cpu: usize, pending: bool) {
        extract_guard(self.state.lock()).pending_last[cpu] = pending;
    }

    /// Current GICR_VPROPBASER of `cpu`.
    pub fn vpropbaser(&self, cpu: usize) -> u64 {
        extract_guard(self.state.lock()).vpropbaser[cpu]
    }

    /// Current GICR_VPENDBASER of `cpu`, without side effects.
    pub fn vpendbaser(&self, cpu: usize) -> u64 {
        extract_guard(self.state.lock()).vpendbaser[cpu]
    }
}

impl Redistributors for SimRedistributors {
    fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn is_online(&self, cpu: usize) -> bool {
        extract_guard(self.state.lock())
            .online
            .get(cpu)
            .copied()
            .unwrap_or(false)
    }

    fn phys_base(&self, cpu: usize) -> u64 {
        SIM_RDIST_BASE + cpu as u64 * SIM_RDIST_STRIDE
    }

    fn processor_number(&self, cpu: usize) -> u16 {
        cpu as u16
    }

    fn has_direct_lpi(&self) -> bool {
        self.direct_lpi
    }

    fn is_coherent(&self) -> bool {
        self.coherent
    }

    fn read(&self, cpu: usize, offset: u32) -> u64 {
        let mut state = extract_guard(self.state.lock());
        match offset {
            GICR_VPROPBASER => state.vpropbaser[cpu],
            GICR_VPENDBASER => {
                let mut val = state.vpendbaser[cpu];
                let polls = state.dirty_polls[cpu];
                if polls > 0 {
                    if polls != u32::MAX {
                        state.dirty_polls[cpu] = polls - 1;
                    }
                    val |= GICR_VPENDBASER_DIRTY;
                }
                val
            }
            _ => 0,
        }
    }

    fn write(&self, cpu: usize, offset: u32, val: u64) {
        let mut state = extract_guard(self.state.lock());
        // The LPI is held in the low 32 bits.
        let lpi = val as u32;
        match offset {
            GICR_SETLPIR => state.ops.push(DirectLpiOp::Set { cpu, lpi }),
            GICR_CLRLPIR => state.ops.push(DirectLpiOp::Clear { cpu, lpi }),
            GICR_INVLPIR => state.ops.push(DirectLpiOp::Inv { cpu, lpi }),
            GICR_VPROPBASER => state.vpropbaser[cpu] = val,
            GICR_VPENDBASER => {
                let was_valid = state.vpendbaser[cpu] & GICR_VPENDBASER_VALID != 0;
                let mut val = val & !(GICR_VPENDBASER_DIRTY | GICR_VPENDBASER_PENDING_LAST);
                if was_valid && val & GICR_VPENDBASER_VALID == 0 {
                    state.dirty_polls[cpu] = state.dirty_latency;
                    if state.pending_last[cpu] {
                        val |= GICR_VPENDBASER_PENDING_LAST;
                    }
                }
                state.vpendbaser[cpu] = val;
            }
            _ => {}
        }
    }
}
