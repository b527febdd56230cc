// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::SimMemory;
use crate::cmd::{CommandBlock, ITS_CMD_SIZE, NO_DOORBELL, Opcode};
use crate::hw::ItsMmio;
use crate::hw::regs::*;
use crate::logger::extract_guard;
use crate::lpi::LPI_BASE;
use crate::utils::{SZ_4K, genmask, u64_to_usize, usize_to_u64};

const DTE_VALID: u64 = 1 << 63;

/// Shape of a simulated ITS.
#[derive(Debug, Clone)]
pub struct SimItsConfig {
    /// Base of the register frame.
    pub phys_base: u64,
    /// GITS_TYPER.Physical.
    pub physical_lpis: bool,
    /// GITS_TYPER.Virtual (GICv4).
    pub virtual_lpis: bool,
    /// GITS_TYPER.VMOVP.
    pub vmovp: bool,
    /// GITS_TYPER.PTA.
    pub pta: bool,
    /// Number of DeviceID bits.
    pub device_id_bits: u32,
    /// Number of EventID bits.
    pub event_id_bits: u32,
    /// Size of an ITT entry.
    pub itt_entry_size: usize,
    /// Page sizes accepted by GITS_BASER<n>.
    pub page_sizes: Vec<ItsPageSize>,
    /// Whether GITS_BASER<n>.Indirect sticks for device and VPE tables.
    pub indirect: bool,
    /// Whether shareability attributes stick.
    pub shareable: bool,
    /// Whether GITS_BASER<n>.Valid sticks.
    pub baser_valid_sticks: bool,
    /// Hardwired GITS_CTLR.ITS_Number, writable when `None`.
    pub its_number: Option<u8>,
    /// Whether the ITS is enabled when the driver finds it.
    pub enabled_at_reset: bool,
    /// Whether GITS_CTLR.Quiescent never sets.
    pub never_quiescent: bool,
}

impl Default for SimItsConfig {
    fn default() -> Self {
        SimItsConfig {
            phys_base: 0x0808_0000,
            physical_lpis: true,
            virtual_lpis: false,
            vmovp: false,
            pta: false,
            device_id_bits: 16,
            event_id_bits: 16,
            itt_entry_size: 8,
            page_sizes: vec![
                ItsPageSize::Size4K,
                ItsPageSize::Size16K,
                ItsPageSize::Size64K,
            ],
            indirect: true,
            shareable: true,
            baser_valid_sticks: true,
            its_number: None,
            enabled_at_reset: false,
            never_quiescent: false,
        }
    }
}

/// Translation of one event, as recorded by the simulated ITS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimIte {
    /// Physical LPI routed to a collection.
    Physical {
        /// LPI.
        lpi: u32,
        /// Collection ID.
        collection: u16,
    },
    /// Virtual LPI of a VPE.
    Virtual {
        /// VPE ID.
        vpe_id: u16,
        /// Virtual INTID.
        virt_id: u32,
        /// Doorbell LPI, `1023` for none.
        doorbell: u32,
    },
}

#[derive(Debug)]
struct SimDevice {
    itt: u64,
    nr_ites: u32,
    events: BTreeMap<u32, SimIte>,
}

#[derive(Debug)]
struct ItsState {
    ctlr: u64,
    cbaser: u64,
    cwriter: u64,
    creadr: u64,
    basers: [u64; GITS_BASER_NR_REGS],
    paused: bool,
    batch: Option<usize>,
    log: Vec<CommandBlock>,
    errors: Vec<String>,
    devices: BTreeMap<u32, SimDevice>,
    collections: BTreeMap<u16, u64>,
    vpes: BTreeMap<u16, u64>,
    pending: BTreeSet<u32>,
}

/// Simulated ITS: a register frame backed by a command interpreter.
///
/// Commands are executed when the driver reads GITS_CREADR, so a paused ITS looks like one
/// that stopped consuming its queue. Commands that the hardware would treat as errors are
/// recorded in [`SimIts::errors`].
#[derive(Debug)]
pub struct SimIts {
    config: SimItsConfig,
    memory: Arc<SimMemory>,
    state: Mutex<ItsState>,
}

impl SimIts {
    /// Creates an ITS in its reset state.
    pub fn new(config: SimItsConfig, memory: Arc<SimMemory>) -> Self {
        let table = |kind: BaserType| {
            (kind.encoding() << GITS_BASER_TYPE_SHIFT) | (7 << GITS_BASER_ENTRY_SIZE_SHIFT)
        };
        let mut basers = [0; GITS_BASER_NR_REGS];
        basers[0] = table(BaserType::Device);
        basers[1] = table(BaserType::Collection);
        if config.virtual_lpis {
            basers[2] = table(BaserType::Vcpu);
        }
        let mut ctlr = 0;
        if config.enabled_at_reset {
            ctlr |= GITS_CTLR_ENABLE;
        }
        if let Some(number) = config.its_number {
            ctlr |= u64::from(number) << GITS_CTLR_ITS_NUMBER_SHIFT;
        }

        SimIts {
            config,
            memory,
            state: Mutex::new(ItsState {
                ctlr,
                cbaser: 0,
                cwriter: 0,
                creadr: 0,
                basers,
                paused: false,
                batch: None,
                log: Vec::new(),
                errors: Vec::new(),
                devices: BTreeMap::new(),
                collections: BTreeMap::new(),
                vpes: BTreeMap::new(),
                pending: BTreeSet::new(),
            }),
        }
    }

    /// The GITS_TYPER value the ITS reports.
    pub fn typer(&self) -> Typer {
        let mut flags = TyperFlags::empty();
        flags.set(TyperFlags::PHYSICAL, self.config.physical_lpis);
        flags.set(TyperFlags::VIRTUAL, self.config.virtual_lpis);
        flags.set(TyperFlags::PTA, self.config.pta);
        flags.set(TyperFlags::VMOVP, self.config.vmovp);
        Typer::encode(
            flags,
            self.config.itt_entry_size,
            self.config.event_id_bits,
            self.config.device_id_bits,
        )
    }

    /// Stops consuming commands.
    pub fn pause(&self) {
        extract_guard(self.state.lock()).paused = true;
    }

    /// Consumes commands again.
    pub fn resume(&self) {
        extract_guard(self.state.lock()).paused = false;
    }

    /// Limits the number of commands consumed per GITS_CREADR read.
    pub fn set_batch(&self, batch: Option<usize>) {
        extract_guard(self.state.lock()).batch = batch;
    }

    /// Every command executed so far, in order.
    pub fn commands(&self) -> Vec<CommandBlock> {
        extract_guard(self.state.lock()).log.clone()
    }

    /// Executed commands with the given opcode.
    pub fn commands_with(&self, opcode: Opcode) -> Vec<CommandBlock> {
        extract_guard(self.state.lock())
            .log
            .iter()
            .filter(|cmd| cmd.opcode() == Some(opcode))
            .copied()
            .collect()
    }

    /// Forgets the executed commands.
    pub fn clear_commands(&self) {
        extract_guard(self.state.lock()).log.clear();
    }

    /// Command errors the ITS would have reported.
    pub fn errors(&self) -> Vec<String> {
        extract_guard(self.state.lock()).errors.clone()
    }

    /// Current GITS_CTLR.
    pub fn ctlr(&self) -> u64 {
        extract_guard(self.state.lock()).ctlr
    }

    /// Current GITS_CBASER.
    pub fn cbaser(&self) -> u64 {
        extract_guard(self.state.lock()).cbaser
    }

    /// Current GITS_BASER<index>.
    pub fn baser(&self, index: usize) -> u64 {
        extract_guard(self.state.lock()).basers[index]
    }

    /// Whether the device is mapped, with its ITT address and size.
    pub fn device(&self, device_id: u32) -> Option<(u64, u32)> {
        extract_guard(self.state.lock())
            .devices
            .get(&device_id)
            .map(|dev| (dev.itt, dev.nr_ites))
    }

    /// Translation of an event.
    pub fn ite(&self, device_id: u32, event_id: u32) -> Option<SimIte> {
        extract_guard(self.state.lock())
            .devices
            .get(&device_id)
            .and_then(|dev| dev.events.get(&event_id).copied())
    }

    /// Target of a mapped collection.
    pub fn collection_target(&self, col_id: u16) -> Option<u64> {
        extract_guard(self.state.lock())
            .collections
            .get(&col_id)
            .copied()
    }

    /// Target of a mapped VPE.
    pub fn vpe_target(&self, vpe_id: u16) -> Option<u64> {
        extract_guard(self.state.lock()).vpes.get(&vpe_id).copied()
    }

    /// Physical LPIs made pending by INT and not cleared since.
    pub fn pending_lpis(&self) -> Vec<u32> {
        extract_guard(self.state.lock())
            .pending
            .iter()
            .copied()
            .collect()
    }

    /// Device table entry of `device_id`, as stored in memory.
    pub fn dte(&self, device_id: u32) -> Option<u64> {
        let state = extract_guard(self.state.lock());
        self.table_entry(&state, BaserType::Device, device_id)
            .ok()
            .map(|addr| self.memory.hw_read_u64(addr))
    }

    // Address of the entry for `id` in the table of type `kind`.
    fn table_entry(&self, state: &ItsState, kind: BaserType, id: u32) -> Result<u64, String> {
        let val = state
            .basers
            .iter()
            .copied()
            .find(|val| BaserType::from_baser(*val) == kind && val & GITS_BASER_VALID != 0)
            .ok_or_else(|| format!("no valid {} table", kind.name()))?;
        let psz = ItsPageSize::from_baser(val).ok_or("bad page size")?;
        let base = psz.decode_phys(val);
        let esz = usize_to_u64(baser_entry_size(val));
        let size = usize_to_u64(baser_nr_pages(val) * psz.bytes());
        let id = u64::from(id);

        if val & GITS_BASER_INDIRECT == 0 {
            if (id + 1) * esz > size {
                return Err(format!("{} ID {id:#x} beyond the table", kind.name()));
            }
            return Ok(base + id * esz);
        }
        let per_page = usize_to_u64(psz.bytes()) / esz;
        let lvl1 = id / per_page;
        if (lvl1 + 1) * 8 > size {
            return Err(format!("{} ID {id:#x} beyond the level-1 table", kind.name()));
        }
        let entry = self.memory.hw_read_u64(base + lvl1 * 8);
        if entry & GITS_LVL1_ENTRY_VALID == 0 {
            return Err(format!("{} ID {id:#x} has no level-2 page", kind.name()));
        }
        Ok((entry & genmask(51, 0)) + (id % per_page) * esz)
    }

    fn write_entry(&self, state: &mut ItsState, kind: BaserType, id: u32, val: u64) {
        match self.table_entry(state, kind, id) {
            Ok(addr) => self.memory.hw_write_u64(addr, val),
            Err(err) => state.errors.push(err),
        }
    }

    fn check_event(state: &ItsState, block: &CommandBlock) -> Result<(), String> {
        let dev = state
            .devices
            .get(&block.device_id())
            .ok_or_else(|| format!("device {:#x} not mapped", block.device_id()))?;
        if block.event_id() >= dev.nr_ites {
            return Err(format!("event {} beyond the ITT", block.event_id()));
        }
        Ok(())
    }

    fn mapped_event(state: &ItsState, block: &CommandBlock) -> Result<SimIte, String> {
        Self::check_event(state, block)?;
        state
            .devices
            .get(&block.device_id())
            .and_then(|dev| dev.events.get(&block.event_id()).copied())
            .ok_or_else(|| {
                format!(
                    "event {} of device {:#x} not mapped",
                    block.event_id(),
                    block.device_id()
                )
            })
    }

    fn check_collection(state: &ItsState, col_id: u16) -> Result<(), String> {
        if state.collections.contains_key(&col_id) {
            Ok(())
        } else {
            Err(format!("collection {col_id} not mapped"))
        }
    }

    fn check_vpe(state: &ItsState, vpe_id: u16) -> Result<(), String> {
        if state.vpes.contains_key(&vpe_id) {
            Ok(())
        } else {
            Err(format!("VPE {vpe_id} not mapped"))
        }
    }

    fn set_ite(state: &mut ItsState, block: &CommandBlock, ite: Option<SimIte>) {
        if let Some(dev) = state.devices.get_mut(&block.device_id()) {
            match ite {
                Some(ite) => dev.events.insert(block.event_id(), ite),
                None => dev.events.remove(&block.event_id()),
            };
        }
    }

    fn execute(&self, state: &mut ItsState, block: CommandBlock) -> Result<(), String> {
        let opcode = block
            .opcode()
            .ok_or_else(|| format!("unknown opcode {:#x}", block.raw_opcode()))?;
        match opcode {
            Opcode::Mapd => {
                let device_id = block.device_id();
                if device_id >> self.config.device_id_bits != 0 {
                    return Err(format!("device {device_id:#x} beyond DeviceID bits"));
                }
                if block.valid() {
                    let nr_ites = 2u32 << block.size();
                    let itt = block.itt_addr();
                    self.write_entry(
                        state,
                        BaserType::Device,
                        device_id,
                        DTE_VALID | itt | u64::from(block.size()),
                    );
                    state.devices.insert(
                        device_id,
                        SimDevice {
                            itt,
                            nr_ites,
                            events: BTreeMap::new(),
                        },
                    );
                } else {
                    self.write_entry(state, BaserType::Device, device_id, 0);
                    state.devices.remove(&device_id);
                }
            }
            Opcode::Mapc => {
                let col_id = block.collection_id();
                if block.valid() {
                    self.write_entry(
                        state,
                        BaserType::Collection,
                        u32::from(col_id),
                        DTE_VALID | (block.target() >> 16),
                    );
                    state.collections.insert(col_id, block.target());
                } else {
                    self.write_entry(state, BaserType::Collection, u32::from(col_id), 0);
                    state.collections.remove(&col_id);
                }
            }
            Opcode::Mapti => {
                Self::check_event(state, &block)?;
                Self::check_collection(state, block.collection_id())?;
                if block.phys_id() < LPI_BASE {
                    return Err(format!("INTID {} is not an LPI", block.phys_id()));
                }
                let ite = SimIte::Physical {
                    lpi: block.phys_id(),
                    collection: block.collection_id(),
                };
                Self::set_ite(state, &block, Some(ite));
            }
            Opcode::Movi => {
                let SimIte::Physical { lpi, .. } = Self::mapped_event(state, &block)? else {
                    return Err("MOVI on a virtual event".to_string());
                };
                Self::check_collection(state, block.collection_id())?;
                let ite = SimIte::Physical {
                    lpi,
                    collection: block.collection_id(),
                };
                Self::set_ite(state, &block, Some(ite));
            }
            Opcode::Discard => {
                if let SimIte::Physical { lpi, .. } = Self::mapped_event(state, &block)? {
                    state.pending.remove(&lpi);
                }
                Self::set_ite(state, &block, None);
            }
            Opcode::Inv => {
                Self::mapped_event(state, &block)?;
            }
            Opcode::Int => {
                if let SimIte::Physical { lpi, .. } = Self::mapped_event(state, &block)? {
                    state.pending.insert(lpi);
                }
            }
            Opcode::Clear => {
                if let SimIte::Physical { lpi, .. } = Self::mapped_event(state, &block)? {
                    state.pending.remove(&lpi);
                }
            }
            Opcode::Invall => Self::check_collection(state, block.collection_id())?,
            Opcode::Sync => {
                if !state.collections.values().any(|target| *target == block.target()) {
                    return Err(format!("SYNC to unknown target {:#x}", block.target()));
                }
            }
            Opcode::Vmapp => {
                let vpe_id = block.vpe_id();
                if block.valid() {
                    self.write_entry(
                        state,
                        BaserType::Vcpu,
                        u32::from(vpe_id),
                        DTE_VALID | block.vpt_addr() | u64::from(block.vpt_size()),
                    );
                    state.vpes.insert(vpe_id, block.target());
                } else {
                    self.write_entry(state, BaserType::Vcpu, u32::from(vpe_id), 0);
                    state.vpes.remove(&vpe_id);
                }
            }
            Opcode::Vmapti => {
                Self::check_event(state, &block)?;
                Self::check_vpe(state, block.vpe_id())?;
                let doorbell = block.db_phys_id();
                if doorbell != NO_DOORBELL && doorbell < LPI_BASE {
                    return Err(format!("doorbell {doorbell} is not an LPI"));
                }
                let ite = SimIte::Virtual {
                    vpe_id: block.vpe_id(),
                    virt_id: block.virt_id(),
                    doorbell,
                };
                Self::set_ite(state, &block, Some(ite));
            }
            Opcode::Vmovi => {
                let SimIte::Virtual { virt_id, .. } = Self::mapped_event(state, &block)? else {
                    return Err("VMOVI on a physical event".to_string());
                };
                Self::check_vpe(state, block.vpe_id())?;
                let doorbell = if block.db_valid() {
                    block.db_phys_id()
                } else {
                    NO_DOORBELL
                };
                let ite = SimIte::Virtual {
                    vpe_id: block.vpe_id(),
                    virt_id,
                    doorbell,
                };
                Self::set_ite(state, &block, Some(ite));
            }
            Opcode::Vmovp => {
                Self::check_vpe(state, block.vpe_id())?;
                state.vpes.insert(block.vpe_id(), block.target());
            }
            Opcode::Vsync | Opcode::Vinvall => Self::check_vpe(state, block.vpe_id())?,
        }
        Ok(())
    }

    fn process(&self, state: &mut ItsState) {
        if state.paused || state.cbaser & GITS_CBASER_VALID == 0 {
            return;
        }
        let base = state.cbaser & GITS_CBASER_PA_MASK;
        let size = ((state.cbaser & GITS_CBASER_SIZE_MASK) + 1) * usize_to_u64(SZ_4K);
        let mut budget = state.batch.unwrap_or(usize::MAX);

        while state.creadr != state.cwriter && budget > 0 {
            let addr = base + state.creadr;
            let mut block = CommandBlock::default();
            for (idx, dw) in block.0.iter_mut().enumerate() {
                *dw = self.memory.hw_read_u64(addr + usize_to_u64(idx * 8));
            }
            state.log.push(block);
            if let Err(err) = self.execute(state, block) {
                state.errors.push(err);
            }
            state.creadr = (state.creadr + usize_to_u64(ITS_CMD_SIZE)) % size;
            budget -= 1;
        }
    }

    fn write_baser(&self, state: &mut ItsState, index: usize, val: u64) {
        let current = state.basers[index];
        let kind = BaserType::from_baser(current);
        if kind == BaserType::None {
            return;
        }
        let read_only = (7 << GITS_BASER_TYPE_SHIFT) | (0x1f << GITS_BASER_ENTRY_SIZE_SHIFT);
        let mut val = (val & !read_only) | (current & read_only);

        let requested = ItsPageSize::from_baser(val).unwrap_or(ItsPageSize::Size64K);
        if !self.config.page_sizes.contains(&requested) {
            let fallback = self
                .config
                .page_sizes
                .iter()
                .copied()
                .filter(|size| *size <= requested)
                .max()
                .or_else(|| self.config.page_sizes.iter().copied().min())
                .unwrap_or(ItsPageSize::Size4K);
            val = (val & !GITS_BASER_PAGE_SIZE_MASK) | fallback.encoding();
        }
        if !self.config.indirect || kind == BaserType::Collection {
            val &= !GITS_BASER_INDIRECT;
        }
        if !self.config.shareable {
            val &= !GITS_BASER_SHAREABILITY_MASK;
        }
        if !self.config.baser_valid_sticks {
            val &= !GITS_BASER_VALID;
        }
        state.basers[index] = val;
    }
}

impl ItsMmio for SimIts {
    fn phys_base(&self) -> u64 {
        self.config.phys_base
    }

    fn read(&self, offset: u32) -> u64 {
        let mut state = extract_guard(self.state.lock());
        match offset {
            GITS_CTLR => {
                let mut ctlr = state.ctlr;
                if ctlr & GITS_CTLR_ENABLE == 0 && !self.config.never_quiescent {
                    ctlr |= GITS_CTLR_QUIESCENT;
                }
                ctlr
            }
            GITS_IIDR => 0x43b,
            GITS_TYPER => self.typer().0,
            GITS_CBASER => state.cbaser,
            GITS_CWRITER => state.cwriter,
            GITS_CREADR => {
                self.process(&mut state);
                state.creadr
            }
            offset if (GITS_BASER..gits_baser(GITS_BASER_NR_REGS)).contains(&offset) => {
                state.basers[((offset - GITS_BASER) / 8) as usize]
            }
            _ => 0,
        }
    }

    fn write(&self, offset: u32, val: u64) {
        let mut state = extract_guard(self.state.lock());
        match offset {
            GITS_CTLR => {
                let mut ctlr = val & (GITS_CTLR_ENABLE | GITS_CTLR_IMDE | GITS_CTLR_ITS_NUMBER);
                if let Some(number) = self.config.its_number {
                    ctlr = (ctlr & !GITS_CTLR_ITS_NUMBER)
                        | (u64::from(number) << GITS_CTLR_ITS_NUMBER_SHIFT);
                }
                state.ctlr = ctlr;
            }
            GITS_CBASER => {
                let mut val = val;
                if !self.config.shareable {
                    val &= !GITS_CBASER_SHAREABILITY_MASK;
                }
                state.cbaser = val;
                state.creadr = 0;
            }
            GITS_CWRITER => {
                let size = ((state.cbaser & GITS_CBASER_SIZE_MASK) + 1) * usize_to_u64(SZ_4K);
                let cwriter = val & GITS_CMDQ_OFFSET_MASK;
                if cwriter >= size {
                    state.errors.push(format!("CWRITER {cwriter:#x} beyond the queue"));
                    return;
                }
                state.cwriter = cwriter;
            }
            offset if (GITS_BASER..gits_baser(GITS_BASER_NR_REGS)).contains(&offset) => {
                self.write_baser(&mut state, u64_to_usize(u64::from(offset - GITS_BASER) / 8), val)
            }
            _ => {}
        }
    }
}
