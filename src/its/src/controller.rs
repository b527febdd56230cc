// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::ItsError;
use crate::cmd::CommandQueue;
use crate::collection::CollectionManager;
use crate::config::ItsConfig;
use crate::device::DeviceRegistry;
use crate::hw::regs::*;
use crate::hw::{DmaMemory, ItsMmio, Redistributors};
use crate::logger::{ItsMetrics, info, warn};
use crate::lpi::LpiAllocator;
use crate::tables::TableManager;
use crate::utils::{Backoff, Timeout};

/// Errors associated with bringing up an ITS.
#[derive(Debug, Clone, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ProbeError {
    /// The ITS does not support physical LPIs
    NoPhysicalLpis,
    /// The ITS did not become quiescent: {0}
    NotQuiescent(Timeout),
    /// No ITS number left for the ITS list
    ItsListFull,
    /// ITS number {0} is already used by another ITS
    DuplicateItsNumber(u8),
}

/// One ITS instance, with its command queue, tables, collections and devices.
#[derive(Debug)]
pub struct ItsController {
    index: usize,
    mmio: Arc<dyn ItsMmio>,
    typer: Typer,
    list_nr: Option<u8>,
    metrics: Arc<ItsMetrics>,
    queue: Arc<CommandQueue>,
    tables: Arc<TableManager>,
    collections: Arc<CollectionManager>,
    devices: DeviceRegistry,
}

impl ItsController {
    /// Brings up the ITS behind `mmio` and enables it.
    ///
    /// `its_list_map` holds the ITS numbers already taken by other controllers. GICv4
    /// controllers that need an ITS list for VMOVP get the next free number.
    pub fn probe(
        index: usize,
        mmio: Arc<dyn ItsMmio>,
        memory: Arc<dyn DmaMemory>,
        rdists: Arc<dyn Redistributors>,
        lpis: Arc<LpiAllocator>,
        config: &ItsConfig,
        its_list_map: &mut u16,
    ) -> Result<Self, ItsError> {
        let base = mmio.phys_base();
        let typer = Typer(mmio.read(GITS_TYPER));
        if !typer.flags().contains(TyperFlags::PHYSICAL) {
            return Err(ProbeError::NoPhysicalLpis.into());
        }
        let backoff = config.backoff();
        force_quiescent(mmio.as_ref(), &backoff)?;

        let list_nr = if typer.is_v4() && !typer.flags().contains(TyperFlags::VMOVP) {
            Some(assign_its_number(mmio.as_ref(), its_list_map)?)
        } else {
            None
        };

        let metrics = Arc::new(ItsMetrics::new());
        let mut tables = TableManager::new(mmio.clone(), memory.clone(), metrics.clone());
        tables.setup_all(&typer, config.vpe_id_bits)?;
        let tables = Arc::new(tables);

        let queue = Arc::new(CommandQueue::new(
            mmio.clone(),
            &memory,
            config.cmd_queue_size,
            backoff,
            metrics.clone(),
        )?);
        let collections = Arc::new(CollectionManager::new(
            rdists,
            typer.flags().contains(TyperFlags::PTA),
        ));
        let devices = DeviceRegistry::new(
            typer,
            queue.clone(),
            tables.clone(),
            collections.clone(),
            lpis,
            memory,
            metrics.clone(),
        );

        let mut ctlr = mmio.read(GITS_CTLR) | GITS_CTLR_ENABLE;
        if typer.is_v4() {
            ctlr |= GITS_CTLR_IMDE;
        }
        mmio.write(GITS_CTLR, ctlr);

        info!(
            "ITS@{base:#x}: {} LPIs, {} DeviceID bits, {} EventID bits{}",
            if typer.is_v4() { "Virtual" } else { "Physical" },
            typer.device_id_bits(),
            typer.event_id_bits(),
            list_nr.map_or(String::new(), |nr| format!(", ITS number {nr}"))
        );
        Ok(ItsController {
            index,
            mmio,
            typer,
            list_nr,
            metrics,
            queue,
            tables,
            collections,
            devices,
        })
    }

    /// Position of the controller in the runtime.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Physical address of the register frame.
    pub fn phys_base(&self) -> u64 {
        self.mmio.phys_base()
    }

    /// Capabilities read from GITS_TYPER.
    pub fn typer(&self) -> Typer {
        self.typer
    }

    /// Whether the controller supports virtual LPIs.
    pub fn is_v4(&self) -> bool {
        self.typer.is_v4()
    }

    /// ITS number used in VMOVP ITS lists, when the controller needs one.
    pub fn list_nr(&self) -> Option<u8> {
        self.list_nr
    }

    /// Address devices write their MSIs to.
    pub fn msi_address(&self) -> u64 {
        self.mmio.phys_base() + GITS_TRANSLATER
    }

    /// Activity counters.
    pub fn metrics(&self) -> &ItsMetrics {
        &self.metrics
    }

    /// The command queue.
    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// The translation tables.
    pub fn tables(&self) -> &TableManager {
        &self.tables
    }

    /// The per-CPU collections.
    pub fn collections(&self) -> &CollectionManager {
        &self.collections
    }

    /// The devices mapped on this ITS.
    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    /// Maps the collection of a CPU coming online.
    pub fn init_cpu(&self, cpu: usize) -> Result<(), ItsError> {
        self.collections.init_cpu(cpu, &self.queue)?;
        Ok(())
    }
}

// Disables the ITS and waits for it to finish whatever it was doing.
fn force_quiescent(mmio: &dyn ItsMmio, backoff: &Backoff) -> Result<(), ProbeError> {
    let ctlr = mmio.read(GITS_CTLR);
    if ctlr & GITS_CTLR_QUIESCENT != 0 && ctlr & (GITS_CTLR_ENABLE | GITS_CTLR_IMDE) == 0 {
        return Ok(());
    }
    if ctlr & GITS_CTLR_ENABLE != 0 {
        warn!("ITS@{:#x}: enabled by firmware, disabling it", mmio.phys_base());
    }
    mmio.write(GITS_CTLR, ctlr & !(GITS_CTLR_ENABLE | GITS_CTLR_IMDE));
    backoff
        .retry(|| (mmio.read(GITS_CTLR) & GITS_CTLR_QUIESCENT != 0).then_some(()))
        .map_err(ProbeError::NotQuiescent)
}

// Picks the ITS number used to address this ITS in VMOVP ITS lists.
fn assign_its_number(mmio: &dyn ItsMmio, its_list_map: &mut u16) -> Result<u8, ProbeError> {
    let free = its_list_map.trailing_ones();
    if free >= u32::from(ITS_LIST_MAX) {
        return Err(ProbeError::ItsListFull);
    }
    // Bounded by ITS_LIST_MAX.
    let wanted = free as u8;

    let ctlr = mmio.read(GITS_CTLR) & !GITS_CTLR_ITS_NUMBER;
    mmio.write(GITS_CTLR, ctlr | (u64::from(wanted) << GITS_CTLR_ITS_NUMBER_SHIFT));
    let readback = mmio.read(GITS_CTLR);
    // The field is 4 bits wide.
    let nr = ((readback & GITS_CTLR_ITS_NUMBER) >> GITS_CTLR_ITS_NUMBER_SHIFT) as u8;
    if nr != wanted {
        info!("ITS@{:#x}: ITS number hardwired to {nr}", mmio.phys_base());
    }
    if *its_list_map & (1 << nr) != 0 {
        return Err(ProbeError::DuplicateItsNumber(nr));
    }
    *its_list_map |= 1 << nr;
    Ok(nr)
}
