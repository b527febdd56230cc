// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! GICv4.0 virtual LPI support: VMs, their VPEs, and the forwarding of device events to
//! virtual LPIs.
//!
//! Two mapping strategies exist. When every GICv4 ITS implements GITS_TYPER.VMOVP, VPEs
//! are mapped on every ITS as soon as they are enabled, and a VMOVP sent to one ITS is
//! enough. Otherwise the driver runs in ITS-list mode: a VM is only mapped on the ITSs
//! that hold VLPIs for it, and every VMOVP is sent to all of them with a global sequence
//! number.

mod proxy;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use vm_allocator::IdAllocator;

use self::proxy::DoorbellProxy;
use crate::cmd::ItsCommand;
use crate::config::ItsConfig;
use crate::controller::ItsController;
use crate::device::{DeviceHandle, EventCommand, EventMapping};
use crate::domain::invalidate_lpi;
use crate::error_ratelimited;
use crate::hw::regs::*;
use crate::hw::{DmaBuffer, DmaMemory, Redistributors, wait_for_syncr};
use crate::logger::{IncMetric, LogRateLimit, debug, extract_guard, info, warn};
use crate::lpi::{
    LPI_PROP_DEFAULT_PRIO, LPI_PROP_ENABLED, LPI_PROP_GROUP1, LpiAllocator, LpiRange, PropTable,
};
use crate::tables::TableError;
use crate::utils::{Backoff, SZ_64K, align_up};
use crate::{ItsError, RequestError};

/// A VM registered with [`VirtManager::register_vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmHandle(u32);

impl VmHandle {
    /// Identifier of the VM.
    pub fn id(&self) -> u32 {
        self.0
    }

    /// The `index`-th VPE of the VM.
    pub fn vpe(&self, index: usize) -> VpeHandle {
        VpeHandle { vm: self.0, index }
    }
}

/// One VPE of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpeHandle {
    vm: u32,
    index: usize,
}

impl VpeHandle {
    /// VM owning the VPE.
    pub fn vm(&self) -> VmHandle {
        VmHandle(self.vm)
    }

    /// Index of the VPE within its VM.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// What GICR_VPENDBASER reported when a VPE was descheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingState {
    /// The VPE may have interrupts pending.
    pub pending_last: bool,
    /// The pending table's implementation defined area is valid.
    pub idai: bool,
}

/// Snapshot of a VPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VpeInfo {
    /// VPE ID.
    pub vpe_id: u16,
    /// Doorbell LPI.
    pub doorbell: u32,
    /// CPU the VPE is routed to.
    pub cpu: usize,
    /// Slot of the doorbell proxy device, if the VPE holds one.
    pub proxy_event: Option<u32>,
    /// Physical address of the virtual pending table.
    pub vpt_phys: u64,
}

#[derive(Debug)]
pub(crate) struct Vpe {
    pub(crate) vpe_id: u16,
    pub(crate) doorbell: u32,
    vpt: DmaBuffer,
    col_idx: AtomicUsize,
    // Proxy slot, -1 when none.
    pub(crate) proxy_event: AtomicI32,
    idai: AtomicBool,
    pending_last: AtomicBool,
}

impl Vpe {
    pub(crate) fn cpu(&self) -> usize {
        self.col_idx.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
struct VmState {
    // Forwarded events per controller.
    vlpi_count: Vec<u32>,
    // VPEs enabled with `map_vpe`.
    enabled: Vec<bool>,
}

#[derive(Debug)]
struct ItsVm {
    id: u32,
    doorbells: LpiRange,
    vprop: PropTable,
    vpes: Vec<Arc<Vpe>>,
    state: Mutex<VmState>,
}

/// GICv4 VMs and VPEs, across every ITS of the runtime.
#[derive(Debug)]
pub struct VirtManager {
    controllers: Vec<Arc<ItsController>>,
    list_mode: bool,
    prop: Arc<PropTable>,
    lpis: Arc<LpiAllocator>,
    rdists: Arc<dyn Redistributors>,
    memory: Arc<dyn DmaMemory>,
    backoff: Backoff,
    lpi_id_bits: u32,
    vpe_ids: Mutex<IdAllocator>,
    next_vm_id: AtomicU32,
    vms: Mutex<BTreeMap<u32, Arc<ItsVm>>>,
    vmovp_seq: Mutex<u16>,
    proxy: Option<DoorbellProxy>,
    log_limit: LogRateLimit,
}

impl VirtManager {
    /// Sets up virtual LPI support over `controllers`, at least one of which must be a
    /// GICv4 ITS.
    pub fn new(
        controllers: Vec<Arc<ItsController>>,
        prop: Arc<PropTable>,
        lpis: Arc<LpiAllocator>,
        rdists: Arc<dyn Redistributors>,
        memory: Arc<dyn DmaMemory>,
        config: &ItsConfig,
    ) -> Result<Self, ItsError> {
        if !controllers.iter().any(|its| its.is_v4()) {
            return Err(RequestError::VirtualUnsupported.into());
        }
        let list_mode = controllers.iter().any(|its| its.list_nr().is_some());
        let vpe_ids = IdAllocator::new(0, (1u32 << config.vpe_id_bits) - 1)?;
        let proxy = if rdists.has_direct_lpi() {
            None
        } else {
            let its = controllers
                .first()
                .cloned()
                .ok_or(RequestError::UnknownIts(0))?;
            Some(DoorbellProxy::new(its, rdists.nr_cpus())?)
        };
        info!(
            "ITS: Enabling GICv4 support{}{}",
            if list_mode { ", ITS list mode" } else { "" },
            proxy.as_ref().map_or(String::new(), |proxy| format!(
                ", doorbell proxy DevID {:#x}",
                proxy.device_id()
            ))
        );

        Ok(VirtManager {
            controllers,
            list_mode,
            prop,
            lpis,
            rdists,
            memory,
            backoff: config.backoff(),
            lpi_id_bits: config.lpi_id_bits,
            vpe_ids: Mutex::new(vpe_ids),
            next_vm_id: AtomicU32::new(0),
            vms: Mutex::new(BTreeMap::new()),
            vmovp_seq: Mutex::new(0),
            proxy,
            log_limit: LogRateLimit::default(),
        })
    }

    /// Whether VMs are only mapped on the ITSs that hold VLPIs for them.
    pub fn is_list_mode(&self) -> bool {
        self.list_mode
    }

    /// DeviceID of the doorbell proxy device on the first ITS, when doorbells go through
    /// it.
    pub fn proxy_device_id(&self) -> Option<u32> {
        self.proxy.as_ref().map(DoorbellProxy::device_id)
    }

    fn v4_controllers(&self) -> impl Iterator<Item = &Arc<ItsController>> {
        self.controllers.iter().filter(|its| its.is_v4())
    }

    fn first_v4(&self) -> Result<&Arc<ItsController>, RequestError> {
        self.v4_controllers()
            .next()
            .ok_or(RequestError::VirtualUnsupported)
    }

    fn v4_controller(&self, index: usize) -> Result<&Arc<ItsController>, RequestError> {
        let its = self
            .controllers
            .get(index)
            .ok_or(RequestError::UnknownIts(index))?;
        if !its.is_v4() {
            return Err(RequestError::NotVirtual(index));
        }
        Ok(its)
    }

    fn vm(&self, id: u32) -> Result<Arc<ItsVm>, RequestError> {
        extract_guard(self.vms.lock())
            .get(&id)
            .cloned()
            .ok_or(RequestError::UnknownVm(id))
    }

    fn vpe(&self, handle: VpeHandle) -> Result<(Arc<ItsVm>, Arc<Vpe>), RequestError> {
        let vm = self.vm(handle.vm)?;
        let vpe = vm
            .vpes
            .get(handle.index)
            .cloned()
            .ok_or(RequestError::UnknownVpe {
                vm: handle.vm,
                index: handle.index,
            })?;
        Ok((vm, vpe))
    }

    /// Creates a VM with `vpe_count` VPEs.
    ///
    /// Each VPE gets a doorbell LPI, a VPE ID, a virtual pending table and an entry in the
    /// VPE table of every GICv4 ITS. VPEs start routed to the first CPU with a collection.
    pub fn register_vm(&self, vpe_count: u32) -> Result<VmHandle, ItsError> {
        if vpe_count == 0 {
            return Err(RequestError::NoVpes.into());
        }
        let cpu = self
            .first_v4()?
            .collections()
            .first_mapped()
            .ok_or(RequestError::NoTargetCpu)?;
        let doorbells = self.lpis.alloc_exact(vpe_count)?;

        let mut vpes = Vec::with_capacity(vpe_count as usize);
        let res = PropTable::new(&self.memory, self.lpi_id_bits, self.rdists.is_coherent())
            .map_err(ItsError::from)
            .and_then(|vprop| {
                for doorbell in doorbells.base_id..doorbells.base_id + doorbells.span {
                    vpes.push(Arc::new(self.alloc_vpe(doorbell, cpu)?));
                }
                Ok(vprop)
            });
        let vprop = match res {
            Ok(vprop) => vprop,
            Err(err) => {
                self.release_vpes(&vpes, doorbells);
                return Err(err);
            }
        };

        let id = self.next_vm_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "ITS: VM {id}: {vpe_count} VPEs, doorbells [{}, {})",
            doorbells.base_id,
            doorbells.end()
        );
        let vm = ItsVm {
            id,
            doorbells,
            vprop,
            state: Mutex::new(VmState {
                vlpi_count: vec![0; self.controllers.len()],
                enabled: vec![false; vpes.len()],
            }),
            vpes,
        };
        extract_guard(self.vms.lock()).insert(id, Arc::new(vm));
        Ok(VmHandle(id))
    }

    fn alloc_vpe(&self, doorbell: u32, cpu: usize) -> Result<Vpe, ItsError> {
        let id = extract_guard(self.vpe_ids.lock()).allocate_id()?;
        self.init_vpe(id, doorbell, cpu).inspect_err(|_| {
            if let Err(err) = extract_guard(self.vpe_ids.lock()).free_id(id) {
                warn!("ITS: cannot free VPE ID {id}: {err}");
            }
        })
    }

    fn init_vpe(&self, id: u32, doorbell: u32, cpu: usize) -> Result<Vpe, ItsError> {
        // vpe_id_bits is at most 16.
        let vpe_id = u16::try_from(id).map_err(|_| vm_allocator::Error::ResourceNotAvailable)?;
        for its in self.v4_controllers() {
            let table = its
                .tables()
                .find(BaserType::Vcpu)
                .ok_or(TableError::NoSuchTable(BaserType::Vcpu))?;
            its.tables().ensure_entry(table, u32::from(vpe_id))?;
        }

        let size = align_up((1usize << self.lpi_id_bits) / 8, SZ_64K);
        let vpt = DmaBuffer::zeroed(&self.memory, size, SZ_64K)?;
        vpt.flush();
        Ok(Vpe {
            vpe_id,
            doorbell,
            vpt,
            col_idx: AtomicUsize::new(cpu),
            proxy_event: AtomicI32::new(-1),
            idai: AtomicBool::new(false),
            pending_last: AtomicBool::new(false),
        })
    }

    fn release_vpes(&self, vpes: &[Arc<Vpe>], doorbells: LpiRange) {
        let mut ids = extract_guard(self.vpe_ids.lock());
        for vpe in vpes {
            if let Err(err) = ids.free_id(u32::from(vpe.vpe_id)) {
                warn!("ITS: cannot free VPE ID {}: {err}", vpe.vpe_id);
            }
        }
        drop(ids);
        if let Err(err) = self.lpis.free(doorbells) {
            warn!("ITS: cannot free doorbells {doorbells:?}: {err}");
        }
    }

    /// Tears down a VM. Fails while interrupts are still forwarded to it.
    pub fn unregister_vm(&self, vm: VmHandle) -> Result<(), ItsError> {
        let vm = self.vm(vm.0)?;
        {
            let mut state = extract_guard(vm.state.lock());
            if state.vlpi_count.iter().any(|count| *count > 0) {
                return Err(RequestError::VmBusy(vm.id).into());
            }
            for (index, vpe) in vm.vpes.iter().enumerate() {
                if state.enabled[index] && !self.list_mode {
                    for its in self.v4_controllers() {
                        self.send_vmapp(its, vpe, false)?;
                    }
                }
                state.enabled[index] = false;
                if let Some(proxy) = &self.proxy {
                    proxy.unmap(vpe)?;
                }
                self.prop.update(vpe.doorbell, LPI_PROP_ENABLED, 0);
            }
        }
        extract_guard(self.vms.lock()).remove(&vm.id);
        self.release_vpes(&vm.vpes, vm.doorbells);
        debug!("ITS: VM {} unregistered", vm.id);
        Ok(())
    }

    /// Snapshot of a VPE.
    pub fn vpe_info(&self, handle: VpeHandle) -> Result<VpeInfo, RequestError> {
        let (_, vpe) = self.vpe(handle)?;
        Ok(VpeInfo {
            vpe_id: vpe.vpe_id,
            doorbell: vpe.doorbell,
            cpu: vpe.cpu(),
            proxy_event: u32::try_from(vpe.proxy_event.load(Ordering::Acquire)).ok(),
            vpt_phys: vpe.vpt.phys(),
        })
    }

    // VMAPP on one ITS. Mapping also drops whatever the ITS cached for the VPE.
    fn send_vmapp(&self, its: &ItsController, vpe: &Vpe, valid: bool) -> Result<(), ItsError> {
        let target = its.collections().get(vpe.cpu())?.target_address;
        its.queue().send_command(&ItsCommand::Vmapp {
            vpe_id: vpe.vpe_id,
            target,
            vpt_addr: vpe.vpt.phys(),
            vpt_id_bits: self.lpi_id_bits,
            valid,
        })?;
        if valid {
            its.queue()
                .send_command(&ItsCommand::Vinvall { vpe_id: vpe.vpe_id })?;
        }
        Ok(())
    }

    /// Enables or disables a VPE.
    ///
    /// Outside of ITS-list mode the VPE is mapped on (or unmapped from) every GICv4 ITS
    /// right away. In ITS-list mode this is only recorded: VPEs are mapped along with
    /// their VM when the first VLPI lands on an ITS.
    pub fn map_vpe(&self, handle: VpeHandle, enable: bool) -> Result<(), ItsError> {
        let (vm, vpe) = self.vpe(handle)?;
        let mut state = extract_guard(vm.state.lock());
        if state.enabled[handle.index] == enable {
            return Ok(());
        }
        if !self.list_mode {
            for its in self.v4_controllers() {
                self.send_vmapp(its, &vpe, enable)?;
            }
        }
        state.enabled[handle.index] = enable;
        Ok(())
    }

    fn map_vm_locked(&self, vm: &ItsVm, state: &mut VmState, index: usize) -> Result<(), ItsError> {
        if self.list_mode && state.vlpi_count[index] == 0 {
            let its = self.v4_controller(index)?;
            for vpe in &vm.vpes {
                self.send_vmapp(its, vpe, true)?;
            }
            debug!("ITS@{:#x}: mapped VM {}", its.phys_base(), vm.id);
        }
        state.vlpi_count[index] += 1;
        Ok(())
    }

    fn unmap_vm_locked(&self, vm: &ItsVm, state: &mut VmState, index: usize) -> Result<(), ItsError> {
        let its = self.v4_controller(index)?;
        if state.vlpi_count[index] == 0 {
            warn!("ITS@{:#x}: VM {} is not mapped", its.phys_base(), vm.id);
            return Ok(());
        }
        state.vlpi_count[index] -= 1;
        if self.list_mode && state.vlpi_count[index] == 0 {
            for vpe in &vm.vpes {
                self.send_vmapp(its, vpe, false)?;
            }
            debug!("ITS@{:#x}: unmapped VM {}", its.phys_base(), vm.id);
        }
        Ok(())
    }

    /// Takes a reference on the mapping of `vm` on ITS `its_index`. In ITS-list mode, the
    /// first reference maps every VPE of the VM on that ITS.
    pub fn map_vm(&self, its_index: usize, vm: VmHandle) -> Result<(), ItsError> {
        self.v4_controller(its_index)?;
        let vm = self.vm(vm.0)?;
        let mut state = extract_guard(vm.state.lock());
        self.map_vm_locked(&vm, &mut state, its_index)
    }

    /// Drops a reference taken with [`VirtManager::map_vm`]. In ITS-list mode, the last
    /// reference unmaps every VPE of the VM from that ITS.
    pub fn unmap_vm(&self, its_index: usize, vm: VmHandle) -> Result<(), ItsError> {
        self.v4_controller(its_index)?;
        let vm = self.vm(vm.0)?;
        let mut state = extract_guard(vm.state.lock());
        self.unmap_vm_locked(&vm, &mut state, its_index)
    }

    fn event(&self, its_index: usize, device_id: u32) -> Result<(&Arc<ItsController>, DeviceHandle), RequestError> {
        let its = self.v4_controller(its_index)?;
        let device = its
            .devices()
            .find(device_id)
            .ok_or(RequestError::UnknownDevice(device_id))?;
        Ok((its, device))
    }

    /// Forwards an event of a device on ITS `its_index` to virtual LPI `vintid` of a VPE.
    ///
    /// The first forwarding replaces the physical translation with VMAPTI and maps the VM
    /// on the ITS if needed. Forwarding an already forwarded event retargets it with VMOVI.
    /// With `doorbell`, the ITS rings the VPE's doorbell when the VPE is not resident.
    pub fn map_vlpi(
        &self,
        its_index: usize,
        device_id: u32,
        event_id: u32,
        vpe: VpeHandle,
        vintid: u32,
        doorbell: bool,
    ) -> Result<(), ItsError> {
        let (its, device) = self.event(its_index, device_id)?;
        let (vm, target) = self.vpe(vpe)?;
        if vm.vprop.get(vintid).is_none() {
            return Err(RequestError::InvalidVintid(vintid).into());
        }

        let mut state = extract_guard(vm.state.lock());
        if !self.list_mode && !state.enabled[vpe.index] {
            return Err(RequestError::VpeNotMapped(target.vpe_id).into());
        }
        let first = match its.devices().forwarded_vm(device, event_id)? {
            Some(id) if id != vm.id => {
                return Err(RequestError::EventForwarded { device_id, event_id }.into());
            }
            Some(_) => false,
            None => true,
        };
        if first {
            self.map_vm_locked(&vm, &mut state, its_index)?;
        }

        let forwarded = its.devices().forward_event(
            device,
            event_id,
            vm.id,
            target.vpe_id,
            vintid,
            doorbell.then_some(target.doorbell),
        );
        if let Err(err) = forwarded {
            if first {
                if let Err(unmap_err) = self.unmap_vm_locked(&vm, &mut state, its_index) {
                    warn!("ITS: cannot drop mapping of VM {}: {unmap_err}", vm.id);
                }
            }
            return Err(err);
        }
        vm.vprop.update(
            vintid,
            0xff,
            LPI_PROP_DEFAULT_PRIO | LPI_PROP_GROUP1 | LPI_PROP_ENABLED,
        );
        Ok(())
    }

    /// Stops forwarding an event: the physical translation is restored and enabled, and the
    /// VM's mapping on the ITS loses a reference.
    pub fn unmap_vlpi(&self, its_index: usize, device_id: u32, event_id: u32) -> Result<(), ItsError> {
        let (its, device) = self.event(its_index, device_id)?;
        let EventMapping::Virtual {
            vm, cpu, virt_id, ..
        } = its.devices().event_mapping(device, event_id)?
        else {
            return Err(RequestError::EventNotForwarded { device_id, event_id }.into());
        };
        let vm = self.vm(vm)?;
        let mut state = extract_guard(vm.state.lock());

        let (lpi, _) = its.devices().unforward_event(device, event_id)?;
        vm.vprop.update(virt_id, LPI_PROP_ENABLED, 0);
        self.prop.update(
            lpi,
            0xff,
            LPI_PROP_DEFAULT_PRIO | LPI_PROP_GROUP1 | LPI_PROP_ENABLED,
        );
        invalidate_lpi(
            self.rdists.as_ref(),
            &self.backoff,
            its.devices(),
            device,
            event_id,
            lpi,
            cpu,
        )?;
        self.unmap_vm_locked(&vm, &mut state, its_index)
    }

    /// Routes a VPE to `cpu`, sending VMOVP where the VPE is mapped, then moves its
    /// doorbell.
    pub fn move_vpe(&self, handle: VpeHandle, cpu: usize) -> Result<(), ItsError> {
        let (vm, vpe) = self.vpe(handle)?;
        self.first_v4()?.collections().get(cpu)?;

        let state = extract_guard(vm.state.lock());
        let from = vpe.cpu();
        if from == cpu {
            return Ok(());
        }
        vpe.col_idx.store(cpu, Ordering::Release);
        if let Err(err) = self.send_vmovp(&vpe, &state, handle.index, cpu) {
            vpe.col_idx.store(from, Ordering::Release);
            return Err(err);
        }
        drop(state);
        self.move_doorbell(&vpe, from, cpu)
    }

    fn send_vmovp(&self, vpe: &Vpe, state: &VmState, index: usize, cpu: usize) -> Result<(), ItsError> {
        if !self.list_mode {
            // One ITS is enough, the others follow.
            if !state.enabled[index] {
                return Ok(());
            }
            let its = self.first_v4()?;
            let target = its.collections().get(cpu)?.target_address;
            its.queue().send_command(&ItsCommand::Vmovp {
                vpe_id: vpe.vpe_id,
                target,
                seq_num: 0,
                its_list: 0,
            })?;
            its.metrics().vmovp_sent.inc();
            return Ok(());
        }

        let mut targets: Vec<(&Arc<ItsController>, u64)> = Vec::new();
        for its in self
            .v4_controllers()
            .filter(|its| state.vlpi_count[its.index()] > 0)
        {
            targets.push((its, its.collections().get(cpu)?.target_address));
        }
        if targets.is_empty() {
            return Ok(());
        }
        let its_list = targets
            .iter()
            .filter_map(|(its, _)| its.list_nr())
            .fold(0u16, |list, nr| list | (1 << nr));

        // Every queue involved is held, in controller order, before the sequence number is
        // taken: each ITS sees VMOVPs in sequence order.
        let mut guards: Vec<_> = targets.iter().map(|(its, _)| its.queue().lock()).collect();
        let seq_num = {
            let mut seq = extract_guard(self.vmovp_seq.lock());
            let current = *seq;
            *seq = seq.wrapping_add(1);
            current
        };
        let mut tokens = Vec::with_capacity(targets.len());
        for (guard, (its, target)) in guards.iter_mut().zip(&targets) {
            tokens.push(guard.send(&ItsCommand::Vmovp {
                vpe_id: vpe.vpe_id,
                target: *target,
                seq_num,
                its_list,
            })?);
            its.metrics().vmovp_sent.inc();
        }
        drop(guards);

        for ((its, _), token) in targets.iter().zip(&tokens) {
            its.queue().wait_for_completion(token)?;
        }
        debug!(
            "ITS: VMOVP {seq_num} of VPE {} to CPU{cpu}, ITS list {its_list:#x}",
            vpe.vpe_id
        );
        Ok(())
    }

    fn move_doorbell(&self, vpe: &Arc<Vpe>, from: usize, to: usize) -> Result<(), ItsError> {
        if self.rdists.has_direct_lpi() {
            // A doorbell pending on the old redistributor would never be seen.
            self.rdists
                .write(from, GICR_CLRLPIR, u64::from(vpe.doorbell));
            wait_for_syncr(self.rdists.as_ref(), from, &self.backoff)?;
            return Ok(());
        }
        match &self.proxy {
            Some(proxy) => proxy.move_doorbell(vpe, to),
            None => Ok(()),
        }
    }

    /// Makes a VPE resident on the redistributor of its CPU.
    pub fn schedule_vpe(&self, handle: VpeHandle) -> Result<(), ItsError> {
        let (vm, vpe) = self.vpe(handle)?;
        let cpu = vpe.cpu();

        let vprop = (vm.vprop.phys() & GICR_VPROPBASER_PA_MASK)
            | (u64::from(self.lpi_id_bits - 1) & GICR_VPROPBASER_IDBITS_MASK)
            | GICR_VPROPBASER_RAWB
            | GICR_VPROPBASER_INNER_SHAREABLE;
        self.rdists.write(cpu, GICR_VPROPBASER, vprop);

        // PendingLast is always set: the pending table may hold interrupts that arrived
        // while the VPE was not resident.
        let mut vpend = (vpe.vpt.phys() & GICR_VPENDBASER_PA_MASK)
            | GICR_VPENDBASER_RAWAWB
            | GICR_VPENDBASER_INNER_SHAREABLE
            | GICR_VPENDBASER_PENDING_LAST
            | GICR_VPENDBASER_VALID;
        if vpe.idai.load(Ordering::Acquire) {
            vpend |= GICR_VPENDBASER_IDAI;
        }
        self.rdists.write(cpu, GICR_VPENDBASER, vpend);
        Ok(())
    }

    /// Makes a VPE non-resident and reports whether it has interrupts pending.
    ///
    /// If the redistributor does not finish writing back the pending table in time, the
    /// VPE is assumed to have pending interrupts and the timeout is returned.
    pub fn deschedule_vpe(&self, handle: VpeHandle) -> Result<PendingState, ItsError> {
        let (_, vpe) = self.vpe(handle)?;
        let cpu = vpe.cpu();

        let val = self.rdists.read(cpu, GICR_VPENDBASER);
        self.rdists
            .write(cpu, GICR_VPENDBASER, val & !GICR_VPENDBASER_VALID);
        let res = self.backoff.retry(|| {
            let val = self.rdists.read(cpu, GICR_VPENDBASER);
            (val & GICR_VPENDBASER_DIRTY == 0).then_some(val)
        });
        match res {
            Ok(val) => {
                let state = PendingState {
                    pending_last: val & GICR_VPENDBASER_PENDING_LAST != 0,
                    idai: val & GICR_VPENDBASER_IDAI != 0,
                };
                vpe.idai.store(state.idai, Ordering::Release);
                vpe.pending_last.store(state.pending_last, Ordering::Release);
                Ok(state)
            }
            Err(err) => {
                error_ratelimited!(
                    self.log_limit,
                    "ITS: CPU{cpu}: virtual pending table of VPE {} not cleaning",
                    vpe.vpe_id
                );
                vpe.idai.store(false, Ordering::Release);
                vpe.pending_last.store(true, Ordering::Release);
                Err(err.into())
            }
        }
    }

    /// Pending state recorded at the last deschedule.
    pub fn pending_state(&self, handle: VpeHandle) -> Result<PendingState, RequestError> {
        let (_, vpe) = self.vpe(handle)?;
        Ok(PendingState {
            pending_last: vpe.pending_last.load(Ordering::Acquire),
            idai: vpe.idai.load(Ordering::Acquire),
        })
    }

    /// Reloads the configuration of every VLPI of a VPE with VINVALL, on one ITS that has
    /// the VPE mapped.
    pub fn invalidate_all(&self, handle: VpeHandle) -> Result<(), ItsError> {
        let (vm, vpe) = self.vpe(handle)?;
        let state = extract_guard(vm.state.lock());
        let its = if self.list_mode {
            self.v4_controllers()
                .find(|its| state.vlpi_count[its.index()] > 0)
        } else {
            if !state.enabled[handle.index] {
                return Err(RequestError::VpeNotMapped(vpe.vpe_id).into());
            }
            self.v4_controllers().next()
        };
        if let Some(its) = its {
            its.queue()
                .send_command(&ItsCommand::Vinvall { vpe_id: vpe.vpe_id })?;
        }
        Ok(())
    }

    /// Enables or disables the doorbell of a VPE.
    pub fn set_doorbell(&self, handle: VpeHandle, enable: bool) -> Result<(), ItsError> {
        let (_, vpe) = self.vpe(handle)?;
        let set = if enable { LPI_PROP_ENABLED } else { 0 };
        self.prop.update(vpe.doorbell, LPI_PROP_ENABLED, set);

        if self.rdists.has_direct_lpi() {
            let cpu = vpe.cpu();
            self.rdists
                .write(cpu, GICR_INVLPIR, u64::from(vpe.doorbell));
            wait_for_syncr(self.rdists.as_ref(), cpu, &self.backoff)?;
            return Ok(());
        }
        self.proxy_send(&vpe, EventCommand::Inv)
    }

    /// Raises or clears the doorbell of a VPE.
    pub fn set_doorbell_pending(&self, handle: VpeHandle, pending: bool) -> Result<(), ItsError> {
        let (_, vpe) = self.vpe(handle)?;
        if self.rdists.has_direct_lpi() {
            let cpu = vpe.cpu();
            let doorbell = u64::from(vpe.doorbell);
            if pending {
                self.rdists.write(cpu, GICR_SETLPIR, doorbell);
            } else {
                self.rdists.write(cpu, GICR_CLRLPIR, doorbell);
                wait_for_syncr(self.rdists.as_ref(), cpu, &self.backoff)?;
            }
            return Ok(());
        }
        let cmd = if pending {
            EventCommand::Int
        } else {
            EventCommand::Clear
        };
        self.proxy_send(&vpe, cmd)
    }

    fn proxy_send(&self, vpe: &Arc<Vpe>, cmd: EventCommand) -> Result<(), ItsError> {
        match &self.proxy {
            Some(proxy) => proxy.send(vpe, cmd),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Opcode;
    use crate::test_utils::{DirectLpiOp, SimIte, SimItsConfig, SimPlatform};

    fn v4(vmovp: bool) -> SimItsConfig {
        SimItsConfig {
            virtual_lpis: true,
            vmovp,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_vm() {
        let platform = SimPlatform::builder().direct_lpi(true).its(v4(true)).build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        assert!(!virt.is_list_mode());
        assert_eq!(virt.proxy_device_id(), None);
        let free = runtime.lpi_allocator().free_count();

        let vm = virt.register_vm(3).unwrap();
        let info: Vec<_> = (0..3).map(|i| virt.vpe_info(vm.vpe(i)).unwrap()).collect();
        assert_eq!(runtime.lpi_allocator().free_count(), free - 3);
        assert_eq!(info[1].doorbell, info[0].doorbell + 1);
        assert_ne!(info[0].vpe_id, info[1].vpe_id);
        assert!(info.iter().all(|vpe| vpe.vpt_phys % SZ_64K as u64 == 0));
        assert!(info.iter().all(|vpe| vpe.cpu == 0 && vpe.proxy_event.is_none()));
        assert!(platform.memory.is_zeroed(info[2].vpt_phys, 0x2000));
        assert!(matches!(
            virt.vpe_info(vm.vpe(3)),
            Err(RequestError::UnknownVpe { index: 3, .. })
        ));
        assert!(matches!(
            virt.register_vm(0),
            Err(ItsError::InvalidRequest(RequestError::NoVpes))
        ));

        virt.unregister_vm(vm).unwrap();
        assert_eq!(runtime.lpi_allocator().free_count(), free);
        assert!(matches!(
            virt.vpe_info(vm.vpe(0)),
            Err(RequestError::UnknownVm(_))
        ));
        // VPE IDs are reused.
        let vm = virt.register_vm(1).unwrap();
        assert_eq!(virt.vpe_info(vm.vpe(0)).unwrap().vpe_id, info[0].vpe_id);
    }

    #[test]
    fn test_eager_vpe_mapping() {
        let platform = SimPlatform::builder()
            .direct_lpi(true)
            .its(v4(true))
            .its(v4(true))
            .build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        let vm = virt.register_vm(2).unwrap();
        let vpe = vm.vpe(1);
        let vpe_id = virt.vpe_info(vpe).unwrap().vpe_id;

        virt.map_vpe(vpe, true).unwrap();
        virt.map_vpe(vpe, true).unwrap();
        for its in &platform.its {
            assert_eq!(its.vpe_target(vpe_id), Some(0));
            assert_eq!(its.commands_with(Opcode::Vmapp).len(), 1);
            assert_eq!(its.commands_with(Opcode::Vinvall).len(), 1);
        }

        // A single VMOVP, without sequence number.
        virt.move_vpe(vpe, 2).unwrap();
        let vmovp = platform.its[0].commands_with(Opcode::Vmovp);
        assert_eq!(vmovp.len(), 1);
        assert_eq!(vmovp[0].seq_num(), 0);
        assert_eq!(vmovp[0].its_list(), 0);
        assert_eq!(platform.its[0].vpe_target(vpe_id), Some(2 << 16));
        assert!(platform.its[1].commands_with(Opcode::Vmovp).is_empty());
        // The doorbell is cleared on the redistributor the VPE left.
        let doorbell = virt.vpe_info(vpe).unwrap().doorbell;
        assert!(
            platform
                .rdists
                .ops()
                .contains(&DirectLpiOp::Clear { cpu: 0, lpi: doorbell })
        );
        virt.move_vpe(vpe, 2).unwrap();
        assert_eq!(platform.its[0].commands_with(Opcode::Vmovp).len(), 1);

        virt.invalidate_all(vpe).unwrap();
        assert_eq!(platform.its[0].commands_with(Opcode::Vinvall).len(), 2);
        assert!(matches!(
            virt.invalidate_all(vm.vpe(0)),
            Err(ItsError::InvalidRequest(RequestError::VpeNotMapped(_)))
        ));

        virt.map_vpe(vpe, false).unwrap();
        assert!(platform.its.iter().all(|its| its.vpe_target(vpe_id).is_none()));
        assert!(platform.errors().is_empty());
    }

    #[test]
    fn test_list_mode_refcount() {
        let platform = SimPlatform::builder()
            .direct_lpi(true)
            .its(v4(false))
            .its(v4(false))
            .build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        assert!(virt.is_list_mode());
        let vm = virt.register_vm(2).unwrap();
        let vpe_ids: Vec<_> = (0..2).map(|i| virt.vpe_info(vm.vpe(i)).unwrap().vpe_id).collect();

        // Only recorded.
        virt.map_vpe(vm.vpe(0), true).unwrap();
        assert!(platform.its[0].commands_with(Opcode::Vmapp).is_empty());

        let its = runtime.controller(1).unwrap();
        let dev = its.devices().create_device(0x20, 2, true).unwrap();
        for event in 0..2 {
            let lpi = its.devices().event_lpi(dev, event).unwrap();
            its.devices().bind_event(dev, event, lpi, 0).unwrap();
        }

        virt.map_vlpi(1, 0x20, 0, vm.vpe(0), 8192, true).unwrap();
        virt.map_vlpi(1, 0x20, 1, vm.vpe(1), 8193, false).unwrap();
        // Both VPEs mapped once, on the ITS holding the VLPIs only.
        assert_eq!(platform.its[1].commands_with(Opcode::Vmapp).len(), 2);
        assert!(platform.its[0].commands_with(Opcode::Vmapp).is_empty());
        let doorbell = virt.vpe_info(vm.vpe(0)).unwrap().doorbell;
        assert_eq!(
            platform.its[1].ite(0x20, 0),
            Some(SimIte::Virtual {
                vpe_id: vpe_ids[0],
                virt_id: 8192,
                doorbell,
            })
        );
        assert!(matches!(
            virt.unregister_vm(vm),
            Err(ItsError::InvalidRequest(RequestError::VmBusy(_)))
        ));

        // Retargeting an event uses VMOVI.
        virt.map_vlpi(1, 0x20, 0, vm.vpe(1), 8192, true).unwrap();
        assert_eq!(platform.its[1].commands_with(Opcode::Vmovi).len(), 1);

        virt.move_vpe(vm.vpe(1), 3).unwrap();
        let vmovp = platform.its[1].commands_with(Opcode::Vmovp);
        assert_eq!(vmovp.len(), 1);
        assert_eq!(vmovp[0].its_list(), 1 << 1);
        assert!(platform.its[0].commands_with(Opcode::Vmovp).is_empty());

        virt.unmap_vlpi(1, 0x20, 0).unwrap();
        assert!(platform.its[1].vpe_target(vpe_ids[0]).is_some());
        virt.unmap_vlpi(1, 0x20, 1).unwrap();
        assert!(platform.its[1].vpe_target(vpe_ids[0]).is_none());
        let lpi = its.devices().event_lpi(dev, 1).unwrap();
        assert_eq!(platform.its[1].ite(0x20, 1), Some(SimIte::Physical { lpi, collection: 0 }));
        assert_eq!(
            runtime.prop_table().get(lpi),
            Some(LPI_PROP_DEFAULT_PRIO | LPI_PROP_GROUP1 | LPI_PROP_ENABLED)
        );
        assert!(
            platform
                .rdists
                .ops()
                .contains(&DirectLpiOp::Inv { cpu: 0, lpi })
        );
        assert!(matches!(
            virt.unmap_vlpi(1, 0x20, 1),
            Err(ItsError::InvalidRequest(RequestError::EventNotForwarded { .. }))
        ));
        virt.unregister_vm(vm).unwrap();
        assert!(platform.errors().is_empty());
    }

    #[test]
    fn test_map_vlpi_errors() {
        let platform = SimPlatform::builder()
            .direct_lpi(true)
            .its(SimItsConfig::default())
            .its(v4(true))
            .build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        let vm = virt.register_vm(1).unwrap();
        let its = runtime.controller(1).unwrap();
        let dev = its.devices().create_device(7, 1, true).unwrap();

        assert!(matches!(
            virt.map_vlpi(0, 7, 0, vm.vpe(0), 8192, false),
            Err(ItsError::InvalidRequest(RequestError::NotVirtual(0)))
        ));
        assert!(matches!(
            virt.map_vlpi(1, 7, 0, vm.vpe(0), 8192, false),
            Err(ItsError::InvalidRequest(RequestError::VpeNotMapped(_)))
        ));
        virt.map_vpe(vm.vpe(0), true).unwrap();
        assert!(matches!(
            virt.map_vlpi(1, 7, 0, vm.vpe(0), 8192, false),
            Err(ItsError::InvalidRequest(RequestError::EventNotMapped { .. }))
        ));
        assert!(matches!(
            virt.map_vlpi(1, 7, 0, vm.vpe(0), 17, false),
            Err(ItsError::InvalidRequest(RequestError::InvalidVintid(17)))
        ));
        let lpi = its.devices().event_lpi(dev, 0).unwrap();
        its.devices().bind_event(dev, 0, lpi, 1).unwrap();
        virt.map_vlpi(1, 7, 0, vm.vpe(0), 8200, false).unwrap();
        assert!(matches!(
            its.devices().destroy_device(dev),
            Err(ItsError::InvalidRequest(RequestError::EventForwarded { .. }))
        ));
        assert!(platform.errors().is_empty());
    }

    #[test]
    fn test_schedule_deschedule() {
        let platform = SimPlatform::builder().direct_lpi(true).its(v4(true)).build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        let vm = virt.register_vm(1).unwrap();
        let vpe = vm.vpe(0);
        let info = virt.vpe_info(vpe).unwrap();

        virt.schedule_vpe(vpe).unwrap();
        let vpend = platform.rdists.vpendbaser(0);
        assert_eq!(vpend & GICR_VPENDBASER_PA_MASK, info.vpt_phys);
        assert_ne!(vpend & GICR_VPENDBASER_VALID, 0);
        assert_eq!(vpend & GICR_VPENDBASER_IDAI, 0);
        assert_eq!(platform.rdists.vpropbaser(0) & GICR_VPROPBASER_IDBITS_MASK, 15);

        platform.rdists.set_pending_last(0, true);
        let state = virt.deschedule_vpe(vpe).unwrap();
        assert!(state.pending_last);
        assert_eq!(platform.rdists.vpendbaser(0) & GICR_VPENDBASER_VALID, 0);
        assert_eq!(virt.pending_state(vpe).unwrap(), state);

        platform.rdists.set_pending_last(0, false);
        virt.schedule_vpe(vpe).unwrap();
        assert!(!virt.deschedule_vpe(vpe).unwrap().pending_last);
    }

    #[test]
    fn test_deschedule_timeout() {
        let platform = SimPlatform::builder().direct_lpi(true).its(v4(true)).build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        let vpe = virt.register_vm(1).unwrap().vpe(0);

        virt.schedule_vpe(vpe).unwrap();
        platform.rdists.set_dirty_latency(u32::MAX);
        let err = virt.deschedule_vpe(vpe).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Timeout);
        // Assume the worst.
        assert!(virt.pending_state(vpe).unwrap().pending_last);
    }

    #[test]
    fn test_direct_doorbell() {
        let platform = SimPlatform::builder().direct_lpi(true).its(v4(true)).build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        let vpe = virt.register_vm(1).unwrap().vpe(0);
        let doorbell = virt.vpe_info(vpe).unwrap().doorbell;
        platform.rdists.clear_ops();

        virt.set_doorbell(vpe, true).unwrap();
        assert_eq!(
            runtime.prop_table().get(doorbell).unwrap() & LPI_PROP_ENABLED,
            LPI_PROP_ENABLED
        );
        virt.set_doorbell_pending(vpe, true).unwrap();
        virt.set_doorbell_pending(vpe, false).unwrap();
        virt.set_doorbell(vpe, false).unwrap();
        assert_eq!(runtime.prop_table().get(doorbell).unwrap() & LPI_PROP_ENABLED, 0);
        assert_eq!(
            platform.rdists.ops(),
            vec![
                DirectLpiOp::Inv { cpu: 0, lpi: doorbell },
                DirectLpiOp::Set { cpu: 0, lpi: doorbell },
                DirectLpiOp::Clear { cpu: 0, lpi: doorbell },
                DirectLpiOp::Inv { cpu: 0, lpi: doorbell },
            ]
        );
        assert!(platform.its[0].commands_with(Opcode::Inv).is_empty());
    }

    #[test]
    fn test_proxy_doorbell() {
        let platform = SimPlatform::builder().nr_cpus(2).its(v4(true)).build();
        let runtime = platform.runtime().unwrap();
        let virt = runtime.virt().unwrap();
        let proxy_id = virt.proxy_device_id().unwrap();
        assert_eq!(proxy_id, 0xffff);
        let vpe = virt.register_vm(1).unwrap().vpe(0);
        let doorbell = virt.vpe_info(vpe).unwrap().doorbell;

        virt.set_doorbell_pending(vpe, true).unwrap();
        assert_eq!(virt.vpe_info(vpe).unwrap().proxy_event, Some(0));
        assert_eq!(platform.its[0].pending_lpis(), vec![doorbell]);
        virt.set_doorbell_pending(vpe, false).unwrap();
        assert!(platform.its[0].pending_lpis().is_empty());
        virt.set_doorbell(vpe, true).unwrap();
        assert_eq!(platform.its[0].commands_with(Opcode::Mapti).len(), 1);
        assert_eq!(platform.its[0].commands_with(Opcode::Inv).len(), 1);

        // Moving the VPE moves the proxy event too.
        virt.move_vpe(vpe, 1).unwrap();
        assert_eq!(
            platform.its[0].ite(proxy_id, 0),
            Some(SimIte::Physical {
                lpi: doorbell,
                collection: 1
            })
        );
        assert!(platform.errors().is_empty());
    }
}
