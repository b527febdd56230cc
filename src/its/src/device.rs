// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Devices known to one ITS: their interrupt translation tables, LPI ranges and the
//! translation of each of their events.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::cmd::{CommandQueue, ItsCommand};
use crate::collection::{Collection, CollectionManager};
use crate::hw::regs::{BaserType, Typer};
use crate::hw::{DmaBuffer, DmaMemory};
use crate::logger::{IncMetric, ItsMetrics, debug, extract_guard, warn};
use crate::lpi::{LpiAllocator, LpiRange};
use crate::tables::{TableError, TableManager};
use crate::{ItsError, RequestError};

/// Alignment of an interrupt translation table.
pub const ITS_ITT_ALIGN: usize = 256;

/// Who holds a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sharing {
    /// A single requester. The device goes away with its last event.
    Exclusive,
    /// Several requesters alias the same DeviceID. The device stays until all but one have
    /// released it.
    Shared(u32),
}

impl Sharing {
    /// Number of requesters holding the device.
    pub fn owners(&self) -> u32 {
        match self {
            Sharing::Exclusive => 1,
            Sharing::Shared(owners) => *owners,
        }
    }

    fn acquire(self) -> Self {
        Sharing::Shared(self.owners() + 1)
    }

    fn release(self) -> Self {
        match self.owners() {
            0..=2 => Sharing::Exclusive,
            owners => Sharing::Shared(owners - 1),
        }
    }
}

/// A device registered with an ITS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(u32);

impl DeviceHandle {
    /// DeviceID of the device.
    pub fn device_id(&self) -> u32 {
        self.0
    }
}

/// Translation of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventMapping {
    /// Not translated.
    Unmapped,
    /// Translated to a physical LPI routed to `cpu`.
    Physical {
        /// Physical LPI.
        lpi: u32,
        /// Target CPU (collection).
        cpu: usize,
    },
    /// Forwarded to a virtual LPI. The physical translation is kept to be restored once the
    /// event stops being forwarded.
    Virtual {
        /// Physical LPI.
        lpi: u32,
        /// Target CPU of the physical LPI.
        cpu: usize,
        /// VM receiving the event.
        vm: u32,
        /// VPE receiving the event.
        vpe_id: u16,
        /// Virtual LPI.
        virt_id: u32,
        /// Doorbell rung when the VPE is not resident.
        doorbell: Option<u32>,
    },
}

/// Commands acting on an already translated event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCommand {
    /// Reload the LPI configuration (INV).
    Inv,
    /// Make the LPI pending (INT).
    Int,
    /// Clear the pending LPI (CLEAR).
    Clear,
}

/// Snapshot of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// DeviceID.
    pub device_id: u32,
    /// Number of ITT entries.
    pub nr_ites: u32,
    /// Physical address of the ITT.
    pub itt_phys: u64,
    /// LPIs backing the events, if the device owns some.
    pub lpis: Option<LpiRange>,
    /// Owners of the device.
    pub sharing: Sharing,
    /// Number of allocated events.
    pub allocated_events: u32,
}

#[derive(Debug)]
struct ItsDevice {
    itt: DmaBuffer,
    nr_ites: u32,
    lpis: Option<LpiRange>,
    // One bit per allocatable event.
    allocated: Vec<u64>,
    events: Vec<EventMapping>,
    sharing: Sharing,
}

impl ItsDevice {
    // Events that can be handed out by `alloc_events`.
    fn nr_allocatable(&self) -> u32 {
        self.lpis.map_or(self.nr_ites, |range| range.span.min(self.nr_ites))
    }

    fn is_allocated(&self, event_id: u32) -> bool {
        let idx = event_id as usize;
        self.allocated[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_allocated(&mut self, event_id: u32, allocated: bool) {
        let idx = event_id as usize;
        if allocated {
            self.allocated[idx / 64] |= 1 << (idx % 64);
        } else {
            self.allocated[idx / 64] &= !(1 << (idx % 64));
        }
    }

    fn allocated_events(&self) -> u32 {
        self.allocated.iter().map(|word| word.count_ones()).sum()
    }

    // First block of `count` free events, aligned to the next power of two.
    fn find_free_block(&self, count: u32) -> Option<u32> {
        let align = count.next_power_of_two();
        let limit = self.nr_allocatable();
        (0..limit)
            .step_by(align as usize)
            .take_while(|base| base + count <= limit)
            .find(|base| (*base..base + count).all(|event| !self.is_allocated(event)))
    }
}

/// Devices of one ITS, indexed by DeviceID.
#[derive(Debug)]
pub struct DeviceRegistry {
    typer: Typer,
    queue: Arc<CommandQueue>,
    tables: Arc<TableManager>,
    collections: Arc<CollectionManager>,
    lpis: Arc<LpiAllocator>,
    memory: Arc<dyn DmaMemory>,
    metrics: Arc<ItsMetrics>,
    devices: Mutex<BTreeMap<u32, ItsDevice>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new(
        typer: Typer,
        queue: Arc<CommandQueue>,
        tables: Arc<TableManager>,
        collections: Arc<CollectionManager>,
        lpis: Arc<LpiAllocator>,
        memory: Arc<dyn DmaMemory>,
        metrics: Arc<ItsMetrics>,
    ) -> Self {
        DeviceRegistry {
            typer,
            queue,
            tables,
            collections,
            lpis,
            memory,
            metrics,
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Largest DeviceID the ITS accepts.
    pub fn max_device_id(&self) -> u32 {
        u32::try_from((1u64 << self.typer.device_id_bits()) - 1).unwrap_or(u32::MAX)
    }

    fn check_request(&self, device_id: u32, nvecs: u32) -> Result<(), RequestError> {
        if device_id > self.max_device_id() {
            return Err(RequestError::DeviceIdOutOfRange(device_id));
        }
        if nvecs == 0 || u64::from(nvecs) > 1u64 << self.typer.event_id_bits() {
            return Err(RequestError::InvalidEventCount(nvecs));
        }
        Ok(())
    }

    /// Registers a device with room for `nvecs` events, and maps it with MAPD.
    ///
    /// When `wants_lpis` is set, the device also gets its own LPI range, which may be
    /// shorter than `nvecs` if the LPI space is fragmented.
    pub fn create_device(
        &self,
        device_id: u32,
        nvecs: u32,
        wants_lpis: bool,
    ) -> Result<DeviceHandle, ItsError> {
        self.check_request(device_id, nvecs)?;
        let mut devices = extract_guard(self.devices.lock());
        if devices.contains_key(&device_id) {
            return Err(RequestError::DeviceExists(device_id).into());
        }
        let device = self.alloc_device(device_id, nvecs, wants_lpis)?;
        devices.insert(device_id, device);
        Ok(DeviceHandle(device_id))
    }

    fn alloc_device(&self, device_id: u32, nvecs: u32, wants_lpis: bool) -> Result<ItsDevice, ItsError> {
        let table = self
            .tables
            .find(BaserType::Device)
            .ok_or(TableError::NoSuchTable(BaserType::Device))?;
        self.tables.ensure_entry(table, device_id)?;

        // An ITT holds a power of two of at least two entries.
        let nr_ites = nvecs.max(2).next_power_of_two();
        let size = (nr_ites as usize * self.typer.itt_entry_size()).max(ITS_ITT_ALIGN);
        let itt = DmaBuffer::zeroed(&self.memory, size, ITS_ITT_ALIGN)?;
        itt.flush();

        let lpis = if wants_lpis {
            Some(self.lpis.allocate(nvecs)?)
        } else {
            None
        };

        let mapd = ItsCommand::Mapd {
            device_id,
            itt_addr: itt.phys(),
            nr_ites,
            valid: true,
        };
        if let Err(err) = self.queue.send_command(&mapd) {
            if let Some(range) = lpis {
                self.free_lpis(range);
            }
            return Err(err.into());
        }

        debug!(
            "ITS: ID:{device_id:#x} ITT {nr_ites} entries, {} bits, LPIs {:?}",
            nr_ites.ilog2(),
            lpis
        );
        self.metrics.devices_created.inc();
        Ok(ItsDevice {
            itt,
            nr_ites,
            lpis,
            allocated: vec![0; (nr_ites as usize).div_ceil(64)],
            events: vec![EventMapping::Unmapped; nr_ites as usize],
            sharing: Sharing::Exclusive,
        })
    }

    fn free_lpis(&self, range: LpiRange) {
        if let Err(err) = self.lpis.free(range) {
            warn!("ITS: cannot free LPIs {range:?}: {err}");
        }
    }

    /// Gets a device ready for `nvecs` MSIs. An existing device is shared with one more
    /// requester; otherwise a new one is created with its own LPIs.
    pub fn prepare(&self, device_id: u32, nvecs: u32) -> Result<DeviceHandle, ItsError> {
        self.check_request(device_id, nvecs)?;
        let mut devices = extract_guard(self.devices.lock());
        if let Some(device) = devices.get_mut(&device_id) {
            device.sharing = device.sharing.acquire();
            debug!("ITS: Reusing ITT for devID {device_id:#x}");
            return Ok(DeviceHandle(device_id));
        }
        let device = self.alloc_device(device_id, nvecs, true)?;
        devices.insert(device_id, device);
        Ok(DeviceHandle(device_id))
    }

    /// Handle of the device with this DeviceID.
    pub fn find(&self, device_id: u32) -> Option<DeviceHandle> {
        extract_guard(self.devices.lock())
            .contains_key(&device_id)
            .then_some(DeviceHandle(device_id))
    }

    /// Snapshot of a device.
    pub fn info(&self, handle: DeviceHandle) -> Result<DeviceInfo, RequestError> {
        let devices = extract_guard(self.devices.lock());
        let device = devices
            .get(&handle.0)
            .ok_or(RequestError::UnknownDevice(handle.0))?;
        Ok(DeviceInfo {
            device_id: handle.0,
            nr_ites: device.nr_ites,
            itt_phys: device.itt.phys(),
            lpis: device.lpis,
            sharing: device.sharing,
            allocated_events: device.allocated_events(),
        })
    }

    /// Current translation of an event.
    pub fn event_mapping(&self, handle: DeviceHandle, event_id: u32) -> Result<EventMapping, RequestError> {
        let devices = extract_guard(self.devices.lock());
        let device = Self::device(&devices, handle)?;
        Self::check_event(handle, device, event_id)?;
        Ok(device.events[event_id as usize])
    }

    /// LPI backing an event of a device that owns LPIs.
    pub fn event_lpi(&self, handle: DeviceHandle, event_id: u32) -> Result<u32, RequestError> {
        let devices = extract_guard(self.devices.lock());
        let device = Self::device(&devices, handle)?;
        let range = device.lpis.ok_or(RequestError::NoLpis(handle.0))?;
        if event_id >= range.span {
            return Err(RequestError::UnknownEvent {
                device_id: handle.0,
                event_id,
            });
        }
        Ok(range.base_id + event_id)
    }

    fn device(devices: &BTreeMap<u32, ItsDevice>, handle: DeviceHandle) -> Result<&ItsDevice, RequestError> {
        devices
            .get(&handle.0)
            .ok_or(RequestError::UnknownDevice(handle.0))
    }

    fn device_mut(
        devices: &mut BTreeMap<u32, ItsDevice>,
        handle: DeviceHandle,
    ) -> Result<&mut ItsDevice, RequestError> {
        devices
            .get_mut(&handle.0)
            .ok_or(RequestError::UnknownDevice(handle.0))
    }

    fn check_event(handle: DeviceHandle, device: &ItsDevice, event_id: u32) -> Result<(), RequestError> {
        if event_id >= device.nr_ites {
            return Err(RequestError::UnknownEvent {
                device_id: handle.0,
                event_id,
            });
        }
        Ok(())
    }

    /// Allocates `count` consecutive events, aligned on the next power of two, and returns
    /// the first one.
    pub fn alloc_events(&self, handle: DeviceHandle, count: u32) -> Result<u32, ItsError> {
        if count == 0 {
            return Err(RequestError::InvalidEventCount(count).into());
        }
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        let base = device
            .find_free_block(count)
            .ok_or(ItsError::EventsExhausted {
                device_id: handle.0,
                count,
            })?;
        for event in base..base + count {
            device.set_allocated(event, true);
        }
        Ok(base)
    }

    fn collection(&self, cpu: usize) -> Result<Collection, RequestError> {
        self.collections.get(cpu)
    }

    /// Translates an event to `lpi` on the collection of `cpu`.
    ///
    /// The first translation sends MAPTI. Moving the event to another CPU sends MOVI, and
    /// asking for the current target sends nothing.
    pub fn bind_event(&self, handle: DeviceHandle, event_id: u32, lpi: u32, cpu: usize) -> Result<(), ItsError> {
        let collection = self.collection(cpu)?;
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        Self::check_event(handle, device, event_id)?;
        let device_id = handle.0;

        match device.events[event_id as usize] {
            EventMapping::Unmapped => {}
            EventMapping::Physical { lpi: cur, cpu: cur_cpu } if cur == lpi => {
                if cur_cpu != cpu {
                    self.queue.send_command(&ItsCommand::Movi {
                        device_id,
                        event_id,
                        collection,
                    })?;
                    device.events[event_id as usize] = EventMapping::Physical { lpi, cpu };
                }
                return Ok(());
            }
            EventMapping::Physical { cpu: cur_cpu, .. } => {
                // Another LPI: drop the old translation first.
                self.queue.send_command(&ItsCommand::Discard {
                    device_id,
                    event_id,
                    collection: self.collection(cur_cpu)?,
                })?;
                device.events[event_id as usize] = EventMapping::Unmapped;
            }
            EventMapping::Virtual { .. } => {
                return Err(RequestError::EventForwarded { device_id, event_id }.into());
            }
        }

        self.queue.send_command(&ItsCommand::Mapti {
            device_id,
            event_id,
            phys_id: lpi,
            collection,
        })?;
        device.events[event_id as usize] = EventMapping::Physical { lpi, cpu };
        Ok(())
    }

    /// Removes the translation of an event with DISCARD.
    pub fn unbind_event(&self, handle: DeviceHandle, event_id: u32) -> Result<(), ItsError> {
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        Self::check_event(handle, device, event_id)?;
        self.discard(handle, device, event_id)
    }

    fn discard(&self, handle: DeviceHandle, device: &mut ItsDevice, event_id: u32) -> Result<(), ItsError> {
        let device_id = handle.0;
        let cpu = match device.events[event_id as usize] {
            EventMapping::Physical { cpu, .. } => cpu,
            EventMapping::Unmapped => {
                return Err(RequestError::EventNotMapped { device_id, event_id }.into());
            }
            EventMapping::Virtual { .. } => {
                return Err(RequestError::EventForwarded { device_id, event_id }.into());
            }
        };
        self.queue.send_command(&ItsCommand::Discard {
            device_id,
            event_id,
            collection: self.collection(cpu)?,
        })?;
        device.events[event_id as usize] = EventMapping::Unmapped;
        Ok(())
    }

    /// Sends INV, INT or CLEAR for a translated event.
    pub fn send_event_command(&self, handle: DeviceHandle, event_id: u32, cmd: EventCommand) -> Result<(), ItsError> {
        let devices = extract_guard(self.devices.lock());
        let device = Self::device(&devices, handle)?;
        Self::check_event(handle, device, event_id)?;
        let device_id = handle.0;
        let cpu = match device.events[event_id as usize] {
            EventMapping::Physical { cpu, .. } | EventMapping::Virtual { cpu, .. } => cpu,
            EventMapping::Unmapped => {
                return Err(RequestError::EventNotMapped { device_id, event_id }.into());
            }
        };
        let collection = self.collection(cpu)?;
        let cmd = match cmd {
            EventCommand::Inv => ItsCommand::Inv {
                device_id,
                event_id,
                collection,
            },
            EventCommand::Int => ItsCommand::Int {
                device_id,
                event_id,
                collection,
            },
            EventCommand::Clear => ItsCommand::Clear {
                device_id,
                event_id,
                collection,
            },
        };
        self.queue.send_command(&cmd)?;
        Ok(())
    }

    /// VM an event is forwarded to, if any.
    pub fn forwarded_vm(&self, handle: DeviceHandle, event_id: u32) -> Result<Option<u32>, RequestError> {
        Ok(match self.event_mapping(handle, event_id)? {
            EventMapping::Virtual { vm, .. } => Some(vm),
            _ => None,
        })
    }

    /// Forwards a physically translated event to virtual LPI `virt_id` of a VPE of `vm`.
    ///
    /// The first forwarding replaces the physical translation (DISCARD then VMAPTI) and
    /// returns `true`. Later calls for the same VM retarget the event with VMOVI.
    pub fn forward_event(
        &self,
        handle: DeviceHandle,
        event_id: u32,
        vm: u32,
        vpe_id: u16,
        virt_id: u32,
        doorbell: Option<u32>,
    ) -> Result<bool, ItsError> {
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        Self::check_event(handle, device, event_id)?;
        let device_id = handle.0;

        let (lpi, cpu, first) = match device.events[event_id as usize] {
            EventMapping::Unmapped => {
                return Err(RequestError::EventNotMapped { device_id, event_id }.into());
            }
            EventMapping::Physical { lpi, cpu } => (lpi, cpu, true),
            EventMapping::Virtual {
                lpi,
                cpu,
                vm: cur_vm,
                virt_id: cur_virt_id,
                ..
            } => {
                if cur_vm != vm {
                    return Err(RequestError::EventForwarded { device_id, event_id }.into());
                }
                if cur_virt_id == virt_id {
                    self.queue.send_command(&ItsCommand::Vmovi {
                        device_id,
                        event_id,
                        vpe_id,
                        doorbell,
                    })?;
                    device.events[event_id as usize] = EventMapping::Virtual {
                        lpi,
                        cpu,
                        vm,
                        vpe_id,
                        virt_id,
                        doorbell,
                    };
                    return Ok(false);
                }
                (lpi, cpu, false)
            }
        };

        self.queue.send_command(&ItsCommand::Discard {
            device_id,
            event_id,
            collection: self.collection(cpu)?,
        })?;
        device.events[event_id as usize] = EventMapping::Unmapped;
        self.queue.send_command(&ItsCommand::Vmapti {
            device_id,
            event_id,
            vpe_id,
            virt_id,
            doorbell,
        })?;
        device.events[event_id as usize] = EventMapping::Virtual {
            lpi,
            cpu,
            vm,
            vpe_id,
            virt_id,
            doorbell,
        };
        Ok(first)
    }

    /// Stops forwarding an event and restores its physical translation. Returns the LPI and
    /// the VM the event was forwarded to.
    pub fn unforward_event(&self, handle: DeviceHandle, event_id: u32) -> Result<(u32, u32), ItsError> {
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        Self::check_event(handle, device, event_id)?;
        let device_id = handle.0;

        let EventMapping::Virtual { lpi, cpu, vm, .. } = device.events[event_id as usize] else {
            return Err(RequestError::EventNotForwarded { device_id, event_id }.into());
        };
        let collection = self.collection(cpu)?;
        self.queue.send_command(&ItsCommand::Discard {
            device_id,
            event_id,
            collection,
        })?;
        device.events[event_id as usize] = EventMapping::Unmapped;
        self.queue.send_command(&ItsCommand::Mapti {
            device_id,
            event_id,
            phys_id: lpi,
            collection,
        })?;
        device.events[event_id as usize] = EventMapping::Physical { lpi, cpu };
        Ok((lpi, vm))
    }

    /// Releases `count` events starting at `event_id`, removing their translations.
    ///
    /// An exclusive device left without events is torn down; returns whether that
    /// happened.
    pub fn free_events(&self, handle: DeviceHandle, event_id: u32, count: u32) -> Result<bool, ItsError> {
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        let end = event_id.checked_add(count).unwrap_or(u32::MAX);
        if count == 0 || end > device.nr_ites {
            return Err(RequestError::UnknownEvent {
                device_id: handle.0,
                event_id: end.saturating_sub(1),
            }
            .into());
        }
        if let Some(event) = (event_id..end).find(|event| !device.is_allocated(*event)) {
            return Err(RequestError::UnknownEvent {
                device_id: handle.0,
                event_id: event,
            }
            .into());
        }
        if let Some(event) = (event_id..end)
            .find(|event| matches!(device.events[*event as usize], EventMapping::Virtual { .. }))
        {
            return Err(RequestError::EventForwarded {
                device_id: handle.0,
                event_id: event,
            }
            .into());
        }

        for event in event_id..end {
            if matches!(device.events[event as usize], EventMapping::Physical { .. }) {
                self.discard(handle, device, event)?;
            }
            device.set_allocated(event, false);
        }

        if device.allocated_events() != 0 || device.sharing != Sharing::Exclusive {
            return Ok(false);
        }
        self.teardown(&mut devices, handle)?;
        Ok(true)
    }

    /// Releases one owner of a shared device. A device left exclusive without events is
    /// torn down; returns whether that happened.
    pub fn release(&self, handle: DeviceHandle) -> Result<bool, ItsError> {
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        device.sharing = device.sharing.release();
        if device.allocated_events() != 0 || device.sharing != Sharing::Exclusive {
            return Ok(false);
        }
        self.teardown(&mut devices, handle)?;
        Ok(true)
    }

    /// Releases one owner of the device. Once no other owner remains, every translation is
    /// discarded and the device is unmapped, freeing its ITT and LPIs.
    ///
    /// Returns whether the device was torn down.
    pub fn destroy_device(&self, handle: DeviceHandle) -> Result<bool, ItsError> {
        let mut devices = extract_guard(self.devices.lock());
        let device = Self::device_mut(&mut devices, handle)?;
        if device.sharing != Sharing::Exclusive {
            device.sharing = device.sharing.release();
            return Ok(false);
        }
        if let Some(event_id) = device
            .events
            .iter()
            .position(|mapping| matches!(mapping, EventMapping::Virtual { .. }))
        {
            return Err(RequestError::EventForwarded {
                device_id: handle.0,
                event_id: event_id as u32,
            }
            .into());
        }

        for event in 0..device.nr_ites {
            if device.events[event as usize] != EventMapping::Unmapped {
                self.discard(handle, device, event)?;
            }
            device.set_allocated(event, false);
        }
        self.teardown(&mut devices, handle)?;
        Ok(true)
    }

    fn teardown(&self, devices: &mut BTreeMap<u32, ItsDevice>, handle: DeviceHandle) -> Result<(), ItsError> {
        let device = Self::device(devices, handle)?;
        self.queue.send_command(&ItsCommand::Mapd {
            device_id: handle.0,
            itt_addr: device.itt.phys(),
            nr_ites: device.nr_ites,
            valid: false,
        })?;
        if let Some(device) = devices.remove(&handle.0) {
            if let Some(range) = device.lpis {
                self.free_lpis(range);
            }
        }
        debug!("ITS: freed devID {:#x}", handle.0);
        self.metrics.devices_freed.inc();
        Ok(())
    }

    /// Every registered DeviceID.
    pub fn device_ids(&self) -> Vec<u32> {
        extract_guard(self.devices.lock()).keys().copied().collect()
    }
}
