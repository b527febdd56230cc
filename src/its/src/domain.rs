// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The operations an MSI interrupt domain performs on an ITS.
//!
//! Interrupts are identified by the caller's virtual IRQ numbers. Each one is backed by an
//! event of a device and by the LPI the device reserved for that event.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::controller::ItsController;
use crate::device::{DeviceHandle, DeviceRegistry, EventCommand, EventMapping};
use crate::hw::regs::GICR_INVLPIR;
use crate::hw::{Redistributors, wait_for_syncr};
use crate::logger::{debug, extract_guard};
use crate::lpi::{LPI_PROP_ENABLED, PropTable};
use crate::utils::Backoff;
use crate::{ItsError, RequestError};

/// Doorbell write a device performs to raise an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MsiMessage {
    /// GITS_TRANSLATER of the ITS.
    pub address: u64,
    /// EventID.
    pub data: u32,
}

/// Makes the redistributors reload the configuration of `lpi`, translated from an event of
/// `device` and routed to `cpu`.
pub(crate) fn invalidate_lpi(
    rdists: &dyn Redistributors,
    backoff: &Backoff,
    devices: &DeviceRegistry,
    device: DeviceHandle,
    event_id: u32,
    lpi: u32,
    cpu: usize,
) -> Result<(), ItsError> {
    if rdists.has_direct_lpi() {
        rdists.write(cpu, GICR_INVLPIR, u64::from(lpi));
        wait_for_syncr(rdists, cpu, backoff)?;
        return Ok(());
    }
    devices.send_event_command(device, event_id, EventCommand::Inv)
}

#[derive(Debug, Clone, Copy)]
struct IrqEntry {
    device: DeviceHandle,
    event_id: u32,
    lpi: u32,
    // CPU requested with `set_affinity` before activation.
    affinity: Option<usize>,
    // CPU the event is translated to, once activated.
    bound: Option<usize>,
}

/// MSI domain of one ITS.
#[derive(Debug)]
pub struct ItsMsiDomain {
    its: Arc<ItsController>,
    prop: Arc<PropTable>,
    rdists: Arc<dyn Redistributors>,
    backoff: Backoff,
    irqs: Mutex<BTreeMap<u32, IrqEntry>>,
}

impl ItsMsiDomain {
    /// Creates the domain of `its`.
    pub fn new(
        its: Arc<ItsController>,
        prop: Arc<PropTable>,
        rdists: Arc<dyn Redistributors>,
        backoff: Backoff,
    ) -> Self {
        ItsMsiDomain {
            its,
            prop,
            rdists,
            backoff,
            irqs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Controller behind the domain.
    pub fn controller(&self) -> &Arc<ItsController> {
        &self.its
    }

    /// Gets device `device_id` ready for `nvec` MSIs, sharing it if it already exists.
    pub fn prepare(&self, device_id: u32, nvec: u32) -> Result<DeviceHandle, ItsError> {
        self.its.devices().prepare(device_id, nvec)
    }

    /// Gives back an owner reference taken by [`ItsMsiDomain::prepare`] on a shared device.
    ///
    /// Once a single owner is left, the device is exclusive again and goes away with its last
    /// event, right away if it has none. Returns whether the device was torn down.
    pub fn release(&self, device_id: u32) -> Result<bool, ItsError> {
        let devices = self.its.devices();
        let device = devices
            .find(device_id)
            .ok_or(RequestError::UnknownDevice(device_id))?;
        devices.release(device)
    }

    /// Backs interrupts `virq_base..virq_base + count` with consecutive events of
    /// `device_id`, and returns the LPI of the first one.
    pub fn alloc(&self, virq_base: u32, count: u32, device_id: u32) -> Result<u32, ItsError> {
        if count == 0 {
            return Err(RequestError::InvalidEventCount(count).into());
        }
        let devices = self.its.devices();
        let device = devices
            .find(device_id)
            .ok_or(RequestError::UnknownDevice(device_id))?;
        let mut irqs = extract_guard(self.irqs.lock());
        let end = virq_base
            .checked_add(count)
            .ok_or(RequestError::IrqInUse(u32::MAX))?;
        if let Some(virq) = (virq_base..end).find(|virq| irqs.contains_key(virq)) {
            return Err(RequestError::IrqInUse(virq).into());
        }

        let base = devices.alloc_events(device, count)?;
        let lpis: Result<Vec<u32>, RequestError> = (base..base + count)
            .map(|event_id| devices.event_lpi(device, event_id))
            .collect();
        let lpis = match lpis {
            Ok(lpis) => lpis,
            Err(err) => {
                devices.free_events(device, base, count)?;
                return Err(err.into());
            }
        };
        for (idx, lpi) in lpis.iter().enumerate() {
            let idx = idx as u32;
            irqs.insert(
                virq_base + idx,
                IrqEntry {
                    device,
                    event_id: base + idx,
                    lpi: *lpi,
                    affinity: None,
                    bound: None,
                },
            );
        }
        debug!(
            "ITS: ID:{device_id:#x} virq {virq_base}..{end} -> events {base}.., LPI {}",
            lpis[0]
        );
        Ok(lpis[0])
    }

    fn entry(irqs: &BTreeMap<u32, IrqEntry>, virq: u32) -> Result<IrqEntry, RequestError> {
        irqs.get(&virq).copied().ok_or(RequestError::UnknownIrq(virq))
    }

    /// Releases interrupts `virq_base..virq_base + count`. Their translations are
    /// discarded, and an exclusive device goes away with its last event.
    ///
    /// Nothing is released if any interrupt of the range is unknown or forwarded to a VM.
    pub fn free(&self, virq_base: u32, count: u32) -> Result<(), ItsError> {
        let mut irqs = extract_guard(self.irqs.lock());
        let end = virq_base.saturating_add(count);
        let devices = self.its.devices();
        for virq in virq_base..end {
            let entry = Self::entry(&irqs, virq)?;
            if let EventMapping::Virtual { .. } = devices.event_mapping(entry.device, entry.event_id)? {
                return Err(RequestError::EventForwarded {
                    device_id: entry.device.device_id(),
                    event_id: entry.event_id,
                }
                .into());
            }
        }
        for virq in virq_base..end {
            let entry = Self::entry(&irqs, virq)?;
            self.its
                .devices()
                .free_events(entry.device, entry.event_id, 1)?;
            self.prop.update(entry.lpi, LPI_PROP_ENABLED, 0);
            irqs.remove(&virq);
        }
        Ok(())
    }

    /// Translates the event of `virq` to its LPI, on the CPU requested by `set_affinity`
    /// or the first CPU with a collection.
    pub fn activate(&self, virq: u32) -> Result<(), ItsError> {
        let mut irqs = extract_guard(self.irqs.lock());
        let entry = Self::entry(&irqs, virq)?;
        if entry.bound.is_some() {
            return Ok(());
        }
        let collections = self.its.collections();
        let cpu = entry
            .affinity
            .and_then(|cpu| collections.select(&[cpu]))
            .or_else(|| collections.first_mapped())
            .ok_or(RequestError::NoTargetCpu)?;
        self.its
            .devices()
            .bind_event(entry.device, entry.event_id, entry.lpi, cpu)?;
        if let Some(entry) = irqs.get_mut(&virq) {
            entry.bound = Some(cpu);
        }
        Ok(())
    }

    /// Removes the translation of the event of `virq`.
    pub fn deactivate(&self, virq: u32) -> Result<(), ItsError> {
        let mut irqs = extract_guard(self.irqs.lock());
        let entry = Self::entry(&irqs, virq)?;
        if entry.bound.is_none() {
            return Ok(());
        }
        self.its
            .devices()
            .unbind_event(entry.device, entry.event_id)?;
        if let Some(entry) = irqs.get_mut(&virq) {
            entry.bound = None;
        }
        Ok(())
    }

    /// Routes `virq` to the first CPU of `cpus` that has a collection, and returns it.
    pub fn set_affinity(&self, virq: u32, cpus: &[usize]) -> Result<usize, ItsError> {
        let mut irqs = extract_guard(self.irqs.lock());
        let entry = Self::entry(&irqs, virq)?;
        let cpu = self
            .its
            .collections()
            .select(cpus)
            .ok_or(RequestError::NoTargetCpu)?;
        if entry.bound.is_some() {
            self.its
                .devices()
                .bind_event(entry.device, entry.event_id, entry.lpi, cpu)?;
        }
        if let Some(entry) = irqs.get_mut(&virq) {
            entry.affinity = Some(cpu);
            entry.bound = entry.bound.map(|_| cpu);
        }
        Ok(cpu)
    }

    /// MSI the device must write to raise `virq`.
    pub fn compose_message(&self, virq: u32) -> Result<MsiMessage, RequestError> {
        let irqs = extract_guard(self.irqs.lock());
        let entry = Self::entry(&irqs, virq)?;
        Ok(MsiMessage {
            address: self.its.msi_address(),
            data: entry.event_id,
        })
    }

    /// LPI backing `virq`.
    pub fn lpi(&self, virq: u32) -> Result<u32, RequestError> {
        let irqs = extract_guard(self.irqs.lock());
        Ok(Self::entry(&irqs, virq)?.lpi)
    }

    fn set_enabled(&self, virq: u32, enable: bool) -> Result<(), ItsError> {
        let irqs = extract_guard(self.irqs.lock());
        let entry = Self::entry(&irqs, virq)?;
        let devices = self.its.devices();
        if let EventMapping::Virtual { .. } = devices.event_mapping(entry.device, entry.event_id)? {
            return Err(RequestError::EventForwarded {
                device_id: entry.device.device_id(),
                event_id: entry.event_id,
            }
            .into());
        }
        let set = if enable { LPI_PROP_ENABLED } else { 0 };
        self.prop.update(entry.lpi, LPI_PROP_ENABLED, set);
        // An untranslated LPI has nothing cached.
        let Some(cpu) = entry.bound else {
            return Ok(());
        };
        invalidate_lpi(
            self.rdists.as_ref(),
            &self.backoff,
            devices,
            entry.device,
            entry.event_id,
            entry.lpi,
            cpu,
        )
    }

    /// Disables the LPI of `virq`.
    pub fn mask(&self, virq: u32) -> Result<(), ItsError> {
        self.set_enabled(virq, false)
    }

    /// Enables the LPI of `virq`.
    pub fn unmask(&self, virq: u32) -> Result<(), ItsError> {
        self.set_enabled(virq, true)
    }

    /// Makes `virq` pending (INT) or clears it (CLEAR).
    pub fn set_pending(&self, virq: u32, pending: bool) -> Result<(), ItsError> {
        let entry = {
            let irqs = extract_guard(self.irqs.lock());
            Self::entry(&irqs, virq)?
        };
        let cmd = if pending {
            EventCommand::Int
        } else {
            EventCommand::Clear
        };
        self.its
            .devices()
            .send_event_command(entry.device, entry.event_id, cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Opcode;
    use crate::hw::regs::GITS_TRANSLATER;
    use crate::device::Sharing;
    use crate::test_utils::{DirectLpiOp, SimIte, SimItsConfig, SimPlatform};

    #[test]
    fn test_alloc_activate_free() {
        let platform = SimPlatform::builder().build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        let its = &platform.its[0];
        let free = runtime.lpi_allocator().free_count();

        domain.prepare(0x10, 4).unwrap();
        let lpi = domain.alloc(100, 4, 0x10).unwrap();
        assert_eq!(domain.lpi(103).unwrap(), lpi + 3);
        assert_eq!(
            domain.compose_message(101).unwrap(),
            MsiMessage {
                address: 0x0808_0000 + GITS_TRANSLATER,
                data: 1
            }
        );
        assert!(matches!(
            domain.alloc(103, 2, 0x10),
            Err(ItsError::InvalidRequest(RequestError::IrqInUse(103)))
        ));
        assert!(matches!(
            domain.alloc(200, 1, 0x11),
            Err(ItsError::InvalidRequest(RequestError::UnknownDevice(0x11)))
        ));
        // Nothing is translated before activation.
        assert_eq!(its.ite(0x10, 0), None);

        domain.activate(100).unwrap();
        domain.activate(100).unwrap();
        assert_eq!(its.commands_with(Opcode::Mapti).len(), 1);
        assert_eq!(its.ite(0x10, 0), Some(SimIte::Physical { lpi, collection: 0 }));

        assert_eq!(domain.set_affinity(100, &[2, 3]).unwrap(), 2);
        assert_eq!(its.commands_with(Opcode::Movi).len(), 1);
        assert_eq!(its.ite(0x10, 0), Some(SimIte::Physical { lpi, collection: 2 }));

        // Affinity set before activation is honored without MOVI.
        assert_eq!(domain.set_affinity(101, &[3]).unwrap(), 3);
        domain.activate(101).unwrap();
        assert_eq!(its.commands_with(Opcode::Movi).len(), 1);
        assert_eq!(
            its.ite(0x10, 1),
            Some(SimIte::Physical {
                lpi: lpi + 1,
                collection: 3
            })
        );

        domain.deactivate(101).unwrap();
        assert_eq!(its.ite(0x10, 1), None);
        domain.free(100, 4).unwrap();
        assert_eq!(its.device(0x10), None);
        assert_eq!(runtime.lpi_allocator().free_count(), free);
        assert!(matches!(
            domain.compose_message(100),
            Err(RequestError::UnknownIrq(100))
        ));
        assert!(platform.errors().is_empty());
    }

    #[test]
    fn test_partial_free_keeps_device() {
        let platform = SimPlatform::builder().build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();

        domain.prepare(0x10, 2).unwrap();
        domain.alloc(1, 2, 0x10).unwrap();
        domain.activate(2).unwrap();
        domain.free(1, 1).unwrap();
        assert!(platform.its[0].device(0x10).is_some());
        assert!(matches!(
            domain.free(1, 2),
            Err(ItsError::InvalidRequest(RequestError::UnknownIrq(1)))
        ));
        domain.free(2, 1).unwrap();
        assert!(platform.its[0].device(0x10).is_none());
        assert!(platform.errors().is_empty());
    }

    #[test]
    fn test_shared_device_released() {
        let platform = SimPlatform::builder().build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        let devices = runtime.controller(0).unwrap().devices();
        let free = runtime.lpi_allocator().free_count();

        let dev = domain.prepare(0x10, 4).unwrap();
        domain.prepare(0x10, 4).unwrap();
        domain.alloc(0, 2, 0x10).unwrap();
        domain.alloc(2, 2, 0x10).unwrap();
        domain.free(0, 2).unwrap();
        domain.free(2, 2).unwrap();
        // Still held by both requesters.
        assert_eq!(devices.info(dev).unwrap().sharing, Sharing::Shared(2));
        assert!(platform.its[0].device(0x10).is_some());

        assert!(domain.release(0x10).unwrap());
        assert!(platform.its[0].device(0x10).is_none());
        assert_eq!(devices.find(0x10), None);
        assert_eq!(runtime.lpi_allocator().free_count(), free);
        assert!(matches!(
            domain.release(0x10),
            Err(ItsError::InvalidRequest(RequestError::UnknownDevice(0x10)))
        ));

        // Released before the remaining owner frees its interrupts.
        domain.prepare(0x20, 2).unwrap();
        domain.prepare(0x20, 2).unwrap();
        domain.alloc(0, 1, 0x20).unwrap();
        domain.alloc(1, 1, 0x20).unwrap();
        domain.free(0, 1).unwrap();
        assert!(!domain.release(0x20).unwrap());
        assert!(platform.its[0].device(0x20).is_some());
        domain.free(1, 1).unwrap();
        assert!(platform.its[0].device(0x20).is_none());
        assert_eq!(runtime.lpi_allocator().free_count(), free);
        assert!(platform.errors().is_empty());
    }

    #[test]
    fn test_free_rejects_forwarded_range() {
        let platform = SimPlatform::builder()
            .direct_lpi(true)
            .its(SimItsConfig {
                virtual_lpis: true,
                vmovp: true,
                ..Default::default()
            })
            .build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        let virt = runtime.virt().unwrap();
        domain.prepare(0x10, 2).unwrap();
        let lpi = domain.alloc(0, 2, 0x10).unwrap();
        domain.activate(0).unwrap();
        domain.activate(1).unwrap();
        let vm = virt.register_vm(1).unwrap();
        virt.map_vpe(vm.vpe(0), true).unwrap();
        virt.map_vlpi(0, 0x10, 1, vm.vpe(0), 8200, false).unwrap();
        let discards = platform.its[0].commands_with(Opcode::Discard).len();

        assert!(matches!(
            domain.free(0, 2),
            Err(ItsError::InvalidRequest(RequestError::EventForwarded {
                device_id: 0x10,
                event_id: 1
            }))
        ));
        // The first interrupt of the range was left alone.
        assert_eq!(domain.lpi(0).unwrap(), lpi);
        assert_eq!(
            platform.its[0].ite(0x10, 0),
            Some(SimIte::Physical { lpi, collection: 0 })
        );
        assert_eq!(
            platform.its[0].commands_with(Opcode::Discard).len(),
            discards
        );
    }

    #[test]
    fn test_mask_with_commands() {
        let platform = SimPlatform::builder().build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        domain.prepare(0x10, 1).unwrap();
        let lpi = domain.alloc(0, 1, 0x10).unwrap();

        // Inactive: only the property byte changes.
        domain.unmask(0).unwrap();
        assert!(platform.its[0].commands_with(Opcode::Inv).is_empty());
        assert_eq!(
            runtime.prop_table().get(lpi).unwrap() & LPI_PROP_ENABLED,
            LPI_PROP_ENABLED
        );

        domain.activate(0).unwrap();
        domain.mask(0).unwrap();
        assert_eq!(platform.its[0].commands_with(Opcode::Inv).len(), 1);
        assert_eq!(runtime.prop_table().get(lpi).unwrap() & LPI_PROP_ENABLED, 0);
        assert!(platform.rdists.ops().is_empty());
    }

    #[test]
    fn test_mask_with_direct_lpi() {
        let platform = SimPlatform::builder().direct_lpi(true).build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        domain.prepare(0x10, 1).unwrap();
        let lpi = domain.alloc(0, 1, 0x10).unwrap();
        domain.set_affinity(0, &[1]).unwrap();
        domain.activate(0).unwrap();

        domain.unmask(0).unwrap();
        assert_eq!(platform.rdists.ops(), vec![DirectLpiOp::Inv { cpu: 1, lpi }]);
        assert!(platform.its[0].commands_with(Opcode::Inv).is_empty());
    }

    #[test]
    fn test_set_pending() {
        let platform = SimPlatform::builder().build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        domain.prepare(0x10, 1).unwrap();
        let lpi = domain.alloc(0, 1, 0x10).unwrap();

        assert!(matches!(
            domain.set_pending(0, true),
            Err(ItsError::InvalidRequest(RequestError::EventNotMapped { .. }))
        ));
        domain.activate(0).unwrap();
        domain.set_pending(0, true).unwrap();
        assert_eq!(platform.its[0].pending_lpis(), vec![lpi]);
        domain.set_pending(0, false).unwrap();
        assert!(platform.its[0].pending_lpis().is_empty());
    }

    #[test]
    fn test_no_target_cpu() {
        let platform = SimPlatform::builder().nr_cpus(2).offline(1).build();
        let runtime = platform.runtime().unwrap();
        let domain = runtime.domain(0).unwrap();
        domain.prepare(0x10, 1).unwrap();
        domain.alloc(0, 1, 0x10).unwrap();
        assert!(matches!(
            domain.set_affinity(0, &[1]),
            Err(ItsError::InvalidRequest(RequestError::NoTargetCpu))
        ));
    }
}
