// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Doorbell proxy device.
//!
//! Without direct LPI support in the redistributors, the only way to invalidate, raise or
//! clear a doorbell is to send a command about an event translated to it. The proxy is a
//! device with one event per slot; VPEs borrow a slot on demand and lose it when another
//! VPE needs it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use super::Vpe;
use crate::ItsError;
use crate::controller::ItsController;
use crate::device::{DeviceHandle, EventCommand};
use crate::logger::{IncMetric, debug, extract_guard};

#[derive(Debug)]
struct ProxyState {
    vpes: Vec<Option<Arc<Vpe>>>,
    next_victim: usize,
}

#[derive(Debug)]
pub(crate) struct DoorbellProxy {
    its: Arc<ItsController>,
    device: DeviceHandle,
    state: Mutex<ProxyState>,
}

impl DoorbellProxy {
    /// Creates the proxy device on `its`, with the last DeviceID and one slot per CPU
    /// rounded up to a power of two.
    pub(crate) fn new(its: Arc<ItsController>, nr_cpus: usize) -> Result<Self, ItsError> {
        let devices = its.devices();
        let device_id = devices.max_device_id();
        let slots = u32::try_from(nr_cpus.max(1).next_power_of_two()).unwrap_or(u32::MAX);
        let device = devices.create_device(device_id, slots, false)?;
        // The proxy hands out its events itself.
        devices.alloc_events(device, slots)?;
        debug!("ITS: Allocated DevID {device_id:#x} as GICv4 proxy device ({slots} slots)");
        Ok(DoorbellProxy {
            its,
            device,
            state: Mutex::new(ProxyState {
                vpes: vec![None; slots as usize],
                next_victim: 0,
            }),
        })
    }

    /// DeviceID of the proxy device.
    pub(crate) fn device_id(&self) -> u32 {
        self.device.device_id()
    }

    fn event_of(vpe: &Vpe) -> Option<u32> {
        u32::try_from(vpe.proxy_event.load(Ordering::Acquire)).ok()
    }

    // Gives `vpe` a slot, evicting the VPE holding the next one in round-robin order.
    fn map_locked(&self, state: &mut ProxyState, vpe: &Arc<Vpe>) -> Result<u32, ItsError> {
        if let Some(event) = Self::event_of(vpe) {
            return Ok(event);
        }
        let slot = state.next_victim;
        // Slots are bounded by the EventID space.
        let event = slot as u32;
        if let Some(victim) = state.vpes[slot].take() {
            if let Err(err) = self.its.devices().unbind_event(self.device, event) {
                state.vpes[slot] = Some(victim);
                return Err(err);
            }
            victim.proxy_event.store(-1, Ordering::Release);
            self.its.metrics().proxy_evictions.inc();
            debug!("ITS: proxy slot {slot} taken from VPE {}", victim.vpe_id);
        }

        self.its
            .devices()
            .bind_event(self.device, event, vpe.doorbell, vpe.cpu())?;
        state.vpes[slot] = Some(vpe.clone());
        vpe.proxy_event.store(slot as i32, Ordering::Release);
        state.next_victim = (slot + 1) % state.vpes.len();
        Ok(event)
    }

    /// Releases the slot of `vpe`, if it holds one.
    pub(crate) fn unmap(&self, vpe: &Vpe) -> Result<(), ItsError> {
        let mut state = extract_guard(self.state.lock());
        let Some(event) = Self::event_of(vpe) else {
            return Ok(());
        };
        self.its.devices().unbind_event(self.device, event)?;
        state.vpes[event as usize] = None;
        vpe.proxy_event.store(-1, Ordering::Release);
        Ok(())
    }

    /// Routes the doorbell of `vpe` to `cpu`.
    pub(crate) fn move_doorbell(&self, vpe: &Arc<Vpe>, cpu: usize) -> Result<(), ItsError> {
        let mut state = extract_guard(self.state.lock());
        let event = self.map_locked(&mut state, vpe)?;
        self.its
            .devices()
            .bind_event(self.device, event, vpe.doorbell, cpu)
    }

    /// Sends `cmd` for the doorbell of `vpe`.
    pub(crate) fn send(&self, vpe: &Arc<Vpe>, cmd: EventCommand) -> Result<(), ItsError> {
        let mut state = extract_guard(self.state.lock());
        let event = self.map_locked(&mut state, vpe)?;
        self.its
            .devices()
            .send_event_command(self.device, event, cmd)
    }
}
