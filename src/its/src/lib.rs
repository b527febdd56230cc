// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver core for the GICv3/GICv4.0 Interrupt Translation Service.
//!
//! The crate turns MSI writes from devices into LPIs routed to CPUs, and forwards them as
//! virtual LPIs to the VPEs of virtual machines. Hardware is reached exclusively through the
//! traits of [`hw`]; [`ItsRuntime`] owns every controller and the state they share.

#![deny(missing_docs)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![allow(clippy::blanket_clippy_restriction_lints)]

/// Command encodings and the command queue.
pub mod cmd;
/// Per-CPU collections.
pub mod collection;
/// Driver configuration.
pub mod config;
/// One ITS instance.
pub mod controller;
/// Devices and their interrupt translation tables.
pub mod device;
/// Operations of the ITS MSI interrupt domain.
pub mod domain;
/// Hardware interfaces.
pub mod hw;
/// Logging and metrics.
pub mod logger;
/// LPI allocation and configuration.
pub mod lpi;
/// Context object owning every controller.
pub mod runtime;
/// Translation tables.
pub mod tables;
/// Software model of the hardware, used by tests.
pub mod test_utils;
/// Helpers shared by the whole crate.
pub mod utils;
/// GICv4 virtual LPI support.
pub mod virt;

pub use crate::config::{ConfigError, ItsConfig};
pub use crate::controller::{ItsController, ProbeError};
pub use crate::domain::{ItsMsiDomain, MsiMessage};
pub use crate::runtime::ItsRuntime;
pub use crate::virt::{PendingState, VirtManager, VmHandle, VpeHandle};

use crate::cmd::QueueError;
use crate::hw::DmaError;
use crate::lpi::LpiError;
use crate::tables::TableError;
use crate::utils::Timeout;

/// Requests rejected before any hardware access.
#[derive(Debug, Clone, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum RequestError {
    /// CPU {0} has no collection
    UnknownCpu(usize),
    /// Redistributor target address {0:#x} is not 64K aligned
    InvalidTarget(u64),
    /// No ITS with index {0}
    UnknownIts(usize),
    /// Device {0:#x} is not known to this ITS
    UnknownDevice(u32),
    /// Device {0:#x} already exists
    DeviceExists(u32),
    /// DeviceID {0:#x} is out of the range of this ITS
    DeviceIdOutOfRange(u32),
    /// Invalid number of events {0}
    InvalidEventCount(u32),
    /// Event {event_id} of device {device_id:#x} is not allocated
    UnknownEvent {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
    },
    /// Event {event_id} of device {device_id:#x} is not mapped
    EventNotMapped {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
    },
    /// Event {event_id} of device {device_id:#x} is forwarded to a VM
    EventForwarded {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
    },
    /// Event {event_id} of device {device_id:#x} is not forwarded to a VM
    EventNotForwarded {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
    },
    /// Device {0:#x} has no LPI range
    NoLpis(u32),
    /// Interrupt {0} is not allocated in this domain
    UnknownIrq(u32),
    /// Interrupt {0} is already allocated
    IrqInUse(u32),
    /// None of the requested CPUs has a collection
    NoTargetCpu,
    /// No ITS supports virtual LPIs
    VirtualUnsupported,
    /// ITS {0} does not support virtual LPIs
    NotVirtual(usize),
    /// VM {0} is not registered
    UnknownVm(u32),
    /// VM {vm} has no VPE {index}
    UnknownVpe {
        /// VM ID.
        vm: u32,
        /// VPE index within the VM.
        index: usize,
    },
    /// VPE {0} is not mapped
    VpeNotMapped(u16),
    /// Virtual LPI {0} is outside the LPI space of the VM
    InvalidVintid(u32),
    /// VM {0} still has interrupts forwarded to it
    VmBusy(u32),
    /// A VM needs at least one VPE
    NoVpes,
}

/// Coarse classification of [`ItsError`], for callers that only need to decide how to
/// react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An ID space (LPIs, table entries, VPE IDs) has no room left.
    Exhausted,
    /// A command queue stopped draining. The controller is unusable.
    QueueStall,
    /// The hardware refused a register value.
    HardwareRejected,
    /// A bounded wait expired.
    Timeout,
    /// The caller passed an invalid argument. Nothing was sent to the hardware.
    InvalidRequest,
    /// Memory shared with the GIC could not be allocated.
    OutOfMemory,
}

/// Errors associated with the ITS driver.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ItsError {
    /// LPI allocation: {0}
    Lpi(#[from] LpiError),
    /// Command queue: {0}
    Queue(#[from] QueueError),
    /// Translation table: {0}
    Table(#[from] TableError),
    /// DMA memory: {0}
    Dma(#[from] DmaError),
    /// Configuration: {0}
    Config(#[from] ConfigError),
    /// VPE ID allocation: {0}
    VpeId(#[from] vm_allocator::Error),
    /// Polling a register: {0}
    Timeout(#[from] Timeout),
    /// Controller probe: {0}
    Probe(#[from] ProbeError),
    /// Device {device_id:#x} has no room for {count} more events
    EventsExhausted {
        /// DeviceID.
        device_id: u32,
        /// Number of events requested.
        count: u32,
    },
    /// Invalid request: {0}
    InvalidRequest(#[from] RequestError),
}

impl ItsError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ItsError::Lpi(LpiError::Exhausted(_)) => ErrorKind::Exhausted,
            ItsError::Lpi(_) => ErrorKind::InvalidRequest,
            ItsError::Queue(QueueError::QueueFull) => ErrorKind::QueueStall,
            ItsError::Queue(QueueError::Timeout(_)) | ItsError::Timeout(_) => ErrorKind::Timeout,
            ItsError::Queue(QueueError::InvalidSize(_)) => ErrorKind::InvalidRequest,
            ItsError::Queue(QueueError::Dma(_)) | ItsError::Table(TableError::Dma(_)) => {
                ErrorKind::OutOfMemory
            }
            ItsError::Dma(DmaError::OutOfMemory { .. }) => ErrorKind::OutOfMemory,
            ItsError::Dma(DmaError::InvalidRequest { .. }) => ErrorKind::InvalidRequest,
            ItsError::Table(TableError::IdOutOfRange { .. }) | ItsError::EventsExhausted { .. } => {
                ErrorKind::Exhausted
            }
            ItsError::Table(_) => ErrorKind::HardwareRejected,
            ItsError::Config(_) | ItsError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ItsError::VpeId(vm_allocator::Error::ResourceNotAvailable) => ErrorKind::Exhausted,
            ItsError::VpeId(_) => ErrorKind::InvalidRequest,
            ItsError::Probe(ProbeError::NotQuiescent(_)) => ErrorKind::Timeout,
            ItsError::Probe(_) => ErrorKind::HardwareRejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(ItsError::from(LpiError::Exhausted(4)).kind(), ErrorKind::Exhausted);
        assert_eq!(ItsError::from(QueueError::QueueFull).kind(), ErrorKind::QueueStall);
        assert_eq!(ItsError::from(QueueError::Timeout(3)).kind(), ErrorKind::Timeout);
        assert_eq!(
            ItsError::from(TableError::Rejected {
                index: 0,
                wrote: 1,
                read: 0
            })
            .kind(),
            ErrorKind::HardwareRejected
        );
        assert_eq!(
            ItsError::from(DmaError::OutOfMemory {
                size: 0x1000,
                align: 0x1000
            })
            .kind(),
            ErrorKind::OutOfMemory
        );
        assert_eq!(
            ItsError::from(RequestError::UnknownDevice(5)).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            ItsError::from(vm_allocator::Error::ResourceNotAvailable).kind(),
            ErrorKind::Exhausted
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ItsError::from(RequestError::UnknownEvent {
                device_id: 0x10,
                event_id: 3
            })
            .to_string(),
            "Invalid request: Event 3 of device 0x10 is not allocated"
        );
        assert_eq!(
            ItsError::from(QueueError::QueueFull).to_string(),
            "Command queue: ITS command queue full: the hardware did not consume commands in time"
        );
    }
}
