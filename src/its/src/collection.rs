// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-CPU interrupt collections.

use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::cmd::{CommandQueue, ItsCommand};
use crate::hw::Redistributors;
use crate::logger::{debug, extract_guard};
use crate::{ItsError, RequestError};

/// A collection: the unit of LPI routing to one redistributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Collection {
    /// Collection ID, equal to the CPU index.
    pub col_id: u16,
    /// Redistributor target address: a physical address or a processor number shifted left
    /// by 16, depending on GITS_TYPER.PTA. Bits [15:0] are always clear.
    pub target_address: u64,
}

impl Collection {
    /// Whether the target address is well formed.
    pub fn is_valid(&self) -> bool {
        self.target_address & 0xffff == 0
    }
}

/// The collections of one ITS, one per CPU.
#[derive(Debug)]
pub struct CollectionManager {
    rdists: Arc<dyn Redistributors>,
    pta: bool,
    collections: RwLock<Vec<Option<Collection>>>,
}

impl CollectionManager {
    /// Creates a manager with no collection mapped yet.
    pub fn new(rdists: Arc<dyn Redistributors>, pta: bool) -> Self {
        let nr_cpus = rdists.nr_cpus();
        CollectionManager {
            rdists,
            pta,
            collections: RwLock::new(vec![None; nr_cpus]),
        }
    }

    /// Target address of the redistributor of `cpu`.
    pub fn target_address(&self, cpu: usize) -> u64 {
        if self.pta {
            self.rdists.phys_base(cpu)
        } else {
            u64::from(self.rdists.processor_number(cpu)) << 16
        }
    }

    /// Maps the collection of `cpu` and invalidates whatever the ITS cached for it.
    pub fn init_cpu(&self, cpu: usize, queue: &CommandQueue) -> Result<Collection, ItsError> {
        if cpu >= self.rdists.nr_cpus() {
            return Err(RequestError::UnknownCpu(cpu).into());
        }
        let collection = Collection {
            col_id: u16::try_from(cpu).map_err(|_| RequestError::UnknownCpu(cpu))?,
            target_address: self.target_address(cpu),
        };
        if !collection.is_valid() {
            return Err(RequestError::InvalidTarget(collection.target_address).into());
        }

        queue.send_command(&ItsCommand::Mapc {
            collection,
            valid: true,
        })?;
        queue.send_command(&ItsCommand::Invall { collection })?;
        extract_guard(self.collections.write())[cpu] = Some(collection);
        debug!("ITS: CPU{cpu}: mapped collection {:#x}", collection.target_address);
        Ok(collection)
    }

    /// Collection of `cpu`, if it has been mapped.
    pub fn get(&self, cpu: usize) -> Result<Collection, RequestError> {
        extract_guard(self.collections.read())
            .get(cpu)
            .copied()
            .flatten()
            .ok_or(RequestError::UnknownCpu(cpu))
    }

    /// Lowest CPU whose collection is mapped.
    pub fn first_mapped(&self) -> Option<usize> {
        extract_guard(self.collections.read())
            .iter()
            .position(Option::is_some)
    }

    /// First CPU of `candidates` whose collection is mapped.
    pub fn select(&self, candidates: &[usize]) -> Option<usize> {
        let collections = extract_guard(self.collections.read());
        candidates
            .iter()
            .copied()
            .find(|cpu| matches!(collections.get(*cpu), Some(Some(_))))
    }
}
