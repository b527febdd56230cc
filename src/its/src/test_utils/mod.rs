// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

//! Software model of the GIC pieces the ITS driver talks to.

mod its;
mod memory;
mod rdist;

use std::sync::Arc;

pub use self::its::{SimIte, SimIts, SimItsConfig};
pub use self::memory::{PublishRecord, SIM_DRAM_BASE, SIM_POISON, SimMemory};
pub use self::rdist::{DirectLpiOp, SIM_RDIST_BASE, SIM_RDIST_STRIDE, SimRedistributors};
use crate::config::ItsConfig;
use crate::hw::{DmaMemory, ItsMmio, Redistributors};
use crate::{ItsError, ItsRuntime};

/// Distance between the register frames of two simulated ITSs.
pub const SIM_ITS_STRIDE: u64 = 0x2_0000;

/// A configuration that polls quickly, so that timeouts are hit fast in tests.
pub fn test_config() -> ItsConfig {
    ItsConfig {
        cmd_queue_size: 0x2000,
        poll_iterations: 1000,
        poll_delay_us: 0,
        ..Default::default()
    }
}

/// Memory, redistributors and ITSs of a simulated system.
#[derive(Debug)]
pub struct SimPlatform {
    pub memory: Arc<SimMemory>,
    pub rdists: Arc<SimRedistributors>,
    pub its: Vec<Arc<SimIts>>,
}

#[derive(Debug)]
pub struct SimPlatformBuilder {
    nr_cpus: usize,
    direct_lpi: bool,
    coherent: bool,
    offline: Vec<usize>,
    its: Vec<SimItsConfig>,
}

impl SimPlatformBuilder {
    pub fn nr_cpus(mut self, nr_cpus: usize) -> Self {
        self.nr_cpus = nr_cpus;
        self
    }

    pub fn direct_lpi(mut self, direct_lpi: bool) -> Self {
        self.direct_lpi = direct_lpi;
        self
    }

    pub fn coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    pub fn offline(mut self, cpu: usize) -> Self {
        self.offline.push(cpu);
        self
    }

    /// Adds an ITS. Frames are laid out one after the other from the first ITS's base.
    pub fn its(mut self, config: SimItsConfig) -> Self {
        self.its.push(config);
        self
    }

    pub fn build(self) -> SimPlatform {
        let mut configs = self.its;
        if configs.is_empty() {
            configs.push(SimItsConfig::default());
        }
        let coherent = self.coherent && configs.iter().all(|config| config.shareable);
        let memory = Arc::new(SimMemory::new(coherent));
        let rdists = Arc::new(SimRedistributors::new(
            self.nr_cpus,
            self.direct_lpi,
            coherent,
        ));
        for cpu in self.offline {
            rdists.set_online(cpu, false);
        }
        let its = configs
            .into_iter()
            .enumerate()
            .map(|(idx, mut config)| {
                config.phys_base += idx as u64 * SIM_ITS_STRIDE;
                Arc::new(SimIts::new(config, memory.clone()))
            })
            .collect();
        SimPlatform {
            memory,
            rdists,
            its,
        }
    }
}

impl SimPlatform {
    pub fn builder() -> SimPlatformBuilder {
        SimPlatformBuilder {
            nr_cpus: 4,
            direct_lpi: false,
            coherent: true,
            offline: Vec::new(),
            its: Vec::new(),
        }
    }

    pub fn dma(&self) -> Arc<dyn DmaMemory> {
        self.memory.clone()
    }

    pub fn frames(&self) -> Vec<Arc<dyn ItsMmio>> {
        self.its
            .iter()
            .map(|its| its.clone() as Arc<dyn ItsMmio>)
            .collect()
    }

    /// Brings up the driver on the platform with [`test_config`].
    pub fn runtime(&self) -> Result<ItsRuntime, ItsError> {
        self.runtime_with(test_config())
    }

    pub fn runtime_with(&self, config: ItsConfig) -> Result<ItsRuntime, ItsError> {
        let rdists: Arc<dyn Redistributors> = self.rdists.clone();
        ItsRuntime::new(config, self.dma(), rdists, self.frames())
    }

    /// Command errors reported by any ITS.
    pub fn errors(&self) -> Vec<String> {
        self.its.iter().flat_map(|its| its.errors()).collect()
    }
}
