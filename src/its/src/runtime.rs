// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::config::ItsConfig;
use crate::controller::ItsController;
use crate::domain::ItsMsiDomain;
use crate::hw::{DmaMemory, ItsMmio, Redistributors};
use crate::logger::{debug, info};
use crate::lpi::{LpiAllocator, PropTable};
use crate::virt::VirtManager;
use crate::{ItsError, RequestError};

/// Every ITS of the system, with the LPI space, the LPI property table and the virtual
/// LPI support they share.
#[derive(Debug)]
pub struct ItsRuntime {
    config: ItsConfig,
    rdists: Arc<dyn Redistributors>,
    lpis: Arc<LpiAllocator>,
    prop: Arc<PropTable>,
    controllers: Vec<Arc<ItsController>>,
    domains: Vec<ItsMsiDomain>,
    virt: Option<VirtManager>,
}

impl ItsRuntime {
    /// Probes and enables one controller per register frame, then maps the collections of
    /// every online CPU.
    ///
    /// Any controller failing to come up fails the whole runtime.
    pub fn new(
        config: ItsConfig,
        memory: Arc<dyn DmaMemory>,
        rdists: Arc<dyn Redistributors>,
        frames: Vec<Arc<dyn ItsMmio>>,
    ) -> Result<Self, ItsError> {
        config.validate()?;
        let lpis = Arc::new(LpiAllocator::new(config.lpi_id_bits, config.nr_lpis)?);
        let prop = Arc::new(PropTable::new(
            &memory,
            config.lpi_id_bits,
            rdists.is_coherent(),
        )?);

        let mut its_list_map = 0u16;
        let mut controllers = Vec::with_capacity(frames.len());
        for (index, mmio) in frames.into_iter().enumerate() {
            let its = ItsController::probe(
                index,
                mmio,
                memory.clone(),
                rdists.clone(),
                lpis.clone(),
                &config,
                &mut its_list_map,
            )?;
            controllers.push(Arc::new(its));
        }

        let online: Vec<usize> = (0..rdists.nr_cpus())
            .filter(|cpu| rdists.is_online(*cpu))
            .collect();
        for its in &controllers {
            for cpu in &online {
                its.init_cpu(*cpu)?;
            }
        }

        let domains = controllers
            .iter()
            .map(|its| {
                ItsMsiDomain::new(
                    its.clone(),
                    prop.clone(),
                    rdists.clone(),
                    config.backoff(),
                )
            })
            .collect();
        let virt = if controllers.iter().any(|its| its.is_v4()) {
            Some(VirtManager::new(
                controllers.clone(),
                prop.clone(),
                lpis.clone(),
                rdists.clone(),
                memory,
                &config,
            )?)
        } else {
            None
        };
        info!(
            "ITS: {} controller(s), {} LPIs, {} CPU(s) online",
            controllers.len(),
            lpis.free_count(),
            online.len()
        );

        Ok(ItsRuntime {
            config,
            rdists,
            lpis,
            prop,
            controllers,
            domains,
            virt,
        })
    }

    /// Configuration the runtime was built with.
    pub fn config(&self) -> &ItsConfig {
        &self.config
    }

    /// Controller `index`, in frame order.
    pub fn controller(&self, index: usize) -> Option<&Arc<ItsController>> {
        self.controllers.get(index)
    }

    /// Every controller, in frame order.
    pub fn controllers(&self) -> &[Arc<ItsController>] {
        &self.controllers
    }

    /// MSI domain of controller `index`.
    pub fn domain(&self, index: usize) -> Option<&ItsMsiDomain> {
        self.domains.get(index)
    }

    /// Virtual LPI support, present when at least one controller is a GICv4 ITS.
    pub fn virt(&self) -> Option<&VirtManager> {
        self.virt.as_ref()
    }

    /// The LPI space shared by every controller.
    pub fn lpi_allocator(&self) -> &LpiAllocator {
        &self.lpis
    }

    /// The LPI property table.
    pub fn prop_table(&self) -> &PropTable {
        &self.prop
    }

    /// Maps the collection of `cpu` on every controller, once the CPU is online.
    pub fn cpu_online(&self, cpu: usize) -> Result<(), ItsError> {
        if cpu >= self.rdists.nr_cpus() {
            return Err(RequestError::UnknownCpu(cpu).into());
        }
        for its in &self.controllers {
            its.init_cpu(cpu)?;
        }
        debug!("ITS: CPU{cpu} online");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Opcode;
    use crate::config::ConfigError;
    use crate::test_utils::{SimItsConfig, SimPlatform, test_config};

    #[test]
    fn test_runtime_brings_up_every_cpu() {
        let platform = SimPlatform::builder()
            .nr_cpus(3)
            .offline(2)
            .its(SimItsConfig::default())
            .its(SimItsConfig::default())
            .build();
        let runtime = platform.runtime().unwrap();
        assert_eq!(runtime.controllers().len(), 2);
        assert!(runtime.virt().is_none());
        for its in &platform.its {
            assert_eq!(its.commands_with(Opcode::Mapc).len(), 2);
            assert_eq!(its.collection_target(2), None);
        }

        platform.rdists.set_online(2, true);
        runtime.cpu_online(2).unwrap();
        assert!(platform.its.iter().all(|its| its.collection_target(2) == Some(2 << 16)));
        assert!(matches!(
            runtime.cpu_online(3),
            Err(ItsError::InvalidRequest(RequestError::UnknownCpu(3)))
        ));
    }

    #[test]
    fn test_runtime_rejects_config() {
        let platform = SimPlatform::builder().build();
        let config = ItsConfig {
            lpi_id_bits: 20,
            ..test_config()
        };
        assert!(matches!(
            platform.runtime_with(config),
            Err(ItsError::Config(ConfigError::InvalidLpiIdBits(20)))
        ));
    }

    #[test]
    fn test_restricted_lpis() {
        let platform = SimPlatform::builder().build();
        let config = ItsConfig {
            nr_lpis: Some(1024),
            ..test_config()
        };
        let runtime = platform.runtime_with(config).unwrap();
        assert_eq!(runtime.lpi_allocator().free_count(), 1024);
    }
}
