// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory backing the ITS translation tables described by GITS_BASER<n>.

use std::sync::{Arc, Mutex};

use crate::hw::regs::*;
use crate::hw::{DmaBuffer, DmaError, DmaMemory, ItsMmio};
use crate::logger::{IncMetric, ItsMetrics, debug, error, extract_guard, info, warn};

// Bound on BASER renegotiations; each retry changes one attribute for good.
const MAX_BASER_ATTEMPTS: usize = 8;

/// Errors associated with the ITS tables.
#[derive(Debug, Clone, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum TableError {
    /// No GITS_BASER register describes a {0:?} table
    NoSuchTable(BaserType),
    /// GITS_BASER{0} accepts none of the 4K, 16K and 64K page sizes
    PageSizeUnsupported(usize),
    /// GITS_BASER{index} doesn't stick: wrote {wrote:#x}, read back {read:#x}
    Rejected {
        /// Register index.
        index: usize,
        /// Value written.
        wrote: u64,
        /// Value read back.
        read: u64,
    },
    /// ID {id} is out of the range of the {kind:?} table
    IdOutOfRange {
        /// Table type.
        kind: BaserType,
        /// Offending ID.
        id: u32,
    },
    /// Cannot allocate table memory: {0}
    Dma(#[from] DmaError),
}

/// Index of a table within its [`TableManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHandle(usize);

/// One table, flat or two-level.
#[derive(Debug)]
pub struct ItsTable {
    index: usize,
    kind: BaserType,
    base: DmaBuffer,
    psz: ItsPageSize,
    esz: usize,
    indirect: bool,
    // IDs the table translates once fully populated.
    nr_ids: usize,
    val: u64,
    lvl2: Mutex<Vec<Option<DmaBuffer>>>,
}

impl ItsTable {
    /// GITS_BASER<n> index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Table type.
    pub fn kind(&self) -> BaserType {
        self.kind
    }

    /// Page size negotiated with the hardware.
    pub fn page_size(&self) -> ItsPageSize {
        self.psz
    }

    /// Size of one hardware entry.
    pub fn entry_size(&self) -> usize {
        self.esz
    }

    /// Whether the table has two levels.
    pub fn is_indirect(&self) -> bool {
        self.indirect
    }

    /// Number of ID bits the table covers once allocated in full.
    pub fn id_bits(&self) -> u32 {
        self.nr_ids.ilog2()
    }

    /// Final GITS_BASER<n> value.
    pub fn baser(&self) -> u64 {
        self.val
    }

    /// Physical address of the (first level) table.
    pub fn base_phys(&self) -> u64 {
        self.base.phys()
    }

    /// Size of the (first level) table in bytes.
    pub fn size(&self) -> usize {
        self.base.size()
    }

    /// Whether the ITS accesses the table coherently with the CPU caches.
    pub fn is_coherent(&self) -> bool {
        self.val & GITS_BASER_SHAREABILITY_MASK != 0
    }

    /// Number of second-level pages allocated so far.
    pub fn lvl2_pages(&self) -> usize {
        extract_guard(self.lvl2.lock()).iter().flatten().count()
    }

    // Number of entries held by a single second-level page.
    fn ids_per_page(&self) -> u32 {
        (self.psz.bytes() / self.esz).ilog2()
    }

    fn ensure_entry(&self, id: u32, metrics: &ItsMetrics) -> Result<(), TableError> {
        let out_of_range = TableError::IdOutOfRange {
            kind: self.kind,
            id,
        };

        if id as usize >= self.nr_ids {
            return Err(out_of_range);
        }
        if !self.indirect {
            return Ok(());
        }

        let idx = (id >> self.ids_per_page()) as usize;
        let mut lvl2 = extract_guard(self.lvl2.lock());
        if lvl2[idx].is_some() {
            return Ok(());
        }

        // Second-level page: clear it and make it visible before publishing it.
        let memory = self.base.memory();
        let page = DmaBuffer::new(memory, self.psz.bytes(), self.psz.bytes())?;
        page.zero();
        if !self.is_coherent() {
            page.flush();
        }
        let offset = idx * GITS_LVL1_ENTRY_SIZE;
        self.base.write_u64(offset, page.phys() | GITS_LVL1_ENTRY_VALID);
        if !self.is_coherent() {
            self.base.flush_range(offset, GITS_LVL1_ENTRY_SIZE);
        }
        memory.full_barrier();

        debug!("ITS: {} L2 page for ID {id} at {:#x}", self.kind.name(), page.phys());
        lvl2[idx] = Some(page);
        metrics.table_pages.inc();
        Ok(())
    }
}

/// The translation tables of one ITS.
#[derive(Debug)]
pub struct TableManager {
    mmio: Arc<dyn ItsMmio>,
    memory: Arc<dyn DmaMemory>,
    metrics: Arc<ItsMetrics>,
    tables: Vec<ItsTable>,
    // Cacheability and shareability that stuck for the previous table, tried first for the
    // next one.
    cache: u64,
    shr: u64,
}

impl TableManager {
    /// Creates a manager with no table allocated.
    pub fn new(mmio: Arc<dyn ItsMmio>, memory: Arc<dyn DmaMemory>, metrics: Arc<ItsMetrics>) -> Self {
        TableManager {
            mmio,
            memory,
            metrics,
            tables: Vec::new(),
            cache: GITS_BASER_RAWAWB,
            shr: GITS_BASER_INNER_SHAREABLE,
        }
    }

    fn read_baser(&self, index: usize) -> u64 {
        self.mmio.read(gits_baser(index))
    }

    fn write_baser(&self, index: usize, val: u64) -> u64 {
        self.mmio.write(gits_baser(index), val);
        self.read_baser(index)
    }

    /// Finds the largest page size GITS_BASER<index> accepts.
    fn probe_page_size(&self, index: usize) -> Result<ItsPageSize, TableError> {
        let mut psz = Some(ItsPageSize::Size64K);
        while let Some(size) = psz {
            let val = (self.read_baser(index) & !GITS_BASER_PAGE_SIZE_MASK) | size.encoding();
            let readback = self.write_baser(index, val);
            if ItsPageSize::from_baser(readback) == Some(size) {
                return Ok(size);
            }
            psz = size.smaller();
        }
        Err(TableError::PageSizeUnsupported(index))
    }

    /// Allocates and programs every table the ITS describes. VPE tables are only set up on
    /// GICv4 implementations.
    pub fn setup_all(&mut self, typer: &Typer, vpe_id_bits: u32) -> Result<(), TableError> {
        for index in 0..GITS_BASER_NR_REGS {
            let kind = BaserType::from_baser(self.read_baser(index));
            let id_bits = match kind {
                BaserType::Device => typer.device_id_bits(),
                BaserType::Vcpu if typer.is_v4() => vpe_id_bits,
                BaserType::Collection => 16,
                BaserType::None | BaserType::Vcpu => continue,
                BaserType::Reserved(_) => {
                    warn!("ITS@{:#x}: ignoring reserved GITS_BASER{index}", self.mmio.phys_base());
                    continue;
                }
            };
            self.setup_baser(index, kind, id_bits)?;
        }
        Ok(())
    }

    /// Allocates and programs the table of type `kind`, sized for `id_bits` worth of IDs.
    pub fn setup_table(&mut self, kind: BaserType, id_bits: u32) -> Result<TableHandle, TableError> {
        if let Some(handle) = self.find(kind) {
            return Ok(handle);
        }
        let index = (0..GITS_BASER_NR_REGS)
            .find(|index| BaserType::from_baser(self.read_baser(*index)) == kind)
            .ok_or(TableError::NoSuchTable(kind))?;
        self.setup_baser(index, kind, id_bits)
    }

    fn setup_baser(&mut self, index: usize, kind: BaserType, id_bits: u32) -> Result<TableHandle, TableError> {
        let base_addr = self.mmio.phys_base();
        let mut psz = self.probe_page_size(index)?;
        let esz = baser_entry_size(self.read_baser(index));

        // Device and VPE tables switch to two levels when a flat table would span more
        // than two pages, if the hardware lets us.
        let mut ids = id_bits;
        let mut indirect = false;
        let mut size = psz.bytes();
        if matches!(kind, BaserType::Device | BaserType::Vcpu) {
            let mut lvl1_esz = esz;
            if (esz << ids) > psz.bytes() * 2 {
                let val = self.read_baser(index) | GITS_BASER_INDIRECT;
                indirect = self.write_baser(index, val) & GITS_BASER_INDIRECT != 0;
                if indirect {
                    ids = ids.saturating_sub((psz.bytes() / esz).ilog2());
                    lvl1_esz = GITS_LVL1_ENTRY_SIZE;
                }
            }
            size = (lvl1_esz << ids).next_power_of_two().max(psz.bytes());
            let max = GITS_BASER_PAGES_MAX * psz.bytes();
            if size > max {
                let reduced = (max / lvl1_esz).ilog2();
                warn!(
                    "ITS@{base_addr:#x}: {} Table too large, reduce ids {ids}->{reduced}",
                    kind.name()
                );
                ids = reduced;
                size = max;
            }
        }

        let mut cache = self.cache;
        let mut shr = self.shr;
        let mut base = DmaBuffer::zeroed(&self.memory, size, psz.bytes())?;
        let indirect_bit = if indirect { GITS_BASER_INDIRECT } else { 0 };
        let mut attempts = 0;
        let val = loop {
            attempts += 1;
            let val = psz.encode_phys(base.phys())
                | (kind.encoding() << GITS_BASER_TYPE_SHIFT)
                | (((esz - 1) as u64) << GITS_BASER_ENTRY_SIZE_SHIFT)
                | ((base.size() / psz.bytes() - 1) as u64)
                | cache
                | shr
                | psz.encoding()
                | indirect_bit
                | GITS_BASER_VALID;
            let readback = self.write_baser(index, val);
            if readback == val {
                break val;
            }
            if attempts >= MAX_BASER_ATTEMPTS {
                return Err(TableError::Rejected {
                    index,
                    wrote: val,
                    read: readback,
                });
            }

            if (val ^ readback) & GITS_BASER_SHAREABILITY_MASK != 0 {
                // Use whatever shareability the hardware reported. Non-shareable also
                // means non-cacheable.
                shr = readback & GITS_BASER_SHAREABILITY_MASK;
                if shr == 0 {
                    cache = GITS_BASER_NC;
                }
                continue;
            }
            if (val ^ readback) & GITS_BASER_PAGE_SIZE_MASK != 0 {
                let Some(smaller) = psz.smaller() else {
                    return Err(TableError::PageSizeUnsupported(index));
                };
                psz = smaller;
                if base.size() / psz.bytes() > GITS_BASER_PAGES_MAX {
                    base = DmaBuffer::zeroed(&self.memory, GITS_BASER_PAGES_MAX * psz.bytes(), psz.bytes())?;
                }
                continue;
            }

            error!(
                "ITS@{base_addr:#x}: {} doesn't stick: {val:#x} {readback:#x}",
                kind.name()
            );
            return Err(TableError::Rejected {
                index,
                wrote: val,
                read: readback,
            });
        };

        if val & GITS_BASER_SHAREABILITY_MASK == 0 {
            base.flush();
        }
        self.cache = cache;
        self.shr = shr;

        info!(
            "ITS@{base_addr:#x}: allocated {} {} @{:#x} ({}, esz {}, psz {}K, shr {})",
            base.size() / if indirect { GITS_LVL1_ENTRY_SIZE } else { esz },
            kind.name(),
            base.phys(),
            if indirect { "indirect" } else { "flat" },
            esz,
            psz.bytes() / 1024,
            shr >> GITS_BASER_SHAREABILITY_SHIFT
        );

        // Bounded by both the requested ID width and what the allocation can hold.
        let (lvl1_entries, nr_ids) = if indirect {
            let entries = (base.size() / GITS_LVL1_ENTRY_SIZE).min(1 << ids);
            (entries, entries * (psz.bytes() / esz))
        } else {
            (0, (base.size() / esz).min(1 << ids))
        };
        self.tables.push(ItsTable {
            index,
            kind,
            base,
            psz,
            esz,
            indirect,
            nr_ids,
            val,
            lvl2: Mutex::new((0..lvl1_entries).map(|_| None).collect()),
        });
        Ok(TableHandle(self.tables.len() - 1))
    }

    /// Handle of the table of type `kind`, if it has been set up.
    pub fn find(&self, kind: BaserType) -> Option<TableHandle> {
        self.tables
            .iter()
            .position(|table| table.kind == kind)
            .map(TableHandle)
    }

    /// The table behind `handle`.
    pub fn table(&self, handle: TableHandle) -> &ItsTable {
        &self.tables[handle.0]
    }

    /// Every table set up so far.
    pub fn tables(&self) -> &[ItsTable] {
        &self.tables
    }

    /// Makes sure the hardware can store the entry for `id`, allocating and publishing the
    /// second-level page that holds it if needed.
    pub fn ensure_entry(&self, handle: TableHandle, id: u32) -> Result<(), TableError> {
        self.table(handle).ensure_entry(id, &self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{SimIts, SimItsConfig, SimMemory};
    use crate::utils::{SZ_4K, SZ_16K, SZ_64K};

    fn setup(config: SimItsConfig) -> (Arc<SimMemory>, Arc<SimIts>, TableManager) {
        let memory = Arc::new(SimMemory::new(config.shareable));
        let its = Arc::new(SimIts::new(config, memory.clone()));
        let manager = TableManager::new(its.clone(), memory.clone(), Arc::new(ItsMetrics::new()));
        (memory, its, manager)
    }

    #[test]
    fn test_flat_device_table() {
        let (_, its, mut manager) = setup(SimItsConfig {
            device_id_bits: 10,
            ..Default::default()
        });
        let handle = manager.setup_table(BaserType::Device, 10).unwrap();
        let table = manager.table(handle);
        assert!(!table.is_indirect());
        assert_eq!(table.page_size(), ItsPageSize::Size64K);
        // 1024 entries of 8 bytes fit in a single page.
        assert_eq!(table.size(), SZ_64K);
        assert_eq!(table.base_phys() % SZ_64K as u64, 0);
        assert_eq!(its.baser(table.index()), table.baser());
        assert!(table.is_coherent());

        assert_eq!(table.id_bits(), 10);

        manager.ensure_entry(handle, 0).unwrap();
        manager.ensure_entry(handle, 1023).unwrap();
        assert_eq!(
            manager.ensure_entry(handle, 1024),
            Err(TableError::IdOutOfRange {
                kind: BaserType::Device,
                id: 1024
            })
        );
    }

    #[test]
    fn test_page_size_fallback() {
        let (_, its, mut manager) = setup(SimItsConfig {
            page_sizes: vec![ItsPageSize::Size4K],
            ..Default::default()
        });
        let handle = manager.setup_table(BaserType::Collection, 16).unwrap();
        let table = manager.table(handle);
        assert_eq!(table.page_size(), ItsPageSize::Size4K);
        assert_eq!(table.size(), SZ_4K);
        assert_eq!(ItsPageSize::from_baser(its.baser(table.index())), Some(ItsPageSize::Size4K));

        let (_, _, mut manager) = setup(SimItsConfig {
            page_sizes: vec![ItsPageSize::Size16K, ItsPageSize::Size4K],
            ..Default::default()
        });
        let handle = manager.setup_table(BaserType::Collection, 16).unwrap();
        assert_eq!(manager.table(handle).size(), SZ_16K);
    }

    #[test]
    fn test_shareability_fallback() {
        let (memory, its, mut manager) = setup(SimItsConfig {
            shareable: false,
            ..Default::default()
        });
        let device = manager.setup_table(BaserType::Device, 16).unwrap();
        let table = manager.table(device);
        assert!(!table.is_coherent());
        assert_eq!(table.baser() & GITS_BASER_INNER_CACHEABILITY_MASK, GITS_BASER_NC);
        assert!(memory.is_clean(table.base_phys(), table.size()));

        // The next table starts from the attributes that stuck.
        let collection = manager.setup_table(BaserType::Collection, 16).unwrap();
        let table = manager.table(collection);
        assert_eq!(table.baser() & GITS_BASER_SHAREABILITY_MASK, 0);
        assert_eq!(its.baser(table.index()), table.baser());
    }

    #[test]
    fn test_rejected_baser() {
        let (_, _, mut manager) = setup(SimItsConfig {
            baser_valid_sticks: false,
            ..Default::default()
        });
        assert!(matches!(
            manager.setup_table(BaserType::Device, 16),
            Err(TableError::Rejected { index: 0, .. })
        ));
        assert_eq!(
            manager.setup_table(BaserType::Vcpu, 16).unwrap_err(),
            TableError::NoSuchTable(BaserType::Vcpu)
        );
    }

    #[test]
    fn test_indirect_device_table() {
        let (memory, _, mut manager) = setup(SimItsConfig {
            device_id_bits: 20,
            indirect: true,
            ..Default::default()
        });
        let handle = manager.setup_table(BaserType::Device, 20).unwrap();
        let table = manager.table(handle);
        assert!(table.is_indirect());
        // 8192 entries per 64K page: 2^7 first level entries, in a single page.
        assert_eq!(table.size(), SZ_64K);
        assert_eq!(table.id_bits(), 20);
        assert_eq!(table.lvl2_pages(), 0);

        manager.ensure_entry(handle, 5).unwrap();
        manager.ensure_entry(handle, 8191).unwrap();
        assert_eq!(table.lvl2_pages(), 1);
        manager.ensure_entry(handle, 8192).unwrap();
        manager.ensure_entry(handle, (1 << 20) - 1).unwrap();
        assert_eq!(table.lvl2_pages(), 3);
        assert_eq!(manager.metrics.table_pages.count(), 3);

        let l1 = memory.read_u64(table.base_phys() + 8);
        assert_ne!(l1 & GITS_LVL1_ENTRY_VALID, 0);
        let l2 = l1 & !GITS_LVL1_ENTRY_VALID;
        assert!(memory.is_zeroed(l2, SZ_64K));

        assert!(manager.ensure_entry(handle, 1 << 20).is_err());
    }

    #[test]
    fn test_indirect_unsupported_stays_flat() {
        let (_, _, mut manager) = setup(SimItsConfig {
            device_id_bits: 16,
            indirect: false,
            ..Default::default()
        });
        let handle = manager.setup_table(BaserType::Device, 16).unwrap();
        let table = manager.table(handle);
        assert!(!table.is_indirect());
        assert_eq!(table.size(), 8 << 16);
        manager.ensure_entry(handle, 0xffff).unwrap();
    }

    #[test]
    fn test_l2_publish_ordering() {
        let (memory, _, mut manager) = setup(SimItsConfig {
            device_id_bits: 20,
            indirect: true,
            shareable: false,
            ..Default::default()
        });
        let handle = manager.setup_table(BaserType::Device, 20).unwrap();
        let table = manager.table(handle);
        memory.watch_publish(table.base_phys(), table.size(), SZ_64K);

        for id in [0, 9000, 100_000] {
            manager.ensure_entry(handle, id).unwrap();
        }
        let records = memory.publish_records();
        assert_eq!(records.len(), 3);
        // The page was cleared and cleaned before the first-level entry pointed at it.
        assert!(records.iter().all(|record| record.zeroed && record.clean));
        assert!(memory.is_clean(table.base_phys(), table.size()));
    }

    #[test]
    fn test_setup_all() {
        let (_, _, mut manager) = setup(SimItsConfig {
            virtual_lpis: true,
            ..Default::default()
        });
        let typer = Typer::encode(
            TyperFlags::PHYSICAL | TyperFlags::VIRTUAL,
            8,
            16,
            16,
        );
        manager.setup_all(&typer, 16).unwrap();
        let kinds: Vec<_> = manager.tables().iter().map(ItsTable::kind).collect();
        assert_eq!(
            kinds,
            vec![BaserType::Device, BaserType::Collection, BaserType::Vcpu]
        );
    }
}
