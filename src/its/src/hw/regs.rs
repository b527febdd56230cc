// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! GICv3/v4 ITS and redistributor register layout.

#![allow(missing_docs)]

use bitflags::bitflags;

use crate::utils::{SZ_4K, SZ_16K, SZ_64K, genmask};

// ITS control frame.
pub const GITS_CTLR: u32 = 0x0000;
pub const GITS_IIDR: u32 = 0x0004;
pub const GITS_TYPER: u32 = 0x0008;
pub const GITS_CBASER: u32 = 0x0080;
pub const GITS_CWRITER: u32 = 0x0088;
pub const GITS_CREADR: u32 = 0x0090;
pub const GITS_BASER: u32 = 0x0100;
/// Number of GITS_BASER<n> registers.
pub const GITS_BASER_NR_REGS: usize = 8;
/// Doorbell register, in the translation frame (second 64K page).
pub const GITS_TRANSLATER: u64 = 0x1_0040;

/// Offset of GITS_BASER<n>.
pub const fn gits_baser(n: usize) -> u32 {
    // n < 8
    GITS_BASER + (n as u32) * 8
}

pub const GITS_CTLR_ENABLE: u64 = 1 << 0;
pub const GITS_CTLR_IMDE: u64 = 1 << 1;
pub const GITS_CTLR_ITS_NUMBER_SHIFT: u32 = 4;
pub const GITS_CTLR_ITS_NUMBER: u64 = 0xf << GITS_CTLR_ITS_NUMBER_SHIFT;
pub const GITS_CTLR_QUIESCENT: u64 = 1 << 31;

/// Maximum number of entries in an ITS list (GICv4.0).
pub const ITS_LIST_MAX: u8 = 16;

bitflags! {
    /// Single-bit capabilities advertised in GITS_TYPER.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TyperFlags: u64 {
        /// Physical LPIs are supported.
        const PHYSICAL = 1 << 0;
        /// Virtual LPIs and direct injection (GICv4).
        const VIRTUAL = 1 << 1;
        /// Target addresses are redistributor physical addresses.
        const PTA = 1 << 19;
        /// VMOVP only needs to be sent to one ITS.
        const VMOVP = 1 << 37;
    }
}

/// Decoded GITS_TYPER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Typer(pub u64);

impl Typer {
    /// Capability bits.
    pub fn flags(&self) -> TyperFlags {
        TyperFlags::from_bits_truncate(self.0)
    }

    /// Size in bytes of an ITT entry.
    pub fn itt_entry_size(&self) -> usize {
        // [7:4] holds size - 1.
        ((self.0 >> 4) & 0xf) as usize + 1
    }

    /// Number of EventID bits.
    pub fn event_id_bits(&self) -> u32 {
        ((self.0 >> 8) & 0x1f) as u32 + 1
    }

    /// Number of DeviceID bits.
    pub fn device_id_bits(&self) -> u32 {
        ((self.0 >> 13) & 0x1f) as u32 + 1
    }

    /// Number of collections held in the ITS itself.
    pub fn hcc(&self) -> u32 {
        ((self.0 >> 24) & 0xff) as u32
    }

    /// Whether the ITS implements GICv4 virtual LPI support.
    pub fn is_v4(&self) -> bool {
        self.flags().contains(TyperFlags::VIRTUAL)
    }

    /// Builds a GITS_TYPER value. Widths and sizes are given as their natural values.
    pub fn encode(
        flags: TyperFlags,
        itt_entry_size: usize,
        event_id_bits: u32,
        device_id_bits: u32,
    ) -> Self {
        Typer(
            flags.bits()
                | (((itt_entry_size as u64) - 1) & 0xf) << 4
                | ((u64::from(event_id_bits) - 1) & 0x1f) << 8
                | ((u64::from(device_id_bits) - 1) & 0x1f) << 13,
        )
    }
}

// GITS_BASER<n> fields.
pub const GITS_BASER_VALID: u64 = 1 << 63;
pub const GITS_BASER_INDIRECT: u64 = 1 << 62;
pub const GITS_BASER_INNER_CACHEABILITY_SHIFT: u32 = 59;
pub const GITS_BASER_INNER_CACHEABILITY_MASK: u64 = 7 << GITS_BASER_INNER_CACHEABILITY_SHIFT;
pub const GITS_BASER_TYPE_SHIFT: u32 = 56;
pub const GITS_BASER_OUTER_CACHEABILITY_SHIFT: u32 = 53;
pub const GITS_BASER_OUTER_CACHEABILITY_MASK: u64 = 7 << GITS_BASER_OUTER_CACHEABILITY_SHIFT;
pub const GITS_BASER_ENTRY_SIZE_SHIFT: u32 = 48;
pub const GITS_BASER_SHAREABILITY_SHIFT: u32 = 10;
pub const GITS_BASER_SHAREABILITY_MASK: u64 = 3 << GITS_BASER_SHAREABILITY_SHIFT;
pub const GITS_BASER_PAGE_SIZE_SHIFT: u32 = 8;
pub const GITS_BASER_PAGE_SIZE_MASK: u64 = 3 << GITS_BASER_PAGE_SIZE_SHIFT;
pub const GITS_BASER_PAGES_MAX: usize = 256;
/// Size of a first-level entry of an indirect table.
pub const GITS_LVL1_ENTRY_SIZE: usize = 8;
/// Valid bit of a first-level entry.
pub const GITS_LVL1_ENTRY_VALID: u64 = 1 << 63;

pub const GIC_BASER_CACHE_NC: u64 = 1;
pub const GIC_BASER_CACHE_RAWAWB: u64 = 7;
pub const GIC_BASER_INNER_SHAREABLE: u64 = 1;

pub const GITS_BASER_NC: u64 = GIC_BASER_CACHE_NC << GITS_BASER_INNER_CACHEABILITY_SHIFT;
pub const GITS_BASER_RAWAWB: u64 = GIC_BASER_CACHE_RAWAWB << GITS_BASER_INNER_CACHEABILITY_SHIFT;
pub const GITS_BASER_INNER_SHAREABLE: u64 =
    GIC_BASER_INNER_SHAREABLE << GITS_BASER_SHAREABILITY_SHIFT;

/// Contents of the Type field of GITS_BASER<n>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum BaserType {
    /// Unimplemented register.
    None,
    /// Device table.
    Device,
    /// VPE table (GICv4).
    Vcpu,
    /// Collection table.
    Collection,
    /// Reserved encoding.
    Reserved(u8),
}

impl BaserType {
    /// Extracts the type of a GITS_BASER<n> value.
    pub fn from_baser(val: u64) -> Self {
        match (val >> GITS_BASER_TYPE_SHIFT) & 7 {
            0 => BaserType::None,
            1 => BaserType::Device,
            2 => BaserType::Vcpu,
            4 => BaserType::Collection,
            other => BaserType::Reserved(other as u8),
        }
    }

    /// Field encoding.
    pub fn encoding(&self) -> u64 {
        match self {
            BaserType::None => 0,
            BaserType::Device => 1,
            BaserType::Vcpu => 2,
            BaserType::Collection => 4,
            BaserType::Reserved(val) => u64::from(*val) & 7,
        }
    }

    /// Human readable name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            BaserType::None => "None",
            BaserType::Device => "Devices",
            BaserType::Vcpu => "Virtual CPUs",
            BaserType::Collection => "Interrupt Collections",
            BaserType::Reserved(_) => "Reserved",
        }
    }
}

/// Entry size of a GITS_BASER<n> value, in bytes.
pub fn baser_entry_size(val: u64) -> usize {
    ((val >> GITS_BASER_ENTRY_SIZE_SHIFT) & 0x1f) as usize + 1
}

/// Number of pages of a GITS_BASER<n> value.
pub fn baser_nr_pages(val: u64) -> usize {
    (val & 0xff) as usize + 1
}

/// ITS translation table page sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub enum ItsPageSize {
    /// 4 KiB pages.
    Size4K,
    /// 16 KiB pages.
    Size16K,
    /// 64 KiB pages.
    Size64K,
}

impl ItsPageSize {
    /// Size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            ItsPageSize::Size4K => SZ_4K,
            ItsPageSize::Size16K => SZ_16K,
            ItsPageSize::Size64K => SZ_64K,
        }
    }

    /// GITS_BASER Page_Size field value, already shifted.
    pub fn encoding(&self) -> u64 {
        let field = match self {
            ItsPageSize::Size4K => 0,
            ItsPageSize::Size16K => 1,
            ItsPageSize::Size64K => 2,
        };
        field << GITS_BASER_PAGE_SIZE_SHIFT
    }

    /// Decodes the Page_Size field of a GITS_BASER<n> value.
    pub fn from_baser(val: u64) -> Option<Self> {
        match (val & GITS_BASER_PAGE_SIZE_MASK) >> GITS_BASER_PAGE_SIZE_SHIFT {
            0 => Some(ItsPageSize::Size4K),
            1 => Some(ItsPageSize::Size16K),
            2 => Some(ItsPageSize::Size64K),
            _ => None,
        }
    }

    /// Next size to try when this one is refused.
    pub fn smaller(&self) -> Option<Self> {
        match self {
            ItsPageSize::Size64K => Some(ItsPageSize::Size16K),
            ItsPageSize::Size16K => Some(ItsPageSize::Size4K),
            ItsPageSize::Size4K => None,
        }
    }

    /// Encodes a table address. With 64K pages, PA[51:48] moves to bits [15:12].
    pub fn encode_phys(&self, phys: u64) -> u64 {
        match self {
            ItsPageSize::Size64K => {
                (phys & genmask(47, 16)) | (((phys & genmask(51, 48)) >> 48) << 12)
            }
            _ => phys & genmask(47, 12),
        }
    }

    /// Inverse of [`ItsPageSize::encode_phys`].
    pub fn decode_phys(&self, val: u64) -> u64 {
        match self {
            ItsPageSize::Size64K => (val & genmask(47, 16)) | (((val >> 12) & 0xf) << 48),
            _ => val & genmask(47, 12),
        }
    }
}

// GITS_CBASER fields.
pub const GITS_CBASER_VALID: u64 = 1 << 63;
pub const GITS_CBASER_INNER_CACHEABILITY_SHIFT: u32 = 59;
pub const GITS_CBASER_CACHEABILITY_MASK: u64 = 7 << GITS_CBASER_INNER_CACHEABILITY_SHIFT;
pub const GITS_CBASER_OUTER_CACHEABILITY_MASK: u64 = 7 << 53;
pub const GITS_CBASER_SHAREABILITY_SHIFT: u32 = 10;
pub const GITS_CBASER_SHAREABILITY_MASK: u64 = 3 << GITS_CBASER_SHAREABILITY_SHIFT;
pub const GITS_CBASER_NC: u64 = GIC_BASER_CACHE_NC << GITS_CBASER_INNER_CACHEABILITY_SHIFT;
pub const GITS_CBASER_RAWAWB: u64 = GIC_BASER_CACHE_RAWAWB << GITS_CBASER_INNER_CACHEABILITY_SHIFT;
pub const GITS_CBASER_INNER_SHAREABLE: u64 =
    GIC_BASER_INNER_SHAREABLE << GITS_CBASER_SHAREABILITY_SHIFT;
pub const GITS_CBASER_PA_MASK: u64 = genmask(51, 12);
pub const GITS_CBASER_SIZE_MASK: u64 = 0xff;

/// Byte offset held in GITS_CREADR/GITS_CWRITER.
pub const GITS_CMDQ_OFFSET_MASK: u64 = genmask(19, 5);
/// GITS_CREADR.Stalled.
pub const GITS_CREADR_STALLED: u64 = 1 << 0;

// Redistributor, RD_base frame.
pub const GICR_SETLPIR: u32 = 0x0040;
pub const GICR_CLRLPIR: u32 = 0x0048;
pub const GICR_INVLPIR: u32 = 0x00a0;
pub const GICR_SYNCR: u32 = 0x00c0;
pub const GICR_SYNCR_BUSY: u64 = 1 << 0;

// Redistributor, VLPI_base frame (fourth 64K page of a GICv4 redistributor).
pub const GICR_VLPI_BASE: u32 = 0x2_0000;
pub const GICR_VPROPBASER: u32 = GICR_VLPI_BASE + 0x0070;
pub const GICR_VPENDBASER: u32 = GICR_VLPI_BASE + 0x0078;

pub const GICR_VPROPBASER_RAWB: u64 = 7 << 7;
pub const GICR_VPROPBASER_INNER_SHAREABLE: u64 = 1 << 10;
pub const GICR_VPROPBASER_PA_MASK: u64 = genmask(51, 12);
pub const GICR_VPROPBASER_IDBITS_MASK: u64 = 0x1f;

pub const GICR_VPENDBASER_VALID: u64 = 1 << 63;
pub const GICR_VPENDBASER_IDAI: u64 = 1 << 62;
pub const GICR_VPENDBASER_PENDING_LAST: u64 = 1 << 61;
pub const GICR_VPENDBASER_DIRTY: u64 = 1 << 60;
pub const GICR_VPENDBASER_RAWAWB: u64 = 7 << 7;
pub const GICR_VPENDBASER_INNER_SHAREABLE: u64 = 1 << 10;
pub const GICR_VPENDBASER_PA_MASK: u64 = genmask(51, 16);
