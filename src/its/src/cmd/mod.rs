// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! ITS commands and their 32-byte encodings.

mod queue;

pub use queue::{CommandQueue, CommandQueueGuard, CompletionToken, QueueError};

use crate::collection::Collection;
use crate::utils::genmask;

/// Size of one command block, in bytes.
pub const ITS_CMD_SIZE: usize = 32;

/// Doorbell INTID meaning "no doorbell".
pub const NO_DOORBELL: u32 = 1023;

/// Command opcodes (DW0[7:0]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// MOVI
    Movi = 0x01,
    /// INT
    Int = 0x03,
    /// CLEAR
    Clear = 0x04,
    /// SYNC
    Sync = 0x05,
    /// MAPD
    Mapd = 0x08,
    /// MAPC
    Mapc = 0x09,
    /// MAPTI
    Mapti = 0x0a,
    /// INV
    Inv = 0x0c,
    /// INVALL
    Invall = 0x0d,
    /// DISCARD
    Discard = 0x0f,
    /// VMOVI
    Vmovi = 0x21,
    /// VMOVP
    Vmovp = 0x22,
    /// VSYNC
    Vsync = 0x25,
    /// VMAPP
    Vmapp = 0x29,
    /// VMAPTI
    Vmapti = 0x2a,
    /// VINVALL
    Vinvall = 0x2d,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0x01 => Opcode::Movi,
            0x03 => Opcode::Int,
            0x04 => Opcode::Clear,
            0x05 => Opcode::Sync,
            0x08 => Opcode::Mapd,
            0x09 => Opcode::Mapc,
            0x0a => Opcode::Mapti,
            0x0c => Opcode::Inv,
            0x0d => Opcode::Invall,
            0x0f => Opcode::Discard,
            0x21 => Opcode::Vmovi,
            0x22 => Opcode::Vmovp,
            0x25 => Opcode::Vsync,
            0x29 => Opcode::Vmapp,
            0x2a => Opcode::Vmapti,
            0x2d => Opcode::Vinvall,
            other => return Err(other),
        })
    }
}

/// Raw command block, four little-endian double words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandBlock(pub [u64; 4]);

impl CommandBlock {
    fn set(&mut self, dw: usize, val: u64, high: u32, low: u32) {
        let mask = genmask(high, low);
        self.0[dw] &= !mask;
        self.0[dw] |= (val << low) & mask;
    }

    fn get(&self, dw: usize, high: u32, low: u32) -> u64 {
        (self.0[dw] & genmask(high, low)) >> low
    }

    /// Raw opcode field.
    pub fn raw_opcode(&self) -> u8 {
        self.get(0, 7, 0) as u8
    }

    /// Decoded opcode, if known.
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.raw_opcode()).ok()
    }

    /// DeviceID, DW0[63:32].
    pub fn device_id(&self) -> u32 {
        self.get(0, 63, 32) as u32
    }

    /// VMOVP sequence number, DW0[47:32].
    pub fn seq_num(&self) -> u16 {
        self.get(0, 47, 32) as u16
    }

    /// EventID, DW1[31:0].
    pub fn event_id(&self) -> u32 {
        self.get(1, 31, 0) as u32
    }

    /// Physical INTID, DW1[63:32].
    pub fn phys_id(&self) -> u32 {
        self.get(1, 63, 32) as u32
    }

    /// MAPD Size field (number of EventID bits minus one), DW1[4:0].
    pub fn size(&self) -> u8 {
        self.get(1, 4, 0) as u8
    }

    /// VPE ID, DW1[47:32].
    pub fn vpe_id(&self) -> u16 {
        self.get(1, 47, 32) as u16
    }

    /// VMOVP ITS list, DW1[15:0].
    pub fn its_list(&self) -> u16 {
        self.get(1, 15, 0) as u16
    }

    /// Collection ID, DW2[15:0].
    pub fn collection_id(&self) -> u16 {
        self.get(2, 15, 0) as u16
    }

    /// Target address, DW2[51:16], returned as a full address.
    pub fn target(&self) -> u64 {
        self.get(2, 51, 16) << 16
    }

    /// ITT address, DW2[51:8], returned as a full address.
    pub fn itt_addr(&self) -> u64 {
        self.get(2, 51, 8) << 8
    }

    /// Valid bit, DW2[63].
    pub fn valid(&self) -> bool {
        self.get(2, 63, 63) != 0
    }

    /// Virtual INTID, DW2[31:0].
    pub fn virt_id(&self) -> u32 {
        self.get(2, 31, 0) as u32
    }

    /// Doorbell INTID, DW2[63:32].
    pub fn db_phys_id(&self) -> u32 {
        self.get(2, 63, 32) as u32
    }

    /// Doorbell valid bit, DW2[0].
    pub fn db_valid(&self) -> bool {
        self.get(2, 0, 0) != 0
    }

    /// Virtual pending table address, DW3[51:16], returned as a full address.
    pub fn vpt_addr(&self) -> u64 {
        self.get(3, 51, 16) << 16
    }

    /// Virtual pending table size (INTID bits minus one), DW3[4:0].
    pub fn vpt_size(&self) -> u8 {
        self.get(3, 4, 0) as u8
    }
}

/// Where the completion of a command is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPoint {
    /// SYNC on a redistributor target address.
    Physical(u64),
    /// VSYNC on a VPE.
    Virtual(u16),
}

impl SyncPoint {
    /// The synchronization command itself.
    pub fn command(&self) -> ItsCommand {
        match *self {
            SyncPoint::Physical(target) => ItsCommand::Sync { target },
            SyncPoint::Virtual(vpe_id) => ItsCommand::Vsync { vpe_id },
        }
    }
}

/// An ITS command, before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItsCommand {
    /// Map (or unmap) a device to its interrupt translation table.
    Mapd {
        /// DeviceID.
        device_id: u32,
        /// Physical address of the ITT, 256-byte aligned.
        itt_addr: u64,
        /// Number of ITT entries, a power of two of at least 2.
        nr_ites: u32,
        /// Map when set, unmap otherwise.
        valid: bool,
    },
    /// Map (or unmap) a collection to a redistributor.
    Mapc {
        /// The collection.
        collection: Collection,
        /// Map when set, unmap otherwise.
        valid: bool,
    },
    /// Map an event to a physical LPI and a collection.
    Mapti {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// Physical LPI.
        phys_id: u32,
        /// Target collection.
        collection: Collection,
    },
    /// Move an event to another collection.
    Movi {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// New collection.
        collection: Collection,
    },
    /// Remove the mapping of an event.
    Discard {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// Collection the event was mapped to.
        collection: Collection,
    },
    /// Reload the configuration of an event's LPI.
    Inv {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// Collection the event is mapped to.
        collection: Collection,
    },
    /// Reload the configuration of every LPI of a collection.
    Invall {
        /// The collection.
        collection: Collection,
    },
    /// Make an event pending.
    Int {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// Collection the event is mapped to.
        collection: Collection,
    },
    /// Clear the pending state of an event.
    Clear {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// Collection the event is mapped to.
        collection: Collection,
    },
    /// Wait for the effects of prior commands on a redistributor.
    Sync {
        /// Redistributor target address.
        target: u64,
    },
    /// Map (or unmap) a VPE to a redistributor.
    Vmapp {
        /// VPE ID.
        vpe_id: u16,
        /// Redistributor target address.
        target: u64,
        /// Physical address of the virtual pending table, 64K aligned.
        vpt_addr: u64,
        /// Number of virtual INTID bits covered by the pending table.
        vpt_id_bits: u32,
        /// Map when set, unmap otherwise.
        valid: bool,
    },
    /// Map an event to a virtual LPI of a VPE.
    Vmapti {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// VPE ID.
        vpe_id: u16,
        /// Virtual INTID.
        virt_id: u32,
        /// Doorbell LPI, if any.
        doorbell: Option<u32>,
    },
    /// Move a virtual event to another VPE.
    Vmovi {
        /// DeviceID.
        device_id: u32,
        /// EventID.
        event_id: u32,
        /// New VPE ID.
        vpe_id: u16,
        /// Doorbell LPI, if any.
        doorbell: Option<u32>,
    },
    /// Move a VPE to another redistributor.
    Vmovp {
        /// VPE ID.
        vpe_id: u16,
        /// New redistributor target address.
        target: u64,
        /// Sequence number shared by every ITS receiving this move.
        seq_num: u16,
        /// ITS numbers receiving this move.
        its_list: u16,
    },
    /// Reload the configuration of every virtual LPI of a VPE.
    Vinvall {
        /// VPE ID.
        vpe_id: u16,
    },
    /// Wait for the effects of prior commands on a VPE.
    Vsync {
        /// VPE ID.
        vpe_id: u16,
    },
}

impl ItsCommand {
    /// Opcode of the command.
    pub fn opcode(&self) -> Opcode {
        match self {
            ItsCommand::Mapd { .. } => Opcode::Mapd,
            ItsCommand::Mapc { .. } => Opcode::Mapc,
            ItsCommand::Mapti { .. } => Opcode::Mapti,
            ItsCommand::Movi { .. } => Opcode::Movi,
            ItsCommand::Discard { .. } => Opcode::Discard,
            ItsCommand::Inv { .. } => Opcode::Inv,
            ItsCommand::Invall { .. } => Opcode::Invall,
            ItsCommand::Int { .. } => Opcode::Int,
            ItsCommand::Clear { .. } => Opcode::Clear,
            ItsCommand::Sync { .. } => Opcode::Sync,
            ItsCommand::Vmapp { .. } => Opcode::Vmapp,
            ItsCommand::Vmapti { .. } => Opcode::Vmapti,
            ItsCommand::Vmovi { .. } => Opcode::Vmovi,
            ItsCommand::Vmovp { .. } => Opcode::Vmovp,
            ItsCommand::Vinvall { .. } => Opcode::Vinvall,
            ItsCommand::Vsync { .. } => Opcode::Vsync,
        }
    }

    /// The SYNC or VSYNC that has to follow this command, if any.
    pub fn sync_point(&self) -> Option<SyncPoint> {
        match *self {
            ItsCommand::Mapc { collection, .. }
            | ItsCommand::Mapti { collection, .. }
            | ItsCommand::Movi { collection, .. }
            | ItsCommand::Discard { collection, .. }
            | ItsCommand::Inv { collection, .. }
            | ItsCommand::Int { collection, .. }
            | ItsCommand::Clear { collection, .. } => {
                Some(SyncPoint::Physical(collection.target_address))
            }
            ItsCommand::Vmapp {
                vpe_id,
                valid: true,
                ..
            }
            | ItsCommand::Vmapti { vpe_id, .. }
            | ItsCommand::Vmovi { vpe_id, .. }
            | ItsCommand::Vmovp { vpe_id, .. }
            | ItsCommand::Vinvall { vpe_id } => Some(SyncPoint::Virtual(vpe_id)),
            ItsCommand::Mapd { .. }
            | ItsCommand::Invall { .. }
            | ItsCommand::Sync { .. }
            | ItsCommand::Vmapp { valid: false, .. }
            | ItsCommand::Vsync { .. } => None,
        }
    }

    /// Encodes the command into its 32-byte block.
    pub fn build(&self) -> CommandBlock {
        let mut block = CommandBlock::default();
        block.set(0, self.opcode() as u64, 7, 0);

        match *self {
            ItsCommand::Mapd {
                device_id,
                itt_addr,
                nr_ites,
                valid,
            } => {
                block.set(0, u64::from(device_id), 63, 32);
                block.set(1, u64::from(nr_ites.max(2).ilog2() - 1), 4, 0);
                block.set(2, itt_addr >> 8, 51, 8);
                block.set(2, u64::from(valid), 63, 63);
            }
            ItsCommand::Mapc { collection, valid } => {
                block.set(2, u64::from(collection.col_id), 15, 0);
                block.set(2, collection.target_address >> 16, 51, 16);
                block.set(2, u64::from(valid), 63, 63);
            }
            ItsCommand::Mapti {
                device_id,
                event_id,
                phys_id,
                collection,
            } => {
                block.set(0, u64::from(device_id), 63, 32);
                block.set(1, u64::from(event_id), 31, 0);
                block.set(1, u64::from(phys_id), 63, 32);
                block.set(2, u64::from(collection.col_id), 15, 0);
            }
            ItsCommand::Movi {
                device_id,
                event_id,
                collection,
            }
            | ItsCommand::Discard {
                device_id,
                event_id,
                collection,
            }
            | ItsCommand::Inv {
                device_id,
                event_id,
                collection,
            }
            | ItsCommand::Int {
                device_id,
                event_id,
                collection,
            }
            | ItsCommand::Clear {
                device_id,
                event_id,
                collection,
            } => {
                block.set(0, u64::from(device_id), 63, 32);
                block.set(1, u64::from(event_id), 31, 0);
                if self.opcode() == Opcode::Movi {
                    block.set(2, u64::from(collection.col_id), 15, 0);
                }
            }
            ItsCommand::Invall { collection } => {
                block.set(2, u64::from(collection.col_id), 15, 0);
            }
            ItsCommand::Sync { target } => {
                block.set(2, target >> 16, 51, 16);
            }
            ItsCommand::Vmapp {
                vpe_id,
                target,
                vpt_addr,
                vpt_id_bits,
                valid,
            } => {
                block.set(1, u64::from(vpe_id), 47, 32);
                block.set(2, u64::from(valid), 63, 63);
                if valid {
                    block.set(2, target >> 16, 51, 16);
                    block.set(3, vpt_addr >> 16, 51, 16);
                    block.set(3, u64::from(vpt_id_bits.saturating_sub(1)), 4, 0);
                }
            }
            ItsCommand::Vmapti {
                device_id,
                event_id,
                vpe_id,
                virt_id,
                doorbell,
            } => {
                block.set(0, u64::from(device_id), 63, 32);
                block.set(1, u64::from(event_id), 31, 0);
                block.set(1, u64::from(vpe_id), 47, 32);
                block.set(2, u64::from(virt_id), 31, 0);
                block.set(2, u64::from(doorbell.unwrap_or(NO_DOORBELL)), 63, 32);
            }
            ItsCommand::Vmovi {
                device_id,
                event_id,
                vpe_id,
                doorbell,
            } => {
                block.set(0, u64::from(device_id), 63, 32);
                block.set(1, u64::from(event_id), 31, 0);
                block.set(1, u64::from(vpe_id), 47, 32);
                block.set(2, u64::from(doorbell.unwrap_or(NO_DOORBELL)), 63, 32);
                block.set(2, 1, 0, 0);
            }
            ItsCommand::Vmovp {
                vpe_id,
                target,
                seq_num,
                its_list,
            } => {
                block.set(0, u64::from(seq_num), 47, 32);
                block.set(1, u64::from(its_list), 15, 0);
                block.set(1, u64::from(vpe_id), 47, 32);
                block.set(2, target >> 16, 51, 16);
            }
            ItsCommand::Vinvall { vpe_id } | ItsCommand::Vsync { vpe_id } => {
                block.set(1, u64::from(vpe_id), 47, 32);
            }
        }

        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(col_id: u16, target_address: u64) -> Collection {
        Collection {
            col_id,
            target_address,
        }
    }

    #[test]
    fn test_mapd_encoding() {
        let block = ItsCommand::Mapd {
            device_id: 5,
            itt_addr: 0x8000_1200,
            nr_ites: 4,
            valid: true,
        }
        .build();
        assert_eq!(block.0[0], 0x0000_0005_0000_0008);
        // log2(4) - 1
        assert_eq!(block.0[1], 1);
        assert_eq!(block.0[2], (1 << 63) | 0x8000_1200);
        assert_eq!(block.0[3], 0);
        assert_eq!(block.itt_addr(), 0x8000_1200);
        assert!(block.valid());
    }

    #[test]
    fn test_mapc_and_mapti_encoding() {
        let block = ItsCommand::Mapc {
            collection: col(3, 0x3_0000),
            valid: true,
        }
        .build();
        assert_eq!(block.0[0], 0x09);
        assert_eq!(block.0[2], (1 << 63) | 0x3_0000 | 3);
        assert_eq!(block.target(), 0x3_0000);

        let block = ItsCommand::Mapti {
            device_id: 0x10,
            event_id: 7,
            phys_id: 8200,
            collection: col(2, 0x2_0000),
        }
        .build();
        assert_eq!(block.0[0], (0x10 << 32) | 0x0a);
        assert_eq!(block.0[1], (8200 << 32) | 7);
        // Only the collection ID is carried.
        assert_eq!(block.0[2], 2);
        assert_eq!(block.phys_id(), 8200);
        assert_eq!(block.event_id(), 7);
    }

    #[test]
    fn test_event_commands_encoding() {
        let c = col(9, 0x9_0000);
        let movi = ItsCommand::Movi {
            device_id: 1,
            event_id: 2,
            collection: c,
        }
        .build();
        assert_eq!(movi.opcode(), Some(Opcode::Movi));
        assert_eq!(movi.collection_id(), 9);

        let discard = ItsCommand::Discard {
            device_id: 1,
            event_id: 2,
            collection: c,
        }
        .build();
        assert_eq!(discard.0, [(1 << 32) | 0x0f, 2, 0, 0]);

        let sync = ItsCommand::Sync { target: 0x9_0000 }.build();
        assert_eq!(sync.0, [0x05, 0, 0x9_0000, 0]);
    }

    #[test]
    fn test_virtual_commands_encoding() {
        let vmapp = ItsCommand::Vmapp {
            vpe_id: 0x42,
            target: 0x5_0000,
            vpt_addr: 0x1234_0000,
            vpt_id_bits: 16,
            valid: true,
        }
        .build();
        assert_eq!(vmapp.0[0], 0x29);
        assert_eq!(vmapp.vpe_id(), 0x42);
        assert_eq!(vmapp.0[2], (1 << 63) | 0x5_0000);
        assert_eq!(vmapp.0[3], 0x1234_0000 | 15);

        let unmap = ItsCommand::Vmapp {
            vpe_id: 0x42,
            target: 0x5_0000,
            vpt_addr: 0x1234_0000,
            vpt_id_bits: 16,
            valid: false,
        }
        .build();
        assert_eq!(unmap.0, [0x29, 0x42 << 32, 0, 0]);

        let vmapti = ItsCommand::Vmapti {
            device_id: 3,
            event_id: 4,
            vpe_id: 5,
            virt_id: 6,
            doorbell: None,
        }
        .build();
        assert_eq!(vmapti.0[1], (5 << 32) | 4);
        assert_eq!(vmapti.virt_id(), 6);
        assert_eq!(vmapti.db_phys_id(), NO_DOORBELL);

        let vmovi = ItsCommand::Vmovi {
            device_id: 3,
            event_id: 4,
            vpe_id: 7,
            doorbell: Some(8300),
        }
        .build();
        assert_eq!(vmovi.0[2], (8300 << 32) | 1);
        assert!(vmovi.db_valid());

        let vmovp = ItsCommand::Vmovp {
            vpe_id: 5,
            target: 0x7_0000,
            seq_num: 0x1234,
            its_list: 0b101,
        }
        .build();
        assert_eq!(vmovp.0[0], (0x1234 << 32) | 0x22);
        assert_eq!(vmovp.0[1], (5 << 32) | 0b101);
        assert_eq!(vmovp.0[2], 0x7_0000);
        assert_eq!(vmovp.seq_num(), 0x1234);
        assert_eq!(vmovp.its_list(), 0b101);
    }

    #[test]
    fn test_sync_points() {
        let c = col(1, 0x1_0000);
        assert_eq!(
            ItsCommand::Mapti {
                device_id: 0,
                event_id: 0,
                phys_id: 8192,
                collection: c
            }
            .sync_point(),
            Some(SyncPoint::Physical(0x1_0000))
        );
        assert_eq!(
            ItsCommand::Mapd {
                device_id: 0,
                itt_addr: 0,
                nr_ites: 2,
                valid: true
            }
            .sync_point(),
            None
        );
        assert_eq!(ItsCommand::Invall { collection: c }.sync_point(), None);
        assert_eq!(
            ItsCommand::Vinvall { vpe_id: 3 }.sync_point(),
            Some(SyncPoint::Virtual(3))
        );
        assert_eq!(
            SyncPoint::Virtual(3).command(),
            ItsCommand::Vsync { vpe_id: 3 }
        );
        assert_eq!(Opcode::try_from(0x2d_u8), Ok(Opcode::Vinvall));
        assert_eq!(Opcode::try_from(0x02_u8), Err(0x02));
    }
}
