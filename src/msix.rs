// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use byteorder::{ByteOrder, LittleEndian};

use crate::MsiMessage;

pub const MSIX_TABLE_ENTRY_SIZE: usize = 16;
pub const MSIX_PAGE_SIZE: u64 = 0x1000;

const FUNCTION_MASK_BIT: u8 = 14;
const MSIX_ENABLE_BIT: u8 = 15;
const FUNCTION_MASK_MASK: u16 = 1 << FUNCTION_MASK_BIT;
const MSIX_ENABLE_MASK: u16 = 1 << MSIX_ENABLE_BIT;

/// Shadow of the MSI-X capability registers.
///
/// Table and PBA locations are physical values read once at setup;
/// only the control word changes afterwards, through guest writes.
#[derive(Clone, Copy, Default)]
pub struct MsixCapability {
    pub offset: u32,
    msg_ctl: u16,
    table: u32,
    pba: u32,
}

impl MsixCapability {
    pub fn new(offset: u32, msg_ctl: u16, table: u32, pba: u32) -> Self {
        MsixCapability {
            offset,
            msg_ctl,
            table,
            pba,
        }
    }

    /// Length of the capability window in config space.
    pub fn size(&self) -> u32 {
        0xc
    }

    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset + len > self.offset && offset < self.offset + self.size()
    }

    pub fn enabled(&self) -> bool {
        self.msg_ctl & MSIX_ENABLE_MASK == MSIX_ENABLE_MASK
    }

    pub fn function_masked(&self) -> bool {
        self.msg_ctl & FUNCTION_MASK_MASK == FUNCTION_MASK_MASK
    }

    pub fn table_size(&self) -> u16 {
        (self.msg_ctl & 0x7ff) + 1
    }

    pub fn table_bir(&self) -> u32 {
        self.table & 0x7
    }

    pub fn table_offset(&self) -> u64 {
        u64::from(self.table & !0x7)
    }

    pub fn pba_bir(&self) -> u32 {
        self.pba & 0x7
    }

    pub fn pba_offset(&self) -> u64 {
        u64::from(self.pba & !0x7)
    }

    /// Fold a guest config write into the shadow control word. Only
    /// the enable and function-mask bits are writable.
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        if offset <= 2 && offset + data.len() as u64 > 2 {
            let start = (2 - offset) as usize;
            let mut ctl = self.msg_ctl.to_le_bytes();
            for (i, byte) in data[start..std::cmp::min(start + 2, data.len())]
                .iter()
                .enumerate()
            {
                ctl[i] = *byte;
            }
            let wanted = u16::from_le_bytes(ctl);
            self.msg_ctl = (self.msg_ctl & !(MSIX_ENABLE_MASK | FUNCTION_MASK_MASK))
                | (wanted & (MSIX_ENABLE_MASK | FUNCTION_MASK_MASK));
        }
    }
}

#[derive(Clone, Default)]
pub struct MsixTableEntry {
    pub msg_addr_lo: u32,
    pub msg_addr_hi: u32,
    pub msg_data: u32,
    pub vector_ctl: u32,
    claimed: bool,
}

impl MsixTableEntry {
    pub fn masked(&self) -> bool {
        self.vector_ctl & 0x1 == 0x1
    }

    /// True while a live registration owns this vector.
    pub fn claimed(&self) -> bool {
        self.claimed
    }

    pub fn message(&self) -> MsiMessage {
        MsiMessage {
            addr: (u64::from(self.msg_addr_hi) << 32) | u64::from(self.msg_addr_lo),
            data: self.msg_data,
        }
    }
}

/// The trapped MSI-X vector table.
///
/// Guest accesses to the spliced-out table page land here instead of
/// on the device; the stored entries are handed to the channel when
/// MSI-X is enabled.
pub struct MsixTable {
    pub entries: Vec<MsixTableEntry>,
}

impl MsixTable {
    pub fn new(table_size: u16) -> Self {
        MsixTable {
            entries: vec![MsixTableEntry::default(); table_size as usize],
        }
    }

    /// Mark every vector as owned by a registration.
    pub fn claim_vectors(&mut self) {
        for entry in &mut self.entries {
            entry.claimed = true;
        }
    }

    /// Release every vector marker.
    pub fn release_vectors(&mut self) {
        for entry in &mut self.entries {
            entry.claimed = false;
        }
    }

    pub fn read(&self, offset: u64, data: &mut [u8]) {
        let index: usize = (offset / MSIX_TABLE_ENTRY_SIZE as u64) as usize;
        let modulo_offset = offset % MSIX_TABLE_ENTRY_SIZE as u64;

        let entry = match self.entries.get(index) {
            Some(e) => e,
            None => {
                for byte in data.iter_mut() {
                    *byte = 0xff;
                }
                return;
            }
        };

        match data.len() {
            4 => {
                let value = match modulo_offset {
                    0x0 => entry.msg_addr_lo,
                    0x4 => entry.msg_addr_hi,
                    0x8 => entry.msg_data,
                    0xc => entry.vector_ctl,
                    _ => {
                        error!("invalid MSI-X table read offset 0x{:x}", offset);
                        return;
                    }
                };

                LittleEndian::write_u32(data, value);
            }
            8 => {
                let value = match modulo_offset {
                    0x0 => {
                        (u64::from(entry.msg_addr_hi) << 32) | u64::from(entry.msg_addr_lo)
                    }
                    0x8 => (u64::from(entry.vector_ctl) << 32) | u64::from(entry.msg_data),
                    _ => {
                        error!("invalid MSI-X table read offset 0x{:x}", offset);
                        return;
                    }
                };

                LittleEndian::write_u64(data, value);
            }
            _ => error!("invalid MSI-X table read length {}", data.len()),
        }
    }

    /// Store a guest table write. Returns the touched vector when the
    /// write landed on a valid entry.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Option<usize> {
        let index: usize = (offset / MSIX_TABLE_ENTRY_SIZE as u64) as usize;
        let modulo_offset = offset % MSIX_TABLE_ENTRY_SIZE as u64;

        let entry = self.entries.get_mut(index)?;

        match data.len() {
            4 => {
                let value = LittleEndian::read_u32(data);
                match modulo_offset {
                    0x0 => entry.msg_addr_lo = value,
                    0x4 => entry.msg_addr_hi = value,
                    0x8 => entry.msg_data = value,
                    0xc => entry.vector_ctl = value,
                    _ => {
                        error!("invalid MSI-X table write offset 0x{:x}", offset);
                        return None;
                    }
                }
            }
            8 => {
                let value = LittleEndian::read_u64(data);
                match modulo_offset {
                    0x0 => {
                        entry.msg_addr_lo = (value & 0xffff_ffff) as u32;
                        entry.msg_addr_hi = (value >> 32) as u32;
                    }
                    0x8 => {
                        entry.msg_data = (value & 0xffff_ffff) as u32;
                        entry.vector_ctl = (value >> 32) as u32;
                    }
                    _ => {
                        error!("invalid MSI-X table write offset 0x{:x}", offset);
                        return None;
                    }
                }
            }
            _ => {
                error!("invalid MSI-X table write length {}", data.len());
                return None;
            }
        }

        Some(index)
    }
}
