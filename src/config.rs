// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Config space proxying.
//!
//! Most of the physical config space is passed straight through to
//! the channel. The BAR registers, the expansion ROM register and the
//! MSI/MSI-X capability windows are served from a local image so that
//! guest-programmed values never reach the device registers that the
//! host still relies on.

use crate::channel::VfioChannelOps;
use crate::interrupt::InterruptUpdateAction;
use crate::msi::MsiCapability;
use crate::msix::MsixCapability;

pub const PCI_CONFIG_SPACE_SIZE: u32 = 0x100;
pub const PCI_CONFIG_HEADER_SIZE: u32 = 0x40;

pub const PCI_COMMAND: u32 = 0x04;
pub const PCI_STATUS: u32 = 0x06;
pub const PCI_HEADER_TYPE: u32 = 0x0e;
pub const PCI_BASE_ADDRESS_0: u32 = 0x10;
pub const PCI_ROM_ADDRESS: u32 = 0x30;
pub const PCI_CAPABILITY_LIST: u32 = 0x34;
pub const PCI_INTERRUPT_PIN: u32 = 0x3d;

pub const PCI_STATUS_CAP_LIST: u16 = 0x10;
pub const PCI_HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;

pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_MSIX: u8 = 0x11;

const PCI_NUM_BAR_BYTES: u32 = 24;

/// Walk the capability list looking for the given id.
///
/// The walk is bounded so a corrupted list on the device cannot spin
/// us forever, and pointers into the header are rejected.
pub fn find_capability(channel: &dyn VfioChannelOps, cap_id: u8) -> Option<u32> {
    let status = channel.read_config_word(PCI_STATUS);
    if status & PCI_STATUS_CAP_LIST == 0 {
        return None;
    }

    let mut pos = u32::from(channel.read_config_byte(PCI_CAPABILITY_LIST)) & !0x3;
    let max = (PCI_CONFIG_SPACE_SIZE - PCI_CONFIG_HEADER_SIZE) / 4;

    for _ in 0..max {
        if pos < PCI_CONFIG_HEADER_SIZE {
            break;
        }

        let id = channel.read_config_byte(pos);
        if id == 0xff || id == 0 {
            break;
        }
        if id == cap_id {
            return Some(pos);
        }

        pos = u32::from(channel.read_config_byte(pos + 1)) & !0x3;
    }

    None
}

pub struct PciConfig {
    image: [u8; PCI_CONFIG_SPACE_SIZE as usize],
    pub msi: Option<MsiCapability>,
    pub msix: Option<MsixCapability>,
}

impl PciConfig {
    /// Snapshot the physical config space and locate the MSI and
    /// MSI-X capabilities.
    ///
    /// Stale BAR and ROM values left by the host are scrubbed from
    /// the local image, and the multi-function bit is cleared since
    /// sibling functions are never exposed together.
    pub fn probe(channel: &dyn VfioChannelOps) -> Self {
        let mut image = [0xffu8; PCI_CONFIG_SPACE_SIZE as usize];
        for (i, chunk) in image.chunks_mut(4).enumerate() {
            let val = channel.read_config_dword(i as u32 * 4);
            chunk.copy_from_slice(&val.to_le_bytes());
        }

        for i in PCI_BASE_ADDRESS_0..PCI_BASE_ADDRESS_0 + PCI_NUM_BAR_BYTES {
            image[i as usize] = 0;
        }
        for i in PCI_ROM_ADDRESS..PCI_ROM_ADDRESS + 4 {
            image[i as usize] = 0;
        }
        image[PCI_HEADER_TYPE as usize] &= !PCI_HEADER_TYPE_MULTI_FUNCTION;

        let msi = find_capability(channel, PCI_CAP_ID_MSI)
            .map(|pos| MsiCapability::new(pos, channel.read_config_word(pos + 2)));

        let msix = find_capability(channel, PCI_CAP_ID_MSIX).map(|pos| {
            MsixCapability::new(
                pos,
                channel.read_config_word(pos + 2),
                channel.read_config_dword(pos + 4),
                channel.read_config_dword(pos + 8),
            )
        });

        if let Some(cap) = &msi {
            debug!("MSI capability at 0x{:x}", cap.offset);
        }
        if let Some(cap) = &msix {
            debug!(
                "MSI-X capability at 0x{:x}, {} entries, table in BAR{} at 0x{:x}",
                cap.offset,
                cap.table_size(),
                cap.table_bir(),
                cap.table_offset()
            );
        }

        PciConfig { image, msi, msix }
    }

    fn emulated(&self, offset: u32, len: u32) -> bool {
        let end = u64::from(offset) + u64::from(len);
        let overlap = |start: u32, size: u32| end > u64::from(start) && offset < start + size;

        if overlap(PCI_BASE_ADDRESS_0, PCI_NUM_BAR_BYTES) || overlap(PCI_ROM_ADDRESS, 4) {
            return true;
        }
        if let Some(cap) = &self.msi {
            if cap.contains(offset, len) {
                return true;
            }
        }
        if let Some(cap) = &self.msix {
            if cap.contains(offset, len) {
                return true;
            }
        }

        false
    }

    /// Guest config read. Emulated ranges come from the local image,
    /// everything else from the device; a dead channel reads as
    /// all-ones.
    pub fn read(&self, channel: &dyn VfioChannelOps, offset: u32, data: &mut [u8]) {
        let len = data.len() as u32;
        if u64::from(offset) + u64::from(len) > u64::from(PCI_CONFIG_SPACE_SIZE) {
            for byte in data.iter_mut() {
                *byte = 0xff;
            }
            return;
        }

        if self.emulated(offset, len) {
            data.copy_from_slice(&self.image[offset as usize..(offset + len) as usize]);
            return;
        }

        if channel.config_read(offset, data).is_err() {
            warn!("config read at 0x{:x} failed, returning all-ones", offset);
            for byte in data.iter_mut() {
                *byte = 0xff;
            }
        }
    }

    /// Guest config write. The write is forwarded to the device
    /// first, then mirrored into the local image, then checked for an
    /// interrupt mode transition. At most one transition can result
    /// from a single write.
    pub fn write(
        &mut self,
        channel: &dyn VfioChannelOps,
        offset: u32,
        data: &[u8],
    ) -> Option<InterruptUpdateAction> {
        let len = data.len() as u32;
        if u64::from(offset) + u64::from(len) > u64::from(PCI_CONFIG_SPACE_SIZE) {
            return None;
        }

        if let Err(e) = channel.config_write(offset, data) {
            warn!("config write at 0x{:x} failed: {}", offset, e);
        }

        if self.emulated(offset, len) || offset < PCI_CONFIG_HEADER_SIZE {
            self.image[offset as usize..(offset + len) as usize].copy_from_slice(data);
        }

        if let Some(cap) = self.msi.as_mut() {
            if cap.contains(offset, len) {
                let was_enabled = cap.enabled();
                // A write may start below the window; only the tail
                // that lands inside it reaches the shadow registers.
                let skip = cap.offset.saturating_sub(offset);
                cap.update(u64::from(offset + skip - cap.offset), &data[skip as usize..]);
                return match (was_enabled, cap.enabled()) {
                    (false, true) => Some(InterruptUpdateAction::EnableMsi),
                    (true, false) => Some(InterruptUpdateAction::DisableMsi),
                    _ => None,
                };
            }
        }

        if let Some(cap) = self.msix.as_mut() {
            if cap.contains(offset, len) {
                let was_enabled = cap.enabled();
                let skip = cap.offset.saturating_sub(offset);
                cap.update(u64::from(offset + skip - cap.offset), &data[skip as usize..]);
                return match (was_enabled, cap.enabled()) {
                    (false, true) => Some(InterruptUpdateAction::EnableMsix),
                    (true, false) => Some(InterruptUpdateAction::DisableMsix),
                    _ => None,
                };
            }
        }

        None
    }

    pub fn interrupt_pin(&self) -> u8 {
        self.image[PCI_INTERRUPT_PIN as usize]
    }
}
