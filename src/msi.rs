// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use crate::MsiMessage;

// MSI control masks
const MSI_CTL_ENABLE: u16 = 0x1;
const MSI_CTL_MULTI_MSG_ENABLE: u16 = 0x70;
const MSI_CTL_64_BITS: u16 = 0x80;
const MSI_CTL_PER_VECTOR: u16 = 0x100;

/// Shadow of the MSI capability registers, fed by guest config writes.
///
/// The physical capability keeps its own state; this copy exists so
/// that enable transitions can be detected and vector messages
/// composed without touching the device.
#[derive(Clone, Copy, Default)]
pub struct MsiCapability {
    pub offset: u32,
    msg_ctl: u16,
    msg_addr_lo: u32,
    msg_addr_hi: u32,
    msg_data: u16,
}

impl MsiCapability {
    pub fn new(offset: u32, msg_ctl: u16) -> Self {
        MsiCapability {
            offset,
            msg_ctl,
            ..Default::default()
        }
    }

    pub fn addr_64_bits(&self) -> bool {
        self.msg_ctl & MSI_CTL_64_BITS == MSI_CTL_64_BITS
    }

    pub fn per_vector_mask(&self) -> bool {
        self.msg_ctl & MSI_CTL_PER_VECTOR == MSI_CTL_PER_VECTOR
    }

    pub fn enabled(&self) -> bool {
        self.msg_ctl & MSI_CTL_ENABLE == MSI_CTL_ENABLE
    }

    pub fn num_enabled_vectors(&self) -> usize {
        let field = (self.msg_ctl >> 4) & 0x7;
        if field > 5 {
            return 0;
        }

        1 << field
    }

    /// Length of the capability window in config space.
    pub fn size(&self) -> u32 {
        let mut size: u32 = 0xa;

        if self.addr_64_bits() {
            size += 0x4;
        }
        if self.per_vector_mask() {
            size += 0xa;
        }

        size
    }

    pub fn contains(&self, offset: u32, len: u32) -> bool {
        offset + len > self.offset && offset < self.offset + self.size()
    }

    /// Compose the message the device would have signalled for the
    /// given vector. The low data bits carry the vector number when
    /// multiple messages are enabled.
    pub fn message(&self, vector: u16) -> MsiMessage {
        let addr = if self.addr_64_bits() {
            (u64::from(self.msg_addr_hi) << 32) | u64::from(self.msg_addr_lo)
        } else {
            u64::from(self.msg_addr_lo)
        };

        let count = self.num_enabled_vectors() as u16;
        let data = (self.msg_data & !(count.saturating_sub(1))) | vector;

        MsiMessage {
            addr,
            data: data.into(),
        }
    }

    /// Fold a guest config write into the shadow registers.
    pub fn update(&mut self, offset: u64, data: &[u8]) {
        // Calculate message data offset depending on the address type.
        let msg_data_offset: u64 = if self.addr_64_bits() { 0xc } else { 0x8 };

        // Update "Message Control" register
        if offset <= 2 && offset + data.len() as u64 > 2 {
            let start = (2 - offset) as usize;
            let mut ctl = self.msg_ctl.to_le_bytes();
            for (i, byte) in data[start..std::cmp::min(start + 2, data.len())]
                .iter()
                .enumerate()
            {
                ctl[i] = *byte;
            }
            // Only enable and multiple-message enable are writable.
            let wanted = u16::from_le_bytes(ctl);
            self.msg_ctl = (self.msg_ctl & !(MSI_CTL_ENABLE | MSI_CTL_MULTI_MSG_ENABLE))
                | (wanted & (MSI_CTL_ENABLE | MSI_CTL_MULTI_MSG_ENABLE));
        }

        // Update "Message Address" register
        if offset >= 0x4 && offset < 0x8 {
            self.update_reg32(&mut |cap| &mut cap.msg_addr_lo, offset - 0x4, data);
        }

        // Update "Message Upper Address" register
        if self.addr_64_bits() && offset >= 0x8 && offset < 0xc {
            self.update_reg32(&mut |cap| &mut cap.msg_addr_hi, offset - 0x8, data);
        }

        // Update "Message Data" register
        if offset >= msg_data_offset && offset < msg_data_offset + 2 {
            let shift = ((offset - msg_data_offset) * 8) as u32;
            let mut val = self.msg_data;
            for (i, byte) in data.iter().take(2).enumerate() {
                let bit = shift + (i as u32) * 8;
                if bit < 16 {
                    val = (val & !(0xff << bit)) | (u16::from(*byte) << bit);
                }
            }
            self.msg_data = val;
        }
    }

    fn update_reg32(
        &mut self,
        field: &mut dyn FnMut(&mut Self) -> &mut u32,
        offset: u64,
        data: &[u8],
    ) {
        let mut val = *field(self);
        let shift = (offset * 8) as u32;
        for (i, byte) in data.iter().take(4).enumerate() {
            let bit = shift + (i as u32) * 8;
            if bit < 32 {
                val = (val & !(0xff << bit)) | (u32::from(*byte) << bit);
            }
        }
        *field(self) = val;
    }
}
