// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Interrupt delivery.
//!
//! The device is always in exactly one mode. Transitions are driven
//! by guest config writes to the MSI/MSI-X capabilities; the physical
//! registers are written before the channel registration changes, so
//! the device can never signal through a sink that is not set up yet.

use std::io;

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;

use crate::channel::{ChannelError, VfioChannelOps};
use crate::msi::MsiCapability;
use crate::msix::MsixTable;
use crate::{MsiMessage, VmmServices};

/// Transition detected by a guest config write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptUpdateAction {
    EnableMsi,
    DisableMsi,
    EnableMsix,
    DisableMsix,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptMode {
    None,
    Intx,
    Msi,
    Msix,
}

#[derive(Debug, Error)]
pub enum InterruptError {
    #[error("Failed to create eventfd: {0}")]
    EventFd(#[source] io::Error),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, InterruptError>;

struct IntxState {
    pin: u8,
    line: u32,
    pending: bool,
    event: EventFd,
}

pub struct MsiVector {
    pub event: EventFd,
    pub message: MsiMessage,
}

pub struct InterruptBridge {
    mode: InterruptMode,
    intx: Option<IntxState>,
    vectors: Vec<MsiVector>,
}

impl Default for InterruptBridge {
    fn default() -> Self {
        InterruptBridge {
            mode: InterruptMode::None,
            intx: None,
            vectors: Vec::new(),
        }
    }
}

impl InterruptBridge {
    pub fn mode(&self) -> InterruptMode {
        self.mode
    }

    pub fn intx_event(&self) -> Option<&EventFd> {
        self.intx.as_ref().map(|i| &i.event)
    }

    pub fn vectors(&self) -> &[MsiVector] {
        &self.vectors
    }

    /// Enter line-interrupt mode. A function without an interrupt pin
    /// stays quiet.
    pub fn enable_intx(
        &mut self,
        channel: &dyn VfioChannelOps,
        vmm: &dyn VmmServices,
        pin: u8,
    ) -> Result<()> {
        if pin == 0 {
            return Ok(());
        }

        let event = EventFd::new(libc::EFD_NONBLOCK).map_err(InterruptError::EventFd)?;
        channel.set_irq_eventfd(Some(&event))?;

        self.intx = Some(IntxState {
            pin,
            line: vmm.intx_line(pin - 1),
            pending: false,
            event,
        });
        self.mode = InterruptMode::Intx;

        // The physical line may have fired while no sink was attached.
        channel.unmask_irq()?;

        Ok(())
    }

    fn disable_intx(&mut self, channel: &dyn VfioChannelOps, vmm: &dyn VmmServices) -> Result<()> {
        if let Some(intx) = self.intx.take() {
            if intx.pending {
                vmm.set_intx(intx.line, false);
            }
            channel.set_irq_eventfd(None)?;
        }
        self.mode = InterruptMode::None;
        Ok(())
    }

    /// The line eventfd fired: assert the guest line. The physical
    /// line stays masked until the guest acknowledges.
    pub fn intx_fired(&mut self, vmm: &dyn VmmServices) {
        if let Some(intx) = self.intx.as_mut() {
            intx.pending = true;
            vmm.set_intx(intx.line, true);
        }
    }

    /// Guest end-of-interrupt: deassert and let the physical line
    /// fire again.
    pub fn guest_eoi(&mut self, channel: &dyn VfioChannelOps, vmm: &dyn VmmServices) {
        if let Some(intx) = self.intx.as_mut() {
            if !intx.pending {
                return;
            }
            intx.pending = false;
            vmm.set_intx(intx.line, false);
            if let Err(e) = channel.unmask_irq() {
                warn!("failed to unmask line interrupt: {}", e);
            }
        }
    }

    /// Guest interrupt routing changed. Deasserts the old line and
    /// acknowledges on the guest's behalf so the device refires on
    /// the new one.
    pub fn irq_routing_changed(&mut self, channel: &dyn VfioChannelOps, vmm: &dyn VmmServices) {
        let intx = match self.intx.as_mut() {
            Some(intx) => intx,
            None => return,
        };

        let new_line = vmm.intx_line(intx.pin - 1);
        if new_line == intx.line {
            return;
        }

        debug!("line interrupt moved {} -> {}", intx.line, new_line);
        vmm.set_intx(intx.line, false);
        intx.line = new_line;
        self.guest_eoi(channel, vmm);
    }

    /// Enter MSI mode with the vector count and messages the guest
    /// programmed into the capability.
    pub fn enable_msi(
        &mut self,
        channel: &dyn VfioChannelOps,
        vmm: &dyn VmmServices,
        cap: &MsiCapability,
    ) -> Result<()> {
        self.disable_intx(channel, vmm)?;

        let count = cap.num_enabled_vectors();
        let mut vectors = Vec::with_capacity(count);
        for i in 0..count {
            let event = EventFd::new(libc::EFD_NONBLOCK).map_err(InterruptError::EventFd)?;
            vectors.push(MsiVector {
                event,
                message: cap.message(i as u16),
            });
        }

        let fds: Vec<&EventFd> = vectors.iter().map(|v| &v.event).collect();
        if let Err(e) = channel.set_msi_eventfds(&fds) {
            // Message interrupts stay broken until the guest retries.
            warn!("failed to register {} MSI vectors: {}", count, e);
            self.mode = InterruptMode::None;
            return Err(e.into());
        }

        self.vectors = vectors;
        self.mode = InterruptMode::Msi;
        debug!("MSI enabled with {} vectors", count);

        Ok(())
    }

    /// Leave MSI mode and fall back to the line interrupt. The local
    /// state is torn down even when the channel refuses to drop the
    /// registration; the guest already sees the capability disabled.
    pub fn disable_msi(
        &mut self,
        channel: &dyn VfioChannelOps,
        vmm: &dyn VmmServices,
        pin: u8,
    ) -> Result<()> {
        self.vectors.clear();
        self.mode = InterruptMode::None;
        if let Err(e) = channel.set_msi_eventfds(&[]) {
            warn!("failed to drop MSI vector registration: {}", e);
        }

        self.enable_intx(channel, vmm, pin)
    }

    /// Enter MSI-X mode with one vector per trapped table entry. The
    /// entries are marked claimed while the registration lives.
    pub fn enable_msix(
        &mut self,
        channel: &dyn VfioChannelOps,
        vmm: &dyn VmmServices,
        table: &mut MsixTable,
    ) -> Result<()> {
        self.disable_intx(channel, vmm)?;

        let mut vectors = Vec::with_capacity(table.entries.len());
        for entry in &table.entries {
            let event = EventFd::new(libc::EFD_NONBLOCK).map_err(InterruptError::EventFd)?;
            vectors.push(MsiVector {
                event,
                message: entry.message(),
            });
        }

        let fds: Vec<&EventFd> = vectors.iter().map(|v| &v.event).collect();
        if let Err(e) = channel.set_msix_eventfds(&fds) {
            warn!("failed to register {} MSI-X vectors: {}", fds.len(), e);
            self.mode = InterruptMode::None;
            return Err(e.into());
        }

        table.claim_vectors();
        self.vectors = vectors;
        self.mode = InterruptMode::Msix;
        debug!("MSI-X enabled with {} vectors", self.vectors.len());

        Ok(())
    }

    /// Leave MSI-X mode and fall back to the line interrupt. Local
    /// state and the vector markers go away even when the channel
    /// refuses to drop the registration.
    pub fn disable_msix(
        &mut self,
        channel: &dyn VfioChannelOps,
        vmm: &dyn VmmServices,
        pin: u8,
        table: Option<&mut MsixTable>,
    ) -> Result<()> {
        self.vectors.clear();
        self.mode = InterruptMode::None;
        if let Some(table) = table {
            table.release_vectors();
        }
        if let Err(e) = channel.set_msix_eventfds(&[]) {
            warn!("failed to drop MSI-X vector registration: {}", e);
        }

        self.enable_intx(channel, vmm, pin)
    }

    /// A guest table write changed an entry while MSI-X is live.
    pub fn update_vector_message(&mut self, vector: usize, message: MsiMessage) {
        if let Some(v) = self.vectors.get_mut(vector) {
            v.message = message;
        }
    }

    /// A vector eventfd fired: inject its message, unless the entry
    /// is masked.
    pub fn vector_fired(&self, vmm: &dyn VmmServices, vector: usize, masked: bool) {
        let v = match self.vectors.get(vector) {
            Some(v) => v,
            None => return,
        };

        if masked {
            trace!("dropping masked vector {}", vector);
            return;
        }

        vmm.inject_msi(v.message);
    }

    /// Drop every registration. Used at detach and reset.
    pub fn shutdown(
        &mut self,
        channel: &dyn VfioChannelOps,
        vmm: &dyn VmmServices,
        table: Option<&mut MsixTable>,
    ) {
        let result = match self.mode {
            InterruptMode::Msi => channel.set_msi_eventfds(&[]),
            InterruptMode::Msix => {
                if let Some(table) = table {
                    table.release_vectors();
                }
                channel.set_msix_eventfds(&[])
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("failed to drop vector registration: {}", e);
        }
        self.vectors.clear();

        if let Err(e) = self.disable_intx(channel, vmm) {
            warn!("failed to drop line registration: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::cell::RefCell;

    use crate::{MsiMessage, PciHostAddress, VmmServices};

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum VmmCall {
        SetIntx { line: u32, level: bool },
        InjectMsi(MsiMessage),
        RequestUnplug(PciHostAddress),
    }

    #[derive(Default)]
    pub struct FakeVmm {
        pub line: u32,
        pub calls: RefCell<Vec<VmmCall>>,
    }

    impl VmmServices for FakeVmm {
        fn intx_line(&self, _pin: u8) -> u32 {
            self.line
        }

        fn set_intx(&self, line: u32, level: bool) {
            self.calls
                .borrow_mut()
                .push(VmmCall::SetIntx { line, level });
        }

        fn inject_msi(&self, msg: MsiMessage) {
            self.calls.borrow_mut().push(VmmCall::InjectMsi(msg));
        }

        fn request_unplug(&self, device: &PciHostAddress) {
            self.calls.borrow_mut().push(VmmCall::RequestUnplug(*device));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::{FakeVmm, VmmCall};
    use super::*;
    use crate::channel::tests_support::{Call, FakeChannel};

    #[test]
    fn intx_lifecycle() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm {
            line: 11,
            ..Default::default()
        };
        let mut bridge = InterruptBridge::default();

        bridge.enable_intx(&channel, &vmm, 1).unwrap();
        assert_eq!(bridge.mode(), InterruptMode::Intx);
        assert_eq!(
            channel.calls(),
            vec![Call::SetIrqEventFd(true), Call::UnmaskIrq]
        );

        bridge.intx_fired(&vmm);
        assert_eq!(
            vmm.calls.borrow().last(),
            Some(&VmmCall::SetIntx {
                line: 11,
                level: true
            })
        );

        bridge.guest_eoi(&channel, &vmm);
        assert_eq!(
            vmm.calls.borrow().last(),
            Some(&VmmCall::SetIntx {
                line: 11,
                level: false
            })
        );
        assert_eq!(channel.calls().last(), Some(&Call::UnmaskIrq));

        // An EOI with nothing pending is a no-op.
        let before = channel.calls().len();
        bridge.guest_eoi(&channel, &vmm);
        assert_eq!(channel.calls().len(), before);
    }

    #[test]
    fn no_pin_means_no_intx() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();

        bridge.enable_intx(&channel, &vmm, 0).unwrap();
        assert_eq!(bridge.mode(), InterruptMode::None);
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn msi_enable_disables_intx_first() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();
        bridge.enable_intx(&channel, &vmm, 1).unwrap();

        let mut cap = MsiCapability::new(0x50, 0);
        cap.update(2, &[0x21, 0x00]); // enable, four vectors

        bridge.enable_msi(&channel, &vmm, &cap).unwrap();
        assert_eq!(bridge.mode(), InterruptMode::Msi);
        assert_eq!(bridge.vectors().len(), 4);

        let calls = channel.calls();
        let drop_pos = calls
            .iter()
            .position(|c| *c == Call::SetIrqEventFd(false))
            .unwrap();
        let msi_pos = calls
            .iter()
            .position(|c| *c == Call::SetMsiEventFds(4))
            .unwrap();
        assert!(drop_pos < msi_pos);
    }

    #[test]
    fn msi_disable_falls_back_to_intx() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();

        let mut cap = MsiCapability::new(0x50, 0);
        cap.update(2, &[0x01, 0x00]);
        bridge.enable_msi(&channel, &vmm, &cap).unwrap();

        bridge.disable_msi(&channel, &vmm, 1).unwrap();
        assert_eq!(bridge.mode(), InterruptMode::Intx);

        let calls = channel.calls();
        assert!(calls.contains(&Call::SetMsiEventFds(0)));
        assert_eq!(calls.last(), Some(&Call::UnmaskIrq));
    }

    #[test]
    fn msi_registration_failure_degrades() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();

        let mut cap = MsiCapability::new(0x50, 0);
        cap.update(2, &[0x01, 0x00]);

        channel.fail_msi_eventfds.set(true);
        assert!(bridge.enable_msi(&channel, &vmm, &cap).is_err());
        assert_eq!(bridge.mode(), InterruptMode::None);
        assert!(bridge.vectors().is_empty());
    }

    #[test]
    fn msix_vector_injection_respects_mask() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();

        let mut table = MsixTable::new(2);
        table.write(0x00, &0xfee0_0000u32.to_le_bytes());
        table.write(0x08, &0x31u32.to_le_bytes());
        bridge.enable_msix(&channel, &vmm, &mut table).unwrap();
        assert_eq!(bridge.mode(), InterruptMode::Msix);

        bridge.vector_fired(&vmm, 0, false);
        assert_eq!(
            vmm.calls.borrow().last(),
            Some(&VmmCall::InjectMsi(MsiMessage {
                addr: 0xfee0_0000,
                data: 0x31
            }))
        );

        let before = vmm.calls.borrow().len();
        bridge.vector_fired(&vmm, 0, true);
        assert_eq!(vmm.calls.borrow().len(), before);
    }

    #[test]
    fn msix_vectors_are_claimed_while_enabled() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();

        let mut table = MsixTable::new(2);
        assert!(!table.entries[0].claimed());

        bridge.enable_msix(&channel, &vmm, &mut table).unwrap();
        assert!(table.entries.iter().all(|e| e.claimed()));

        bridge
            .disable_msix(&channel, &vmm, 1, Some(&mut table))
            .unwrap();
        assert!(table.entries.iter().all(|e| !e.claimed()));
    }

    #[test]
    fn msi_disable_survives_a_teardown_failure() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm::default();
        let mut bridge = InterruptBridge::default();

        let mut cap = MsiCapability::new(0x50, 0);
        cap.update(2, &[0x01, 0x00]);
        bridge.enable_msi(&channel, &vmm, &cap).unwrap();

        // The channel refuses to drop the registration; the bridge
        // still leaves MSI mode and falls back to the line.
        channel.fail_msi_eventfds.set(true);
        bridge.disable_msi(&channel, &vmm, 1).unwrap();
        assert_eq!(bridge.mode(), InterruptMode::Intx);
        assert!(bridge.vectors().is_empty());
    }

    #[test]
    fn routing_change_moves_pending_assertion() {
        let channel = FakeChannel::new();
        let vmm = FakeVmm {
            line: 5,
            ..Default::default()
        };
        let mut bridge = InterruptBridge::default();
        bridge.enable_intx(&channel, &vmm, 1).unwrap();
        bridge.intx_fired(&vmm);

        // Reroute pin A to line 9 while the assertion is pending: the
        // old line drops, the pending state is acked and the device
        // is unmasked so it refires on the new line.
        let vmm2 = FakeVmm {
            line: 9,
            ..Default::default()
        };
        bridge.irq_routing_changed(&channel, &vmm2);
        assert_eq!(
            vmm2.calls.borrow().as_slice(),
            &[
                VmmCall::SetIntx {
                    line: 5,
                    level: false
                },
                VmmCall::SetIntx {
                    line: 9,
                    level: false
                },
            ]
        );
        assert_eq!(channel.calls().last(), Some(&Call::UnmaskIrq));

        bridge.intx_fired(&vmm2);
        assert_eq!(
            vmm2.calls.borrow().last(),
            Some(&VmmCall::SetIntx {
                line: 9,
                level: true
            })
        );
    }
}
