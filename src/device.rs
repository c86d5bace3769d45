// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! The assigned device itself.

use std::sync::Arc;

use thiserror::Error;

use crate::channel::{ChannelError, VfioChannelOps};
use crate::config::PciConfig;
use crate::interrupt::{InterruptBridge, InterruptError, InterruptMode, InterruptUpdateAction};
use crate::iommu::{DomainRegistry, DomainSelector, IommuError};
use crate::msix::{MsixTable, MSIX_TABLE_ENTRY_SIZE};
use crate::resources::{direct_segments, probe_bars, MmapRegion, PciBar, ResourceError};
use crate::unplug::{ProtocolError, RemovalBroker};
use crate::{PciHostAddress, VmmServices};

#[derive(Debug, Error)]
pub enum VfioPciError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Interrupt(#[from] InterruptError),
    #[error(transparent)]
    Iommu(#[from] IommuError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, VfioPciError>;

pub struct VfioPciDevice {
    host: PciHostAddress,
    channel: Arc<dyn VfioChannelOps>,
    config: PciConfig,
    interrupt: InterruptBridge,
    bars: Vec<PciBar>,
    mappings: Vec<(u32, MmapRegion)>,
    msix_table: Option<MsixTable>,
}

impl VfioPciDevice {
    /// Attach a physical function. On any failure the steps already
    /// taken are undone, in reverse, before the error is returned.
    pub fn attach(
        host: PciHostAddress,
        channel: Arc<dyn VfioChannelOps>,
        vmm: &dyn VmmServices,
        registry: &mut DomainRegistry,
        mut broker: Option<&mut RemovalBroker>,
        selector: DomainSelector,
    ) -> Result<Self> {
        if let Some(broker) = broker.as_deref_mut() {
            broker.register(host)?;
        }

        if let Err(e) = registry.join(host, channel.clone(), selector) {
            if let Some(broker) = broker.as_deref_mut() {
                broker.unregister(&host);
            }
            return Err(e.into());
        }

        let config = PciConfig::probe(channel.as_ref());

        let mut device = VfioPciDevice {
            host,
            channel,
            config,
            interrupt: InterruptBridge::default(),
            bars: Vec::new(),
            mappings: Vec::new(),
            msix_table: None,
        };

        let result = device.setup(vmm);
        if let Err(e) = result {
            device
                .interrupt
                .shutdown(device.channel.as_ref(), vmm, device.msix_table.as_mut());
            device.mappings.clear();
            if let Err(leave) = registry.leave(&host) {
                warn!("failed to leave domain while unwinding: {}", leave);
            }
            if let Some(broker) = broker.as_deref_mut() {
                broker.unregister(&host);
            }
            return Err(e);
        }

        info!("attached {}", host);
        Ok(device)
    }

    fn setup(&mut self, vmm: &dyn VmmServices) -> Result<()> {
        self.bars = probe_bars(self.channel.as_ref())?;

        if let Some(cap) = &self.config.msix {
            self.msix_table = Some(MsixTable::new(cap.table_size()));
        }

        self.map_resources()?;

        let pin = self.config.interrupt_pin();
        self.interrupt
            .enable_intx(self.channel.as_ref(), vmm, pin)?;

        Ok(())
    }

    /// Put direct mappings in place for every BAR that supports them,
    /// splicing the MSI-X table page out of its BAR. A channel that
    /// cannot be mapped leaves every access trapped.
    fn map_resources(&mut self) -> Result<()> {
        let fd = match self.channel.device_fd() {
            Some(fd) => fd,
            None => return Ok(()),
        };

        for bar in &self.bars {
            if !bar.mappable() {
                continue;
            }

            let table_offset = self
                .config
                .msix
                .as_ref()
                .filter(|cap| cap.table_bir() == bar.index)
                .map(|cap| cap.table_offset());

            for segment in direct_segments(bar.len, table_offset) {
                let region = MmapRegion::map(fd, bar.index, segment)?;
                debug!(
                    "BAR{} direct mapping at offset 0x{:x} size 0x{:x}",
                    bar.index, segment.offset, segment.size
                );
                self.mappings.push((bar.index, region));
            }
        }

        Ok(())
    }

    pub fn host(&self) -> &PciHostAddress {
        &self.host
    }

    pub fn bars(&self) -> &[PciBar] {
        &self.bars
    }

    pub fn mappings(&self) -> impl Iterator<Item = (u32, u64, u64, usize)> + '_ {
        self.mappings
            .iter()
            .map(|(bar, m)| (*bar, m.bar_offset, m.host_addr(), m.size()))
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.interrupt.mode()
    }

    pub fn interrupt(&self) -> &InterruptBridge {
        &self.interrupt
    }

    pub fn config_read(&self, offset: u32, data: &mut [u8]) {
        self.config.read(self.channel.as_ref(), offset, data);
    }

    /// Guest config write, with any interrupt mode transition it
    /// triggers applied after the device registers are written.
    pub fn config_write(&mut self, vmm: &dyn VmmServices, offset: u32, data: &[u8]) {
        let action = self.config.write(self.channel.as_ref(), offset, data);

        let result = match action {
            None => Ok(()),
            Some(InterruptUpdateAction::EnableMsi) => match &self.config.msi {
                Some(cap) => self.interrupt.enable_msi(self.channel.as_ref(), vmm, cap),
                None => Ok(()),
            },
            Some(InterruptUpdateAction::DisableMsi) => {
                let pin = self.config.interrupt_pin();
                self.interrupt.disable_msi(self.channel.as_ref(), vmm, pin)
            }
            Some(InterruptUpdateAction::EnableMsix) => match self.msix_table.as_mut() {
                Some(table) => self.interrupt.enable_msix(self.channel.as_ref(), vmm, table),
                None => Ok(()),
            },
            Some(InterruptUpdateAction::DisableMsix) => {
                let pin = self.config.interrupt_pin();
                self.interrupt
                    .disable_msix(self.channel.as_ref(), vmm, pin, self.msix_table.as_mut())
            }
        };

        if let Err(e) = result {
            warn!("interrupt mode change failed: {}", e);
        }
    }

    // Offset of a trapped access within the MSI-X table, if it lands
    // there.
    fn msix_table_offset(&self, bar: u32, offset: u64) -> Option<u64> {
        let cap = self.config.msix.as_ref()?;
        let table = self.msix_table.as_ref()?;

        if cap.table_bir() != bar {
            return None;
        }

        let start = cap.table_offset();
        let len = table.entries.len() as u64 * MSIX_TABLE_ENTRY_SIZE as u64;
        if offset >= start && offset < start + len {
            Some(offset - start)
        } else {
            None
        }
    }

    /// Trapped BAR read. Table accesses come from the local entries,
    /// anything else goes to the device.
    pub fn bar_read(&mut self, vmm: &dyn VmmServices, bar: u32, offset: u64, data: &mut [u8]) {
        if let Some(table_offset) = self.msix_table_offset(bar, offset) {
            if let Some(table) = &self.msix_table {
                table.read(table_offset, data);
            }
        } else if let Err(e) = self.channel.region_read(bar, offset, data) {
            warn!("BAR{} read at 0x{:x} failed: {}", bar, offset, e);
            for byte in data.iter_mut() {
                *byte = 0xff;
            }
        }

        // A driver touching its registers has seen the interrupt.
        self.interrupt.guest_eoi(self.channel.as_ref(), vmm);
    }

    /// Trapped BAR write.
    pub fn bar_write(&mut self, vmm: &dyn VmmServices, bar: u32, offset: u64, data: &[u8]) {
        if let Some(table_offset) = self.msix_table_offset(bar, offset) {
            if let Some(table) = self.msix_table.as_mut() {
                if let Some(vector) = table.write(table_offset, data) {
                    let message = table.entries[vector].message();
                    self.interrupt.update_vector_message(vector, message);
                }
            }
        } else if let Err(e) = self.channel.region_write(bar, offset, data) {
            warn!("BAR{} write at 0x{:x} failed: {}", bar, offset, e);
        }

        self.interrupt.guest_eoi(self.channel.as_ref(), vmm);
    }

    pub fn rom_read(&self, offset: u64, data: &mut [u8]) {
        if let Err(e) = self
            .channel
            .region_read(crate::channel::VFIO_PCI_ROM_SPACE, offset, data)
        {
            warn!("ROM read at 0x{:x} failed: {}", offset, e);
            for byte in data.iter_mut() {
                *byte = 0xff;
            }
        }
    }

    /// The line eventfd fired.
    pub fn intx_fired(&mut self, vmm: &dyn VmmServices) {
        self.interrupt.intx_fired(vmm);
    }

    /// The guest acknowledged the line interrupt.
    pub fn guest_eoi(&mut self, vmm: &dyn VmmServices) {
        self.interrupt.guest_eoi(self.channel.as_ref(), vmm);
    }

    /// Guest interrupt routing changed.
    pub fn irq_routing_changed(&mut self, vmm: &dyn VmmServices) {
        self.interrupt.irq_routing_changed(self.channel.as_ref(), vmm);
    }

    /// A message vector eventfd fired.
    pub fn vector_fired(&self, vmm: &dyn VmmServices, vector: usize) {
        let masked = match self.interrupt.mode() {
            InterruptMode::Msix => {
                let function_masked = self
                    .config
                    .msix
                    .as_ref()
                    .map(|cap| cap.function_masked())
                    .unwrap_or(false);
                let entry_masked = self
                    .msix_table
                    .as_ref()
                    .and_then(|t| t.entries.get(vector))
                    .map(|e| e.masked())
                    .unwrap_or(true);
                function_masked || entry_masked
            }
            InterruptMode::Msi => false,
            _ => return,
        };

        self.interrupt.vector_fired(vmm, vector, masked);
    }

    /// Reset the function to a clean state.
    pub fn reset(&self) {
        if let Err(e) = self.channel.reset_function() {
            warn!("failed to reset {}: {}", self.host, e);
        }
    }

    /// Detach, undoing attach in reverse: interrupts first, then the
    /// direct mappings, then domain membership, then the hot-remove
    /// registration.
    pub fn detach(
        mut self,
        vmm: &dyn VmmServices,
        registry: &mut DomainRegistry,
        broker: Option<&mut RemovalBroker>,
    ) {
        self.interrupt
            .shutdown(self.channel.as_ref(), vmm, self.msix_table.as_mut());
        self.mappings.clear();

        if let Err(e) = registry.leave(&self.host) {
            warn!("failed to leave domain: {}", e);
        }

        if let Some(broker) = broker {
            broker.unregister(&self.host);
        }

        info!("detached {}", self.host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests_support::{Call, FakeChannel};
    use crate::config::{PCI_CAPABILITY_LIST, PCI_INTERRUPT_PIN, PCI_STATUS};
    use crate::interrupt::tests_support::FakeVmm;

    fn host() -> PciHostAddress {
        let _ = env_logger::builder().is_test(true).try_init();
        PciHostAddress {
            segment: 0,
            bus: 1,
            device: 2,
            function: 0,
        }
    }

    // A function with one memory BAR, an interrupt pin and an MSI-X
    // capability whose table lives in BAR0 at 0x1000.
    fn fake_device() -> FakeChannel {
        let mut fake = FakeChannel::new();
        fake.bars = vec![0x3000, 0, 0, 0, 0, 0];
        fake.bar_data
            .borrow_mut()
            .insert(0, vec![0u8; 0x3000]);
        fake.config.borrow_mut()[PCI_INTERRUPT_PIN as usize] = 1;
        fake.config.borrow_mut()[PCI_STATUS as usize] = 0x10;
        fake.config.borrow_mut()[PCI_CAPABILITY_LIST as usize] = 0x70;
        fake.config.borrow_mut()[0x70] = 0x11; // MSI-X
        fake.config.borrow_mut()[0x71] = 0x00;
        fake.config.borrow_mut()[0x72] = 0x03; // four entries
        fake.config.borrow_mut()[0x74] = 0x00;
        fake.config.borrow_mut()[0x75] = 0x10; // table at 0x1000, BIR 0
        fake.config.borrow_mut()[0x78] = 0x00;
        fake.config.borrow_mut()[0x79] = 0x20; // PBA at 0x2000, BIR 0
        fake
    }

    fn attach(channel: &Arc<FakeChannel>, vmm: &FakeVmm) -> (VfioPciDevice, DomainRegistry) {
        let mut registry = DomainRegistry::new();
        let device = VfioPciDevice::attach(
            host(),
            channel.clone(),
            vmm,
            &mut registry,
            None,
            DomainSelector::External(5),
        )
        .unwrap();
        (device, registry)
    }

    #[test]
    fn attach_joins_domain_then_enables_intx() {
        let channel = Arc::new(fake_device());
        let vmm = FakeVmm::default();
        let (device, _registry) = attach(&channel, &vmm);

        assert_eq!(device.interrupt_mode(), InterruptMode::Intx);
        assert_eq!(device.bars().len(), 1);

        let calls = channel.calls();
        let domain = calls
            .iter()
            .position(|c| *c == Call::SetIommuDomain(Some(5)))
            .unwrap();
        let intx = calls
            .iter()
            .position(|c| *c == Call::SetIrqEventFd(true))
            .unwrap();
        assert!(domain < intx);
    }

    #[test]
    fn msix_table_accesses_are_trapped() {
        let channel = Arc::new(fake_device());
        let vmm = FakeVmm::default();
        let (mut device, _registry) = attach(&channel, &vmm);

        // A write into the table page never reaches the device.
        device.bar_write(&vmm, 0, 0x1000, &0xfee0_0000u32.to_le_bytes());
        assert_eq!(channel.bar_data.borrow()[&0][0x1000], 0);

        let mut data = [0u8; 4];
        device.bar_read(&vmm, 0, 0x1000, &mut data);
        assert_eq!(u32::from_le_bytes(data), 0xfee0_0000);

        // Outside the table the BAR is passed through.
        channel.bar_data.borrow_mut().get_mut(&0).unwrap()[0x10] = 0xab;
        device.bar_read(&vmm, 0, 0x10, &mut data);
        assert_eq!(data[0], 0xab);
    }

    #[test]
    fn msix_enable_uses_trapped_table_entries() {
        let channel = Arc::new(fake_device());
        let vmm = FakeVmm::default();
        let (mut device, _registry) = attach(&channel, &vmm);

        device.bar_write(&vmm, 0, 0x1000, &0xfee0_0000u32.to_le_bytes());
        device.bar_write(&vmm, 0, 0x1008, &0x41u32.to_le_bytes());

        // Set the MSI-X enable bit in the control word.
        device.config_write(&vmm, 0x72, &[0x03, 0x80]);
        assert_eq!(device.interrupt_mode(), InterruptMode::Msix);
        assert!(channel.calls().contains(&Call::SetMsixEventFds(4)));
        assert!(device
            .msix_table
            .as_ref()
            .unwrap()
            .entries
            .iter()
            .all(|e| e.claimed()));

        device.vector_fired(&vmm, 0);
        assert_eq!(
            vmm.calls.borrow().last(),
            Some(&crate::interrupt::tests_support::VmmCall::InjectMsi(
                crate::MsiMessage {
                    addr: 0xfee0_0000,
                    data: 0x41
                }
            ))
        );

        // Clearing the enable bit releases the vector markers and
        // falls back to the line interrupt.
        device.config_write(&vmm, 0x72, &[0x03, 0x00]);
        assert_eq!(device.interrupt_mode(), InterruptMode::Intx);
        assert!(device
            .msix_table
            .as_ref()
            .unwrap()
            .entries
            .iter()
            .all(|e| !e.claimed()));
    }

    #[test]
    fn masked_vector_is_not_injected() {
        let channel = Arc::new(fake_device());
        let vmm = FakeVmm::default();
        let (mut device, _registry) = attach(&channel, &vmm);

        device.bar_write(&vmm, 0, 0x1000, &0xfee0_0000u32.to_le_bytes());
        device.bar_write(&vmm, 0, 0x100c, &1u32.to_le_bytes());
        device.config_write(&vmm, 0x72, &[0x03, 0x80]);

        let before = vmm.calls.borrow().len();
        device.vector_fired(&vmm, 0);
        assert_eq!(vmm.calls.borrow().len(), before);
    }

    #[test]
    fn detach_reverses_attach() {
        let channel = Arc::new(fake_device());
        let vmm = FakeVmm::default();
        let (device, mut registry) = attach(&channel, &vmm);

        channel.calls.borrow_mut().clear();
        device.detach(&vmm, &mut registry, None);

        let calls = channel.calls();
        let intx = calls
            .iter()
            .position(|c| *c == Call::SetIrqEventFd(false))
            .unwrap();
        let domain = calls
            .iter()
            .position(|c| *c == Call::SetIommuDomain(None))
            .unwrap();
        assert!(intx < domain);
    }
}
