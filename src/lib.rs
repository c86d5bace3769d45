// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Assignment of physical PCI/PCIe functions to a guest through a
//! kernel VFIO channel: config space proxying, BAR mapping, interrupt
//! delivery, DMA translation, IOMMU domain sharing and the host
//! initiated hot-remove handshake.

#[macro_use]
extern crate log;
#[macro_use]
extern crate vmm_sys_util;

pub mod channel;
pub mod config;
pub mod device;
pub mod dma;
pub mod event;
pub mod interrupt;
pub mod iommu;
pub mod msi;
pub mod msix;
pub mod resources;
pub mod unplug;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub use crate::channel::{ChannelError, VfioChannel, VfioChannelOps};
pub use crate::device::{VfioPciDevice, VfioPciError};
pub use crate::dma::DmaTranslator;
pub use crate::event::{EpollContext, EpollDispatch};
pub use crate::interrupt::InterruptMode;
pub use crate::iommu::{DomainRegistry, DomainSelector};
pub use crate::unplug::RemovalBroker;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid host address '{0}', expected [SSSS:]BB:DD.F")]
    InvalidHostAddress(String),
    #[error("No such host device {0}")]
    NoSuchHostDevice(PciHostAddress),
    #[error("Host device {0} is not bound to the assignment driver: {1}")]
    NotBound(PciHostAddress, #[source] std::io::Error),
}

/// Identity of a physical PCI function: segment, bus, device, function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PciHostAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FromStr for PciHostAddress {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ConfigurationError::InvalidHostAddress(s.to_owned());

        let (left, func) = s.rsplit_once('.').ok_or_else(err)?;
        let function = u8::from_str_radix(func, 16).map_err(|_| err())?;

        let fields: Vec<&str> = left.split(':').collect();
        // The segment is optional and defaults to zero.
        let (segment, bus, device) = match fields.as_slice() {
            [bus, device] => (0, *bus, *device),
            [segment, bus, device] => (
                u16::from_str_radix(segment, 16).map_err(|_| err())?,
                *bus,
                *device,
            ),
            _ => return Err(err()),
        };

        let bus = u8::from_str_radix(bus, 16).map_err(|_| err())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| err())?;

        if device >= 32 || function >= 8 {
            return Err(err());
        }

        Ok(PciHostAddress {
            segment,
            bus,
            device,
            function,
        })
    }
}

impl fmt::Display for PciHostAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

impl PciHostAddress {
    /// Path of the device node in the host sysfs tree.
    pub fn sysfs_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/sys/bus/pci/devices/{}", self))
    }
}

/// A message-signalled interrupt ready for injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsiMessage {
    pub addr: u64,
    pub data: u32,
}

/// Services the surrounding VMM provides to an assigned device.
///
/// One implementation exists per device handle; the core calls out
/// through it for guest interrupt delivery and cooperative unplug.
pub trait VmmServices {
    /// Interrupt line currently routed to the given INTx pin (0 = pin A).
    fn intx_line(&self, pin: u8) -> u32;

    /// Assert or deassert a guest interrupt line.
    fn set_intx(&self, line: u32, level: bool);

    /// Inject a message-signalled interrupt into the guest.
    fn inject_msi(&self, msg: MsiMessage);

    /// Ask the guest to cooperatively release the device.
    fn request_unplug(&self, device: &PciHostAddress);
}
