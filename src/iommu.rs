// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! IOMMU isolation domains.
//!
//! Every attached function belongs to exactly one domain. Devices can
//! bring their own domain descriptor, share one crate-wide domain, or
//! get a freshly opened one of their own. Guest memory is bound per
//! domain, through the channel of one of its members, and new domains
//! get the already known regions replayed into them on creation.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use thiserror::Error;

use crate::channel::{ChannelError, VfioChannelOps};
use crate::dma::DmaTranslator;
use crate::PciHostAddress;

const UIOMMU_DEVICE: &str = "/dev/uiommu";

#[derive(Debug, Error)]
pub enum IommuError {
    #[error("Failed to open {UIOMMU_DEVICE}: {0}")]
    OpenDomainDevice(#[source] io::Error),
    #[error("Device {0} is not a member of any domain")]
    NotAMember(PciHostAddress),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub type Result<T> = std::result::Result<T, IommuError>;

/// How a device picks its isolation domain at attach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DomainSelector {
    /// Join the domain behind a descriptor the caller owns.
    External(RawFd),
    /// Join the shared domain, creating it on first use.
    Shared,
    /// Open a private domain.
    Isolated,
}

/// A guest-physical memory region eligible for DMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestRegion {
    pub iova: u64,
    pub vaddr: u64,
    pub size: u64,
}

struct IommuDomain {
    fd: RawFd,
    // Present when this registry opened the descriptor and owns it.
    file: Option<File>,
    shared: bool,
    members: Vec<(PciHostAddress, Arc<dyn VfioChannelOps>)>,
    translator: DmaTranslator,
}

#[derive(Default)]
pub struct DomainRegistry {
    domains: Vec<IommuDomain>,
    regions: Vec<GuestRegion>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Attach a device to the domain its selector names. The first
    /// member of a fresh domain pays for binding all current guest
    /// regions into it.
    pub fn join(
        &mut self,
        host: PciHostAddress,
        channel: Arc<dyn VfioChannelOps>,
        selector: DomainSelector,
    ) -> Result<()> {
        let index = match selector {
            DomainSelector::External(fd) => {
                match self.domains.iter().position(|d| d.fd == fd) {
                    Some(i) => i,
                    None => self.push_domain(fd, None, false),
                }
            }
            DomainSelector::Shared => match self.domains.iter().position(|d| d.shared) {
                Some(i) => i,
                None => {
                    let file = Self::open_domain()?;
                    let fd = file.as_raw_fd();
                    self.push_domain(fd, Some(file), true)
                }
            },
            DomainSelector::Isolated => {
                let file = Self::open_domain()?;
                let fd = file.as_raw_fd();
                self.push_domain(fd, Some(file), false)
            }
        };

        let domain = &mut self.domains[index];
        channel.set_iommu_domain(Some(domain.fd))?;
        let first_member = domain.members.is_empty();
        domain.members.push((host, channel.clone()));
        info!("{} joined IOMMU domain fd {}", host, domain.fd);

        if first_member {
            for region in &self.regions {
                domain
                    .translator
                    .add_region(channel.as_ref(), region.iova, region.vaddr, region.size)?;
            }
        }

        Ok(())
    }

    /// Detach a device from its domain. The domain dies with its last
    /// member; descriptors the registry opened are closed, borrowed
    /// ones are handed back untouched.
    pub fn leave(&mut self, host: &PciHostAddress) -> Result<()> {
        let index = self
            .domains
            .iter()
            .position(|d| d.members.iter().any(|(h, _)| h == host))
            .ok_or(IommuError::NotAMember(*host))?;

        let domain = &mut self.domains[index];
        let member = domain.members.iter().position(|(h, _)| h == host);
        let channel = match member {
            Some(i) => domain.members.remove(i).1,
            None => return Err(IommuError::NotAMember(*host)),
        };

        if domain.members.is_empty() && domain.file.is_none() {
            // The borrowed domain outlives us, take our bindings out.
            domain.translator.clear(channel.as_ref());
        }

        channel.set_iommu_domain(None)?;
        info!("{} left IOMMU domain fd {}", host, domain.fd);

        if self.domains[index].members.is_empty() {
            self.domains.remove(index);
        }

        Ok(())
    }

    /// Guest memory appeared: bind it into every live domain.
    pub fn add_region(&mut self, region: GuestRegion) {
        self.regions.push(region);
        for domain in self.domains.iter_mut() {
            if let Some(channel) = domain.members.first().map(|(_, c)| c.clone()) {
                if let Err(e) = domain.translator.add_region(
                    channel.as_ref(),
                    region.iova,
                    region.vaddr,
                    region.size,
                ) {
                    error!(
                        "failed to bind region iova 0x{:x} into domain fd {}: {}",
                        region.iova, domain.fd, e
                    );
                }
            }
        }
    }

    /// Guest memory went away: unbind it from every live domain.
    pub fn remove_region(&mut self, region: GuestRegion) {
        self.regions.retain(|r| *r != region);
        for domain in self.domains.iter_mut() {
            if let Some(channel) = domain.members.first().map(|(_, c)| c.clone()) {
                if let Err(e) = domain.translator.remove_region(
                    channel.as_ref(),
                    region.iova,
                    region.vaddr,
                    region.size,
                ) {
                    warn!(
                        "failed to unbind region iova 0x{:x} from domain fd {}: {}",
                        region.iova, domain.fd, e
                    );
                }
            }
        }
    }

    fn push_domain(&mut self, fd: RawFd, file: Option<File>, shared: bool) -> usize {
        self.domains.push(IommuDomain {
            fd,
            file,
            shared,
            members: Vec::new(),
            translator: DmaTranslator::new(),
        });
        self.domains.len() - 1
    }

    fn open_domain() -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(UIOMMU_DEVICE)
            .map_err(IommuError::OpenDomainDevice)
    }
}
