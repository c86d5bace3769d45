// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! The kernel device-assignment channel.
//!
//! Every assigned function is backed by one character device exposing
//! the physical config space, BAR contents and ROM as positioned I/O
//! at fixed per-space offsets, plus a set of control calls for
//! interrupt registration, DMA translation and domain membership.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::prelude::FileExt;

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_ptr, ioctl_with_ref};

use crate::{ConfigurationError, PciHostAddress};

// Device file spaces, each a window at a fixed offset.
pub const VFIO_PCI_BAR0_SPACE: u32 = 0;
pub const VFIO_PCI_ROM_SPACE: u32 = 6;
pub const VFIO_PCI_CONFIG_SPACE: u32 = 7;
pub const VFIO_PCI_NUM_BARS: u32 = 6;

const VFIO_SPACE_OFFSET_SHIFT: u64 = 40;

/// Offset of an address space window within the channel device file.
pub fn space_offset(space: u32) -> u64 {
    u64::from(space) << VFIO_SPACE_OFFSET_SHIFT
}

const VFIO_TYPE: u32 = b';' as u32;

ioctl_iowr_nr!(VFIO_GET_RESOURCE_LEN, VFIO_TYPE, 100, u64);
ioctl_iow_nr!(VFIO_SET_IRQ_EVENTFD, VFIO_TYPE, 101, libc::c_int);
ioctl_io_nr!(VFIO_UNMASK_IRQ, VFIO_TYPE, 102);
ioctl_iow_nr!(VFIO_SET_MSI_EVENTFDS, VFIO_TYPE, 103, libc::c_int);
ioctl_iow_nr!(VFIO_SET_MSIX_EVENTFDS, VFIO_TYPE, 104, libc::c_int);
ioctl_iow_nr!(VFIO_MAP_DMA, VFIO_TYPE, 105, vfio_dma_map);
ioctl_iow_nr!(VFIO_UNMAP_DMA, VFIO_TYPE, 106, vfio_dma_map);
ioctl_iow_nr!(VFIO_SET_IOMMU_DOMAIN, VFIO_TYPE, 107, libc::c_int);
ioctl_io_nr!(VFIO_RESET_FUNCTION, VFIO_TYPE, 108);

pub const VFIO_DMA_FLAG_WRITE: u32 = 1 << 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
#[allow(non_camel_case_types)]
pub struct vfio_dma_map {
    pub vaddr: u64,
    pub iova: u64,
    pub size: u64,
    pub flags: u32,
    pub resv: u32,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Failed to query resource length: {0}")]
    GetResourceLength(#[source] io::Error),
    #[error("Positioned read failed: {0}")]
    RegionRead(#[source] io::Error),
    #[error("Positioned write failed: {0}")]
    RegionWrite(#[source] io::Error),
    #[error("Failed to set INTx eventfd: {0}")]
    SetIrqEventFd(#[source] io::Error),
    #[error("Failed to set MSI/MSI-X eventfds: {0}")]
    SetMsiEventFds(#[source] io::Error),
    #[error("Failed to unmask IRQ: {0}")]
    UnmaskIrq(#[source] io::Error),
    #[error("Failed to reset function: {0}")]
    ResetFunction(#[source] io::Error),
    #[error("DMA map failed: {0}")]
    DmaMap(#[source] io::Error),
    #[error("DMA unmap failed: {0}")]
    DmaUnmap(#[source] io::Error),
    #[error("Failed to set IOMMU domain: {0}")]
    SetIommuDomain(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

/// Operations of the device-assignment channel.
///
/// The rest of the crate goes through this trait so that the channel
/// can be stood in for during tests.
pub trait VfioChannelOps {
    fn resource_len(&self, bar: u32) -> Result<u64>;

    fn region_read(&self, space: u32, offset: u64, data: &mut [u8]) -> Result<()>;

    fn region_write(&self, space: u32, offset: u64, data: &[u8]) -> Result<()>;

    /// Register (or with `None` drop) the legacy line interrupt sink.
    fn set_irq_eventfd(&self, fd: Option<&EventFd>) -> Result<()>;

    /// Register the full MSI vector set in one call; empty disables.
    fn set_msi_eventfds(&self, fds: &[&EventFd]) -> Result<()>;

    /// Register the full MSI-X vector set in one call; empty disables.
    fn set_msix_eventfds(&self, fds: &[&EventFd]) -> Result<()>;

    fn unmask_irq(&self) -> Result<()>;

    fn reset_function(&self) -> Result<()>;

    fn map_dma(&self, iova: u64, size: u64, vaddr: u64) -> Result<()>;

    fn unmap_dma(&self, iova: u64, size: u64, vaddr: u64) -> Result<()>;

    /// Attach the device to an isolation domain; `None` detaches.
    fn set_iommu_domain(&self, fd: Option<RawFd>) -> Result<()>;

    /// Descriptor backing the channel, when there is a real one to
    /// mmap BAR contents from.
    fn device_fd(&self) -> Option<RawFd> {
        None
    }

    fn config_read(&self, offset: u32, data: &mut [u8]) -> Result<()> {
        self.region_read(VFIO_PCI_CONFIG_SPACE, offset.into(), data)
    }

    fn config_write(&self, offset: u32, data: &[u8]) -> Result<()> {
        self.region_write(VFIO_PCI_CONFIG_SPACE, offset.into(), data)
    }

    fn read_config_byte(&self, offset: u32) -> u8 {
        let mut data: [u8; 1] = [0xff];
        self.config_read(offset, &mut data).ok();
        data[0]
    }

    fn read_config_word(&self, offset: u32) -> u16 {
        let mut data: [u8; 2] = [0xff; 2];
        self.config_read(offset, &mut data).ok();
        u16::from_le_bytes(data)
    }

    fn read_config_dword(&self, offset: u32) -> u32 {
        let mut data: [u8; 4] = [0xff; 4];
        self.config_read(offset, &mut data).ok();
        u32::from_le_bytes(data)
    }

    fn write_config_dword(&self, offset: u32, val: u32) {
        self.config_write(offset, &val.to_le_bytes()).ok();
    }
}

/// An open channel to one physical function.
pub struct VfioChannel {
    device: File,
}

impl VfioChannel {
    /// Open the channel by scanning the host sysfs node of the
    /// function for its assignment device.
    pub fn open(host: &PciHostAddress) -> std::result::Result<Self, ConfigurationError> {
        let sysfs = host.sysfs_path();
        if !sysfs.exists() {
            return Err(ConfigurationError::NoSuchHostDevice(*host));
        }

        let vfio_dir = sysfs.join("vfio");
        let entries =
            std::fs::read_dir(&vfio_dir).map_err(|e| ConfigurationError::NotBound(*host, e))?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("vfio") {
                let dev_path = std::path::Path::new("/dev").join(name);
                let device = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&dev_path)
                    .map_err(|e| ConfigurationError::NotBound(*host, e))?;
                return Ok(VfioChannel { device });
            }
        }

        Err(ConfigurationError::NotBound(
            *host,
            io::Error::new(io::ErrorKind::NotFound, "no vfio node in sysfs"),
        ))
    }

    /// Adopt an externally supplied descriptor. The descriptor is
    /// duplicated so the caller's copy stays untouched at detach.
    pub fn from_raw_fd(fd: RawFd) -> std::result::Result<Self, io::Error> {
        // SAFETY: dup() returns a descriptor we exclusively own.
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: dup is a valid, owned descriptor.
        let device = unsafe { File::from_raw_fd(dup) };
        Ok(VfioChannel { device })
    }
}

impl AsRawFd for VfioChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

impl VfioChannelOps for VfioChannel {
    fn resource_len(&self, bar: u32) -> Result<u64> {
        let mut len: u64 = bar.into();
        // SAFETY: the file is the channel device and len is in/out.
        let ret = unsafe {
            vmm_sys_util::ioctl::ioctl_with_mut_ref(&self.device, VFIO_GET_RESOURCE_LEN(), &mut len)
        };
        if ret < 0 {
            return Err(ChannelError::GetResourceLength(io::Error::last_os_error()));
        }
        Ok(len)
    }

    fn region_read(&self, space: u32, offset: u64, data: &mut [u8]) -> Result<()> {
        self.device
            .read_exact_at(data, space_offset(space) + offset)
            .map_err(ChannelError::RegionRead)
    }

    fn region_write(&self, space: u32, offset: u64, data: &[u8]) -> Result<()> {
        self.device
            .write_all_at(data, space_offset(space) + offset)
            .map_err(ChannelError::RegionWrite)
    }

    fn set_irq_eventfd(&self, fd: Option<&EventFd>) -> Result<()> {
        let raw: libc::c_int = fd.map_or(-1, |f| f.as_raw_fd());
        // SAFETY: raw is a valid descriptor or -1 and the kernel only
        // reads it.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_SET_IRQ_EVENTFD(), &raw) };
        if ret < 0 {
            return Err(ChannelError::SetIrqEventFd(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn set_msi_eventfds(&self, fds: &[&EventFd]) -> Result<()> {
        self.set_vector_eventfds(VFIO_SET_MSI_EVENTFDS(), fds)
    }

    fn set_msix_eventfds(&self, fds: &[&EventFd]) -> Result<()> {
        self.set_vector_eventfds(VFIO_SET_MSIX_EVENTFDS(), fds)
    }

    fn unmask_irq(&self) -> Result<()> {
        // SAFETY: no argument, the request is defined by the channel.
        let ret = unsafe { ioctl(&self.device, VFIO_UNMASK_IRQ()) };
        if ret < 0 {
            return Err(ChannelError::UnmaskIrq(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn reset_function(&self) -> Result<()> {
        // SAFETY: no argument, the request is defined by the channel.
        let ret = unsafe { ioctl(&self.device, VFIO_RESET_FUNCTION()) };
        if ret < 0 {
            return Err(ChannelError::ResetFunction(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn map_dma(&self, iova: u64, size: u64, vaddr: u64) -> Result<()> {
        let dma = vfio_dma_map {
            vaddr,
            iova,
            size,
            flags: VFIO_DMA_FLAG_WRITE,
            resv: 0,
        };
        // SAFETY: dma is a valid argument struct the kernel only reads.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_MAP_DMA(), &dma) };
        if ret < 0 {
            return Err(ChannelError::DmaMap(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: u64, vaddr: u64) -> Result<()> {
        let dma = vfio_dma_map {
            vaddr,
            iova,
            size,
            flags: VFIO_DMA_FLAG_WRITE,
            resv: 0,
        };
        // SAFETY: dma is a valid argument struct the kernel only reads.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_UNMAP_DMA(), &dma) };
        if ret < 0 {
            return Err(ChannelError::DmaUnmap(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn set_iommu_domain(&self, fd: Option<RawFd>) -> Result<()> {
        let raw: libc::c_int = fd.unwrap_or(-1);
        // SAFETY: raw is a valid descriptor or -1 and the kernel only
        // reads it.
        let ret = unsafe { ioctl_with_ref(&self.device, VFIO_SET_IOMMU_DOMAIN(), &raw) };
        if ret < 0 {
            return Err(ChannelError::SetIommuDomain(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn device_fd(&self) -> Option<RawFd> {
        Some(self.device.as_raw_fd())
    }
}

impl VfioChannel {
    // The vector registration argument is a counted descriptor array:
    // fds[0] holds the count, fds[1..] the descriptors.
    fn set_vector_eventfds(&self, req: libc::c_ulong, fds: &[&EventFd]) -> Result<()> {
        let mut arg: Vec<libc::c_int> = Vec::with_capacity(fds.len() + 1);
        arg.push(fds.len() as libc::c_int);
        for fd in fds {
            arg.push(fd.as_raw_fd());
        }
        // SAFETY: arg outlives the call and the kernel only reads
        // count + descriptors from it.
        let ret = unsafe { ioctl_with_ptr(&self.device, req, arg.as_ptr()) };
        if ret < 0 {
            return Err(ChannelError::SetMsiEventFds(io::Error::last_os_error()));
        }
        Ok(())
    }
}
