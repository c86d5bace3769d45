// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! BAR resources.
//!
//! Memory BARs are mapped straight from the channel device file into
//! the host address space, except for the page holding the MSI-X
//! vector table, which is spliced out and trapped. I/O port BARs and
//! BARs that do not fill whole pages are always trapped.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::channel::{space_offset, ChannelError, VfioChannelOps, VFIO_PCI_NUM_BARS};
use crate::config::PCI_BASE_ADDRESS_0;
use crate::msix::MSIX_PAGE_SIZE;

const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x1;
const PCI_BASE_ADDRESS_MEM_TYPE_64: u32 = 0x4;
const PCI_BASE_ADDRESS_MEM_PREFETCH: u32 = 0x8;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Failed to mmap BAR segment: {0}")]
    Mmap(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, ResourceError>;

/// One populated BAR of the physical function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciBar {
    pub index: u32,
    pub len: u64,
    pub io_port: bool,
    pub mem_64: bool,
    pub prefetchable: bool,
}

impl PciBar {
    /// Whether the BAR contents can be handed out as a direct
    /// mapping. Port I/O and sub-page regions always trap.
    pub fn mappable(&self) -> bool {
        !self.io_port && self.len & (MSIX_PAGE_SIZE - 1) == 0
    }
}

/// Size every BAR of the function. Empty slots are skipped, and the
/// upper half of a 64-bit BAR does not produce a resource of its own.
pub fn probe_bars(channel: &dyn VfioChannelOps) -> Result<Vec<PciBar>> {
    let mut bars = Vec::new();
    let mut index = 0;

    while index < VFIO_PCI_NUM_BARS {
        let reg = channel.read_config_dword(PCI_BASE_ADDRESS_0 + index * 4);
        let io_port = reg & PCI_BASE_ADDRESS_SPACE_IO == PCI_BASE_ADDRESS_SPACE_IO;
        let mem_64 = !io_port && reg & PCI_BASE_ADDRESS_MEM_TYPE_64 == PCI_BASE_ADDRESS_MEM_TYPE_64;
        let prefetchable =
            !io_port && reg & PCI_BASE_ADDRESS_MEM_PREFETCH == PCI_BASE_ADDRESS_MEM_PREFETCH;

        let len = channel.resource_len(index)?;
        if len > 0 {
            bars.push(PciBar {
                index,
                len,
                io_port,
                mem_64,
                prefetchable,
            });
        }

        index += if mem_64 { 2 } else { 1 };
    }

    Ok(bars)
}

/// A directly mapped slice of a BAR, as an offset range within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarSegment {
    pub offset: u64,
    pub size: u64,
}

/// Plan the direct mappings of a BAR around the MSI-X table page.
///
/// With no table in the BAR the whole of it maps in one piece.
/// Otherwise the page holding the table is left out and at most two
/// segments result, either of which can be empty at the BAR edges.
pub fn direct_segments(len: u64, msix_table_offset: Option<u64>) -> Vec<BarSegment> {
    let table_offset = match msix_table_offset {
        Some(offset) => offset & !(MSIX_PAGE_SIZE - 1),
        None => return vec![BarSegment { offset: 0, size: len }],
    };

    let mut segments = Vec::new();
    if table_offset > 0 {
        segments.push(BarSegment {
            offset: 0,
            size: table_offset,
        });
    }
    if len > table_offset + MSIX_PAGE_SIZE {
        segments.push(BarSegment {
            offset: table_offset + MSIX_PAGE_SIZE,
            size: len - table_offset - MSIX_PAGE_SIZE,
        });
    }

    segments
}

/// A host mapping of one BAR segment, unmapped on drop.
pub struct MmapRegion {
    addr: *mut libc::c_void,
    size: usize,
    pub bar_offset: u64,
}

// The mapping is plain shared memory with no thread affinity.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Map `segment` of the given BAR from the channel device file.
    pub fn map(fd: RawFd, bar: u32, segment: BarSegment) -> Result<Self> {
        // SAFETY: mapping a file we own at an offset the kernel
        // validates; the result is checked before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                segment.size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                (space_offset(bar) + segment.offset) as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(ResourceError::Mmap(io::Error::last_os_error()));
        }

        Ok(MmapRegion {
            addr,
            size: segment.size as usize,
            bar_offset: segment.offset,
        })
    }

    pub fn host_addr(&self) -> u64 {
        self.addr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: addr/size came from a successful mmap.
        unsafe {
            libc::munmap(self.addr, self.size);
        }
    }
}
