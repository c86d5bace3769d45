// Copyright © 2024 The vfio-pci Authors
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! DMA translation.
//!
//! Guest-physical ranges are bound to host virtual addresses through
//! the channel, in bounded chunks so a huge region cannot wedge the
//! kernel in one call. The translator keeps its own page ledger so a
//! conflicting stale binding (EBUSY) can be repaired page by page
//! instead of tearing the whole region down.

use std::collections::BTreeMap;

use crate::channel::{ChannelError, Result, VfioChannelOps};

const DMA_CHUNK_SIZE: u64 = 4 << 20;
const DMA_PAGE_SIZE: u64 = 0x1000;
const DMA_PAGE_MASK: u64 = DMA_PAGE_SIZE - 1;

#[derive(Default)]
pub struct DmaTranslator {
    // iova page -> bound host virtual address
    bound: BTreeMap<u64, u64>,
}

impl DmaTranslator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn mapped_pages(&self) -> usize {
        self.bound.len()
    }

    /// Bind a guest-physical range to host memory. Ranges that do not
    /// line up on page boundaries cannot be translated and are
    /// skipped with a warning rather than failing the caller.
    pub fn add_region(
        &mut self,
        channel: &dyn VfioChannelOps,
        iova: u64,
        vaddr: u64,
        size: u64,
    ) -> Result<()> {
        if (iova | vaddr | size) & DMA_PAGE_MASK != 0 {
            warn!(
                "skipping unaligned DMA region iova 0x{:x} vaddr 0x{:x} size 0x{:x}",
                iova, vaddr, size
            );
            return Ok(());
        }

        let mut done = 0;
        while done < size {
            let chunk = std::cmp::min(size - done, DMA_CHUNK_SIZE);
            match channel.map_dma(iova + done, chunk, vaddr + done) {
                Ok(()) => self.record(iova + done, vaddr + done, chunk),
                Err(ChannelError::DmaMap(ref e))
                    if e.raw_os_error() == Some(libc::EBUSY) =>
                {
                    self.repair(channel, iova + done, vaddr + done, chunk)?;
                }
                Err(e) => {
                    error!(
                        "DMA map failed at iova 0x{:x} size 0x{:x}: {}",
                        iova + done,
                        chunk,
                        e
                    );
                    return Err(e);
                }
            }
            done += chunk;
        }

        Ok(())
    }

    /// Drop the binding of a guest-physical range. Unmapping takes
    /// one call for the whole range; only the bind path is chunked.
    pub fn remove_region(
        &mut self,
        channel: &dyn VfioChannelOps,
        iova: u64,
        vaddr: u64,
        size: u64,
    ) -> Result<()> {
        if (iova | vaddr | size) & DMA_PAGE_MASK != 0 {
            return Ok(());
        }

        channel.unmap_dma(iova, size, vaddr)?;

        let mut page = iova;
        while page < iova + size {
            self.bound.remove(&page);
            page += DMA_PAGE_SIZE;
        }

        Ok(())
    }

    /// Unbind everything still in the ledger.
    pub fn clear(&mut self, channel: &dyn VfioChannelOps) {
        for (&page, &vaddr) in &self.bound {
            if let Err(e) = channel.unmap_dma(page, DMA_PAGE_SIZE, vaddr) {
                warn!("failed to unmap iova 0x{:x}: {}", page, e);
            }
        }
        self.bound.clear();
    }

    fn record(&mut self, iova: u64, vaddr: u64, size: u64) {
        let mut offset = 0;
        while offset < size {
            self.bound.insert(iova + offset, vaddr + offset);
            offset += DMA_PAGE_SIZE;
        }
    }

    // The kernel rejected the chunk because part of it is already
    // bound. Walk it page by page, leave pages whose binding already
    // matches, and rebind only the ones that differ.
    fn repair(
        &mut self,
        channel: &dyn VfioChannelOps,
        iova: u64,
        vaddr: u64,
        size: u64,
    ) -> Result<()> {
        debug!(
            "repairing conflicting DMA bindings at iova 0x{:x} size 0x{:x}",
            iova, size
        );

        let mut offset = 0;
        while offset < size {
            let page = iova + offset;
            let wanted = vaddr + offset;

            match self.bound.get(&page).copied() {
                Some(current) if current == wanted => {}
                Some(current) => {
                    channel.unmap_dma(page, DMA_PAGE_SIZE, current)?;
                    channel.map_dma(page, DMA_PAGE_SIZE, wanted)?;
                    self.bound.insert(page, wanted);
                }
                None => {
                    channel.map_dma(page, DMA_PAGE_SIZE, wanted)?;
                    self.bound.insert(page, wanted);
                }
            }

            offset += DMA_PAGE_SIZE;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests_support::{Call, FakeChannel};

    #[test]
    fn large_region_is_chunked() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        // 10 MiB: two full chunks and a 2 MiB tail.
        dma.add_region(&channel, 0x1000_0000, 0x7f00_0000, 10 << 20)
            .unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                Call::MapDma {
                    iova: 0x1000_0000,
                    size: 4 << 20
                },
                Call::MapDma {
                    iova: 0x1040_0000,
                    size: 4 << 20
                },
                Call::MapDma {
                    iova: 0x1080_0000,
                    size: 2 << 20
                },
            ]
        );
        assert_eq!(dma.mapped_pages(), (10 << 20) / 0x1000);
    }

    #[test]
    fn unaligned_region_is_skipped() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        dma.add_region(&channel, 0x1000, 0x2000, 0x1800).unwrap();
        assert!(channel.calls().is_empty());
        assert_eq!(dma.mapped_pages(), 0);
    }

    #[test]
    fn busy_chunk_is_repaired_page_by_page() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        dma.add_region(&channel, 0x0, 0x10_0000, 0x2000).unwrap();
        channel.calls.borrow_mut().clear();

        // Rebind both pages elsewhere; the kernel refuses the bulk
        // call, so each stale page is unmapped and remapped.
        channel.fail_next_map.set(Some(libc::EBUSY));
        dma.add_region(&channel, 0x0, 0x20_0000, 0x2000).unwrap();

        assert_eq!(
            channel.calls(),
            vec![
                Call::UnmapDma {
                    iova: 0x0,
                    size: 0x1000
                },
                Call::MapDma {
                    iova: 0x0,
                    size: 0x1000
                },
                Call::UnmapDma {
                    iova: 0x1000,
                    size: 0x1000
                },
                Call::MapDma {
                    iova: 0x1000,
                    size: 0x1000
                },
            ]
        );
    }

    #[test]
    fn repair_leaves_matching_pages_alone() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        dma.add_region(&channel, 0x0, 0x10_0000, 0x1000).unwrap();
        channel.calls.borrow_mut().clear();

        // Grow the region with the same translation: only the new
        // page needs a binding.
        channel.fail_next_map.set(Some(libc::EBUSY));
        dma.add_region(&channel, 0x0, 0x10_0000, 0x2000).unwrap();

        assert_eq!(
            channel.calls(),
            vec![Call::MapDma {
                iova: 0x1000,
                size: 0x1000
            }]
        );
    }

    #[test]
    fn remove_region_clears_the_ledger() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        dma.add_region(&channel, 0x0, 0x10_0000, 0x2000).unwrap();
        dma.remove_region(&channel, 0x0, 0x10_0000, 0x2000).unwrap();

        assert_eq!(dma.mapped_pages(), 0);
        assert_eq!(
            channel.calls().last(),
            Some(&Call::UnmapDma {
                iova: 0x0,
                size: 0x2000
            })
        );
    }

    #[test]
    fn large_region_is_unmapped_in_one_call() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        dma.add_region(&channel, 0x0, 0x7f00_0000, 10 << 20).unwrap();
        channel.calls.borrow_mut().clear();

        dma.remove_region(&channel, 0x0, 0x7f00_0000, 10 << 20)
            .unwrap();
        assert_eq!(
            channel.calls(),
            vec![Call::UnmapDma {
                iova: 0x0,
                size: 10 << 20
            }]
        );
        assert_eq!(dma.mapped_pages(), 0);
    }

    #[test]
    fn hard_map_failure_propagates() {
        let channel = FakeChannel::new();
        let mut dma = DmaTranslator::new();

        channel.fail_next_map.set(Some(libc::ENOMEM));
        assert!(dma.add_region(&channel, 0x0, 0x10_0000, 0x1000).is_err());
        assert_eq!(dma.mapped_pages(), 0);
    }
}
