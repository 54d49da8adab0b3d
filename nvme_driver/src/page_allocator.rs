// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Allocator for pages within a pool.
//!
//! This is used for temporary allocations of per-queue DMA buffers, mainly
//! for staging admin command payloads.

use parking_lot::Mutex;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;

pub(crate) struct PageAllocator {
    core: Mutex<PageAllocatorCore>,
    mem: MemoryBlock,
}

impl PageAllocator {
    pub fn new(mem: MemoryBlock) -> Self {
        assert_eq!(mem.offset_in_page(), 0);
        assert_eq!(mem.len() % PAGE_SIZE, 0);
        let count = mem.len() / PAGE_SIZE;
        Self {
            core: Mutex::new(PageAllocatorCore::new(count)),
            mem,
        }
    }

    /// Allocates `n` pages, or `None` if the pool is currently exhausted.
    pub fn alloc_pages(&self, n: usize) -> Option<ScopedPages<'_>> {
        let mut core = self.core.lock();
        if core.remaining() < n {
            return None;
        }
        let pfns = self.mem.pfns();
        let pages = (0..n)
            .map(|_| {
                let n = core.alloc().unwrap();
                ScopedPage {
                    page_index: n,
                    physical_address: pfns[n] * PAGE_SIZE64,
                }
            })
            .collect();
        Some(ScopedPages { alloc: self, pages })
    }

    pub fn alloc_bytes(&self, n: usize) -> Option<ScopedPages<'_>> {
        self.alloc_pages(n.div_ceil(PAGE_SIZE))
    }
}

struct PageAllocatorCore {
    free: Vec<usize>,
}

impl PageAllocatorCore {
    fn new(count: usize) -> Self {
        let free = (0..count).rev().collect();
        Self { free }
    }

    fn remaining(&self) -> usize {
        self.free.len()
    }

    fn alloc(&mut self) -> Option<usize> {
        self.free.pop()
    }

    fn free(&mut self, n: usize) {
        self.free.push(n);
    }
}

/// Pages drawn from a [`PageAllocator`], returned to the pool on drop.
pub(crate) struct ScopedPages<'a> {
    alloc: &'a PageAllocator,
    pages: Vec<ScopedPage>,
}

struct ScopedPage {
    page_index: usize,
    physical_address: u64,
}

impl ScopedPages<'_> {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn physical_address(&self, index: usize) -> u64 {
        self.pages[index].physical_address
    }

    /// Copies the first `data.len()` bytes of the pages into `data`.
    pub fn read(&self, data: &mut [u8]) {
        assert!(data.len() <= self.pages.len() * PAGE_SIZE);
        for (chunk, page) in data.chunks_mut(PAGE_SIZE).zip(&self.pages) {
            self.alloc.mem.read_at(page.page_index * PAGE_SIZE, chunk);
        }
    }
}

impl Drop for ScopedPages<'_> {
    fn drop(&mut self) {
        let mut core = self.alloc.core.lock();
        for page in self.pages.drain(..) {
            core.free(page.page_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use user_driver::shmem::SharedMemory;

    #[test]
    fn pages_return_to_pool_on_drop() {
        let mem = SharedMemory::new(4 * PAGE_SIZE);
        let alloc = PageAllocator::new(MemoryBlock::new(mem.alloc(4 * PAGE_SIZE).unwrap()));
        let a = alloc.alloc_pages(3).unwrap();
        assert_eq!(a.page_count(), 3);
        assert!(alloc.alloc_pages(2).is_none());
        drop(a);
        assert!(alloc.alloc_pages(2).is_some());
    }

    #[test]
    fn read_sees_device_writes() {
        let mem = SharedMemory::new(2 * PAGE_SIZE);
        let block = MemoryBlock::new(mem.alloc(2 * PAGE_SIZE).unwrap());
        let alloc = PageAllocator::new(block.clone());
        let pages = alloc.alloc_bytes(PAGE_SIZE + 16).unwrap();
        assert_eq!(pages.page_count(), 2);

        // The device writes straight into the pool's backing pages.
        block.write_at(0, &[0xab; PAGE_SIZE]);
        block.write_at(PAGE_SIZE, &[0xcd; 16]);
        let mut out = [0u8; PAGE_SIZE + 16];
        pages.read(&mut out);
        assert_eq!(&out[..PAGE_SIZE], &[0xab; PAGE_SIZE]);
        assert_eq!(&out[PAGE_SIZE..], &[0xcd; 16]);
    }
}
