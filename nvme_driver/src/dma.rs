// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-controller DMA arena.
//!
//! User I/O buffers come from here: a growable set of large device-mapped
//! regions, each carved into pages by a bitmap. Regions are only returned to
//! the system when the controller closes, so a buffer's device addresses are
//! stable from `alloc` to `free`.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use thiserror::Error;
use user_driver::DmaClient;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;

/// Default backing region size. Grown allocations get a region of their own.
const REGION_SIZE: usize = 2 << 20;

/// An error allocating from the arena.
#[derive(Debug, Error)]
pub enum DmaError {
    /// No region can serve the allocation and a new one could not be mapped.
    #[error("out of dma memory")]
    OutOfMemory,
}

/// A `free` rejected because the buffer belongs to another controller. The
/// untouched buffer is handed back.
#[derive(Error)]
#[error("buffer is not owned by this device")]
pub struct NotOwned(pub DmaBuffer);

impl std::fmt::Debug for NotOwned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotOwned").finish()
    }
}

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct DmaArena {
    client: Arc<dyn DmaClient>,
    regions: Mutex<Vec<Region>>,
    id: u64,
}

struct Region {
    mem: MemoryBlock,
    /// One bit per page; set means allocated.
    state: Vec<u64>,
    page_count: usize,
    /// Caller-mapped memory adopted into the arena; tracked for ownership
    /// but never handed out by `alloc`.
    external: bool,
}

impl Region {
    fn new(mem: MemoryBlock) -> Self {
        let page_count = mem.len() / PAGE_SIZE;
        Self {
            mem,
            state: vec![0; page_count.div_ceil(64)],
            page_count,
            external: false,
        }
    }

    /// Scans for a contiguous run of `count` free pages.
    fn alloc(&mut self, count: usize) -> Option<usize> {
        let mut i = 0;
        let mut contig = 0;
        while contig < count && i < self.page_count {
            if self.state[i / 64] & 1 << (i % 64) != 0 {
                contig = 0;
            } else {
                contig += 1;
            }
            i += 1;
        }
        if contig < count {
            return None;
        }
        let start = i - contig;
        for j in start..i {
            self.state[j / 64] |= 1 << (j % 64);
        }
        Some(start)
    }

    fn free(&mut self, start: usize, count: usize) {
        for j in start..start + count {
            debug_assert!(self.state[j / 64] & 1 << (j % 64) != 0);
            self.state[j / 64] &= !(1 << (j % 64));
        }
    }
}

impl DmaArena {
    pub fn new(client: Arc<dyn DmaClient>) -> Self {
        Self {
            client,
            regions: Mutex::new(Vec::new()),
            id: NEXT_ARENA_ID.fetch_add(1, Relaxed),
        }
    }

    /// Allocates a buffer of at least `len` bytes, page-granular.
    pub fn alloc(&self, len: usize) -> Result<DmaBuffer, DmaError> {
        if len == 0 {
            return Err(DmaError::OutOfMemory);
        }
        let count = len.div_ceil(PAGE_SIZE);
        let mut regions = self.regions.lock();
        for (index, region) in regions.iter_mut().enumerate() {
            if region.external {
                continue;
            }
            if let Some(start) = region.alloc(count) {
                return Ok(self.buffer(region, index, start, count, len));
            }
        }

        // Grow the arena. The new region stays mapped until the controller
        // closes.
        let region_len = REGION_SIZE.max(count * PAGE_SIZE);
        let mem = self.client.allocate_dma_buffer(region_len).map_err(|err| {
            tracing::warn!(
                region_len,
                error = err.as_ref() as &dyn std::error::Error,
                "dma arena growth failed"
            );
            DmaError::OutOfMemory
        })?;
        let mut region = Region::new(mem);
        let start = region.alloc(count).expect("fresh region fits the request");
        let index = regions.len();
        let buf = self.buffer(&region, index, start, count, len);
        regions.push(region);
        Ok(buf)
    }

    fn buffer(
        &self,
        region: &Region,
        region_index: usize,
        start_page: usize,
        page_count: usize,
        len: usize,
    ) -> DmaBuffer {
        DmaBuffer {
            mem: region
                .mem
                .subblock(start_page * PAGE_SIZE, page_count * PAGE_SIZE),
            arena: self.id,
            region: region_index,
            start_page,
            page_count,
            len,
        }
    }

    /// Adopts caller-mapped memory as an I/O buffer of this arena.
    ///
    /// The memory must already be pinned and device-visible (its page
    /// numbers are used as device addresses) and page-aligned. The arena
    /// tracks it for ownership checks only; `alloc` never draws from it.
    pub fn adopt(&self, mem: MemoryBlock) -> DmaBuffer {
        assert_eq!(mem.offset_in_page(), 0, "adopted memory must be page-aligned");
        assert_eq!(mem.len() % PAGE_SIZE, 0, "adopted memory must be page-granular");
        let len = mem.len();
        let mut region = Region::new(mem);
        region.external = true;
        let page_count = region.page_count;
        let start = region.alloc(page_count).expect("fresh region fits itself");
        let mut regions = self.regions.lock();
        let index = regions.len();
        let buf = self.buffer(&region, index, start, page_count, len);
        regions.push(region);
        buf
    }

    /// Returns a buffer's pages to its region.
    pub fn free(&self, buf: DmaBuffer) -> Result<(), NotOwned> {
        if buf.arena != self.id {
            return Err(NotOwned(buf));
        }
        let mut regions = self.regions.lock();
        regions[buf.region].free(buf.start_page, buf.page_count);
        Ok(())
    }

    /// Whether `buf` was allocated from this arena.
    pub fn owns(&self, buf: &DmaBuffer) -> bool {
        buf.arena == self.id
    }
}

/// A device-visible I/O buffer from a controller's arena.
///
/// The buffer must be freed through the namespace that allocated it (or be
/// left to the arena teardown at close); dropping the handle alone does not
/// return the pages.
pub struct DmaBuffer {
    mem: MemoryBlock,
    arena: u64,
    region: usize,
    start_page: usize,
    page_count: usize,
    len: usize,
}

impl DmaBuffer {
    /// The usable length in bytes, as requested at allocation.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The buffer contents as an atomic slice, including the page-rounding
    /// tail.
    pub fn as_slice(&self) -> &[AtomicU8] {
        self.mem.as_slice()
    }

    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        self.mem.read_at(offset, data)
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.mem.write_at(offset, data)
    }

    /// Device addresses of the buffer's pages.
    pub(crate) fn page_addresses(&self) -> Vec<u64> {
        self.mem.pfns().iter().map(|&pfn| pfn * PAGE_SIZE64).collect()
    }
}
