// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits for implementing user-mode device drivers against a pluggable
//! device backing: a mapped register window plus a DMA-capable memory
//! client. The concrete backing (an IOMMU-bound PCI function, or an
//! in-process emulated device for tests) lives behind these traits.

pub mod backoff;
pub mod memory;
pub mod shmem;

use memory::MemoryBlock;
use std::sync::Arc;

/// An interface to access device hardware.
pub trait DeviceBacking: 'static + Send {
    /// An object for accessing device registers.
    type Registers: 'static + DeviceRegisterIo + Send + Sync;

    /// Returns a device ID for diagnostics, usually the PCI ID
    /// (bus:device.function).
    fn id(&self) -> &str;

    /// Maps a BAR.
    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers>;

    /// Returns the DMA client for this device.
    fn dma_client(&self) -> Arc<dyn DmaClient>;
}

/// Access to device registers.
pub trait DeviceRegisterIo: Send + Sync {
    /// Returns the length of the register space.
    fn len(&self) -> usize;

    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;

    /// Reads a `u64` register.
    fn read_u64(&self, offset: usize) -> u64;

    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);

    /// Writes a `u64` register.
    fn write_u64(&self, offset: usize, data: u64);
}

/// Device-visible memory allocation.
pub trait DmaClient: Send + Sync {
    /// Allocates a new DMA buffer of `len` bytes, zero-initialized and
    /// page-granular. The buffer stays mapped for the device until dropped.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}
