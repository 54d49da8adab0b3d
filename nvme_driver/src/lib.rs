// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A user-space NVMe block driver.
//!
//! The library attaches to an NVMe PCIe function through a pluggable
//! [`DeviceBacking`](user_driver::DeviceBacking) (an IOMMU-bound device in
//! production, an emulated controller in tests), brings the controller up,
//! and exposes namespaces for asynchronous block I/O from native threads.
//! Submission and completion are polled; there is no event loop and no
//! interrupt path.
//!
//! Queue access is thread-affine: at most one thread submits to or polls a
//! given `qid` at a time. Distinct queues run fully in parallel.

#![forbid(unsafe_code)]

mod dma;
mod driver;
mod namespace;
mod page_allocator;
mod pci;
mod queue_pair;
mod queues;
mod registers;
mod registry;
#[cfg(test)]
mod tests;

pub use self::dma::DmaBuffer;
pub use self::dma::DmaError;
pub use self::dma::NotOwned;
pub use self::driver::OpenError;
pub use self::namespace::IoStatus;
pub use self::namespace::IoTicket;
pub use self::namespace::Namespace;
pub use self::namespace::NamespaceError;
pub use self::namespace::OpenOptions;
pub use self::pci::InvalidPciName;
pub use self::pci::PciName;
pub use self::queue_pair::NvmeError;
pub use self::queue_pair::RequestError;

use nvme_spec as spec;
use user_driver::DeviceBacking;

const NVME_PAGE_SHIFT: u8 = 12;

/// Opens a namespace on the device named `name` (`bus:device.function` or
/// `bus:device.function/nsid`, hex), constructing the backing with `connect`
/// if the device is not already open in this process.
///
/// Opening an already-open device is cheap: the existing controller is
/// shared and a fresh namespace handle returned. The controller shuts down
/// when the last handle closes.
pub fn open_with<T: DeviceBacking, F: FnOnce() -> anyhow::Result<T>>(
    name: &str,
    options: &OpenOptions,
    connect: F,
) -> Result<Namespace<T>, OpenError> {
    let name: PciName = name
        .parse()
        .map_err(|_| OpenError::InvalidArgument("malformed pci device name"))?;
    if options.qsize == 1 {
        return Err(OpenError::InvalidArgument(
            "queue depth of one cannot hold an outstanding command",
        ));
    }
    registry::open_with(name, options, connect)
}

/// [`open_with`] with default options: device-granted queue count and depth.
pub fn open<T: DeviceBacking, F: FnOnce() -> anyhow::Result<T>>(
    name: &str,
    connect: F,
) -> Result<Namespace<T>, OpenError> {
    open_with(name, &OpenOptions::default(), connect)
}
