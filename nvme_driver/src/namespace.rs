// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The namespace frontend: the handle an application holds while driving
//! block I/O.

use super::spec::nvm;
use crate::dma::DmaBuffer;
use crate::dma::DmaError;
use crate::dma::NotOwned;
use crate::driver::Controller;
use crate::queue_pair::IoRequest;
use crate::queue_pair::PollOutcome;
use crate::queue_pair::RequestError;
use crate::registry;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use user_driver::DeviceBacking;
use user_driver::backoff::Backoff;
use user_driver::backoff::Deadline;
use user_driver::memory::PAGE_SIZE;

/// Wall-clock bound used by the synchronous wrappers.
const SYNC_TIMEOUT: Duration = Duration::from_secs(60);

/// An error resolving a namespace on an attached controller.
#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("namespace not found")]
    NotFound,
    #[error("formatted lba size invalid")]
    FlbasInvalid,
    #[error("lba format invalid: {0:?}")]
    LbaFormatInvalid(nvm::Lbaf),
    #[error("maximum data transfer size too small: 2^{0} pages")]
    MdtsInvalid(u8),
    #[error("nvme request failed")]
    Request(#[source] RequestError),
}

/// An in-flight asynchronous I/O. Resolved (and consumed) by
/// [`Namespace::poll`] on the namespace that issued it; there is no
/// cancellation, so an unpolled ticket stays outstanding until close.
#[derive(Debug)]
#[must_use = "an unpolled io leaks its command slot until close"]
pub struct IoTicket {
    qid: u16,
    key: usize,
}

/// The result of a bounded poll.
#[derive(Debug)]
pub enum IoStatus {
    /// The I/O chain finished; command-specific DW0 of its last completion.
    Complete(u32),
    /// Not finished within the timeout; the ticket is handed back.
    Pending(IoTicket),
}

/// A logical block device on an open controller.
///
/// Cloneable across threads is deliberately *not* offered: each handle is a
/// refcount on the controller, and per-queue access is thread-affine — at
/// most one thread submits to or polls a given `qid` at a time.
pub struct Namespace<T: DeviceBacking> {
    controller: Arc<Controller<T>>,
    registry_key: String,
    nsid: u32,
    block_count: u64,
    block_shift: u32,
    max_transfer_block_count: u32,
}

impl<T: DeviceBacking> std::fmt::Debug for Namespace<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("registry_key", &self.registry_key)
            .field("nsid", &self.nsid)
            .field("block_count", &self.block_count)
            .field("block_shift", &self.block_shift)
            .field("max_transfer_block_count", &self.max_transfer_block_count)
            .finish()
    }
}

impl<T: DeviceBacking> Namespace<T> {
    pub(crate) fn new(
        controller: Arc<Controller<T>>,
        registry_key: String,
        nsid: u32,
    ) -> Result<Self, NamespaceError> {
        let identify = controller
            .identify_namespace(nsid)
            .map_err(NamespaceError::Request)?;
        if identify.nsze == 0 {
            return Err(NamespaceError::NotFound);
        }

        let lba_format_index = identify.flbas.low_index();
        if lba_format_index > identify.nlbaf {
            return Err(NamespaceError::FlbasInvalid);
        }

        let lbaf = identify.lbaf[lba_format_index as usize];
        let block_shift = lbaf.lbads();
        if !matches!(block_shift, 9..=16) {
            return Err(NamespaceError::LbaFormatInvalid(lbaf));
        }

        let max_transfer_block_count = {
            let mdts = if controller.identify().mdts != 0 {
                controller.identify().mdts
            } else {
                u8::MAX
            };
            let max_transfer_bits = mdts.saturating_add(crate::NVME_PAGE_SHIFT);
            let from_mdts = 1u32
                << max_transfer_bits
                    .checked_sub(block_shift)
                    .ok_or(NamespaceError::MdtsInvalid(mdts))?
                    .min(16);
            // A single PRP-list page describes at most 512 data pages per
            // sub-command.
            let from_prp = (((PAGE_SIZE / 8) << crate::NVME_PAGE_SHIFT) >> block_shift) as u32;
            from_mdts.min(from_prp)
        };

        tracing::info!(
            device = %registry_key,
            nsid,
            block_count = identify.nsze,
            block_size = 1u32 << block_shift,
            max_transfer_block_count,
            "opened namespace"
        );

        Ok(Self {
            controller,
            registry_key,
            nsid,
            block_count: identify.nsze,
            block_shift: block_shift.into(),
            max_transfer_block_count,
        })
    }

    /// Return Namespace ID.
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// The device name this namespace was opened from.
    pub fn device_id(&self) -> &str {
        self.controller.device_id()
    }

    /// Gets the block count.
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Gets the block size in bytes.
    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }

    pub fn block_shift(&self) -> u32 {
        self.block_shift
    }

    /// Blocks per host page.
    pub fn blocks_per_page(&self) -> u32 {
        (PAGE_SIZE >> self.block_shift) as u32
    }

    /// Returns the maximum size for a single NVMe command, in blocks. Larger
    /// I/Os are fragmented transparently.
    pub fn max_transfer_block_count(&self) -> u32 {
        self.max_transfer_block_count
    }

    /// IO queues available on this controller. Valid `qid`s are
    /// `0..queue_count()`.
    pub fn queue_count(&self) -> u16 {
        self.controller.queue_count()
    }

    pub fn max_queue_count(&self) -> u16 {
        self.controller.max_queue_count()
    }

    /// Ring depth of each IO queue.
    pub fn queue_size(&self) -> u16 {
        self.controller.qsize()
    }

    pub fn max_queue_size(&self) -> u16 {
        self.controller.max_qsize()
    }

    /// Outstanding I/O limit per queue.
    pub fn max_io_per_queue(&self) -> u16 {
        self.controller.qsize() - 1
    }

    /// Controller model string.
    pub fn model(&self) -> String {
        self.controller.identify().mn.to_string()
    }

    /// Controller serial string.
    pub fn serial(&self) -> String {
        self.controller.identify().sn.to_string()
    }

    /// Allocates a device-visible I/O buffer.
    pub fn alloc(&self, len: usize) -> Result<DmaBuffer, DmaError> {
        self.controller.arena().alloc(len)
    }

    /// Frees a buffer allocated from this namespace's controller.
    pub fn free(&self, buf: DmaBuffer) -> Result<(), NotOwned> {
        self.controller.arena().free(buf)
    }

    /// Registers memory the caller already mapped for the device (pinned,
    /// page-aligned, page numbers valid as device addresses) so it can be
    /// used as an I/O buffer on this namespace.
    pub fn map_existing(&self, mem: user_driver::memory::MemoryBlock) -> DmaBuffer {
        self.controller.arena().adopt(mem)
    }

    /// Starts an asynchronous read of `nlb` blocks at `slba` into `buf`.
    pub fn begin_read(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
    ) -> Result<IoTicket, RequestError> {
        self.begin_rw(qid, nvm::NvmOpcode::READ, buf, slba, nlb, 0)
    }

    /// Starts an asynchronous write of `nlb` blocks from `buf` to `slba`.
    pub fn begin_write(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
    ) -> Result<IoTicket, RequestError> {
        self.begin_rw(qid, nvm::NvmOpcode::WRITE, buf, slba, nlb, 0)
    }

    /// Starts an asynchronous flush on `qid`.
    pub fn begin_flush(&self, qid: u16) -> Result<IoTicket, RequestError> {
        let queue = self
            .controller
            .io_queue(qid)
            .ok_or(RequestError::InvalidArgument("qid out of range"))?;
        let key = queue.lock().start_flush(self.nsid)?;
        Ok(IoTicket { qid, key })
    }

    fn begin_rw(
        &self,
        qid: u16,
        opcode: nvm::NvmOpcode,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
        buf_offset: usize,
    ) -> Result<IoTicket, RequestError> {
        if nlb == 0 {
            return Err(RequestError::InvalidArgument("zero block count"));
        }
        if slba
            .checked_add(nlb.into())
            .is_none_or(|end| end > self.block_count)
        {
            return Err(RequestError::InvalidArgument(
                "range extends past end of namespace",
            ));
        }
        let queue = self
            .controller
            .io_queue(qid)
            .ok_or(RequestError::InvalidArgument("qid out of range"))?;
        if !self.controller.arena().owns(buf) {
            return Err(RequestError::InvalidArgument(
                "buffer was not allocated from this device",
            ));
        }
        let len = (nlb as usize) << self.block_shift;
        if buf_offset + len > buf.page_addresses().len() * PAGE_SIZE {
            return Err(RequestError::InvalidArgument("buffer too small for io"));
        }
        debug_assert_eq!(buf_offset % PAGE_SIZE, 0);

        let key = queue.lock().start_io(IoRequest {
            opcode,
            nsid: self.nsid,
            pages: buf.page_addresses()[buf_offset / PAGE_SIZE..].to_vec(),
            slba,
            nlb,
            block_shift: self.block_shift,
            max_per_cmd: self.max_transfer_block_count,
        })?;
        Ok(IoTicket { qid, key })
    }

    /// Polls an in-flight I/O for up to `timeout`; zero probes exactly once.
    ///
    /// On `Ok(IoStatus::Complete)` and on `Err` the descriptor is released;
    /// on `Ok(IoStatus::Pending)` the ticket comes back and must be polled
    /// again (or leaked until close).
    pub fn poll(&self, ticket: IoTicket, timeout: Duration) -> Result<IoStatus, RequestError> {
        let queue = self
            .controller
            .io_queue(ticket.qid)
            .expect("ticket was issued by this namespace");
        let deadline = Deadline::after(Some(timeout));
        let mut backoff = Backoff::new();
        loop {
            {
                let mut queue = queue.lock();
                queue.process_completions();
                match queue.resolve(ticket.key) {
                    PollOutcome::Complete(dw0) => return Ok(IoStatus::Complete(dw0)),
                    PollOutcome::Failed(err) => return Err(RequestError::Nvme(err)),
                    PollOutcome::Pending => {}
                }
            }
            if deadline.expired() {
                return Ok(IoStatus::Pending(ticket));
            }
            backoff.back_off();
        }
    }

    /// Reads synchronously, with the library's long internal timeout.
    pub fn read(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
    ) -> Result<(), RequestError> {
        let ticket = self.begin_read(qid, buf, slba, nlb)?;
        self.wait(ticket)
    }

    /// Writes synchronously, with the library's long internal timeout.
    pub fn write(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
    ) -> Result<(), RequestError> {
        let ticket = self.begin_write(qid, buf, slba, nlb)?;
        self.wait(ticket)
    }

    /// Flushes synchronously. The only ordering barrier the device offers
    /// across queues.
    pub fn flush(&self, qid: u16) -> Result<(), RequestError> {
        let ticket = self.begin_flush(qid)?;
        self.wait(ticket)
    }

    fn wait(&self, ticket: IoTicket) -> Result<(), RequestError> {
        std::thread::yield_now();
        match self.poll(ticket, SYNC_TIMEOUT)? {
            IoStatus::Complete(_) => Ok(()),
            IoStatus::Pending(_) => Err(RequestError::Timeout),
        }
    }

    /// Pass-through configuration write: sends `config_nlb` blocks from the
    /// head of `buf` as an ordinary write to `slba`. The block layout is
    /// device-defined.
    pub fn begin_config_write(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        config_nlb: u32,
    ) -> Result<IoTicket, RequestError> {
        self.begin_rw(qid, nvm::NvmOpcode::WRITE, buf, slba, config_nlb, 0)
    }

    /// Pass-through read of device-transformed data; an ordinary read on the
    /// wire.
    pub fn begin_translated_read(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
    ) -> Result<IoTicket, RequestError> {
        self.begin_rw(qid, nvm::NvmOpcode::READ, buf, slba, nlb, 0)
    }

    /// Writes a configuration block, then streams `nlb` blocks of
    /// device-transformed data from `slba` into `buf`, keeping up to a
    /// queue's worth of reads in flight.
    ///
    /// Every read addresses `slba`; the device serves consecutive data on
    /// repeated reads after a configuration write. Completion order between
    /// the chunks is not significant; the loop runs until nothing is
    /// pending.
    pub fn read_translated_region(
        &self,
        qid: u16,
        buf: &DmaBuffer,
        slba: u64,
        nlb: u32,
        config_nlb: u32,
    ) -> Result<(), RequestError> {
        if nlb == 0 || config_nlb == 0 {
            return Err(RequestError::InvalidArgument("zero block count"));
        }
        let max = self.max_transfer_block_count;
        let chunk_count = nlb.div_ceil(max);
        let chunk_bytes = (max as usize) << self.block_shift;

        let issue_read = |index: u32| -> Result<IoTicket, RequestError> {
            let chunk_nlb = if index == chunk_count - 1 && nlb % max != 0 {
                nlb % max
            } else {
                max
            };
            self.begin_rw(
                qid,
                nvm::NvmOpcode::READ,
                buf,
                slba,
                chunk_nlb,
                index as usize * chunk_bytes,
            )
        };

        let window = self.max_io_per_queue() as usize;
        let mut tickets: Vec<Option<IoTicket>> = Vec::with_capacity(window);
        tickets.push(Some(self.begin_config_write(qid, buf, slba, config_nlb)?));
        let mut next = 0;
        while tickets.len() < window && next < chunk_count {
            tickets.push(Some(issue_read(next)?));
            next += 1;
        }

        let mut pending = tickets.len();
        let mut j = 0;
        while pending > 0 {
            if let Some(ticket) = tickets[j].take() {
                std::thread::yield_now();
                match self.poll(ticket, SYNC_TIMEOUT)? {
                    IoStatus::Complete(_) => {
                        if next < chunk_count {
                            tickets[j] = Some(issue_read(next)?);
                            next += 1;
                        } else {
                            pending -= 1;
                        }
                    }
                    IoStatus::Pending(_) => return Err(RequestError::Timeout),
                }
            }
            j = (j + 1) % tickets.len();
        }
        Ok(())
    }

    /// Closes this handle. The controller itself shuts down when the last
    /// handle on its device closes.
    pub fn close(self) {}
}

impl<T: DeviceBacking> Drop for Namespace<T> {
    fn drop(&mut self) {
        if registry::release(&self.registry_key) {
            self.controller.shutdown();
        }
    }
}

/// Queue configuration for [`open`](crate::open).
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// IO queues to create; zero takes the device-granted maximum.
    pub qcount: u16,
    /// Ring depth per queue; zero takes the device maximum. A depth of one
    /// cannot hold an outstanding command and is rejected.
    pub qsize: u16,
}
